use crate::InjectedFailure;
use async_trait::async_trait;
use sluice_core::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct SinkState {
    tables: HashMap<String, Vec<Row>>,
    batches: Vec<(String, usize)>,
    attempts: u64,
    fail_next: u32,
    fail_always: bool,
    latency: Option<Duration>,
}

/// An in-memory analytical store.
///
/// Failures can be injected for the next `n` inserts or for every insert until
/// [`InMemorySink::recover`] is called. Failed inserts write nothing.
#[derive(Clone, Debug, Default)]
pub struct InMemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl InMemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemorySink");
        Self::default()
    }

    /// Fails the next `n` inserts.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// Fails every insert until [`InMemorySink::recover`].
    pub async fn fail_always(&self) {
        self.state.lock().await.fail_always = true;
    }

    /// Clears any injected failure.
    pub async fn recover(&self) {
        let mut state = self.state.lock().await;
        state.fail_next = 0;
        state.fail_always = false;
    }

    /// Delays every insert by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = Some(latency);
    }

    /// Rows written to `table`, in write order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful batches as `(table, row count)`, in write order.
    pub async fn batches(&self) -> Vec<(String, usize)> {
        self.state.lock().await.batches.clone()
    }

    /// Insert calls made so far, successful or not.
    pub async fn attempts(&self) -> u64 {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl AnalyticalSink for InMemorySink {
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), BoxError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.attempts += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_always {
            return Err(Box::new(InjectedFailure::new("sink unavailable")));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Box::new(InjectedFailure::new("sink unavailable")));
        }

        log::debug!("Inserting {} rows into '{}'", rows.len(), table);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(rows);
        state.batches.push((table.to_string(), rows.len()));
        Ok(())
    }
}
