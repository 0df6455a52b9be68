use crate::InjectedFailure;
use async_trait::async_trait;
use sluice_core::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct SourceData {
    rows: HashMap<Channel, HashMap<String, Vec<Row>>>,
    fetches: Vec<(Channel, Vec<String>)>,
}

/// An in-memory source of denormalized rows.
///
/// Rows are registered per channel and id. An id may map to several rows, and
/// ids without rows are silently skipped on fetch.
#[derive(Clone, Debug, Default)]
pub struct InMemorySourceStore {
    data: Arc<Mutex<SourceData>>,
    failing: Arc<AtomicBool>,
}

impl InMemorySourceStore {
    /// Creates an empty source.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemorySourceStore");
        Self::default()
    }

    /// Adds `row` to the rows returned for `id` on `channel`.
    pub async fn insert_row(&self, channel: &str, id: &str, row: Row) {
        self.data
            .lock()
            .await
            .rows
            .entry(Channel::new(channel))
            .or_default()
            .entry(id.to_string())
            .or_default()
            .push(row);
    }

    /// Deletes every row of `id` on `channel`.
    pub async fn remove(&self, channel: &str, id: &str) {
        if let Some(rows) = self.data.lock().await.rows.get_mut(channel) {
            rows.remove(id);
        }
    }

    /// Makes every fetch fail while `fail` is set.
    pub fn fail_fetches(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Every fetch made so far, as `(channel, ids)`.
    pub async fn fetches(&self) -> Vec<(Channel, Vec<String>)> {
        self.data.lock().await.fetches.clone()
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn fetch_denormalized_rows(
        &self,
        channel: &Channel,
        ids: &[String],
    ) -> Result<Vec<Row>, BoxError> {
        let mut data = self.data.lock().await;
        data.fetches.push((channel.clone(), ids.to_vec()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(Box::new(InjectedFailure::new("source unavailable")));
        }

        let Some(by_id) = data.rows.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id))
            .flatten()
            .cloned()
            .collect())
    }
}
