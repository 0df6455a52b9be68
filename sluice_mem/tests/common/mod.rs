#![allow(dead_code)]

use serde_json::json;
use sluice_core::prelude::*;
use sluice_mem::{InMemoryDeadLetterStore, InMemoryResultCache, InMemorySink, InMemorySourceStore};
use std::sync::Arc;

pub const ISSUES: &str = "issue_changes";
pub const COMMENTS: &str = "comment_changes";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory collaborators plus handles to inspect them.
pub struct Harness {
    pub source: InMemorySourceStore,
    pub sink: InMemorySink,
    pub cache: InMemoryResultCache,
    pub dead_letters: InMemoryDeadLetterStore,
}

impl Harness {
    pub fn new() -> Self {
        init_logger();
        Self {
            source: InMemorySourceStore::new(),
            sink: InMemorySink::new(),
            cache: InMemoryResultCache::new(),
            dead_letters: InMemoryDeadLetterStore::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::new(self.source.clone()),
            Arc::new(self.sink.clone()),
            Arc::new(self.cache.clone()),
            Arc::new(self.dead_letters.clone()),
        )
    }

    /// Registers one issue row in workspace `ws`.
    pub async fn issue(&self, id: &str, ws: &str) {
        self.source.insert_row(ISSUES, id, issue_row(id, ws)).await;
    }

    /// Registers one comment row in workspace `ws`.
    pub async fn comment(&self, id: &str, ws: &str) {
        let row = Row::from_value(json!({"id": id, "workspace_id": ws, "body": "hi"}))
            .expect("comment row is an object");
        self.source.insert_row(COMMENTS, id, row).await;
    }
}

pub fn issue_row(id: &str, ws: &str) -> Row {
    Row::from_value(json!({"id": id, "workspace_id": ws, "title": format!("issue {}", id)}))
        .expect("issue row is an object")
}

/// Two channels, long timers so tests drive flushes and replays explicitly.
pub fn config(batch_size: usize) -> ReplicationConfig {
    let mut config = ReplicationConfig::with_channels([
        ChannelBinding::new(ISSUES, "issues"),
        ChannelBinding::new(COMMENTS, "comments"),
    ]);
    config.batch_size = batch_size;
    config.flush_interval_ms = 3_600_000;
    config.replay.interval_ms = 3_600_000;
    config
}

pub fn payload(id: &str) -> String {
    json!({"id": id, "op": "UPDATE"}).to_string()
}

/// Polls `check` every 10ms until it holds, panicking after ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
