use crate::InjectedFailure;
use async_trait::async_trait;
use sluice_core::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// An in-memory result cache that records every invalidation.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResultCache {
    invalidated: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryResultCache {
    /// Creates a cache with no recorded invalidations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every invalidation fail while `fail` is set. Failed invalidations
    /// are not recorded.
    pub fn fail_invalidations(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Workspaces invalidated so far, in call order.
    pub async fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().await.clone()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn invalidate_workspace(&self, workspace_id: &str) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Box::new(InjectedFailure::new("cache unavailable")));
        }
        self.invalidated.lock().await.push(workspace_id.to_string());
        Ok(())
    }
}
