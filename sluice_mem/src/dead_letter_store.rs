use crate::InjectedFailure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// An in-memory dead letter store.
///
/// Entries are kept in insertion order. Nothing survives the process, so this
/// store is only suitable for tests and local development.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<Mutex<Vec<DeadLetterEvent>>>,
    fail_inserts: Arc<AtomicBool>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryDeadLetterStore");
        Self::default()
    }

    /// Makes every subsequent [`DeadLetterStore::insert`] fail while `fail` is set.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Every entry, in insertion order.
    pub async fn entries(&self) -> Vec<DeadLetterEvent> {
        self.entries.lock().await.clone()
    }

    /// Overwrites the stored copy of `entry`, matched by id. Lets tests stage
    /// entries in states the replay loop would otherwise take time to reach.
    pub async fn put(&self, entry: DeadLetterEvent) {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
}

fn pending_mut(
    entries: &mut [DeadLetterEvent],
    id: Uuid,
) -> Result<&mut DeadLetterEvent, DeadLetterError> {
    let entry = entries
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or(DeadLetterError::NotFound(id))?;
    if entry.status != DeadLetterStatus::Pending {
        return Err(DeadLetterError::NotPending {
            id,
            status: entry.status,
        });
    }
    Ok(entry)
}

fn has_status(entry: &DeadLetterEvent, status: Option<DeadLetterStatus>) -> bool {
    status.is_none_or(|status| entry.status == status)
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(
        &self,
        entry: NewDeadLetter,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEvent, DeadLetterError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            let error: BoxError = Box::new(InjectedFailure::new("dead letter store unavailable"));
            return Err(DeadLetterError::Backend(error));
        }
        let entry = entry.into_pending(Uuid::new_v4(), now);
        log::debug!(
            "Storing dead letter {} for channel '{}'",
            entry.id,
            entry.channel
        );
        self.entries.lock().await.push(entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEvent>, DeadLetterError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        let mut due: Vec<DeadLetterEvent> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps
        due.sort_by_key(|e| e.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn mark_replayed(&self, id: Uuid) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.lock().await;
        pending_mut(&mut entries, id)?.status = DeadLetterStatus::Replayed;
        Ok(())
    }

    async fn increment_retry(
        &self,
        id: Uuid,
        error_reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.lock().await;
        let entry = pending_mut(&mut entries, id)?;
        entry.retry_count += 1;
        entry.error_reason = error_reason.to_string();
        entry.next_retry_at = next_retry_at;
        Ok(())
    }

    async fn mark_exhausted(&self, id: Uuid, error_reason: &str) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.lock().await;
        let entry = pending_mut(&mut entries, id)?;
        entry.retry_count = (entry.retry_count + 1).max(entry.max_retries);
        entry.error_reason = error_reason.to_string();
        entry.status = DeadLetterStatus::Exhausted;
        Ok(())
    }

    async fn reset_exhausted(&self, now: DateTime<Utc>) -> Result<u64, DeadLetterError> {
        let mut reset = 0;
        for entry in self
            .entries
            .lock()
            .await
            .iter_mut()
            .filter(|e| e.status == DeadLetterStatus::Exhausted)
        {
            entry.status = DeadLetterStatus::Pending;
            entry.retry_count = 0;
            entry.next_retry_at = now;
            reset += 1;
        }
        Ok(reset)
    }

    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        let mut listed: Vec<DeadLetterEvent> = self
            .entries
            .lock()
            .await
            .iter()
            .rev()
            .filter(|e| has_status(e, status))
            .cloned()
            .collect();
        // Newest first; reversal already puts later inserts first on ties
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listed
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count(&self, status: Option<DeadLetterStatus>) -> Result<u64, DeadLetterError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| has_status(e, status))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::Map;

    fn new_entry(id: &str) -> NewDeadLetter {
        let event = BufferedEvent::new(Channel::new("issue_changes"), id, Map::new());
        NewDeadLetter::from_event(&event, "sink down", 3).unwrap()
    }

    #[tokio::test]
    async fn pending_entries_come_oldest_first_and_respect_limit() {
        let store = InMemoryDeadLetterStore::new();
        let t0 = Utc::now();
        let newer = store.insert(new_entry("b"), t0 + TimeDelta::seconds(5)).await.unwrap();
        let older = store.insert(new_entry("a"), t0).await.unwrap();

        let due = store.get_pending(t0 + TimeDelta::seconds(10), 10).await.unwrap();
        assert_eq!(
            due.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![older.id, newer.id]
        );

        let limited = store.get_pending(t0 + TimeDelta::seconds(10), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, older.id);
    }

    #[tokio::test]
    async fn entries_not_yet_due_are_skipped() {
        let store = InMemoryDeadLetterStore::new();
        let now = Utc::now();
        let entry = store.insert(new_entry("a"), now).await.unwrap();
        store
            .increment_retry(entry.id, "still down", now + TimeDelta::minutes(1))
            .await
            .unwrap();

        assert!(store.get_pending(now, 10).await.unwrap().is_empty());
        assert_eq!(
            store.get_pending(now + TimeDelta::minutes(1), 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn terminal_entries_reject_transitions() {
        let store = InMemoryDeadLetterStore::new();
        let entry = store.insert(new_entry("a"), Utc::now()).await.unwrap();
        store.mark_replayed(entry.id).await.unwrap();

        assert!(matches!(
            store.mark_exhausted(entry.id, "late").await,
            Err(DeadLetterError::NotPending {
                status: DeadLetterStatus::Replayed,
                ..
            })
        ));
        assert!(matches!(
            store.mark_replayed(Uuid::new_v4()).await,
            Err(DeadLetterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn exhausting_a_fresh_entry_uses_up_its_budget() {
        let store = InMemoryDeadLetterStore::new();
        let entry = store.insert(new_entry("a"), Utc::now()).await.unwrap();
        store.mark_exhausted(entry.id, "unreadable").await.unwrap();

        let exhausted = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(exhausted.status, DeadLetterStatus::Exhausted);
        assert_eq!(exhausted.retry_count, exhausted.max_retries);
        assert_eq!(exhausted.error_reason, "unreadable");
    }

    #[tokio::test]
    async fn reset_exhausted_makes_entries_due_again() {
        let store = InMemoryDeadLetterStore::new();
        let t0 = Utc::now();
        let entry = store.insert(new_entry("a"), t0).await.unwrap();
        store.mark_exhausted(entry.id, "gave up").await.unwrap();

        let later = t0 + TimeDelta::hours(1);
        assert_eq!(store.reset_exhausted(later).await.unwrap(), 1);

        let reset = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(reset.status, DeadLetterStatus::Pending);
        assert_eq!(reset.retry_count, 0);
        assert_eq!(reset.next_retry_at, later);
        assert_eq!(reset.error_reason, "gave up");
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filters_by_status() {
        let store = InMemoryDeadLetterStore::new();
        let t0 = Utc::now();
        let first = store.insert(new_entry("a"), t0).await.unwrap();
        let second = store.insert(new_entry("b"), t0 + TimeDelta::seconds(1)).await.unwrap();
        let third = store.insert(new_entry("c"), t0 + TimeDelta::seconds(2)).await.unwrap();
        store.mark_replayed(second.id).await.unwrap();

        let all = store.list(None, 0, 10).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![third.id, second.id, first.id]
        );

        let pending = store.list(Some(DeadLetterStatus::Pending), 1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);

        assert_eq!(store.count(None).await.unwrap(), 3);
        assert_eq!(store.count(Some(DeadLetterStatus::Replayed)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_inserts_surface_backend_errors() {
        let store = InMemoryDeadLetterStore::new();
        store.fail_inserts(true);

        assert!(matches!(
            store.insert(new_entry("a"), Utc::now()).await,
            Err(DeadLetterError::Backend(_))
        ));
        assert_eq!(store.count(None).await.unwrap(), 0);
    }
}
