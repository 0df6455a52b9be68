mod common;

use chrono::{DateTime, TimeDelta, Utc};
use common::{Harness, ISSUES, config, payload};
use serde_json::{Map, json};
use sluice_core::prelude::*;
use sluice_core::{Counters, DeadLetterReplayer};
use sluice_mem::InMemoryNotificationSource;
use std::sync::Arc;
use uuid::Uuid;

fn replayer(harness: &Harness) -> (DeadLetterReplayer, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let replayer = DeadLetterReplayer::new(&config(100), harness.collaborators(), counters.clone());
    (replayer, counters)
}

async fn dead_letter(harness: &Harness, id: &str, at: DateTime<Utc>) -> DeadLetterEvent {
    let event = BufferedEvent::new(Channel::new(ISSUES), id, Map::new());
    let entry = NewDeadLetter::from_event(&event, "sink unavailable", 5)
        .expect("event should serialize");
    harness
        .dead_letters
        .insert(entry, at)
        .await
        .expect("dead letter should be stored")
}

async fn reload(harness: &Harness, id: Uuid) -> DeadLetterEvent {
    harness
        .dead_letters
        .get(id)
        .await
        .expect("store should be readable")
        .expect("dead letter should exist")
}

#[tokio::test]
async fn test_replay_backs_off_exponentially_then_exhausts() {
    let harness = Harness::new();
    harness.issue("1", "ws1").await;
    harness.sink.fail_always().await;
    let (replayer, counters) = replayer(&harness);
    let t0 = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
    let entry = dead_letter(&harness, "1", t0).await;

    let mut now = t0;
    for attempt in 0..4u32 {
        let report = replayer.replay_at(now).await.expect("replay should run");
        assert_eq!(report.fetched, 1);
        assert_eq!(report.rescheduled, 1);

        let stored = reload(&harness, entry.id).await;
        assert_eq!(stored.status, DeadLetterStatus::Pending);
        assert_eq!(stored.retry_count, attempt + 1);
        assert_eq!(stored.error_reason, "sink unavailable");
        assert_eq!(
            stored.next_retry_at - now,
            TimeDelta::seconds(60 * 2i64.pow(attempt))
        );

        // Not due until the backoff has elapsed
        let early = replayer
            .replay_at(stored.next_retry_at - TimeDelta::seconds(1))
            .await
            .expect("replay should run");
        assert_eq!(early.fetched, 0);

        now = stored.next_retry_at;
    }

    let report = replayer.replay_at(now).await.expect("replay should run");
    assert_eq!(report.exhausted, 1);

    let stored = reload(&harness, entry.id).await;
    assert_eq!(stored.status, DeadLetterStatus::Exhausted);
    assert_eq!(stored.retry_count, 5);

    let later = replayer
        .replay_at(now + TimeDelta::days(30))
        .await
        .expect("replay should run");
    assert_eq!(later.fetched, 0);
    assert_eq!(harness.sink.attempts().await, 5);
    assert_eq!(counters.total_replayed(), 0);
}

#[tokio::test]
async fn test_successful_replay_writes_and_invalidates() {
    let harness = Harness::new();
    harness.issue("1", "ws1").await;
    let (replayer, counters) = replayer(&harness);
    let now = Utc::now();
    let entry = dead_letter(&harness, "1", now).await;

    let report = replayer.replay_at(now).await.expect("replay should run");

    assert_eq!(report.replayed, 1);
    assert_eq!(reload(&harness, entry.id).await.status, DeadLetterStatus::Replayed);
    assert_eq!(harness.sink.rows("issues").await.len(), 1);
    assert_eq!(harness.cache.invalidated().await, vec!["ws1"]);
    assert_eq!(counters.total_replayed(), 1);

    // Terminal entries are never fetched again
    let fetches = harness.source.fetches().await.len();
    let again = replayer
        .replay_at(now + TimeDelta::hours(1))
        .await
        .expect("replay should run");
    assert_eq!(again.fetched, 0);
    assert_eq!(harness.source.fetches().await.len(), fetches);
}

#[tokio::test]
async fn test_replay_of_deleted_source_row_counts_as_replayed() {
    let harness = Harness::new();
    let (replayer, _) = replayer(&harness);
    let now = Utc::now();
    let entry = dead_letter(&harness, "gone", now).await;

    let report = replayer.replay_at(now).await.expect("replay should run");

    assert_eq!(report.replayed, 1);
    assert_eq!(reload(&harness, entry.id).await.status, DeadLetterStatus::Replayed);
    assert_eq!(harness.sink.attempts().await, 0);
}

#[tokio::test]
async fn test_source_failure_during_replay_reschedules() {
    let harness = Harness::new();
    harness.source.fail_fetches(true);
    let (replayer, _) = replayer(&harness);
    let now = Utc::now();
    let entry = dead_letter(&harness, "1", now).await;

    let report = replayer.replay_at(now).await.expect("replay should run");

    assert_eq!(report.rescheduled, 1);
    let stored = reload(&harness, entry.id).await;
    assert_eq!(stored.retry_count, 1);
    assert!(stored.error_reason.starts_with("source fetch failed"));
}

#[tokio::test]
async fn test_undecodable_payload_is_exhausted_immediately() {
    let harness = Harness::new();
    let (replayer, _) = replayer(&harness);
    let now = Utc::now();
    let mut entry = dead_letter(&harness, "1", now).await;
    entry.event_payload = json!("not an event");
    harness.dead_letters.put(entry.clone()).await;

    let report = replayer.replay_at(now).await.expect("replay should run");

    assert_eq!(report.exhausted, 1);
    let stored = reload(&harness, entry.id).await;
    assert_eq!(stored.status, DeadLetterStatus::Exhausted);
    assert_eq!(stored.retry_count, stored.max_retries);
    assert!(stored.error_reason.starts_with("undecodable event payload"));
    assert!(harness.source.fetches().await.is_empty());
}

#[tokio::test]
async fn test_replay_respects_batch_size_and_age() {
    let harness = Harness::new();
    harness.issue("1", "ws1").await;
    harness.issue("2", "ws1").await;
    harness.issue("3", "ws1").await;
    let counters = Arc::new(Counters::default());
    let mut config = config(100);
    config.replay.batch_size = 2;
    let replayer = DeadLetterReplayer::new(&config, harness.collaborators(), counters);
    let t0 = Utc::now();
    let newest = dead_letter(&harness, "3", t0 + TimeDelta::seconds(2)).await;
    dead_letter(&harness, "1", t0).await;
    dead_letter(&harness, "2", t0 + TimeDelta::seconds(1)).await;

    let now = t0 + TimeDelta::seconds(10);
    let first = replayer.replay_at(now).await.expect("replay should run");
    assert_eq!(first.fetched, 2);
    assert_eq!(reload(&harness, newest.id).await.status, DeadLetterStatus::Pending);

    let second = replayer.replay_at(now).await.expect("replay should run");
    assert_eq!(second.fetched, 1);
    assert_eq!(second.replayed, 1);
    assert_eq!(reload(&harness, newest.id).await.status, DeadLetterStatus::Replayed);
}

#[tokio::test]
async fn test_reset_exhausted_allows_a_fresh_replay() {
    let harness = Harness::new();
    harness.issue("1", "ws1").await;
    let service = ReplicationService::new(config(100), harness.collaborators())
        .expect("config should be valid");
    let entry = dead_letter(&harness, "1", Utc::now()).await;
    harness
        .dead_letters
        .mark_exhausted(entry.id, "gave up")
        .await
        .expect("entry should be exhausted");

    assert_eq!(
        service
            .count_dead_letters(Some(DeadLetterStatus::Exhausted))
            .await
            .unwrap(),
        1
    );
    assert_eq!(service.reset_exhausted().await.expect("reset should run"), 1);

    let report = service.replay_now().await.expect("replay should run");
    assert_eq!(report.replayed, 1);
    assert_eq!(
        service.stats().await.expect("stats should be readable").total_replayed,
        1
    );
    assert_eq!(service.reset_exhausted().await.expect("reset should run"), 0);
}

#[tokio::test]
async fn test_list_dead_letters_newest_first() {
    let harness = Harness::new();
    let service = ReplicationService::new(config(100), harness.collaborators())
        .expect("config should be valid");
    let t0 = Utc::now();
    let old = dead_letter(&harness, "1", t0).await;
    let new = dead_letter(&harness, "2", t0 + TimeDelta::seconds(1)).await;

    let listed = service
        .list_dead_letters(None, 0, 10)
        .await
        .expect("listing should work");
    assert_eq!(
        listed.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![new.id, old.id]
    );

    let page = service
        .list_dead_letters(Some(DeadLetterStatus::Pending), 1, 1)
        .await
        .expect("listing should work");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, old.id);
}

#[tokio::test(start_paused = true)]
async fn test_live_failure_is_recovered_by_replay() {
    let harness = Harness::new();
    harness.issue("1", "ws1").await;
    harness.sink.fail_always().await;
    let service = ReplicationService::new(config(1), harness.collaborators())
        .expect("config should be valid");
    let (source, sender) = InMemoryNotificationSource::channel();
    service.start(source).await.expect("service should start");

    sender.notify(ISSUES, payload("1"));
    let store = &harness.dead_letters;
    common::wait_until("event to be dead-lettered", move || async move {
        store.count(None).await.unwrap_or(0) == 1
    })
    .await;

    harness.sink.recover().await;
    let report = service.replay_now().await.expect("replay should run");

    assert_eq!(report.replayed, 1);
    assert_eq!(harness.sink.rows("issues").await.len(), 1);
    let stats = service.stats().await.expect("stats should be readable");
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_replayed, 1);
    assert_eq!(stats.dlq_pending, 0);

    service.stop().await.expect("service should stop");
}
