mod common;

use serial_test::serial;
use sluice_core::prelude::*;
use sluice_mem::{InMemoryResultCache, InMemorySink};
use sluice_pg::{PgDeadLetterStore, PgNotificationSource, PgSourceStore, install_notify_trigger};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

const ISSUES_QUERY: &str = r#"
    SELECT json_build_object('id', id, 'workspace_id', workspace_id, 'title', title)
    FROM sluice_test_issues
    WHERE id = ANY($1::text[])
"#;

async fn setup_issues_table(pool: &PgPool) {
    sqlx::query("DROP TABLE IF EXISTS sluice_test_issues CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop test table");
    sqlx::query(
        r#"
        CREATE TABLE sluice_test_issues (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            title TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create test table");
    install_notify_trigger(pool, "sluice_test_issues", "sluice_test_issue_changes")
        .await
        .expect("Failed to install trigger");
}

fn service(pool: &PgPool, sink: &InMemorySink, cache: &InMemoryResultCache) -> ReplicationService {
    let mut config = ReplicationConfig::with_channels([ChannelBinding::new(
        "sluice_test_issue_changes",
        "issues",
    )]);
    config.batch_size = 2;
    config.flush_interval_ms = 200;

    let source =
        PgSourceStore::new(pool.clone()).with_query("sluice_test_issue_changes", ISSUES_QUERY);
    let collaborators = Collaborators::new(
        Arc::new(source),
        Arc::new(sink.clone()),
        Arc::new(cache.clone()),
        Arc::new(PgDeadLetterStore::new(pool.clone())),
    );
    ReplicationService::new(config, collaborators).expect("Config should be valid")
}

async fn wait_for_rows(sink: &InMemorySink, expected: usize) {
    for _ in 0..100 {
        if sink.rows("issues").await.len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Timed out waiting for {} rows", expected);
}

#[tokio::test]
#[serial]
#[ignore = "requires DATABASE_URL"]
async fn test_committed_changes_reach_the_sink() {
    let pool = common::migrated_pool().await;
    setup_issues_table(&pool).await;
    let sink = InMemorySink::new();
    let cache = InMemoryResultCache::new();
    let service = service(&pool, &sink, &cache);

    service
        .start(PgNotificationSource::new(pool.clone()))
        .await
        .expect("Service should start");

    sqlx::query(
        "INSERT INTO sluice_test_issues VALUES ('i1', 'ws1', 'first'), ('i2', 'ws2', 'second')",
    )
    .execute(&pool)
    .await
    .expect("Insert should succeed");
    wait_for_rows(&sink, 2).await;

    sqlx::query("UPDATE sluice_test_issues SET title = 'renamed' WHERE id = 'i1'")
        .execute(&pool)
        .await
        .expect("Update should succeed");
    wait_for_rows(&sink, 3).await;

    let rows = sink.rows("issues").await;
    let last = rows.last().expect("A row should be written");
    assert_eq!(last.get("title"), Some(&serde_json::json!("renamed")));

    let mut invalidated = cache.invalidated().await;
    invalidated.sort();
    invalidated.dedup();
    assert_eq!(invalidated, vec!["ws1", "ws2"]);

    service.stop().await.expect("Service should stop");
    sqlx::query("DROP TABLE IF EXISTS sluice_test_issues CASCADE")
        .execute(&pool)
        .await
        .expect("Failed to drop test table");
    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires DATABASE_URL"]
async fn test_failed_writes_land_in_the_dead_letter_table() {
    let pool = common::migrated_pool().await;
    setup_issues_table(&pool).await;
    let sink = InMemorySink::new();
    sink.fail_always().await;
    let cache = InMemoryResultCache::new();
    let mut config = ReplicationConfig::with_channels([ChannelBinding::new(
        "sluice_test_issue_changes",
        "issues",
    )]);
    config.retry_backoff_ms = vec![10, 10];
    let source =
        PgSourceStore::new(pool.clone()).with_query("sluice_test_issue_changes", ISSUES_QUERY);
    let service = ReplicationService::new(
        config,
        Collaborators::new(
            Arc::new(source),
            Arc::new(sink.clone()),
            Arc::new(cache.clone()),
            Arc::new(PgDeadLetterStore::new(pool.clone())),
        ),
    )
    .expect("Config should be valid");

    service
        .start(PgNotificationSource::new(pool.clone()))
        .await
        .expect("Service should start");
    sqlx::query("INSERT INTO sluice_test_issues VALUES ('i1', 'ws1', 'first')")
        .execute(&pool)
        .await
        .expect("Insert should succeed");

    let mut buffered = false;
    for _ in 0..100 {
        if service.stats().await.expect("Stats should be readable").buffered_events == 1 {
            buffered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(buffered, "Notification should be buffered");

    let report = service.stop().await.expect("Service should stop");
    assert_eq!(report.events_dead_lettered(), 1);
    assert_eq!(
        service
            .count_dead_letters(Some(DeadLetterStatus::Pending))
            .await
            .expect("Count should succeed"),
        1
    );

    sink.recover().await;
    let replay = service.replay_now().await.expect("Replay should run");
    assert_eq!(replay.replayed, 1);
    assert_eq!(sink.rows("issues").await.len(), 1);

    sqlx::query("DROP TABLE IF EXISTS sluice_test_issues CASCADE")
        .execute(&pool)
        .await
        .expect("Failed to drop test table");
    common::teardown(&pool).await;
}
