//! Replicates a handful of changes through in-memory collaborators, with the
//! sink failing for a while so one batch goes through the dead letter store.
//!
//! Run with `RUST_LOG=info cargo run --example in-memory-replication`.

use serde_json::json;
use sluice::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let source = InMemorySourceStore::new();
    for (id, workspace) in [("1", "acme"), ("2", "acme"), ("3", "globex")] {
        let row = Row::from_value(json!({
            "id": id,
            "workspace_id": workspace,
            "title": format!("issue {}", id),
        }))
        .ok_or("row should be an object")?;
        source.insert_row("issue_changes", id, row).await;
    }
    let sink = InMemorySink::new();
    let cache = InMemoryResultCache::new();
    let dead_letters = InMemoryDeadLetterStore::new();

    let config = ReplicationConfig::from_json(
        r#"{
            "channels": [{"channel": "issue_changes", "table": "issues"}],
            "batch_size": 2,
            "flush_interval_ms": 500,
            "retry_backoff_ms": [50, 100]
        }"#,
    )?;
    let service = ReplicationService::new(
        config,
        Collaborators::new(
            Arc::new(source),
            Arc::new(sink.clone()),
            Arc::new(cache.clone()),
            Arc::new(dead_letters),
        ),
    )?;

    let (notifications, sender) = InMemoryNotificationSource::channel();
    service.start(notifications).await?;

    sender.notify("issue_changes", json!({"id": "1", "op": "INSERT"}).to_string());
    sender.notify("issue_changes", json!({"id": 2, "op": "UPDATE"}).to_string());
    tokio::time::sleep(Duration::from_millis(100)).await;

    sink.fail_always().await;
    sender.notify("issue_changes", json!({"id": "3", "op": "INSERT"}).to_string());
    tokio::time::sleep(Duration::from_millis(800)).await;
    log::info!("Stats while the sink is down: {:?}", service.stats().await?);

    sink.recover().await;
    let replay = service.replay_now().await?;
    log::info!("Replay pass: {:?}", replay);

    let report = service.stop().await?;
    log::info!("Shutdown flush: {:?}", report);

    println!("rows written: {}", sink.rows("issues").await.len());
    println!("workspaces invalidated: {:?}", cache.invalidated().await);
    println!("{}", serde_json::to_string_pretty(&service.stats().await?)?);
    Ok(())
}
