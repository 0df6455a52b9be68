use sqlx::PgPool;

/// Errors raised while installing a notify trigger.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The table or channel name is not a plain SQL identifier.
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

fn trigger_name(table: &str) -> Result<String, TriggerError> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|part| is_identifier(part)) {
        return Err(TriggerError::InvalidIdentifier(table.to_string()));
    }
    Ok(format!("sluice_notify_{}", parts.join("_")))
}

/// (Re)creates the row-level trigger that publishes changes on `table` to
/// `channel` through `sluice_notify_change()`.
///
/// `table` may be schema-qualified. Requires migration 2.
pub async fn install_notify_trigger(
    pool: &PgPool,
    table: &str,
    channel: &str,
) -> Result<(), TriggerError> {
    let trigger = trigger_name(table)?;
    if !is_identifier(channel) {
        return Err(TriggerError::InvalidIdentifier(channel.to_string()));
    }

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TRIGGER IF EXISTS {trigger} ON {table}"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        r#"
        CREATE TRIGGER {trigger}
        AFTER INSERT OR UPDATE OR DELETE ON {table}
        FOR EACH ROW EXECUTE FUNCTION sluice_notify_change('{channel}')
        "#
    ))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    log::info!(
        "Installed trigger {} on {} publishing to '{}'",
        trigger,
        table,
        channel
    );
    Ok(())
}
