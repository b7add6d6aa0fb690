/// SQLite document store bootstrap
///
/// Opens the engine's single database file and creates every table the engine uses:
/// - flows: flow definitions (JSON document + indexed owner/status)
/// - email_triggers: Trigger Records, unique on flow_id and unique_email
/// - email_trigger_logs: one row per inbound email outcome, used for rate limiting
/// - flow_executions / flow_execution_steps: run and step logs

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Open (creating if missing) `{data_dir}/flowkeeper.db` and initialise its schema
pub async fn connect(data_dir: &str) -> Result<SqlitePool> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
    let db_path = Path::new(data_dir).join("flowkeeper.db");

    tracing::info!("🗄️ Opening database: {}", db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    init_schema(&pool).await?;

    tracing::info!("✅ Database ready: {}", db_path.display());
    Ok(pool)
}

/// Single-connection in-memory pool, used by tests and ephemeral runs
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes. Safe to call multiple times.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS flows (
            id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            definition JSON NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS email_triggers (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL UNIQUE,
            creator_id TEXT NOT NULL,
            unique_email TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            settings JSON NOT NULL,
            trigger_count INTEGER NOT NULL DEFAULT 0,
            last_triggered TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS email_trigger_logs (
            id TEXT PRIMARY KEY,
            trigger_id TEXT NOT NULL,
            flow_id TEXT,
            execution_id TEXT,
            message_id TEXT,
            from_address TEXT,
            subject TEXT,
            status TEXT NOT NULL,
            reason TEXT,
            received_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS flow_executions (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL,
            user_id TEXT,
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_ms INTEGER,
            steps_total INTEGER NOT NULL,
            steps_completed INTEGER NOT NULL DEFAULT 0,
            error JSON
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS flow_execution_steps (
            execution_id TEXT NOT NULL,
            step_key TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            node_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_ms INTEGER,
            result_summary JSON,
            error TEXT,
            PRIMARY KEY (execution_id, step_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the hot lookups: owner listing, rate-limit windows, run history
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_flows_creator ON flows(creator_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_email_logs_window ON email_trigger_logs(trigger_id, received_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_email_logs_age ON email_trigger_logs(received_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_flow ON flow_executions(flow_id)")
        .execute(pool)
        .await?;

    Ok(())
}
