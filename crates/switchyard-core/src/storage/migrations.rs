//! Database migrations
//!
//! Versioned SQLite schema for switchyard, applied automatically when a
//! [`Database`](super::Database) is opened.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Bandit policy snapshots
const MIGRATION_V1: &str = r#"
    -- One row per (domain, tenant, dimension); tenant is '' when unscoped
    CREATE TABLE IF NOT EXISTS bandit_snapshots (
        domain TEXT NOT NULL,
        tenant TEXT NOT NULL DEFAULT '',
        dimension INTEGER NOT NULL DEFAULT 0 CHECK (dimension >= 0),
        policy_kind TEXT NOT NULL,
        arm_count INTEGER NOT NULL DEFAULT 0,
        state_json TEXT NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (domain, tenant, dimension)
    );

    CREATE INDEX IF NOT EXISTS idx_bandit_snapshots_domain ON bandit_snapshots(domain);
"#;

/// Migration 2: Ingestion job queue
const MIGRATION_V2: &str = r#"
    -- Timestamps are unix milliseconds
    CREATE TABLE IF NOT EXISTS ingest_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant TEXT NOT NULL,
        workspace TEXT NOT NULL,
        source_type TEXT NOT NULL,
        external_id TEXT NOT NULL,
        url TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'running', 'done', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0,
        lease_owner TEXT,
        lease_expires_at INTEGER,
        last_error TEXT,
        metadata TEXT,
        enqueued_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER,
        UNIQUE (tenant, workspace, source_type, external_id)
    );

    CREATE INDEX IF NOT EXISTS idx_ingest_jobs_claim ON ingest_jobs(status, priority DESC, id);
    CREATE INDEX IF NOT EXISTS idx_ingest_jobs_scope ON ingest_jobs(tenant, workspace, status);
    CREATE INDEX IF NOT EXISTS idx_ingest_jobs_lease ON ingest_jobs(status, lease_expires_at);
"#;

/// Migration 3: Discovery watches
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS watches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant TEXT NOT NULL,
        workspace TEXT NOT NULL,
        source_type TEXT NOT NULL,
        handle TEXT NOT NULL,
        cursor TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        interval_secs INTEGER NOT NULL DEFAULT 300 CHECK (interval_secs > 0),
        next_due_at INTEGER NOT NULL,
        last_polled_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (tenant, workspace, source_type, handle)
    );

    CREATE INDEX IF NOT EXISTS idx_watches_due ON watches(enabled, next_due_at);
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Bandit snapshots");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Ingestion job queue");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Discovery watches");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}
