//! Persistent discovery watches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};

const WATCH_COLUMNS: &str = "id, tenant, workspace, source_type, handle, cursor, enabled, \
     interval_secs, next_due_at, last_polled_at, created_at";

/// A registered discovery source, polled every `interval_secs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub id: i64,
    pub tenant: String,
    pub workspace: String,
    pub source_type: String,
    /// Connector-specific source identifier (directory, feed URL, ...)
    pub handle: String,
    /// Opaque connector state from the last successful discovery
    pub cursor: Option<serde_json::Value>,
    pub enabled: bool,
    pub interval_secs: u64,
    pub next_due_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_watch(row: &SqliteRow) -> Result<Watch> {
    let cursor: Option<String> = row.try_get("cursor")?;
    Ok(Watch {
        id: row.try_get("id")?,
        tenant: row.try_get("tenant")?,
        workspace: row.try_get("workspace")?,
        source_type: row.try_get("source_type")?,
        handle: row.try_get("handle")?,
        cursor: cursor.map(|c| serde_json::from_str(&c)).transpose()?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        interval_secs: row.try_get::<i64, _>("interval_secs")?.max(1) as u64,
        next_due_at: from_ms(row.try_get("next_due_at")?),
        last_polled_at: row.try_get::<Option<i64>, _>("last_polled_at")?.map(from_ms),
        created_at: from_ms(row.try_get("created_at")?),
    })
}

/// Longest accepted polling interval (one year)
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// SQLite-backed watch registry
#[derive(Debug, Clone)]
pub struct WatchStore {
    pool: SqlitePool,
}

impl WatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a watch, due immediately. Adding an existing
    /// `(tenant, workspace, source_type, handle)` returns the stored watch.
    pub async fn add(
        &self,
        tenant: &str,
        workspace: &str,
        source_type: &str,
        handle: &str,
        interval_secs: u64,
    ) -> Result<Watch> {
        for (field, value) in [
            ("tenant", tenant),
            ("workspace", workspace),
            ("source_type", source_type),
            ("handle", handle),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidArgument(format!("watch {} is empty", field)));
            }
        }
        if interval_secs == 0 {
            return Err(Error::InvalidArgument("watch interval must be positive".to_string()));
        }
        if interval_secs > MAX_INTERVAL_SECS {
            return Err(Error::InvalidArgument(format!(
                "watch interval {} exceeds the maximum of {} seconds",
                interval_secs, MAX_INTERVAL_SECS
            )));
        }
        let interval = interval_secs as i64;

        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO watches (
                tenant, workspace, source_type, handle, enabled, interval_secs, next_due_at, created_at
            ) VALUES (?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(tenant, workspace, source_type, handle) DO NOTHING
            "#,
        )
        .bind(tenant)
        .bind(workspace)
        .bind(source_type)
        .bind(handle)
        .bind(interval)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let sql = format!(
            "SELECT {} FROM watches WHERE tenant = ? AND workspace = ? AND source_type = ? AND handle = ?",
            WATCH_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tenant)
            .bind(workspace)
            .bind(source_type)
            .bind(handle)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        let watch = row_to_watch(&row)?;

        if result.rows_affected() > 0 {
            info!(
                watch_id = watch.id,
                tenant = %tenant,
                workspace = %workspace,
                source_type = %source_type,
                handle = %handle,
                "Added watch"
            );
        }
        Ok(watch)
    }

    pub async fn get(&self, id: i64) -> Result<Watch> {
        let sql = format!("SELECT {} FROM watches WHERE id = ?", WATCH_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?
            .ok_or(Error::WatchNotFound(id))?;
        row_to_watch(&row)
    }

    /// All watches, optionally for one tenant
    pub async fn list(&self, tenant: Option<&str>) -> Result<Vec<Watch>> {
        let sql = format!(
            "SELECT {} FROM watches WHERE (? IS NULL OR tenant = ?) ORDER BY id",
            WATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tenant)
            .bind(tenant)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        rows.iter().map(row_to_watch).collect()
    }

    /// Enabled watches whose next poll is at or before `now`
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Watch>> {
        let sql = format!(
            "SELECT {} FROM watches WHERE enabled = 1 AND next_due_at <= ? ORDER BY next_due_at, id",
            WATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        rows.iter().map(row_to_watch).collect()
    }

    /// Soft enable/disable. Watches are never deleted.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE watches SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::WatchNotFound(id));
        }
        debug!(watch_id = id, enabled = enabled, "Updated watch");
        Ok(())
    }

    /// Store a new cursor after a successful discovery and schedule the next poll
    pub async fn advance(
        &self,
        id: i64,
        cursor: &serde_json::Value,
        next_due_at: DateTime<Utc>,
    ) -> Result<()> {
        let cursor = serde_json::to_string(cursor)?;
        let result = sqlx::query(
            r#"
            UPDATE watches
            SET cursor = ?, last_polled_at = ?, next_due_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&cursor)
        .bind(Utc::now().timestamp_millis())
        .bind(next_due_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::WatchNotFound(id));
        }
        Ok(())
    }

    /// Record a poll without touching the cursor
    pub async fn mark_polled(&self, id: i64, next_due_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE watches SET last_polled_at = ?, next_due_at = ? WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(next_due_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::WatchNotFound(id));
        }
        Ok(())
    }
}
