//! Durable policy snapshots
//!
//! Rows in `bandit_snapshots` are keyed by `(domain, tenant, dimension)` so a
//! contextual policy configured for one dimension never reads state written
//! for another. Non-contextual policies use dimension 0.

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::bandit::PolicySnapshot;
use crate::error::{Error, Result};

const UPSERT_SNAPSHOT_SQL: &str = r#"
    INSERT INTO bandit_snapshots (
        domain, tenant, dimension, policy_kind, arm_count, state_json, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT(domain, tenant, dimension) DO UPDATE SET
        policy_kind = excluded.policy_kind,
        arm_count = excluded.arm_count,
        state_json = excluded.state_json,
        updated_at = CURRENT_TIMESTAMP
"#;

/// Identity of a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub domain: String,
    pub tenant: Option<String>,
    pub dimension: usize,
}

impl SnapshotKey {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tenant: None,
            dimension: 0,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    fn tenant_column(&self) -> &str {
        self.tenant.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/d{}",
            self.domain,
            self.tenant.as_deref().unwrap_or("-"),
            self.dimension
        )
    }
}

/// Listing entry for a stored snapshot
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub key: SnapshotKey,
    pub policy_kind: String,
    pub arm_count: u64,
    pub updated_at: String,
}

/// Store for persisting policy snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Create a new store from an existing (migrated) connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Save or replace the snapshot stored under `key`
    pub async fn save(&self, key: &SnapshotKey, snapshot: &PolicySnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        sqlx::query(UPSERT_SNAPSHOT_SQL)
            .bind(&key.domain)
            .bind(key.tenant_column())
            .bind(key.dimension as i64)
            .bind(snapshot.kind().to_string())
            .bind(snapshot.arm_count() as i64)
            .bind(&json)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        debug!(key = %key, arms = snapshot.arm_count(), "Saved policy snapshot");
        Ok(())
    }

    /// Save several snapshots atomically
    pub async fn save_all(&self, snapshots: &[(SnapshotKey, PolicySnapshot)]) -> Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        for (key, snapshot) in snapshots {
            let json = serde_json::to_string(snapshot)?;
            sqlx::query(UPSERT_SNAPSHOT_SQL)
                .bind(&key.domain)
                .bind(key.tenant_column())
                .bind(key.dimension as i64)
                .bind(snapshot.kind().to_string())
                .bind(snapshot.arm_count() as i64)
                .bind(&json)
                .execute(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?;
        }

        tx.commit().await.map_err(Error::DatabaseError)?;

        info!(count = snapshots.len(), "Saved batch of policy snapshots");
        Ok(())
    }

    /// Load the snapshot stored under `key`, if any
    pub async fn load(&self, key: &SnapshotKey) -> Result<Option<PolicySnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT state_json FROM bandit_snapshots
            WHERE domain = ? AND tenant = ? AND dimension = ?
            "#,
        )
        .bind(&key.domain)
        .bind(key.tenant_column())
        .bind(key.dimension as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        match row {
            Some(row) => {
                let json: String = row.get("state_json");
                let snapshot: PolicySnapshot = serde_json::from_str(&json)?;
                if snapshot.dimension() != key.dimension {
                    return Err(Error::DimensionMismatch {
                        expected: key.dimension,
                        found: snapshot.dimension(),
                    });
                }
                debug!(key = %key, "Loaded policy snapshot");
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Dimensions stored for a domain/tenant pair
    pub async fn dimensions(&self, domain: &str, tenant: Option<&str>) -> Result<Vec<usize>> {
        let rows = sqlx::query(
            "SELECT dimension FROM bandit_snapshots WHERE domain = ? AND tenant = ? ORDER BY dimension",
        )
        .bind(domain)
        .bind(tenant.unwrap_or(""))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<i64, _>("dimension") as usize)
            .collect())
    }

    /// Every snapshot stored for `domain`
    pub async fn list(&self, domain: &str) -> Result<Vec<StoredSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT domain, tenant, dimension, policy_kind, arm_count,
                   CAST(updated_at AS TEXT) AS updated_at
            FROM bandit_snapshots
            WHERE domain = ?
            ORDER BY tenant, dimension
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let tenant: String = row.get("tenant");
                StoredSnapshot {
                    key: SnapshotKey {
                        domain: row.get("domain"),
                        tenant: (!tenant.is_empty()).then_some(tenant),
                        dimension: row.get::<i64, _>("dimension") as usize,
                    },
                    policy_kind: row.get("policy_kind"),
                    arm_count: row.get::<i64, _>("arm_count") as u64,
                    updated_at: row.get("updated_at"),
                }
            })
            .collect())
    }

    /// Delete the snapshot stored under `key`
    pub async fn delete(&self, key: &SnapshotKey) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM bandit_snapshots WHERE domain = ? AND tenant = ? AND dimension = ?",
        )
        .bind(&key.domain)
        .bind(key.tenant_column())
        .bind(key.dimension as i64)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let deleted = result.rows_affected() > 0;
        info!(key = %key, deleted = deleted, "Deleted policy snapshot");
        Ok(deleted)
    }

    /// Counts across the whole table
    pub async fn summary(&self) -> Result<SnapshotSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as snapshot_count,
                COUNT(DISTINCT domain) as domain_count,
                COUNT(DISTINCT NULLIF(tenant, '')) as tenant_count,
                SUM(arm_count) as total_arms
            FROM bandit_snapshots
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(SnapshotSummary {
            snapshot_count: row.get::<i64, _>("snapshot_count") as u64,
            domain_count: row.get::<i64, _>("domain_count") as u64,
            tenant_count: row.get::<i64, _>("tenant_count") as u64,
            total_arms: row.get::<Option<i64>, _>("total_arms").unwrap_or(0) as u64,
        })
    }
}

/// Summary of stored snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub snapshot_count: u64,
    pub domain_count: u64,
    /// Distinct non-empty tenants
    pub tenant_count: u64,
    pub total_arms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::{BetaArmState, LinArmState, ValueArmState};
    use crate::storage::Database;

    async fn create_test_store() -> SnapshotStore {
        let db = Database::in_memory().await.unwrap();
        SnapshotStore::new(db.pool().clone())
    }

    fn thompson(alpha: f64) -> PolicySnapshot {
        PolicySnapshot::Thompson {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            arms: vec![BetaArmState {
                arm: "fast".into(),
                alpha,
                beta: 1.5,
                count: 4,
                last_reward: Some(0.9),
            }],
        }
    }

    fn linucb(dimension: usize) -> PolicySnapshot {
        PolicySnapshot::LinUcb {
            dimension,
            ridge: 1.0,
            alpha: 1.0,
            arms: vec![LinArmState {
                arm: "a".into(),
                a_diag: vec![2.0; dimension],
                b: vec![0.5; dimension],
                count: 1,
                last_context: None,
                last_reward: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = create_test_store().await;
        let key = SnapshotKey::new("model_selection").tenant("acme");

        store.save(&key, &thompson(3.0)).await.unwrap();
        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded, thompson(3.0));

        // Upsert replaces in place
        store.save(&key, &thompson(5.0)).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap().unwrap(), thompson(5.0));
        assert_eq!(store.list("model_selection").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let store = create_test_store().await;
        let shared = SnapshotKey::new("tools");
        let acme = SnapshotKey::new("tools").tenant("acme");

        store.save(&acme, &thompson(9.0)).await.unwrap();
        assert!(store.load(&shared).await.unwrap().is_none());
        assert!(store.load(&acme).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dimension_keys_do_not_mix() {
        let store = create_test_store().await;
        let d3 = SnapshotKey::new("ctx").dimension(3);
        let d4 = SnapshotKey::new("ctx").dimension(4);

        store.save(&d3, &linucb(3)).await.unwrap();
        assert!(store.load(&d4).await.unwrap().is_none());
        assert_eq!(store.dimensions("ctx", None).await.unwrap(), vec![3]);

        // A row whose payload disagrees with its key is rejected
        store.save(&d4, &linucb(3)).await.unwrap();
        assert!(matches!(
            store.load(&d4).await,
            Err(Error::DimensionMismatch { expected: 4, found: 3 })
        ));
    }

    #[tokio::test]
    async fn test_save_all_and_summary() {
        let store = create_test_store().await;
        let batch = vec![
            (SnapshotKey::new("a"), thompson(2.0)),
            (SnapshotKey::new("b").tenant("t1"), PolicySnapshot::Ucb1 {
                arms: vec![ValueArmState::new("x"), ValueArmState::new("y")],
            }),
            (SnapshotKey::new("b").tenant("t2"), thompson(2.0)),
        ];
        store.save_all(&batch).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.snapshot_count, 3);
        assert_eq!(summary.domain_count, 2);
        assert_eq!(summary.tenant_count, 2);
        assert_eq!(summary.total_arms, 4);

        let listed = store.list("b").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key.tenant.as_deref(), Some("t1"));
        assert_eq!(listed[0].policy_kind, "ucb1");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = create_test_store().await;
        let key = SnapshotKey::new("gone");
        store.save(&key, &thompson(2.0)).await.unwrap();
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.load(&key).await.unwrap().is_none());
    }
}
