//! Storage layer - SQLite plus snapshot files
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//! - `snapshot_store`: Policy snapshots keyed by domain, tenant and dimension
//! - `snapshot_file`: Atomic JSON snapshot files for standalone policies
//!
//! # Usage
//!
//! ```ignore
//! use switchyard_core::storage::{Database, SnapshotKey, SnapshotStore};
//!
//! let db = Database::in_memory().await?;
//! let store = SnapshotStore::new(db.pool().clone());
//! store.save(&SnapshotKey::new("model_selection"), &policy.state_dict()).await?;
//! ```

pub mod database;
pub mod migrations;
pub mod snapshot_file;
pub mod snapshot_store;

pub use database::{Database, DatabaseConfig, default_database_path};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
pub use snapshot_store::{SnapshotKey, SnapshotStore, SnapshotSummary, StoredSnapshot};
