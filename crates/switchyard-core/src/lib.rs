//! Switchyard Core Library
//!
//! This crate provides:
//! - Bandit policies (epsilon-greedy, Thompson, UCB1, LinUCB, doubly robust)
//! - A policy registry and learning engine keyed by decision domain
//! - Constrained routing with kill switch, fallbacks and reward normalization
//! - A durable SQLite job queue with worker leases
//! - A watch-driven ingestion scheduler
//! - Policy snapshot persistence keyed by domain, tenant and dimension
//! - Live configuration and a pluggable metrics facade

pub mod bandit;
pub mod config;
pub mod error;
pub mod learning;
pub mod metrics;
pub mod queue;
pub mod routing;
pub mod scheduler;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bandit::{Arm, BanditPolicy, Context, PolicyKind, PolicySnapshot, PolicySpec};
    pub use crate::config::{Config, ConfigSource, EnvConfig, MemoryConfig};
    pub use crate::error::{Error, Result};
    pub use crate::learning::{LearningEngine, PolicyRegistry};
    pub use crate::metrics::{MetricsSink, SharedMetrics};
    pub use crate::queue::{IngestJob, JobQueue, JobResult, JobStatus, NewJob};
    pub use crate::routing::{Constraints, OutcomeSignals, Router, RoutingDecision, RoutingReason};
    pub use crate::scheduler::{Connector, Discovery, DiscoveryItem, Pipeline, Scheduler};
    pub use crate::storage::{Database, SnapshotKey, SnapshotStore};
}
