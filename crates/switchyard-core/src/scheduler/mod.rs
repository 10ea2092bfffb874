//! Watch-driven ingestion scheduling
//!
//! - `tick()` polls due watches through their [`Connector`] and enqueues new
//!   items as jobs, advancing each watch's cursor.
//! - `worker_run_once()` leases one job, runs the [`Pipeline`], and records
//!   the outcome.
//! - `run()` does both on an interval until its cancellation token fires.

mod connector;
mod directory;
mod runner;
mod watch;

pub use connector::{Connector, Discovery, DiscoveryItem, Pipeline};
pub use directory::DirectoryConnector;
pub use runner::{Scheduler, WorkerReport};
pub use watch::{Watch, WatchStore};
