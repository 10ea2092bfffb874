//! Durable ingestion job queue
//!
//! Jobs live in the `ingest_jobs` table and move through
//! `pending -> running -> done | failed`. Workers claim jobs with a time-bounded
//! lease; an expired lease makes the job claimable by another worker.

mod job_queue;
mod types;

pub use job_queue::JobQueue;
pub use types::{EnqueueResult, IngestJob, JobResult, JobStatus, NewJob, StatusCounts};
