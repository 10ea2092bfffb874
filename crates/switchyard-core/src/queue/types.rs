//! Queue types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Status of an ingestion job
///
/// `pending -> running -> done | failed`. A failed attempt with retry budget
/// left goes back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidArgument(format!("unknown job status '{}'", other))),
        }
    }
}

/// A job to be enqueued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant: String,
    pub workspace: String,
    pub source_type: String,
    pub external_id: String,
    pub url: Option<String>,
    /// Higher runs first
    pub priority: i64,
    pub metadata: Option<serde_json::Value>,
}

impl NewJob {
    pub fn new(
        tenant: impl Into<String>,
        workspace: impl Into<String>,
        source_type: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            workspace: workspace.into(),
            source_type: source_type.into(),
            external_id: external_id.into(),
            url: None,
            priority: 0,
            metadata: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("tenant", &self.tenant),
            ("workspace", &self.workspace),
            ("source_type", &self.source_type),
            ("external_id", &self.external_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidArgument(format!("job {} is empty", field)));
            }
        }
        Ok(())
    }
}

/// A durable job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: i64,
    pub tenant: String,
    pub workspace: String,
    pub source_type: String,
    pub external_id: String,
    pub url: Option<String>,
    pub priority: i64,
    pub status: JobStatus,
    /// Number of times the job has been leased
    pub attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome reported by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure(String),
}

impl JobResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure(error.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub job_id: i64,
    /// False when the job already existed
    pub inserted: bool,
}

/// Job counts per status for one tenant/workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.done + self.failed
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}
