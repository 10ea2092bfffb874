//! Error types for Switchyard

use thiserror::Error;

/// Result type alias using Switchyard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Switchyard error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Decision errors (E100-E199)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Snapshot mismatch: policy is '{expected}' but snapshot is '{found}'")]
    SnapshotMismatch { expected: String, found: String },

    #[error("Domain '{0}' already has a policy. Use `replace` to swap it explicitly.")]
    DomainAlreadyRegistered(String),

    #[error("Domain '{0}' has no registered policy.")]
    DomainNotFound(String),

    // Queue and scheduler errors (E200-E299)
    #[error("Lease conflict: job {job_id} is not leased by worker '{worker_id}'")]
    LeaseConflict { job_id: i64, worker_id: String },

    #[error("Job {0} not found. Run `switchyard queue list` to see queued jobs.")]
    JobNotFound(i64),

    #[error("Watch {0} not found. Run `switchyard watch list` to see all watches.")]
    WatchNotFound(i64),

    #[error("No connector registered for source type '{0}'")]
    ConnectorNotFound(String),

    #[error("Pipeline failed: {0}")]
    Pipeline(String),

    #[error("Connector failed: {0}")]
    Connector(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Serialization errors (E700-E799)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "E100",
            Self::DimensionMismatch { .. } => "E101",
            Self::SnapshotMismatch { .. } => "E102",
            Self::DomainAlreadyRegistered(_) => "E103",
            Self::DomainNotFound(_) => "E104",
            Self::LeaseConflict { .. } => "E200",
            Self::JobNotFound(_) => "E201",
            Self::WatchNotFound(_) => "E202",
            Self::ConnectorNotFound(_) => "E203",
            Self::Pipeline(_) => "E204",
            Self::Connector(_) => "E205",
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::Serialization(_) => "E700",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::DimensionMismatch { expected, .. } => Some(format!(
                "Point the policy at a snapshot written with dimension {}",
                expected
            )),
            Self::JobNotFound(_) => Some("switchyard queue list".to_string()),
            Self::WatchNotFound(_) => Some("switchyard watch list".to_string()),
            Self::LeaseConflict { .. } => {
                Some("Lease may have expired; dequeue a fresh job".to_string())
            }
            Self::ConfigError(_) => Some("switchyard config list".to_string()),
            Self::DatabaseError(_) => Some("switchyard doctor".to_string()),
            _ => None,
        }
    }

    /// Whether the failure comes from a backend that may recover on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::InvalidArgument("x".into()).code(), "E100");
        assert_eq!(
            Error::DimensionMismatch {
                expected: 3,
                found: 4
            }
            .code(),
            "E101"
        );
        assert_eq!(
            Error::LeaseConflict {
                job_id: 1,
                worker_id: "w".into()
            }
            .code(),
            "E200"
        );
        assert_eq!(Error::ConfigError("bad".into()).code(), "E600");
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = Error::DimensionMismatch {
            expected: 3,
            found: 4,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 3, found 4");
        assert!(err.suggestion().unwrap().contains("dimension 3"));
    }

    #[test]
    fn test_transient_classification() {
        let io = Error::Io(std::io::Error::other("disk gone"));
        assert!(io.is_transient());
        assert!(!Error::InvalidArgument("empty".into()).is_transient());
    }
}
