// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid job spec: {reason}")]
    Validation { reason: String },

    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("Invalid transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: String, reason: String },

    #[error("Claim contention on job {job_id}")]
    Contended { job_id: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed job record at {path}: {message}")]
    MalformedRecord { path: PathBuf, message: String },
}

impl StoreError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Classified failure reported by the detection pipeline collaborator.
///
/// Transient failures are retried via the job's retry budget; permanent
/// failures finalize the job immediately without consuming a retry.
#[derive(Debug, Error)]
pub enum PipelineFailure {
    #[error("Transient pipeline failure: {0}")]
    Transient(String),

    #[error("Permanent pipeline failure: {0}")]
    Permanent(String),

    #[error("Pipeline run cancelled at a checkpoint")]
    Cancelled {
        partial: Option<crate::pipeline::PipelineOutput>,
    },
}

/// Errors raised by the supervisor state machine.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Restart ceiling breached: {restarts} restarts within {window_secs}s")]
    Exhausted { restarts: u32, window_secs: u64 },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::validation("input_ref is empty");
        assert!(err.to_string().contains("input_ref is empty"));

        let err = StoreError::invalid_transition("01ABC", "not RUNNING");
        assert!(err.to_string().contains("01ABC"));
        assert!(err.to_string().contains("not RUNNING"));
    }

    #[test]
    fn test_pipeline_failure_classification() {
        let transient = PipelineFailure::Transient("blast db locked".into());
        assert!(matches!(transient, PipelineFailure::Transient(_)));
        assert!(transient.to_string().contains("Transient"));

        let permanent = PipelineFailure::Permanent("malformed FASTA".into());
        assert!(permanent.to_string().contains("Permanent"));
    }

    #[test]
    fn test_supervisor_exhausted_display() {
        let err = SupervisorError::Exhausted {
            restarts: 6,
            window_secs: 600,
        };
        assert!(err.to_string().contains("6 restarts"));
    }
}
