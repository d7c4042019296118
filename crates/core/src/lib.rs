// crates/core/src/lib.rs
//! Shared types for the genedetect job orchestration subsystem:
//! job records, heartbeats, configuration, errors, and the pipeline
//! collaborator contract.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod paths;
pub mod pipeline;

pub use config::OrchestratorConfig;
pub use error::{PipelineFailure, StoreError, StoreResult, SupervisorError};
pub use heartbeat::{WorkerHeartbeat, WorkerState};
pub use job::{Job, JobId, JobOutcome, JobSpec, JobStatus, ProgressEntry, ResultSummary};
pub use pipeline::{
    DetectionRow, JobInputs, Pipeline, PipelineContext, PipelineOptions, PipelineOutput,
};
