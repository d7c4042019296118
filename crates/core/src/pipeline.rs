// crates/core/src/pipeline.rs
//! Contract for the sequence-similarity detection pipeline collaborator.
//!
//! The pipeline's internal algorithm is outside this subsystem; the worker
//! only depends on this seam. The call blocks, may report progress through
//! the context, and must poll `cancelled()` at its own checkpoints -
//! cancellation is cooperative, never preemptive.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::PipelineFailure;

/// Tuning knobs passed through to the collaborator, opaque to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Minimum percent identity for a hit to count as a detection.
    pub identity: f64,
    /// Minimum query coverage, percent.
    pub coverage: u32,
    /// Threads the collaborator may use internally.
    pub threads: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            identity: 90.0,
            coverage: 80,
            threads: 1,
        }
    }
}

/// Input references resolved from the job record.
#[derive(Debug, Clone)]
pub struct JobInputs {
    pub input_ref: PathBuf,
    pub db_ref: PathBuf,
    pub map_ref: PathBuf,
}

/// One detected resistance gene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub gene: String,
    pub resistance_class: String,
    pub identity: f64,
    pub coverage: f64,
}

/// Success payload from a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub detections: Vec<DetectionRow>,
    pub warnings: Vec<String>,
    pub output_files: Vec<PathBuf>,
}

/// Caller-provided callbacks available to a running pipeline.
pub trait PipelineContext: Send + Sync {
    /// Report progress; `percent` is 0–100.
    fn report_progress(&self, percent: u8, message: &str);

    /// True once cancellation has been requested. The pipeline should stop
    /// at its next checkpoint and return `PipelineFailure::Cancelled`.
    fn cancelled(&self) -> bool;
}

/// The detection pipeline collaborator.
pub trait Pipeline: Send + Sync {
    fn run(
        &self,
        inputs: &JobInputs,
        options: &PipelineOptions,
        ctx: &dyn PipelineContext,
    ) -> Result<PipelineOutput, PipelineFailure>;
}
