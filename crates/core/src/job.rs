// crates/core/src/job.rs
//! Job record types - the unit of work tracked by the store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::pipeline::PipelineOptions;

/// Progress history entries kept per job; older entries are dropped.
pub const PROGRESS_HISTORY_CAP: usize = 100;

/// Unique, creation-time-ordered job identifier (ULID).
///
/// ULIDs sort lexicographically in creation order, so `(created_at, id)`
/// gives a stable FIFO claim order with the id as tie-break.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job lifecycle status. Serialized SCREAMING_SNAKE_CASE to match the
/// on-disk records consumed by the front-end gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One append-only progress report: `(timestamp, percent, message)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    pub percent: u8,
    pub message: String,
}

/// Summary recorded on a successful (or partially successful) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Number of detection rows produced by the pipeline.
    pub detections: u64,
    pub output_files: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Terminal outcome passed to `JobStore::finalize`.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded { summary: ResultSummary },
    Failed { error: String },
}

/// Gateway-submitted description of a job to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Input sequence file (FASTA).
    pub input_ref: PathBuf,
    /// Reference gene database.
    pub db_ref: PathBuf,
    /// Gene-to-resistance-class mapping.
    pub map_ref: PathBuf,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub options: PipelineOptions,
}

/// Durable job record - the single source of truth for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub input_ref: PathBuf,
    pub db_ref: PathBuf,
    pub map_ref: PathBuf,
    pub options: PipelineOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest reported percent, 0–100.
    pub progress: u8,
    pub progress_history: Vec<ProgressEntry>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    /// Terminal error detail, populated exactly once on FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Most recent transient error, kept across requeues for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_worker_id: Option<String>,
}

impl Job {
    /// Build a fresh QUEUED record from a validated spec.
    pub fn from_spec(spec: JobSpec, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            input_ref: spec.input_ref,
            db_ref: spec.db_ref,
            map_ref: spec.map_ref,
            options: spec.options,
            created_at: now,
            updated_at: now,
            progress: 0,
            progress_history: Vec::new(),
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            result_summary: None,
            error: None,
            last_error: None,
            owner_worker_id: None,
        }
    }

    /// Append a progress entry, keeping the history strictly
    /// timestamp-monotonic and bounded.
    ///
    /// An entry identical to the current last `(percent, message)` pair is
    /// dropped, so a retried write never duplicates history. A timestamp at
    /// or before the previous entry (clock jitter) is bumped 1ms past it.
    pub fn record_progress(&mut self, percent: u8, message: &str) {
        let percent = percent.min(100);
        if let Some(last) = self.progress_history.last() {
            if last.percent == percent && last.message == message {
                return;
            }
        }
        let mut at = Utc::now();
        if let Some(last) = self.progress_history.last() {
            if at <= last.at {
                at = last.at + Duration::milliseconds(1);
            }
        }
        self.progress_history.push(ProgressEntry {
            at,
            percent,
            message: message.to_string(),
        });
        if self.progress_history.len() > PROGRESS_HISTORY_CAP {
            let excess = self.progress_history.len() - PROGRESS_HISTORY_CAP;
            self.progress_history.drain(..excess);
        }
        self.progress = percent;
        self.updated_at = at;
    }
}
