// crates/core/src/heartbeat.rs
//! Worker liveness records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::JobId;

/// What the worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopping,
}

/// Liveness record for one worker process, refreshed at a fixed cadence.
///
/// Staleness beyond a configured multiple of the cadence means the worker
/// is presumed dead. The record is not deleted eagerly on exit so the
/// supervisor can observe the gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<JobId>,
    pub state: WorkerState,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: impl Into<String>, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            pid,
            started_at: now,
            last_heartbeat_at: now,
            current_job_id: None,
            state: WorkerState::Idle,
        }
    }

    /// Refresh the beat timestamp and current activity.
    pub fn beat(&mut self, state: WorkerState, current_job_id: Option<JobId>) {
        self.last_heartbeat_at = Utc::now();
        self.state = state;
        self.current_job_id = current_job_id;
    }

    /// True when the last beat is older than `threshold` relative to `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(t) => now - self.last_heartbeat_at > t,
            Err(_) => false,
        }
    }
}
