// crates/store/src/heartbeat.rs
//! Heartbeat record I/O - one JSON file per worker id, atomically replaced
//! on every beat so readers never see a torn record.
//!
//! Records are not deleted when a worker exits; the growing staleness gap
//! is exactly what the supervisor watches for.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use genedetect_core::{paths, StoreError, StoreResult, WorkerHeartbeat};

use crate::atomic;

/// Reader/writer for the heartbeat records under one data root.
#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    root: PathBuf,
}

impl HeartbeatFile {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Atomically replace the record for `hb.worker_id`.
    pub fn write(&self, hb: &WorkerHeartbeat) -> StoreResult<()> {
        let dir = paths::heartbeats_dir(&self.root);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        atomic::write_json(&paths::heartbeat_record(&self.root, &hb.worker_id), hb)
    }

    /// Latest record for a worker, `None` if it never wrote one.
    pub fn read(&self, worker_id: &str) -> StoreResult<Option<WorkerHeartbeat>> {
        atomic::read_json(&paths::heartbeat_record(&self.root, worker_id))
    }

    /// All heartbeat records, unreadable ones skipped with a warning.
    pub fn all(&self) -> StoreResult<Vec<WorkerHeartbeat>> {
        let dir = paths::heartbeats_dir(&self.root);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            match atomic::read_json::<WorkerHeartbeat>(&entry.path()) {
                Ok(Some(hb)) => out.push(hb),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable heartbeat")
                }
            }
        }
        Ok(out)
    }

    /// Liveness oracle: a worker is alive when its record exists and is
    /// fresher than `threshold`. Used by the orphan reclaim path.
    pub fn is_worker_alive(&self, worker_id: &str, threshold: Duration) -> bool {
        match self.read(worker_id) {
            Ok(Some(hb)) => !hb.is_stale(Utc::now(), threshold),
            Ok(None) => false,
            Err(e) => {
                warn!(worker_id, error = %e, "Heartbeat read failed, presuming dead");
                false
            }
        }
    }
}

/// Directory used by [`HeartbeatFile`], exposed for the supervisor's
/// status reporting.
pub fn heartbeat_path(root: &Path, worker_id: &str) -> PathBuf {
    paths::heartbeat_record(root, worker_id)
}
