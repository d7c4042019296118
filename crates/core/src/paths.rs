// crates/core/src/paths.rs
//! Centralized path functions for the on-disk layout.
//!
//! Single source of truth - the store, worker, and supervisor all resolve
//! file locations through here, never with ad-hoc joins.

use std::path::{Path, PathBuf};

use crate::job::JobId;

/// Default data root: `~/.local/share/genedetect/` (Linux) or the platform
/// equivalent; falls back to `./genedetect-data` when no home is available.
pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("genedetect"))
        .unwrap_or_else(|| PathBuf::from("genedetect-data"))
}

/// `<root>/jobs/` - one subdirectory per job.
pub fn jobs_dir(root: &Path) -> PathBuf {
    root.join("jobs")
}

/// `<root>/jobs/<job_id>/`.
pub fn job_dir(root: &Path, job_id: &JobId) -> PathBuf {
    jobs_dir(root).join(job_id.as_str())
}

/// `<root>/jobs/<job_id>/job.json` - the durable record.
pub fn job_record(root: &Path, job_id: &JobId) -> PathBuf {
    job_dir(root, job_id).join("job.json")
}

/// `<root>/jobs/<job_id>/.claim` - short-lived mutation lock.
pub fn job_claim_lock(root: &Path, job_id: &JobId) -> PathBuf {
    job_dir(root, job_id).join(".claim")
}

/// `<root>/jobs/<job_id>/cancel.requested` - cooperative cancellation flag.
pub fn job_cancel_flag(root: &Path, job_id: &JobId) -> PathBuf {
    job_dir(root, job_id).join("cancel.requested")
}

/// `<root>/jobs/<job_id>/job.log` - active per-job pipeline log.
pub fn job_log(root: &Path, job_id: &JobId) -> PathBuf {
    job_dir(root, job_id).join("job.log")
}

/// `<root>/heartbeats/` - one record per worker id.
pub fn heartbeats_dir(root: &Path) -> PathBuf {
    root.join("heartbeats")
}

/// `<root>/heartbeats/<worker_id>.json`.
pub fn heartbeat_record(root: &Path, worker_id: &str) -> PathBuf {
    heartbeats_dir(root).join(format!("{worker_id}.json"))
}

/// `<root>/logs/worker.log` - active per-worker log.
pub fn worker_log(root: &Path) -> PathBuf {
    root.join("logs").join("worker.log")
}

/// `<root>/worker.pid` - pid of the supervised worker process.
pub fn worker_pid_file(root: &Path) -> PathBuf {
    root.join("worker.pid")
}

/// `<root>/supervisor.status.json` - supervisor health for operators.
pub fn supervisor_status(root: &Path) -> PathBuf {
    root.join("supervisor.status.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_rooted() {
        let root = Path::new("/var/lib/genedetect");
        let id = JobId::from("01JOB");
        assert_eq!(
            job_record(root, &id),
            PathBuf::from("/var/lib/genedetect/jobs/01JOB/job.json")
        );
        assert_eq!(
            heartbeat_record(root, "w1"),
            PathBuf::from("/var/lib/genedetect/heartbeats/w1.json")
        );
        assert!(worker_log(root).ends_with("logs/worker.log"));
    }

    #[test]
    fn test_default_data_root_named() {
        let root = default_data_root();
        assert!(root.to_string_lossy().contains("genedetect"));
    }
}
