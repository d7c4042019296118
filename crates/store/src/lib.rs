// crates/store/src/lib.rs
//! File-backed job record store with exactly-once claim semantics.
//!
//! The filesystem is the only coordination medium: every record mutation is
//! a whole-file atomic replacement (see [`atomic`]), and state transitions
//! additionally serialize through a short-lived per-job mutation lock
//! created with `O_EXCL`. Two workers racing to claim the same job see
//! exactly one winner; the loser moves on to the next candidate.

pub mod atomic;
pub mod heartbeat;
pub mod logrotate;

pub use heartbeat::HeartbeatFile;
pub use logrotate::RotatingLog;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use genedetect_core::job::{Job, JobId, JobOutcome, JobSpec, JobStatus, ResultSummary};
use genedetect_core::{paths, OrchestratorConfig, StoreError, StoreResult};

/// A mutation lock older than this belongs to a holder that died
/// mid-transition and may be broken.
const LOCK_BREAK: Duration = Duration::from_secs(30);

/// Handle to the job records under one data root.
///
/// Cheap to clone; multiple worker processes may open stores over the same
/// root and compete for claims.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
    default_max_retries: u32,
}

impl JobStore {
    /// Open (or create) the store rooted at `config.data_root`.
    pub fn open(config: &OrchestratorConfig) -> StoreResult<Self> {
        let root = config.data_root.clone();
        let jobs = paths::jobs_dir(&root);
        fs::create_dir_all(&jobs).map_err(|e| StoreError::io(&jobs, e))?;
        let hb = paths::heartbeats_dir(&root);
        fs::create_dir_all(&hb).map_err(|e| StoreError::io(&hb, e))?;
        info!("Job store opened at {}", root.display());
        Ok(Self {
            root,
            default_max_retries: config.max_retries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a spec and persist a new QUEUED record.
    pub fn enqueue(&self, spec: JobSpec) -> StoreResult<Job> {
        for (name, path) in [
            ("input_ref", &spec.input_ref),
            ("db_ref", &spec.db_ref),
            ("map_ref", &spec.map_ref),
        ] {
            if path.as_os_str().is_empty() {
                return Err(StoreError::validation(format!("{name} is empty")));
            }
        }

        let job = Job::from_spec(spec, self.default_max_retries);
        let dir = paths::job_dir(&self.root, &job.id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        atomic::write_json(&paths::job_record(&self.root, &job.id), &job)?;
        info!(job_id = %job.id, "Job enqueued");
        Ok(job)
    }

    /// Snapshot of one job record.
    pub fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        atomic::read_json(&paths::job_record(&self.root, job_id))?.ok_or_else(|| {
            StoreError::NotFound {
                job_id: job_id.to_string(),
            }
        })
    }

    /// Snapshots of all jobs, optionally filtered by status, newest first.
    ///
    /// Unreadable or half-deleted job directories are skipped with a
    /// warning rather than failing the whole listing.
    pub fn list(&self, filter: Option<JobStatus>) -> StoreResult<Vec<Job>> {
        let jobs_dir = paths::jobs_dir(&self.root);
        let mut jobs = Vec::new();
        let entries = fs::read_dir(&jobs_dir).map_err(|e| StoreError::io(&jobs_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&jobs_dir, e))?;
            let record = entry.path().join("job.json");
            match atomic::read_json::<Job>(&record) {
                Ok(Some(job)) => {
                    if filter.map_or(true, |f| job.status == f) {
                        jobs.push(job);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(path = %record.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }

    /// Claim the oldest QUEUED job for `worker_id`.
    ///
    /// Candidates are scanned FIFO by `(created_at, id)`. For each one the
    /// claim takes the mutation lock, re-reads the record, verifies it is
    /// still QUEUED, and atomically replaces it with a RUNNING record owned
    /// by the caller. Losing the lock or the re-check means another worker
    /// won that job; selection moves to the next candidate.
    pub fn claim_next(&self, worker_id: &str) -> StoreResult<Option<Job>> {
        let mut queued = self.list(Some(JobStatus::Queued))?;
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        for candidate in queued {
            let claimed = self.with_lock(&candidate.id, worker_id, |job| {
                if job.status != JobStatus::Queued {
                    return Ok(None);
                }
                job.status = JobStatus::Running;
                job.owner_worker_id = Some(worker_id.to_string());
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            });
            match claimed {
                Ok(Some(job)) => {
                    info!(job_id = %job.id, worker_id, "Job claimed");
                    return Ok(Some(job));
                }
                Ok(None) => continue,
                Err(StoreError::Contended { job_id }) => {
                    debug!(job_id, "Lost claim race, trying next candidate");
                    continue;
                }
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Append a progress report to a RUNNING job.
    ///
    /// Idempotent under write retry: a report identical to the latest
    /// history entry is dropped. Reports against non-RUNNING jobs are
    /// ignored (the job may have been reclaimed under the reporter).
    pub fn update_progress(
        &self,
        job_id: &JobId,
        percent: u8,
        message: &str,
    ) -> StoreResult<Job> {
        self.with_lock(job_id, "progress", |job| {
            if job.status != JobStatus::Running {
                debug!(job_id = %job.id, status = ?job.status, "Ignoring progress on non-running job");
                return Ok(job.clone());
            }
            job.record_progress(percent, message);
            Ok(job.clone())
        })
    }

    /// Transition RUNNING → SUCCEEDED/FAILED under the caller's ownership.
    ///
    /// Rejects the write with `InvalidTransition` when the job is not
    /// RUNNING under `worker_id` - a zombie worker cannot finish a job that
    /// was already reclaimed from it.
    pub fn finalize(
        &self,
        job_id: &JobId,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> StoreResult<Job> {
        let job = self.with_lock(job_id, worker_id, |job| {
            Self::check_owned_running(job, worker_id)?;
            match &outcome {
                JobOutcome::Succeeded { summary } => {
                    job.status = JobStatus::Succeeded;
                    job.result_summary = Some(summary.clone());
                    job.record_progress(100, "completed");
                }
                JobOutcome::Failed { error } => {
                    job.status = JobStatus::Failed;
                    job.error = Some(error.clone());
                }
            }
            job.owner_worker_id = None;
            job.updated_at = Utc::now();
            Ok(job.clone())
        })?;
        self.clear_cancel_flag(job_id);
        info!(job_id = %job.id, status = ?job.status, "Job finalized");
        Ok(job)
    }

    /// Terminal CANCELLED transition, honoring a cooperative cancellation
    /// observed by the owning worker. Keeps whatever partial result the
    /// pipeline yielded at its last checkpoint.
    pub fn finalize_cancelled(
        &self,
        job_id: &JobId,
        worker_id: &str,
        partial: Option<ResultSummary>,
    ) -> StoreResult<Job> {
        let job = self.with_lock(job_id, worker_id, |job| {
            Self::check_owned_running(job, worker_id)?;
            job.status = JobStatus::Cancelled;
            job.result_summary = partial.clone();
            job.owner_worker_id = None;
            job.updated_at = Utc::now();
            Ok(job.clone())
        })?;
        self.clear_cancel_flag(job_id);
        info!(job_id = %job.id, "Job cancelled at checkpoint");
        Ok(job)
    }

    /// Return a RUNNING job to QUEUED after a transient failure, or
    /// finalize it FAILED once the retry budget is spent.
    pub fn requeue_for_retry(
        &self,
        job_id: &JobId,
        worker_id: &str,
        error: &str,
    ) -> StoreResult<Job> {
        let job = self.with_lock(job_id, worker_id, |job| {
            Self::check_owned_running(job, worker_id)?;
            Self::route_retry(job, error);
            Ok(job.clone())
        })?;
        match job.status {
            JobStatus::Queued => {
                info!(job_id = %job.id, retry_count = job.retry_count, "Job requeued for retry")
            }
            _ => warn!(job_id = %job.id, "Retries exhausted, job failed"),
        }
        Ok(job)
    }

    /// Request cooperative cancellation. Sets a flag the owning worker
    /// polls between pipeline checkpoints; the status does not change here.
    pub fn cancel(&self, job_id: &JobId) -> StoreResult<()> {
        // Existence check so the gateway gets NotFound for bogus ids.
        let _ = self.get(job_id)?;
        let flag = paths::job_cancel_flag(&self.root, job_id);
        match fs::OpenOptions::new().create_new(true).write(true).open(&flag) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", Utc::now().to_rfc3339());
                info!(job_id = %job_id, "Cancellation requested");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StoreError::io(&flag, e)),
        }
    }

    /// True once `cancel` has been called for this job.
    pub fn cancel_requested(&self, job_id: &JobId) -> bool {
        paths::job_cancel_flag(&self.root, job_id).exists()
    }

    /// Requeue or fail RUNNING jobs whose owning worker is gone.
    ///
    /// `is_worker_alive` is the liveness oracle (heartbeat staleness in
    /// production, injected in tests). Each orphan is routed through its
    /// own retry budget, so a crash-looping job converges to FAILED instead
    /// of bouncing forever. Returns the ids that were touched.
    pub fn reclaim_orphans(
        &self,
        is_worker_alive: &dyn Fn(&str) -> bool,
    ) -> StoreResult<Vec<JobId>> {
        let mut reclaimed = Vec::new();
        for running in self.list(Some(JobStatus::Running))? {
            let owner_alive = running
                .owner_worker_id
                .as_deref()
                .map(is_worker_alive)
                .unwrap_or(false);
            if owner_alive {
                continue;
            }
            let owner = running.owner_worker_id.clone();
            let result = self.with_lock(&running.id, "reclaim", |job| {
                // Re-check under the lock: the job may have finished or been
                // claimed by a live worker since the scan.
                if job.status != JobStatus::Running || job.owner_worker_id != owner {
                    return Ok(false);
                }
                warn!(
                    job_id = %job.id,
                    owner = owner.as_deref().unwrap_or("<none>"),
                    "Reclaiming orphaned job from dead worker"
                );
                Self::route_retry(job, "owning worker presumed dead");
                Ok(true)
            });
            match result {
                Ok(true) => reclaimed.push(running.id),
                Ok(false) => {}
                Err(StoreError::Contended { .. }) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    fn check_owned_running(job: &Job, worker_id: &str) -> StoreResult<()> {
        if job.status != JobStatus::Running {
            return Err(StoreError::invalid_transition(
                job.id.as_str(),
                format!("expected RUNNING, found {:?}", job.status),
            ));
        }
        if job.owner_worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::invalid_transition(
                job.id.as_str(),
                format!(
                    "owned by {}, not {worker_id}",
                    job.owner_worker_id.as_deref().unwrap_or("<none>")
                ),
            ));
        }
        Ok(())
    }

    /// Shared requeue-or-fail decision for transient failures and reclaims.
    fn route_retry(job: &mut Job, error: &str) {
        job.last_error = Some(error.to_string());
        if job.retry_count < job.max_retries {
            job.retry_count += 1;
            job.status = JobStatus::Queued;
        } else {
            job.status = JobStatus::Failed;
            job.error = Some(format!(
                "Retries exhausted after {} attempts: {error}",
                job.max_retries + 1
            ));
        }
        job.owner_worker_id = None;
        job.updated_at = Utc::now();
    }

    /// Run `f` over the record with the per-job mutation lock held, then
    /// atomically replace the record with the mutated copy.
    fn with_lock<T>(
        &self,
        job_id: &JobId,
        who: &str,
        f: impl FnOnce(&mut Job) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.acquire_lock(job_id, who)?;
        let record = paths::job_record(&self.root, job_id);
        let mut job: Job = atomic::read_json(&record)?.ok_or_else(|| StoreError::NotFound {
            job_id: job_id.to_string(),
        })?;
        let out = f(&mut job)?;
        atomic::write_json(&record, &job)?;
        Ok(out)
    }

    /// `O_EXCL` create of the `.claim` file - the filesystem's
    /// compare-and-swap. A stale lock (holder died mid-transition) is
    /// broken after `LOCK_BREAK`.
    fn acquire_lock(&self, job_id: &JobId, who: &str) -> StoreResult<LockGuard> {
        let path = paths::job_claim_lock(&self.root, job_id);
        for attempt in 0..2 {
            match fs::OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{who} {}", Utc::now().to_rfc3339());
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .map(|t| t.elapsed().unwrap_or_default() > LOCK_BREAK)
                        .unwrap_or(false);
                    if stale && attempt == 0 {
                        warn!(job_id = %job_id, "Breaking stale mutation lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    return Err(StoreError::Contended {
                        job_id: job_id.to_string(),
                    });
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Err(StoreError::Contended {
            job_id: job_id.to_string(),
        })
    }

    fn clear_cancel_flag(&self, job_id: &JobId) {
        let flag = paths::job_cancel_flag(&self.root, job_id);
        if let Err(e) = fs::remove_file(&flag) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %flag.display(), error = %e, "Failed to clear cancel flag");
            }
        }
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
