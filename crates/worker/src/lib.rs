// crates/worker/src/lib.rs
//! The worker process: claims jobs one at a time, invokes the detection
//! pipeline collaborator, reports progress, and emits heartbeats.
//!
//! The poll/claim/execute loop is single-threaded and blocking - one job
//! runs to completion before the next claim. Heartbeats keep flowing during
//! long pipeline calls via a ticker task, so a busy worker is never
//! mistaken for a dead one.

pub mod command_pipeline;

pub use command_pipeline::CommandPipeline;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{error, info, warn};

use genedetect_core::job::{JobId, JobOutcome, JobStatus, ResultSummary};
use genedetect_core::{
    paths, JobInputs, OrchestratorConfig, Pipeline, PipelineContext, PipelineFailure,
    PipelineOutput, StoreError, StoreResult, WorkerHeartbeat, WorkerState,
};
use genedetect_store::{HeartbeatFile, JobStore, RotatingLog};

/// Default worker identity: `<hostname>-<pid>`.
pub fn default_worker_id() -> String {
    format!(
        "{}-{}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id()
    )
}

/// One worker instance per managed process.
pub struct Worker<P: Pipeline> {
    store: JobStore,
    heartbeats: HeartbeatFile,
    config: OrchestratorConfig,
    pipeline: Arc<P>,
    worker_id: String,
    beat: Arc<Mutex<WorkerHeartbeat>>,
    log: Mutex<RotatingLog>,
}

impl<P: Pipeline + 'static> Worker<P> {
    pub fn new(config: OrchestratorConfig, pipeline: P) -> StoreResult<Self> {
        Self::with_id(config, pipeline, default_worker_id())
    }

    pub fn with_id(
        config: OrchestratorConfig,
        pipeline: P,
        worker_id: String,
    ) -> StoreResult<Self> {
        let store = JobStore::open(&config)?;
        let heartbeats = HeartbeatFile::new(&config.data_root);
        let beat = Arc::new(Mutex::new(WorkerHeartbeat::new(
            worker_id.clone(),
            std::process::id(),
        )));
        let log = Mutex::new(RotatingLog::new(
            paths::worker_log(&config.data_root),
            config.log_max_bytes,
            config.log_max_files,
        ));
        Ok(Self {
            store,
            heartbeats,
            config,
            pipeline: Arc::new(pipeline),
            worker_id,
            beat,
            log,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Poll loop. Runs until `shutdown` flips to true; emits a STOPPING
    /// heartbeat on the way out.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> StoreResult<()> {
        info!(worker_id = %self.worker_id, "Worker started");
        self.emit_beat(WorkerState::Idle, None);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(true) => continue, // claimed and executed; poll again at once
                Ok(false) => {}
                Err(e) => error!(error = %e, "Worker cycle failed"),
            }

            self.emit_beat(WorkerState::Idle, None);
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.emit_beat(WorkerState::Stopping, None);
        info!(worker_id = %self.worker_id, "Worker stopping");
        Ok(())
    }

    /// One poll cycle: reclaim orphans, then claim and execute at most one
    /// job. Returns true when a job was processed.
    pub async fn run_once(&self) -> StoreResult<bool> {
        self.sweep_orphans()?;

        let job = match self.store.claim_next(&self.worker_id)? {
            Some(job) => job,
            None => return Ok(false),
        };
        self.execute(job).await?;
        Ok(true)
    }

    /// Requeue RUNNING jobs owned by workers whose heartbeats went stale.
    /// This worker's own id always counts as alive.
    fn sweep_orphans(&self) -> StoreResult<()> {
        let threshold = self.config.staleness_threshold();
        let heartbeats = self.heartbeats.clone();
        let own_id = self.worker_id.clone();
        let reclaimed = self.store.reclaim_orphans(&move |worker_id: &str| {
            worker_id == own_id || heartbeats.is_worker_alive(worker_id, threshold)
        })?;
        for job_id in &reclaimed {
            self.log_line(&format!("reclaimed orphaned job {job_id}"));
        }
        Ok(())
    }

    async fn execute(&self, job: genedetect_core::Job) -> StoreResult<()> {
        let job_id = job.id.clone();
        info!(job_id = %job_id, worker_id = %self.worker_id, "Executing job");
        self.log_line(&format!("job {job_id} started (attempt {})", job.retry_count + 1));
        self.emit_beat(WorkerState::Busy, Some(job_id.clone()));

        // Heartbeats must continue while the pipeline blocks.
        let ticker = self.spawn_heartbeat_ticker();

        let ctx = Arc::new(WorkerContext {
            store: self.store.clone(),
            job_id: job_id.clone(),
            job_log: Mutex::new(RotatingLog::new(
                paths::job_log(self.store.root(), &job_id),
                self.config.log_max_bytes,
                self.config.log_max_files,
            )),
        });

        let pipeline = Arc::clone(&self.pipeline);
        let inputs = JobInputs {
            input_ref: job.input_ref.clone(),
            db_ref: job.db_ref.clone(),
            map_ref: job.map_ref.clone(),
        };
        let options = job.options.clone();
        let run_ctx = Arc::clone(&ctx);
        let result = tokio::task::spawn_blocking(move || {
            pipeline.run(&inputs, &options, run_ctx.as_ref())
        })
        .await
        .map_err(|e| {
            StoreError::validation(format!("pipeline task panicked: {e}"))
        });

        ticker.abort();

        let outcome = match result {
            Ok(r) => r,
            Err(e) => {
                // A panicking collaborator is a permanent failure for this job.
                error!(job_id = %job_id, error = %e, "Pipeline task panicked");
                Err(PipelineFailure::Permanent(e.to_string()))
            }
        };
        let settled = self.settle(&job_id, outcome);
        self.emit_beat(WorkerState::Idle, None);
        settled
    }

    /// Route the pipeline outcome into the store, tolerating the job having
    /// been reclaimed from under us.
    fn settle(
        &self,
        job_id: &JobId,
        outcome: Result<PipelineOutput, PipelineFailure>,
    ) -> StoreResult<()> {
        let settled = match outcome {
            Ok(output) => {
                self.log_line(&format!(
                    "job {job_id} succeeded with {} detections",
                    output.detections.len()
                ));
                self.store.finalize(
                    job_id,
                    &self.worker_id,
                    JobOutcome::Succeeded {
                        summary: summarize(&output),
                    },
                )
            }
            Err(PipelineFailure::Cancelled { partial }) => {
                self.log_line(&format!("job {job_id} cancelled at checkpoint"));
                self.store.finalize_cancelled(
                    job_id,
                    &self.worker_id,
                    partial.as_ref().map(summarize),
                )
            }
            Err(PipelineFailure::Transient(message)) => {
                self.log_line(&format!("job {job_id} transient failure: {message}"));
                self.store.requeue_for_retry(job_id, &self.worker_id, &message)
            }
            Err(PipelineFailure::Permanent(message)) => {
                self.log_line(&format!("job {job_id} permanent failure: {message}"));
                self.store.finalize(
                    job_id,
                    &self.worker_id,
                    JobOutcome::Failed { error: message },
                )
            }
        };

        match settled {
            Ok(_) => Ok(()),
            Err(StoreError::InvalidTransition { .. }) => {
                // The job was reclaimed while we were busy (our heartbeat
                // must have gone stale). The reclaimer owns its fate now.
                warn!(job_id = %job_id, "Job no longer ours to settle, dropping result");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_heartbeat_ticker(&self) -> tokio::task::JoinHandle<()> {
        let beat = Arc::clone(&self.beat);
        let heartbeats = self.heartbeats.clone();
        let cadence = self.config.heartbeat_cadence;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let snapshot = {
                    let mut hb = match beat.lock() {
                        Ok(hb) => hb,
                        Err(e) => {
                            error!("Heartbeat mutex poisoned: {e}");
                            return;
                        }
                    };
                    let state = hb.state;
                    let job = hb.current_job_id.clone();
                    hb.beat(state, job);
                    hb.clone()
                };
                if let Err(e) = heartbeats.write(&snapshot) {
                    warn!(error = %e, "Heartbeat write failed");
                }
            }
        })
    }

    fn emit_beat(&self, state: WorkerState, job_id: Option<JobId>) {
        let snapshot = {
            let mut hb = match self.beat.lock() {
                Ok(hb) => hb,
                Err(e) => {
                    error!("Heartbeat mutex poisoned: {e}");
                    return;
                }
            };
            hb.beat(state, job_id);
            hb.clone()
        };
        if let Err(e) = self.heartbeats.write(&snapshot) {
            warn!(error = %e, "Heartbeat write failed");
        }
    }

    fn log_line(&self, line: &str) {
        if let Ok(mut log) = self.log.lock() {
            if let Err(e) = log.write_line(line) {
                warn!(error = %e, "Worker log write failed");
            }
        }
    }
}

fn summarize(output: &PipelineOutput) -> ResultSummary {
    ResultSummary {
        detections: output.detections.len() as u64,
        output_files: output.output_files.clone(),
        warnings: output.warnings.clone(),
    }
}

/// Progress and cancellation callbacks handed to the pipeline.
///
/// Progress goes to the durable record and the per-job rotating log;
/// cancellation reads the store's flag file. Both are safe to call from
/// the blocking pipeline thread.
struct WorkerContext {
    store: JobStore,
    job_id: JobId,
    job_log: Mutex<RotatingLog>,
}

impl PipelineContext for WorkerContext {
    fn report_progress(&self, percent: u8, message: &str) {
        if let Err(e) = self.store.update_progress(&self.job_id, percent, message) {
            warn!(job_id = %self.job_id, error = %e, "Progress write failed");
        }
        if let Ok(mut log) = self.job_log.lock() {
            let _ = log.write_line(&format!("[{percent:>3}%] {message}"));
        }
    }

    fn cancelled(&self) -> bool {
        self.store.cancel_requested(&self.job_id)
    }
}

/// Leave a terminal job in a state the gateway can always interpret
/// (used by tests and status tooling).
pub fn terminal_error(job: &genedetect_core::Job) -> Option<&str> {
    if job.status == JobStatus::Failed {
        job.error.as_deref()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genedetect_core::job::JobSpec;
    use genedetect_core::pipeline::{DetectionRow, PipelineOptions};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// Scriptable pipeline stand-in: runs the provided closure.
    struct FakePipeline<F>(F);

    impl<F> Pipeline for FakePipeline<F>
    where
        F: Fn(&JobInputs, &PipelineOptions, &dyn PipelineContext) -> Result<PipelineOutput, PipelineFailure>
            + Send
            + Sync,
    {
        fn run(
            &self,
            inputs: &JobInputs,
            options: &PipelineOptions,
            ctx: &dyn PipelineContext,
        ) -> Result<PipelineOutput, PipelineFailure> {
            (self.0)(inputs, options, ctx)
        }
    }

    fn config_in(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            data_root: dir.to_path_buf(),
            heartbeat_cadence: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            ..OrchestratorConfig::default()
        }
    }

    fn spec() -> JobSpec {
        JobSpec {
            input_ref: PathBuf::from("/data/sample.fasta"),
            db_ref: PathBuf::from("/data/card.db"),
            map_ref: PathBuf::from("/data/gene_map.tsv"),
            max_retries: None,
            options: Default::default(),
        }
    }

    fn detection() -> DetectionRow {
        DetectionRow {
            gene: "blaTEM-1".into(),
            resistance_class: "beta-lactam".into(),
            identity: 99.0,
            coverage: 98.5,
        }
    }

    #[tokio::test]
    async fn test_successful_job_reaches_succeeded_with_full_progress() {
        // Happy path: QUEUED → RUNNING → SUCCEEDED, final progress 100.
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::with_id(
            config_in(dir.path()),
            FakePipeline(|_: &JobInputs, _: &PipelineOptions, ctx: &dyn PipelineContext| {
                ctx.report_progress(30, "running blast");
                ctx.report_progress(90, "mapping classes");
                Ok(PipelineOutput {
                    detections: vec![detection()],
                    ..Default::default()
                })
            }),
            "w-test".into(),
        )
        .expect("worker");

        let job = worker.store().enqueue(spec()).expect("enqueue");
        assert!(worker.run_once().await.expect("run_once"), "job processed");

        let done = worker.store().get(&job.id).expect("get");
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result_summary.expect("summary").detections, 1);
        assert!(done.progress_history.iter().any(|p| p.message == "running blast"));
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_without_retry() {
        // Permanent classification → FAILED, retry_count 0.
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::with_id(
            config_in(dir.path()),
            FakePipeline(|_: &JobInputs, _: &PipelineOptions, _: &dyn PipelineContext| {
                Err(PipelineFailure::Permanent("input is not FASTA".into()))
            }),
            "w-test".into(),
        )
        .expect("worker");

        let job = worker.store().enqueue(spec()).expect("enqueue");
        worker.run_once().await.expect("run_once");

        let done = worker.store().get(&job.id).expect("get");
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 0);
        assert_eq!(terminal_error(&done), Some("input is not FASTA"));
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_then_exhausts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::with_id(
            config_in(dir.path()),
            FakePipeline(|_: &JobInputs, _: &PipelineOptions, _: &dyn PipelineContext| {
                Err(PipelineFailure::Transient("reference db locked".into()))
            }),
            "w-test".into(),
        )
        .expect("worker");

        let job = worker
            .store()
            .enqueue(JobSpec {
                max_retries: Some(1),
                ..spec()
            })
            .expect("enqueue");

        worker.run_once().await.expect("first attempt");
        let mid = worker.store().get(&job.id).expect("get");
        assert_eq!(mid.status, JobStatus::Queued);
        assert_eq!(mid.retry_count, 1);

        worker.run_once().await.expect("second attempt");
        let done = worker.store().get(&job.id).expect("get");
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 1, "budget never exceeded");
    }

    #[tokio::test]
    async fn test_cancel_observed_at_checkpoint() {
        // Cancel lands while RUNNING; the job reaches CANCELLED
        // at the pipeline's next checkpoint, not immediately and not never.
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::with_id(
            config_in(dir.path()),
            FakePipeline(|_: &JobInputs, _: &PipelineOptions, ctx: &dyn PipelineContext| {
                ctx.report_progress(10, "chunk 1");
                // Checkpoint between chunks - this is where cancellation
                // may take effect.
                if ctx.cancelled() {
                    return Err(PipelineFailure::Cancelled {
                        partial: Some(PipelineOutput {
                            detections: vec![detection()],
                            ..Default::default()
                        }),
                    });
                }
                ctx.report_progress(100, "chunk 2");
                Ok(PipelineOutput::default())
            }),
            "w-test".into(),
        )
        .expect("worker");

        let job = worker.store().enqueue(spec()).expect("enqueue");
        // Request cancellation before the worker picks the job up; the flag
        // is only observed at the cooperative checkpoint.
        worker.store().cancel(&job.id).expect("cancel");
        worker.run_once().await.expect("run_once");

        let done = worker.store().get(&job.id).expect("get");
        assert_eq!(done.status, JobStatus::Cancelled);
        let partial = done.result_summary.expect("partial result kept");
        assert_eq!(partial.detections, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_stays_fresh_during_long_pipeline_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let cfg = config_in(dir.path());
        let threshold = cfg.staleness_threshold();
        let worker = Worker::with_id(
            cfg,
            FakePipeline(move |_: &JobInputs, _: &PipelineOptions, _: &dyn PipelineContext| {
                // Block well past the staleness threshold, then check that
                // the ticker kept the heartbeat fresh the whole time.
                std::thread::sleep(Duration::from_millis(120));
                let hb = HeartbeatFile::new(&root)
                    .read("w-test")
                    .expect("read heartbeat")
                    .expect("heartbeat exists during run");
                assert_eq!(hb.state, WorkerState::Busy);
                assert!(
                    !hb.is_stale(chrono::Utc::now(), threshold),
                    "ticker must refresh the heartbeat during long work"
                );
                assert!(hb.current_job_id.is_some());
                Ok(PipelineOutput::default())
            }),
            "w-test".into(),
        )
        .expect("worker");

        worker.store().enqueue(spec()).expect("enqueue");
        worker.run_once().await.expect("run_once");
    }

    #[tokio::test]
    async fn test_orphan_swept_before_claiming() {
        // A RUNNING job owned by a dead worker is
        // requeued on the next cycle and then executed here.
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::with_id(
            config_in(dir.path()),
            FakePipeline(|_: &JobInputs, _: &PipelineOptions, _: &dyn PipelineContext| {
                Ok(PipelineOutput::default())
            }),
            "w-live".into(),
        )
        .expect("worker");

        let job = worker.store().enqueue(spec()).expect("enqueue");
        // Simulate a crashed worker: claim under another id, never settle,
        // no heartbeat record for it.
        worker.store().claim_next("w-crashed").expect("claim").expect("claimed");

        assert!(worker.run_once().await.expect("run_once"), "reclaimed and executed");
        let done = worker.store().get(&job.id).expect("get");
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.retry_count, 1, "reclaim consumed one retry");
    }

    #[tokio::test]
    async fn test_idle_cycle_claims_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = Worker::with_id(
            config_in(dir.path()),
            FakePipeline(|_: &JobInputs, _: &PipelineOptions, _: &dyn PipelineContext| {
                panic!("pipeline must not run with an empty queue")
            }),
            "w-test".into(),
        )
        .expect("worker");
        assert!(!worker.run_once().await.expect("run_once"));
    }
}
