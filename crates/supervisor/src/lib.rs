// crates/supervisor/src/lib.rs
//! Watchdog for the worker process.
//!
//! An explicit state machine (`STARTING → RUNNING → (CRASHED → BACKOFF →
//! STARTING)* → STOPPED`) drives spawn, liveness monitoring, and bounded
//! restart backoff. Process control and heartbeat reading are injected
//! seams so the restart-storm behavior is testable without real processes.

pub mod process;

pub use process::WorkerProcess;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use genedetect_core::{paths, OrchestratorConfig, SupervisorError};
use genedetect_store::{atomic, HeartbeatFile};

/// Spawning, liveness, and termination of the managed process.
pub trait ProcessControl: Send {
    fn spawn(&mut self) -> Result<u32, SupervisorError>;
    fn is_alive(&mut self, pid: u32) -> bool;
    fn kill(&mut self, pid: u32);
}

/// Where worker heartbeats come from.
pub trait HeartbeatSource: Send {
    /// Timestamp of the freshest heartbeat from any worker, if one exists.
    fn latest(&self) -> Option<DateTime<Utc>>;
}

/// Heartbeat source backed by the store's heartbeat directory.
#[derive(Debug, Clone)]
pub struct FileHeartbeatSource {
    heartbeats: HeartbeatFile,
}

impl FileHeartbeatSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            heartbeats: HeartbeatFile::new(root.into()),
        }
    }
}

impl HeartbeatSource for FileHeartbeatSource {
    fn latest(&self) -> Option<DateTime<Utc>> {
        self.heartbeats
            .all()
            .ok()?
            .into_iter()
            .map(|hb| hb.last_heartbeat_at)
            .max()
    }
}

/// Supervisor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Starting,
    Running,
    Crashed,
    Backoff,
    Stopped,
}

/// Operator-visible status, atomically written to
/// `supervisor.status.json` on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_pid: Option<u32>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    pub backoff_secs: u64,
    pub updated_at: DateTime<Utc>,
}

/// The watchdog state machine.
pub struct Supervisor<P: ProcessControl, H: HeartbeatSource> {
    process: P,
    heartbeats: H,
    config: OrchestratorConfig,

    phase: Phase,
    managed_pid: Option<u32>,
    spawned_at: Option<DateTime<Utc>>,
    backoff_interval: Duration,
    backoff_until: Option<DateTime<Utc>>,
    restart_count: u32,
    /// Restart instants within the sliding window, oldest first.
    restart_times: VecDeque<DateTime<Utc>>,
    last_restart_at: Option<DateTime<Utc>>,
    healthy_streak: u32,
}

impl<P: ProcessControl, H: HeartbeatSource> Supervisor<P, H> {
    pub fn new(config: OrchestratorConfig, process: P, heartbeats: H) -> Self {
        Self {
            process,
            heartbeats,
            config,
            phase: Phase::Starting,
            managed_pid: None,
            spawned_at: None,
            backoff_interval: Duration::ZERO,
            backoff_until: None,
            restart_count: 0,
            restart_times: VecDeque::new(),
            last_restart_at: None,
            healthy_streak: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn backoff_interval(&self) -> Duration {
        self.backoff_interval
    }

    pub fn managed_pid(&self) -> Option<u32> {
        self.managed_pid
    }

    /// Advance the machine one step at time `now`; returns how long the
    /// caller should wait before the next step.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Duration {
        match self.phase {
            Phase::Starting => self.tick_starting(now),
            Phase::Running => self.tick_running(now),
            Phase::Crashed => self.tick_crashed(now),
            Phase::Backoff => self.tick_backoff(now),
            Phase::Stopped => self.config.check_interval,
        }
    }

    fn tick_starting(&mut self, now: DateTime<Utc>) -> Duration {
        if self.managed_pid.is_none() {
            match self.process.spawn() {
                Ok(pid) => {
                    info!(pid, "Worker spawned");
                    self.managed_pid = Some(pid);
                    self.spawned_at = Some(now);
                    self.write_pid_file(pid);
                    self.write_status(now);
                }
                Err(e) => {
                    warn!(error = %e, "Worker spawn failed");
                    self.enter_crashed(now);
                    return Duration::ZERO;
                }
            }
        }

        let spawned_at = self.spawned_at.unwrap_or(now);
        let seen_first_beat = self
            .heartbeats
            .latest()
            .map(|beat| beat >= spawned_at)
            .unwrap_or(false);
        if seen_first_beat {
            info!(pid = self.managed_pid, "Initial heartbeat observed, worker RUNNING");
            self.phase = Phase::Running;
            self.healthy_streak = 0;
            self.write_status(now);
        } else if to_std(now - spawned_at) > self.config.startup_timeout {
            warn!("No initial heartbeat within startup timeout");
            self.enter_crashed(now);
            return Duration::ZERO;
        }
        self.config.check_interval.min(Duration::from_secs(1))
    }

    fn tick_running(&mut self, now: DateTime<Utc>) -> Duration {
        let pid = match self.managed_pid {
            Some(pid) => pid,
            None => {
                self.enter_crashed(now);
                return Duration::ZERO;
            }
        };

        let alive = self.process.is_alive(pid);
        let stale = match self.heartbeats.latest() {
            Some(beat) => to_std(now - beat) > self.config.staleness_threshold(),
            None => true,
        };

        if !alive {
            warn!(pid, "Worker process exited");
            self.enter_crashed(now);
            return Duration::ZERO;
        }
        if stale {
            warn!(pid, "Worker heartbeat stale, presuming hung");
            self.enter_crashed(now);
            return Duration::ZERO;
        }

        self.healthy_streak += 1;
        if self.restart_count > 0 && self.healthy_streak >= self.config.healthy_reset_after {
            info!(
                healthy_checks = self.healthy_streak,
                "Sustained healthy period, resetting restart count"
            );
            self.restart_count = 0;
            self.restart_times.clear();
            self.write_status(now);
        }
        self.config.check_interval
    }

    fn tick_crashed(&mut self, now: DateTime<Utc>) -> Duration {
        // Exponential backoff, capped.
        let exponent = self.restart_count.saturating_sub(1).min(16);
        self.backoff_interval = self
            .config
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.config.backoff_cap);
        self.backoff_until = Some(now + chrono::Duration::from_std(self.backoff_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60)));
        info!(
            restart_count = self.restart_count,
            backoff_secs = self.backoff_interval.as_secs(),
            "Entering restart backoff"
        );
        self.phase = Phase::Backoff;
        self.write_status(now);
        self.backoff_interval
    }

    fn tick_backoff(&mut self, now: DateTime<Utc>) -> Duration {
        match self.backoff_until {
            Some(until) if now < until => to_std(until - now),
            _ => {
                self.phase = Phase::Starting;
                self.write_status(now);
                Duration::ZERO
            }
        }
    }

    /// CRASHED entry: terminate any lingering process, account the restart
    /// against the sliding window, and stop hard once the ceiling is hit.
    fn enter_crashed(&mut self, now: DateTime<Utc>) {
        if let Some(pid) = self.managed_pid.take() {
            self.process.kill(pid);
        }
        self.spawned_at = None;
        self.healthy_streak = 0;
        self.restart_count += 1;
        self.last_restart_at = Some(now);
        self.restart_times.push_back(now);

        let window = chrono::Duration::from_std(self.config.restart_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        while let Some(&oldest) = self.restart_times.front() {
            if now - oldest > window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }

        if self.restart_times.len() as u32 > self.config.restart_ceiling {
            error!(
                restarts = self.restart_times.len(),
                window_secs = self.config.restart_window.as_secs(),
                "FATAL: restart ceiling breached, supervisor stopping"
            );
            self.phase = Phase::Stopped;
        } else {
            self.phase = Phase::Crashed;
        }
        self.write_status(now);
    }

    /// True once the machine gave up restarting.
    pub fn exhausted(&self) -> bool {
        self.phase == Phase::Stopped
    }

    pub fn status(&self, now: DateTime<Utc>) -> SupervisorStatus {
        SupervisorStatus {
            phase: self.phase,
            managed_pid: self.managed_pid,
            restart_count: self.restart_count,
            last_restart_at: self.last_restart_at,
            backoff_secs: self.backoff_interval.as_secs(),
            updated_at: now,
        }
    }

    fn write_status(&self, now: DateTime<Utc>) {
        let path = paths::supervisor_status(&self.config.data_root);
        if let Err(e) = atomic::write_json(&path, &self.status(now)) {
            warn!(error = %e, "Failed to write supervisor status file");
        }
    }

    fn write_pid_file(&self, pid: u32) {
        let path = paths::worker_pid_file(&self.config.data_root);
        if let Err(e) = atomic::write_bytes(&path, pid.to_string().as_bytes()) {
            warn!(error = %e, "Failed to write worker pid file");
        }
    }

    /// Clean shutdown removes the pid file; crashes leave it for adoption.
    fn remove_pid_file(&self) {
        let path = paths::worker_pid_file(&self.config.data_root);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove worker pid file");
            }
        }
    }

    /// Drive the machine until shutdown or exhaustion.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        info!("Supervisor started");
        loop {
            if *shutdown.borrow() {
                if let Some(pid) = self.managed_pid.take() {
                    info!(pid, "Supervisor stopping, terminating worker");
                    self.process.kill(pid);
                }
                self.phase = Phase::Stopped;
                self.write_status(Utc::now());
                self.remove_pid_file();
                return Ok(());
            }

            let sleep = self.tick(Utc::now());
            if self.exhausted() {
                return Err(SupervisorError::Exhausted {
                    restarts: self.restart_times.len() as u32,
                    window_secs: self.config.restart_window.as_secs(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep.max(Duration::from_millis(10))) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeProcInner {
        next_pid: u32,
        alive: bool,
        spawns: u32,
        kills: Vec<u32>,
        fail_spawn: bool,
    }

    #[derive(Clone, Default)]
    struct FakeProcess(Arc<Mutex<FakeProcInner>>);

    impl FakeProcess {
        fn lock(&self) -> std::sync::MutexGuard<'_, FakeProcInner> {
            self.0.lock().expect("fake process lock")
        }
    }

    impl ProcessControl for FakeProcess {
        fn spawn(&mut self) -> Result<u32, SupervisorError> {
            let mut inner = self.lock();
            if inner.fail_spawn {
                return Err(SupervisorError::Spawn("exec failed".into()));
            }
            inner.next_pid += 1;
            inner.alive = true;
            inner.spawns += 1;
            Ok(inner.next_pid)
        }

        fn is_alive(&mut self, _pid: u32) -> bool {
            self.lock().alive
        }

        fn kill(&mut self, pid: u32) {
            let mut inner = self.lock();
            inner.alive = false;
            inner.kills.push(pid);
        }
    }

    #[derive(Clone, Default)]
    struct FakeHeartbeat(Arc<Mutex<Option<DateTime<Utc>>>>);

    impl FakeHeartbeat {
        fn set(&self, at: DateTime<Utc>) {
            *self.0.lock().expect("fake heartbeat lock") = Some(at);
        }
    }

    impl HeartbeatSource for FakeHeartbeat {
        fn latest(&self) -> Option<DateTime<Utc>> {
            *self.0.lock().expect("fake heartbeat lock")
        }
    }

    fn config_in(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            data_root: dir.to_path_buf(),
            ..OrchestratorConfig::default()
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn harness(
        dir: &Path,
    ) -> (
        Supervisor<FakeProcess, FakeHeartbeat>,
        FakeProcess,
        FakeHeartbeat,
    ) {
        let process = FakeProcess::default();
        let heartbeat = FakeHeartbeat::default();
        let supervisor = Supervisor::new(config_in(dir), process.clone(), heartbeat.clone());
        (supervisor, process, heartbeat)
    }

    #[test]
    fn test_startup_reaches_running_on_first_heartbeat() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, process, heartbeat) = harness(dir.path());
        let t0 = Utc::now();

        sup.tick(t0);
        assert_eq!(sup.phase(), Phase::Starting, "no heartbeat yet");
        assert_eq!(process.lock().spawns, 1);

        heartbeat.set(t0 + secs(1));
        sup.tick(t0 + secs(2));
        assert_eq!(sup.phase(), Phase::Running);
        assert_eq!(sup.restart_count(), 0);
    }

    #[test]
    fn test_startup_timeout_crashes_and_respawns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, process, heartbeat) = harness(dir.path());
        let t0 = Utc::now();

        sup.tick(t0);
        // Past the 30s startup timeout with no heartbeat.
        sup.tick(t0 + secs(31));
        assert_eq!(sup.phase(), Phase::Crashed);
        assert_eq!(sup.restart_count(), 1);

        sup.tick(t0 + secs(31)); // Crashed → Backoff
        assert_eq!(sup.phase(), Phase::Backoff);
        sup.tick(t0 + secs(40)); // backoff elapsed → Starting
        assert_eq!(sup.phase(), Phase::Starting);
        sup.tick(t0 + secs(40)); // respawn
        assert_eq!(process.lock().spawns, 2);

        heartbeat.set(t0 + secs(41));
        sup.tick(t0 + secs(42));
        assert_eq!(sup.phase(), Phase::Running);
    }

    #[test]
    fn test_stale_heartbeat_triggers_exactly_one_restart_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, process, heartbeat) = harness(dir.path());
        let t0 = Utc::now();

        sup.tick(t0);
        heartbeat.set(t0);
        sup.tick(t0 + secs(1));
        assert_eq!(sup.phase(), Phase::Running);

        // Heartbeat stops; staleness threshold is 15s (5s cadence × 3).
        let t_stale = t0 + secs(20);
        sup.tick(t_stale);
        assert_eq!(sup.phase(), Phase::Crashed);
        assert_eq!(sup.restart_count(), 1);
        assert_eq!(process.lock().kills.len(), 1, "lingering process terminated");

        // One full recovery cycle, then health again, no second restart.
        sup.tick(t_stale); // → Backoff
        sup.tick(t_stale + secs(5)); // → Starting
        sup.tick(t_stale + secs(5)); // respawn
        heartbeat.set(t_stale + secs(6));
        sup.tick(t_stale + secs(7));
        assert_eq!(sup.phase(), Phase::Running);
        sup.tick(t_stale + secs(8));
        assert_eq!(sup.restart_count(), 1, "exactly one restart recorded");
        assert_eq!(process.lock().spawns, 2);
    }

    #[test]
    fn test_dead_process_crashes_even_with_fresh_heartbeat() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, process, heartbeat) = harness(dir.path());
        let t0 = Utc::now();

        sup.tick(t0);
        heartbeat.set(t0);
        sup.tick(t0 + secs(1));
        assert_eq!(sup.phase(), Phase::Running);

        process.lock().alive = false;
        heartbeat.set(t0 + secs(2));
        sup.tick(t0 + secs(3));
        assert_eq!(sup.phase(), Phase::Crashed);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, _process, _heartbeat) = harness(dir.path());
        let mut now = Utc::now();
        let mut seen = Vec::new();

        // Crash repeatedly without ever becoming healthy (ceiling is 5).
        for _ in 0..5 {
            // Starting (spawn), then time out waiting for a heartbeat.
            sup.tick(now);
            now = now + secs(31);
            sup.tick(now);
            assert_eq!(sup.phase(), Phase::Crashed);
            sup.tick(now); // compute backoff
            seen.push(sup.backoff_interval());
            now = now + chrono::Duration::from_std(sup.backoff_interval()).expect("dur") + secs(1);
            sup.tick(now); // leave Backoff
            assert_eq!(sup.phase(), Phase::Starting);
        }

        assert_eq!(
            seen,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ],
            "backoff doubles from the base"
        );

        // With a tiny cap every interval clamps.
        let mut cfg = config_in(dir.path());
        cfg.backoff_cap = Duration::from_secs(3);
        let mut sup = Supervisor::new(cfg, FakeProcess::default(), FakeHeartbeat::default());
        let mut now = Utc::now();
        for _ in 0..4 {
            sup.tick(now);
            now = now + secs(31);
            sup.tick(now);
            sup.tick(now);
            assert!(sup.backoff_interval() <= Duration::from_secs(3));
            now = now + secs(4);
            sup.tick(now);
        }
    }

    #[test]
    fn test_restart_ceiling_stops_the_supervisor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config_in(dir.path());
        cfg.restart_ceiling = 2;
        cfg.backoff_cap = Duration::from_secs(1);
        let mut sup = Supervisor::new(cfg, FakeProcess::default(), FakeHeartbeat::default());
        let mut now = Utc::now();

        for _ in 0..3 {
            sup.tick(now); // spawn
            now = now + secs(31);
            sup.tick(now); // startup timeout → crash
            if sup.exhausted() {
                break;
            }
            sup.tick(now); // backoff
            now = now + secs(2);
            sup.tick(now); // → Starting
        }

        assert_eq!(sup.phase(), Phase::Stopped, "no restart-looping forever");
        assert!(sup.exhausted());
    }

    #[test]
    fn test_old_restarts_fall_out_of_sliding_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config_in(dir.path());
        cfg.restart_ceiling = 2;
        let mut sup = Supervisor::new(cfg, FakeProcess::default(), FakeHeartbeat::default());
        let mut now = Utc::now();

        // Three crashes, each separated by more than the 10 minute window:
        // never more than one restart inside the window, so never Stopped.
        for _ in 0..3 {
            sup.tick(now);
            now = now + secs(31);
            sup.tick(now);
            assert_ne!(sup.phase(), Phase::Stopped);
            sup.tick(now);
            now = now + secs(700);
            sup.tick(now);
        }
        assert_eq!(sup.restart_count(), 3);
        assert_ne!(sup.phase(), Phase::Stopped);
    }

    #[test]
    fn test_sustained_health_resets_restart_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config_in(dir.path());
        cfg.healthy_reset_after = 3;
        let heartbeat = FakeHeartbeat::default();
        let mut sup = Supervisor::new(cfg, FakeProcess::default(), heartbeat.clone());
        let mut now = Utc::now();

        // One crash, then recovery.
        sup.tick(now);
        now = now + secs(31);
        sup.tick(now); // crash #1
        sup.tick(now); // backoff
        now = now + secs(2);
        sup.tick(now); // → Starting
        sup.tick(now); // respawn
        heartbeat.set(now);
        now = now + secs(1);
        sup.tick(now); // → Running
        assert_eq!(sup.restart_count(), 1);

        // Three consecutive healthy checks reset the count.
        for _ in 0..3 {
            now = now + secs(1);
            heartbeat.set(now);
            sup.tick(now);
        }
        assert_eq!(sup.restart_count(), 0, "healthy streak clears the penalty");
    }

    #[test]
    fn test_status_file_written_on_transitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut sup, _process, heartbeat) = harness(dir.path());
        let t0 = Utc::now();

        sup.tick(t0);
        heartbeat.set(t0);
        sup.tick(t0 + secs(1));

        let status: SupervisorStatus = genedetect_store::atomic::read_json(
            &paths::supervisor_status(dir.path()),
        )
        .expect("read status")
        .expect("status file exists");
        assert_eq!(status.phase, Phase::Running);
        assert!(status.managed_pid.is_some());
        assert_eq!(status.restart_count, 0);

        let pid_file = paths::worker_pid_file(dir.path());
        let pid_text = std::fs::read_to_string(pid_file).expect("pid file");
        assert_eq!(pid_text, status.managed_pid.expect("pid").to_string());
    }

    #[test]
    fn test_spawn_failure_counts_as_crash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let process = FakeProcess::default();
        process.lock().fail_spawn = true;
        let mut sup = Supervisor::new(
            config_in(dir.path()),
            process.clone(),
            FakeHeartbeat::default(),
        );
        sup.tick(Utc::now());
        assert_eq!(sup.phase(), Phase::Crashed);
        assert_eq!(sup.restart_count(), 1);
    }
}
