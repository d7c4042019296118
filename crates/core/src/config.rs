// crates/core/src/config.rs
//! Configuration surface for the orchestration subsystem.
//!
//! Defaults are conservative and match the original deployment; every knob
//! can be overridden with a `GENEDETECT_*` environment variable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Recognized options for the store, worker, and supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root directory for jobs, heartbeats, logs, and status files.
    pub data_root: PathBuf,

    /// Worker poll interval between claim attempts.
    pub poll_interval: Duration,
    /// Heartbeat refresh cadence while the worker is alive.
    pub heartbeat_cadence: Duration,
    /// Staleness threshold = cadence × this multiplier. Must exceed 1 by a
    /// safety factor so scheduling jitter never looks like a dead worker.
    pub staleness_multiplier: u32,

    /// Default retry budget for jobs that don't specify one.
    pub max_retries: u32,

    /// Supervisor restart backoff: base doubles per restart up to the cap.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Supervisor check interval while the worker looks healthy.
    pub check_interval: Duration,
    /// How long to wait for the first heartbeat after a spawn.
    pub startup_timeout: Duration,
    /// Restarts beyond this count within `restart_window` stop the
    /// supervisor instead of restart-looping.
    pub restart_ceiling: u32,
    pub restart_window: Duration,
    /// Consecutive healthy checks before `restart_count` resets to zero.
    pub healthy_reset_after: u32,

    /// Log rotation thresholds for worker and per-job logs.
    pub log_max_bytes: u64,
    pub log_max_files: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_root: crate::paths::default_data_root(),
            poll_interval: Duration::from_secs(2),
            heartbeat_cadence: Duration::from_secs(5),
            staleness_multiplier: 3,
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            check_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
            restart_ceiling: 5,
            restart_window: Duration::from_secs(600),
            healthy_reset_after: 30,
            log_max_bytes: 5 * 1024 * 1024,
            log_max_files: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Maximum tolerated heartbeat gap before a worker is presumed dead.
    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_cadence * self.staleness_multiplier
    }

    /// Defaults overlaid with any `GENEDETECT_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(dir) = env_var("GENEDETECT_DATA_DIR") {
            cfg.data_root = PathBuf::from(dir);
        }
        if let Some(secs) = env_secs("GENEDETECT_POLL_INTERVAL_SECS") {
            cfg.poll_interval = secs;
        }
        if let Some(secs) = env_secs("GENEDETECT_HEARTBEAT_CADENCE_SECS") {
            cfg.heartbeat_cadence = secs;
        }
        if let Some(n) = env_u32("GENEDETECT_STALENESS_MULTIPLIER") {
            cfg.staleness_multiplier = n.max(2);
        }
        if let Some(n) = env_u32("GENEDETECT_MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(secs) = env_secs("GENEDETECT_BACKOFF_BASE_SECS") {
            cfg.backoff_base = secs;
        }
        if let Some(secs) = env_secs("GENEDETECT_BACKOFF_CAP_SECS") {
            cfg.backoff_cap = secs;
        }
        if let Some(secs) = env_secs("GENEDETECT_CHECK_INTERVAL_SECS") {
            cfg.check_interval = secs;
        }
        if let Some(secs) = env_secs("GENEDETECT_STARTUP_TIMEOUT_SECS") {
            cfg.startup_timeout = secs;
        }
        if let Some(n) = env_u32("GENEDETECT_RESTART_CEILING") {
            cfg.restart_ceiling = n;
        }
        if let Some(secs) = env_secs("GENEDETECT_RESTART_WINDOW_SECS") {
            cfg.restart_window = secs;
        }
        if let Some(n) = env_u32("GENEDETECT_HEALTHY_RESET_AFTER") {
            cfg.healthy_reset_after = n;
        }
        if let Some(n) = env_u64("GENEDETECT_LOG_MAX_BYTES") {
            cfg.log_max_bytes = n;
        }
        if let Some(n) = env_u64("GENEDETECT_LOG_MAX_FILES") {
            cfg.log_max_files = n as usize;
        }
        cfg
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u32(key: &str) -> Option<u32> {
    env_var(key).and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_var(key).and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_secs)
}
