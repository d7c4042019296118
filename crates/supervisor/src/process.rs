// crates/supervisor/src/process.rs
//! Production process control: spawn the worker binary and track it.
//!
//! Liveness prefers the held child handle (`try_wait`), falling back to a
//! `sysinfo` pid lookup when the handle is gone, e.g. a pid adopted from
//! the pid file after a supervisor restart.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

use genedetect_core::SupervisorError;

use crate::ProcessControl;

/// Spawns and terminates the supervised worker process.
pub struct WorkerProcess {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
    system: System,
}

impl WorkerProcess {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
            system: System::new(),
        }
    }

    /// Build from `GENEDETECT_WORKER_CMD`, defaulting to the worker binary
    /// on PATH.
    pub fn from_env() -> Self {
        let raw = std::env::var("GENEDETECT_WORKER_CMD")
            .unwrap_or_else(|_| "genedetect-worker".to_string());
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "genedetect-worker".into());
        Self::new(program, parts.collect())
    }

    fn pid_exists(&mut self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        self.system.process(target).is_some()
    }
}

impl ProcessControl for WorkerProcess {
    fn spawn(&mut self) -> Result<u32, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", self.program.display())))?;
        let pid = child.id();
        self.child = Some(child);
        Ok(pid)
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        if let Some(child) = self.child.as_mut() {
            if child.id() == pid {
                return match child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        info!(pid, %status, "Worker process exited");
                        false
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "try_wait failed, falling back to pid lookup");
                        self.pid_exists(pid)
                    }
                };
            }
        }
        self.pid_exists(pid)
    }

    fn kill(&mut self, pid: u32) {
        if let Some(mut child) = self.child.take() {
            if child.id() == pid {
                if let Err(e) = child.kill() {
                    warn!(pid, error = %e, "Failed to kill worker child");
                }
                // Reap so the pid doesn't linger as a zombie.
                let _ = child.wait();
                return;
            }
            self.child = Some(child);
        }
        let target = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        if let Some(process) = self.system.process(target) {
            if !process.kill() {
                warn!(pid, "Failed to signal adopted worker pid");
            }
        }
    }
}
