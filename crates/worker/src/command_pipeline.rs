// crates/worker/src/command_pipeline.rs
//! Pipeline collaborator that shells out to the external detection tool.
//!
//! The tool's algorithm is outside this subsystem; this adapter only speaks
//! a line protocol on the child's stdout:
//!
//! ```text
//! PROGRESS <percent> <message...>
//! WARN <message...>
//! RESULT <json PipelineOutput>
//! ```
//!
//! Cancellation is checked between stdout lines - the collaborator's yield
//! points. Exit code 75 (EX_TEMPFAIL) classifies as transient; any other
//! non-zero exit is permanent.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use genedetect_core::{
    JobInputs, Pipeline, PipelineContext, PipelineFailure, PipelineOptions, PipelineOutput,
};

/// Exit code the external tool uses for "try again later".
const EXIT_TEMPFAIL: i32 = 75;

/// Runs the configured detection command once per job.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl CommandPipeline {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build from `GENEDETECT_PIPELINE_CMD` (program followed by optional
    /// arguments, whitespace-separated).
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("GENEDETECT_PIPELINE_CMD").ok()?;
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts.collect()))
    }
}

impl Pipeline for CommandPipeline {
    fn run(
        &self,
        inputs: &JobInputs,
        options: &PipelineOptions,
        ctx: &dyn PipelineContext,
    ) -> Result<PipelineOutput, PipelineFailure> {
        let mut child = Command::new(&self.program)
            .args(&self.extra_args)
            .arg("--input")
            .arg(&inputs.input_ref)
            .arg("--db")
            .arg(&inputs.db_ref)
            .arg("--gene-map")
            .arg(&inputs.map_ref)
            .arg("--identity")
            .arg(options.identity.to_string())
            .arg("--coverage")
            .arg(options.coverage.to_string())
            .arg("--threads")
            .arg(options.threads.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                // The tool being missing or busy is recoverable once the
                // environment heals; don't burn the job on it.
                std::io::ErrorKind::NotFound => {
                    PipelineFailure::Transient(format!("detection tool unavailable: {e}"))
                }
                _ => PipelineFailure::Permanent(format!("failed to start detection tool: {e}")),
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut result: Option<PipelineOutput> = None;
        let mut warnings = Vec::new();

        for line in BufReader::new(stdout).lines() {
            if ctx.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PipelineFailure::Cancelled {
                    partial: result.map(|mut out| {
                        out.warnings.append(&mut warnings);
                        out
                    }),
                });
            }
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PipelineFailure::Transient(format!(
                        "lost pipeline output stream: {e}"
                    )));
                }
            };
            match line.split_once(' ') {
                Some(("PROGRESS", rest)) => {
                    if let Some((pct, message)) = rest.split_once(' ') {
                        match pct.parse::<u8>() {
                            Ok(pct) => ctx.report_progress(pct, message.trim()),
                            Err(_) => warn!(line = %line, "Unparseable progress line"),
                        }
                    }
                }
                Some(("WARN", message)) => warnings.push(message.trim().to_string()),
                Some(("RESULT", json)) => match serde_json::from_str(json) {
                    Ok(out) => result = Some(out),
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(PipelineFailure::Permanent(format!(
                            "malformed RESULT payload: {e}"
                        )));
                    }
                },
                _ => debug!(line = %line, "Ignoring pipeline chatter"),
            }
        }

        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text);
        }
        let status = child
            .wait()
            .map_err(|e| PipelineFailure::Permanent(format!("wait on detection tool: {e}")))?;

        if status.success() {
            match result {
                Some(mut out) => {
                    out.warnings.append(&mut warnings);
                    Ok(out)
                }
                None => Err(PipelineFailure::Permanent(
                    "detection tool exited without a RESULT line".into(),
                )),
            }
        } else if status.code() == Some(EXIT_TEMPFAIL) {
            Err(PipelineFailure::Transient(format!(
                "detection tool tempfail: {}",
                stderr_text.trim()
            )))
        } else {
            Err(PipelineFailure::Permanent(format!(
                "detection tool exited with {status}: {}",
                stderr_text.trim()
            )))
        }
    }
}
