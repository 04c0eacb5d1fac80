//! Stages backed by external executables.
//!
//! The executable is resolved under the configured directory, its stdout
//! is parsed line-by-line into progress events, and its exit code is the
//! authoritative success signal. Cancellation is forwarded as a graceful
//! termination first; the process is killed outright only after the grace
//! period, with `kill_on_drop` as the last-resort cleanup on every path.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pulse_types::{DataTag, OperationMode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stage::{ProgressSink, Stage, StageContext, StageFailure, StageOutcome};

/// How long a killed process gets to actually die before being abandoned.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Lines of stderr retained for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// One recognised progress line on stdout.
///
/// Anything that fails to parse as this shape is treated as free text and
/// forwarded as a plain message.
#[derive(Deserialize)]
struct ProgressLine {
    progress: u8,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// A stage whose work runs in a supervised external executable.
pub struct SubprocessStage {
    id: String,
    name: String,
    program: PathBuf,
    args: Vec<String>,
    dependencies: Vec<String>,
    required: Vec<DataTag>,
    produced: Vec<DataTag>,
    timeout: Option<Duration>,
    grace_period: Duration,
}

impl SubprocessStage {
    /// `program` is resolved under the engine's executable directory
    /// unless absolute.
    pub fn new(id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            program: program.into(),
            args: Vec::new(),
            dependencies: Vec::new(),
            required: Vec::new(),
            produced: Vec::new(),
            timeout: None,
            grace_period: Duration::from_secs(10),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn requires(mut self, tag: DataTag) -> Self {
        self.required.push(tag);
        self
    }

    pub fn produces(mut self, tag: DataTag) -> Self {
        self.produced.push(tag);
        self
    }

    pub fn after(mut self, stage_id: impl Into<String>) -> Self {
        self.dependencies.push(stage_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Time between the graceful termination signal and the kill.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn command(&self, ctx: &StageContext) -> (PathBuf, Command) {
        let program = if self.program.is_absolute() {
            self.program.clone()
        } else {
            ctx.executable_dir.join(&self.program)
        };
        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .env("PULSE_OPERATION_ID", &ctx.operation.operation_id)
            .env("PULSE_MODE", mode_name(ctx.operation.mode))
            .env("PULSE_DATA_DIR", &ctx.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(from) = ctx.operation.from_date {
            command.env("PULSE_FROM_DATE", from.to_string());
        }
        if let Some(to) = ctx.operation.to_date {
            command.env("PULSE_TO_DATE", to.to_string());
        }
        (program, command)
    }

    /// Graceful termination path taken when the stage scope is signalled.
    async fn shutdown(
        &self,
        mut child: Child,
        stderr_task: JoinHandle<Vec<String>>,
    ) -> StageFailure {
        stderr_task.abort();
        info!(stage = %self.id, "cancellation: requesting graceful exit");
        terminate_gracefully(&mut child);

        if let Ok(waited) = tokio::time::timeout(self.grace_period, child.wait()).await {
            let code = waited.as_ref().ok().and_then(|status| status.code());
            return StageFailure::new("cancelled; process exited within the grace period")
                .with_exit_code(code);
        }

        warn!(stage = %self.id, grace = ?self.grace_period, "grace period elapsed; killing process");
        let _ = child.start_kill();
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(_) => StageFailure::new("cancelled; process killed after the grace period"),
            Err(_) => {
                warn!(stage = %self.id, "process survived the kill wait; abandoning");
                StageFailure::new("cancelled; process did not die after kill and was abandoned")
            }
        }
    }
}

#[async_trait]
impl Stage for SubprocessStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn required_inputs(&self) -> Vec<DataTag> {
        self.required.clone()
    }

    fn produced_outputs(&self) -> Vec<DataTag> {
        self.produced.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: ProgressSink,
    ) -> Result<StageOutcome, StageFailure> {
        let (program, mut command) = self.command(&ctx);
        let mut child = command.spawn().map_err(|err| {
            StageFailure::new(format!("failed to start `{}`: {err}", program.display()))
        })?;
        info!(stage = %self.id, program = %program.display(), "subprocess started");

        let Some(stdout) = child.stdout.take() else {
            return Err(StageFailure::new("subprocess stdout was not captured"));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(StageFailure::new("subprocess stderr was not captured"));
        };
        let stderr_task = tokio::spawn(collect_stderr_tail(stderr));

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => handle_line(&line, &progress).await,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(stage = %self.id, %err, "stdout read error");
                        break;
                    }
                },
                _ = ctx.scope.cancelled() => {
                    return Err(self.shutdown(child, stderr_task).await);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| StageFailure::new(format!("failed waiting for subprocess: {err}")))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            debug!(stage = %self.id, "subprocess exited cleanly");
            Ok(StageOutcome::default()
                .with_message(format!("{} finished", program.display()))
                .with_metadata("exit_code", Value::from(0)))
        } else {
            let message = if stderr_tail.is_empty() {
                format!("subprocess exited with {status}")
            } else {
                stderr_tail.join("\n")
            };
            Err(StageFailure::new(message).with_exit_code(status.code()))
        }
    }
}

fn mode_name(mode: OperationMode) -> &'static str {
    match mode {
        OperationMode::Initial => "initial",
        OperationMode::Accumulative => "accumulative",
        OperationMode::Full => "full",
    }
}

/// Maps one stdout line onto the progress protocol.
async fn handle_line(line: &str, progress: &ProgressSink) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<ProgressLine>(trimmed) {
            progress
                .update_with(
                    parsed.progress,
                    parsed.message.unwrap_or_default(),
                    parsed.metadata,
                )
                .await;
            return;
        }
    }
    if let Some(rest) = trimmed.strip_prefix("progress=") {
        let (percent, message) = rest.split_once(' ').unwrap_or((rest, ""));
        if let Ok(percent) = percent.parse::<u8>() {
            progress.update(percent, message.trim()).await;
            return;
        }
    }
    progress.message(trimmed).await;
}

async fn collect_stderr_tail(stderr: ChildStderr) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(%err, "SIGTERM failed; falling back to kill");
                let _ = child.start_kill();
            }
        }
        None => {
            // Already reaped.
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) {
    // No portable graceful signal; go straight to kill.
    let _ = child.start_kill();
}
