//! Process runner - start external programs, stream their output and stop
//! them with a terminate-then-kill escalation

use crate::diagnostics::DiagnosticsSink;
use crate::request::shell_join;
use crate::{Result, ScanError};
use bytes::Bytes;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 8 * 1024;
/// How long to keep collecting output after a process has exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Program plus arguments, launched without a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Human readable command line
    pub fn describe(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_join(&words)
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command
    }
}

/// Context a command is executed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    Direct,
    /// `nice -n <niceness> <program> ...`
    Nice { nice_path: String, niceness: i32 },
    /// Prefix the command with another program, e.g. a remote shell client
    Wrapper { program: String, args: Vec<String> },
}

impl ExecutionContext {
    pub fn apply(&self, spec: CommandSpec) -> CommandSpec {
        match self {
            ExecutionContext::Direct => spec,
            ExecutionContext::Nice { nice_path, niceness } => CommandSpec {
                program: nice_path.clone(),
                args: ["-n".to_string(), niceness.to_string(), spec.program]
                    .into_iter()
                    .chain(spec.args)
                    .collect(),
                working_dir: spec.working_dir,
            },
            ExecutionContext::Wrapper { program, args } => CommandSpec {
                program: program.clone(),
                args: args
                    .iter()
                    .cloned()
                    .chain(std::iter::once(spec.program))
                    .chain(spec.args)
                    .collect(),
                working_dir: spec.working_dir,
            },
        }
    }
}

/// A piece of output as it arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Raw stdout bytes, chunk boundaries are arbitrary
    Stdout(Bytes),
    /// One stderr line without its terminator
    Stderr(String),
}

/// How a process came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Exited on its own
    Exited,
    /// Exited after the terminate signal, within the grace period
    Graceful,
    /// Had to be killed after the grace period
    Forced,
}

/// Final status of a started process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Termination,
}

impl ExitReport {
    fn from_status(status: ExitStatus, termination: Termination) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            termination,
        }
    }

    fn lost() -> Self {
        Self {
            code: None,
            signal: None,
            termination: Termination::Exited,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    // no polite signal available, terminate is a kill here
    child.start_kill()
}

/// Two-phase stop: terminate, wait up to `grace`, then kill
pub async fn terminate_with_grace(
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<(Termination, ExitStatus)> {
    if let Some(status) = child.try_wait()? {
        return Ok((Termination::Exited, status));
    }

    send_terminate(child)?;

    match timeout(grace, child.wait()).await {
        Ok(status) => Ok((Termination::Graceful, status?)),
        Err(_) => {
            child.start_kill()?;
            let status = child.wait().await?;
            Ok((Termination::Forced, status))
        }
    }
}

/// Clonable remote control of a running process
#[derive(Debug, Clone)]
pub struct ProcessControl {
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl ProcessControl {
    /// Request termination; idempotent and never blocks
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for exit; may be awaited from several places at once
    pub async fn wait(&self) -> ExitReport {
        let mut exit = self.exit.clone();
        let result = match exit.wait_for(|report| report.is_some()).await {
            Ok(report) => (*report).clone().unwrap_or_else(ExitReport::lost),
            Err(_) => ExitReport::lost(),
        };
        result
    }

    pub fn try_exit(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }
}

/// A started process with its live output stream
#[derive(Debug)]
pub struct RunningProcess {
    pid: Option<u32>,
    description: String,
    output: mpsc::Receiver<ProcessOutput>,
    control: ProcessControl,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Next piece of output, `None` once both streams are closed
    pub async fn next_output(&mut self) -> Option<ProcessOutput> {
        self.output.recv().await
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub async fn wait(&self) -> ExitReport {
        self.control.wait().await
    }
}

/// Collected result of a process run to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Everything needed to explain a failure in one message
    pub fn diagnostic_info(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "exit code: {}\nstdout:\n===============================\n{}\nstderr:\n===============================\n{}",
            code,
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }
}

/// Starts processes and supervises them until exit
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
    sink: DiagnosticsSink,
}

impl ProcessRunner {
    pub fn new(grace: Duration, sink: DiagnosticsSink) -> Self {
        Self { grace, sink }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn sink(&self) -> &DiagnosticsSink {
        &self.sink
    }

    /// Spawn `spec` and begin streaming its output
    pub fn start(&self, spec: &CommandSpec) -> Result<RunningProcess> {
        let description = spec.describe();
        debug!("Starting process: {}", description);

        let mut child = spec.to_command().spawn().map_err(|e| ScanError::ProcessStartError {
            command: description.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ScanError::ProcessStartError {
            command: description.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ScanError::ProcessStartError {
            command: description.clone(),
            reason: "failed to capture stderr".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if stdout_tx.send(ProcessOutput::Stdout(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read stdout: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(ProcessOutput::Stderr(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stderr: {}", e);
                        break;
                    }
                }
            }
        });

        let pid = child.id();
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let supervisor_cancel = cancel.clone();
        let grace = self.grace;
        let sink = self.sink.clone();
        let name = spec.program.clone();
        tokio::spawn(async move {
            let report = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ExitReport::from_status(status, Termination::Exited),
                    Err(e) => {
                        warn!("Failed to wait for '{}': {}", name, e);
                        ExitReport::lost()
                    }
                },
                _ = supervisor_cancel.cancelled() => {
                    sink.info(format!("Sending terminate signal to the '{}' process...", name));
                    match terminate_with_grace(&mut child, grace).await {
                        Ok((termination, status)) => {
                            match termination {
                                Termination::Exited | Termination::Graceful => sink.info(format!(
                                    "The '{}' process has been terminated gracefully.",
                                    name
                                )),
                                Termination::Forced => sink.warning(format!(
                                    "The '{}' process didn't terminate within {} ms, it has been killed instead.",
                                    name,
                                    grace.as_millis()
                                )),
                            }
                            ExitReport::from_status(status, termination)
                        }
                        Err(e) => {
                            sink.error(format!("Failed to stop the '{}' process: {}", name, e));
                            ExitReport::lost()
                        }
                    }
                }
            };
            debug!("Process '{}' finished: {:?}", name, report);
            let _ = exit_tx.send(Some(report));
        });

        Ok(RunningProcess {
            pid,
            description,
            output: rx,
            control: ProcessControl {
                cancel,
                exit: exit_rx,
            },
        })
    }

    /// Run `spec` to completion, collecting its output
    pub async fn output(&self, spec: &CommandSpec, limit: Duration) -> Result<CommandOutput> {
        let mut process = self.start(spec)?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let collected = timeout(limit, async {
            loop {
                tokio::select! {
                    biased;
                    Some(chunk) = process.output.recv() => collect(chunk, &mut stdout, &mut stderr),
                    report = process.control.wait() => break report,
                }
            }
        })
        .await;

        let report = match collected {
            Ok(report) => report,
            Err(_) => {
                process.cancel();
                process.wait().await;
                return Err(ScanError::TimeoutError(format!(
                    "'{}' did not finish within {} ms",
                    process.description,
                    limit.as_millis()
                )));
            }
        };

        // a daemonizing child may keep the pipes open after exit
        while let Ok(Some(chunk)) = timeout(DRAIN_TIMEOUT, process.output.recv()).await {
            collect(chunk, &mut stdout, &mut stderr);
        }

        Ok(CommandOutput {
            exit_code: report.code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: stderr.join("\n"),
        })
    }
}

fn collect(chunk: ProcessOutput, stdout: &mut Vec<u8>, stderr: &mut Vec<String>) {
    match chunk {
        ProcessOutput::Stdout(bytes) => stdout.extend_from_slice(&bytes),
        ProcessOutput::Stderr(line) => stderr.push(line),
    }
}
