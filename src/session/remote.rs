//! Scans of a remote machine over a `RemoteTransport`
//!
//! Input files are staged into a private remote temporary directory, the
//! scanner runs there with its output streamed back, requested artifacts are
//! copied home and the directory is removed. Removal and disconnect happen on
//! every path once the corresponding resource was acquired.

use super::{monitor, Abort, ProcessStopper, SessionContext, SessionState, Stage, StageResult};
use crate::capabilities::{CapabilityProbe, Capabilities};
use crate::diagnostics::DiagnosticsSink;
use crate::error::ScanError;
use crate::process::{CommandSpec, ExitReport, ProcessControl};
use crate::request::{
    shell_join, shell_quote, ArtifactKind, EvaluationPaths, RemoteConnection, ResultArtifacts, Tailoring,
};
use crate::transport::{RemoteTransport, SSH_CONNECTION_FAILURE};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::time::timeout;

const PID_FILE: &str = "scan.pid";
/// Polls of 100 ms for the pid file before giving up
const PID_FILE_POLLS: u32 = 20;
/// Exit status of the kill command when no pid was ever recorded
const PID_FILE_MISSING: i32 = 3;
const TAILORING_FILE: &str = "tailoring.xml";
const TEMP_DIR_TEMPLATE: &str = "${TMPDIR:-/tmp}/scap-runner.XXXXXXXX";

/// Remote temporary directory that must be released exactly once
#[derive(Debug)]
pub struct RemoteTempDir {
    path: String,
    released: bool,
}

impl RemoteTempDir {
    async fn create(transport: &dyn RemoteTransport) -> crate::Result<Self> {
        let output = transport
            .exec(&format!("mktemp -d \"{}\"", TEMP_DIR_TEMPLATE))
            .await?;

        let path = output.stdout.trim().to_string();
        if !output.success() || path.is_empty() {
            return Err(ScanError::RemoteCopyError {
                file: TEMP_DIR_TEMPLATE.to_string(),
                diagnostic: format!(
                    "could not create the temporary directory on {}. Diagnostic info:\n\n{}",
                    transport.describe(),
                    output.diagnostic_info()
                ),
            });
        }

        debug!("Remote working directory: {}", path);
        Ok(Self { path, released: false })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.path, name)
    }

    /// Remove the directory; a failure becomes exactly one warning
    async fn release(mut self, transport: &dyn RemoteTransport, sink: &DiagnosticsSink) {
        self.released = true;

        let command = format!("rm -rf -- {}", shell_quote(&self.path));
        let diagnostic = match transport.exec(&command).await {
            Ok(output) if output.success() => return,
            Ok(output) => output.diagnostic_info(),
            Err(e) => e.to_string(),
        };

        let error = ScanError::CleanupError {
            path: self.path.clone(),
            diagnostic,
        };
        sink.warning(error.to_string());
    }
}

impl Drop for RemoteTempDir {
    fn drop(&mut self) {
        if !self.released {
            warn!("Remote temporary directory {} was never removed", self.path);
        }
    }
}

/// Terminates the remote scanner by pid, then tears down the local client
struct RemoteStopper<'a> {
    transport: &'a dyn RemoteTransport,
    pid_file: String,
    sudo: bool,
}

impl<'a> RemoteStopper<'a> {
    async fn signal(&self, ctx: &SessionContext, signal: &str) {
        let command = kill_command(&self.pid_file, self.sudo, signal);

        match self.transport.exec(&command).await {
            Ok(output) if output.success() => {}
            Ok(output) if output.exit_code == Some(PID_FILE_MISSING) => ctx.sink.warning(format!(
                "The remote scanner never recorded its process id, {} was not delivered. \
                 It may keep running on {} after the local client is stopped.",
                signal,
                self.transport.describe()
            )),
            Ok(output) => ctx.sink.warning(format!(
                "Failed to send {} to the remote scanner. Diagnostic info:\n{}",
                signal,
                output.diagnostic_info()
            )),
            Err(e) => ctx
                .sink
                .warning(format!("Failed to send {} to the remote scanner: {}", signal, e)),
        }
    }
}

/// Shell command signalling the pid recorded in `pid_file`; a scanner that
/// was only just started gets a short while to record it
fn kill_command(pid_file: &str, sudo: bool, signal: &str) -> String {
    let pid = shell_quote(pid_file);
    let sudo = if sudo { "sudo -n " } else { "" };
    format!(
        "i=0; while [ ! -s {pid} ] && [ $i -lt {tries} ]; do sleep 0.1; i=$((i+1)); done; \
         [ -s {pid} ] || exit {missing}; \
         {sudo}kill -{signal} $(cat {pid}) 2>/dev/null",
        pid = pid,
        tries = PID_FILE_POLLS,
        missing = PID_FILE_MISSING,
        sudo = sudo,
        signal = signal
    )
}

#[async_trait]
impl<'a> ProcessStopper for RemoteStopper<'a> {
    async fn stop(&self, ctx: &SessionContext, process: &ProcessControl) -> ExitReport {
        if let Some(report) = process.try_exit() {
            return report;
        }

        ctx.sink.info("Sending terminate signal to the remote scanner...");
        self.signal(ctx, "TERM").await;

        let grace = ctx.runner.grace();
        match timeout(grace, process.wait()).await {
            Ok(report) => {
                ctx.sink.info("The remote scanner has been terminated gracefully.");
                report
            }
            Err(_) => {
                ctx.sink.warning(format!(
                    "The remote scanner didn't terminate within {} ms, it has been killed instead.",
                    grace.as_millis()
                ));
                self.signal(ctx, "KILL").await;
                process.cancel();
                process.wait().await
            }
        }
    }
}

/// Runs the scanner on another machine
pub struct RemoteScanSession {
    connection: RemoteConnection,
    transport: Box<dyn RemoteTransport>,
    connected: bool,
    workdir: Option<RemoteTempDir>,
    paths: Option<EvaluationPaths>,
    artifacts: ResultArtifacts,
}

impl RemoteScanSession {
    pub fn new(connection: RemoteConnection, transport: Box<dyn RemoteTransport>) -> Self {
        Self {
            connection,
            transport,
            connected: false,
            workdir: None,
            paths: None,
            artifacts: ResultArtifacts::default(),
        }
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }

    pub fn artifacts(&self) -> &ResultArtifacts {
        &self.artifacts
    }

    fn workdir(&self, stage: Stage) -> StageResult<&RemoteTempDir> {
        self.workdir.as_ref().ok_or_else(|| {
            Abort::failed(
                stage,
                ScanError::ConfigError("Session has not been prepared".to_string()),
            )
        })
    }

    pub(crate) async fn probe_capabilities(&mut self, ctx: &SessionContext) -> StageResult<Capabilities> {
        ctx.transition(SessionState::Connecting);
        ctx.sink.info(format!("Connecting to {}...", self.transport.describe()));
        self.transport
            .connect()
            .await
            .map_err(|e| Abort::failed(Stage::Connect, e))?;
        self.connected = true;
        ctx.checkpoint()?;

        ctx.transition(SessionState::ProbingCapabilities);
        ctx.sink.info("Querying capabilities on the remote machine...");
        CapabilityProbe::remote(&ctx.config.tool_path, self.transport.as_ref())
            .probe()
            .await
            .map_err(|e| Abort::failed(Stage::Probe, e))
    }

    pub(crate) async fn prepare(&mut self, ctx: &SessionContext) -> StageResult<()> {
        let request = &ctx.request;
        if !request.input.is_file() {
            return Err(Abort::failed(
                Stage::Prepare,
                ScanError::ConfigError(format!(
                    "Input document '{}' does not exist",
                    request.input.display()
                )),
            ));
        }

        let workdir = RemoteTempDir::create(self.transport.as_ref())
            .await
            .map_err(|e| Abort::failed(Stage::Prepare, e))?;
        let workdir = self.workdir.insert(workdir);

        ctx.sink.info("Copying input data to the remote machine...");
        let input_name = request
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.xml".to_string());
        let remote_input = workdir.file(&input_name);
        upload(self.transport.as_ref(), &request.input, &remote_input).await?;
        ctx.checkpoint()?;

        let tailoring = match &request.tailoring {
            None => None,
            Some(tailoring) => {
                // an inline document lives on disk until `_staged` is dropped
                let (local, _staged) = match tailoring {
                    Tailoring::File(path) => (path.clone(), None),
                    Tailoring::Inline(document) => {
                        let file = write_temp(document).map_err(|e| Abort::failed(Stage::Prepare, e))?;
                        (file.path().to_path_buf(), Some(file))
                    }
                };
                let remote = workdir.file(TAILORING_FILE);
                upload(self.transport.as_ref(), &local, &remote).await?;
                Some(remote)
            }
        };

        let outputs: BTreeMap<ArtifactKind, String> = request
            .requested_artifacts()
            .into_iter()
            .map(|kind| (kind, workdir.file(kind.remote_name())))
            .collect();

        self.paths = Some(EvaluationPaths {
            input: remote_input,
            tailoring,
            outputs,
        });
        Ok(())
    }

    pub(crate) fn command(&self, ctx: &SessionContext, capabilities: &Capabilities) -> StageResult<CommandSpec> {
        let workdir = self.workdir(Stage::Prepare)?;
        let paths = self.paths.as_ref().ok_or_else(|| {
            Abort::failed(
                Stage::Prepare,
                ScanError::ConfigError("Session has not been prepared".to_string()),
            )
        })?;

        let mut words = Vec::new();
        if self.connection.sudo {
            words.extend(["sudo".to_string(), "-n".to_string()]);
        }
        words.push(ctx.config.tool_path.clone());
        words.extend(ctx.evaluation_args(capabilities, paths));

        let script = format!(
            "cd {dir} && echo $$ > {pid} && exec {scanner}",
            dir = shell_quote(workdir.path()),
            pid = shell_quote(&workdir.file(PID_FILE)),
            scanner = shell_join(&words)
        );
        Ok(self.transport.streaming_command(&script))
    }

    pub(crate) async fn run(&mut self, ctx: &SessionContext, command: &CommandSpec) -> StageResult<ExitReport> {
        let stopper = RemoteStopper {
            transport: self.transport.as_ref(),
            pid_file: self.workdir(Stage::Run)?.file(PID_FILE),
            sudo: self.connection.sudo,
        };

        let mut process = ctx
            .runner
            .start(command)
            .map_err(|e| Abort::failed(Stage::Run, e))?;
        let report = monitor(ctx, &mut process, &stopper).await?;

        if report.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(Abort::failed(
                Stage::Run,
                ScanError::ConnectionError(format!(
                    "Lost connection to {} while scanning",
                    self.transport.describe()
                )),
            )
            .with_exit_code(report.code));
        }

        Ok(report)
    }

    pub(crate) async fn collect_artifacts(&mut self, ctx: &SessionContext) -> StageResult<()> {
        ctx.transition(SessionState::Retrieving);
        ctx.sink.info("Copying results back from the remote machine...");

        for kind in ctx.request.requested_artifacts() {
            ctx.checkpoint()?;

            let remote = self.workdir(Stage::Retrieve)?.file(kind.remote_name());
            let destination = ctx.request.artifact_path(kind);
            if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
                // local problem, the connection is not involved
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    ctx.sink.warning(format!(
                        "Failed to copy back the {}: cannot create '{}': {}",
                        kind,
                        parent.display(),
                        e
                    ));
                    continue;
                }
            }

            let diagnostic = match self.transport.download(&remote, &destination).await {
                Ok(output) if output.success() => {
                    self.artifacts.set(kind, destination);
                    continue;
                }
                Ok(output) => output.diagnostic_info(),
                Err(e) => e.to_string(),
            };

            // a dead connection is fatal; a single missing file is not
            self.transport
                .check()
                .await
                .map_err(|e| Abort::failed(Stage::Retrieve, e))?;
            ctx.sink.warning(format!(
                "Failed to copy back the {}. Diagnostic info:\n{}",
                kind, diagnostic
            ));
        }

        Ok(())
    }

    pub(crate) async fn release(&mut self, ctx: &SessionContext, succeeded: bool) {
        if let Some(workdir) = self.workdir.take() {
            if succeeded {
                ctx.transition(SessionState::CleaningUp);
            }
            workdir.release(self.transport.as_ref(), &ctx.sink).await;
        }

        if self.connected {
            if succeeded {
                ctx.transition(SessionState::Disconnecting);
            }
            self.connected = false;
            if let Err(e) = self.transport.disconnect().await {
                ctx.sink.warning(format!(
                    "Failed to disconnect from {}: {}",
                    self.transport.describe(),
                    e
                ));
            }
        }
    }
}

async fn upload(transport: &dyn RemoteTransport, local: &Path, remote: &str) -> StageResult<()> {
    let diagnostic = match transport.upload(local, remote).await {
        Ok(output) if output.success() => return Ok(()),
        Ok(output) => output.diagnostic_info(),
        Err(e) => e.to_string(),
    };

    Err(Abort::failed(
        Stage::Prepare,
        ScanError::RemoteCopyError {
            file: local.display().to_string(),
            diagnostic,
        },
    ))
}

fn write_temp(document: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("scap-runner-tailoring-")
        .suffix(".xml")
        .tempfile()?;
    file.write_all(document.as_bytes())?;
    file.flush()?;
    Ok(file)
}
