//! Scans of the local machine

use super::{monitor, Abort, LocalStopper, SessionContext, SessionState, Stage, StageResult};
use crate::capabilities::{CapabilityProbe, Capabilities};
use crate::error::ScanError;
use crate::process::{CommandSpec, ExecutionContext, ExitReport};
use crate::request::{ArtifactKind, EvaluationPaths, ResultArtifacts, Tailoring};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

/// Runs the scanner as a child process and moves its results into place
#[derive(Debug, Default)]
pub struct LocalScanSession {
    workdir: Option<TempDir>,
    paths: Option<EvaluationPaths>,
    artifacts: ResultArtifacts,
}

impl LocalScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> &ResultArtifacts {
        &self.artifacts
    }

    fn workdir_path(&self) -> StageResult<&Path> {
        self.workdir.as_ref().map(TempDir::path).ok_or_else(|| {
            Abort::failed(
                Stage::Prepare,
                ScanError::ConfigError("Session has not been prepared".to_string()),
            )
        })
    }

    pub(crate) async fn probe_capabilities(&mut self, ctx: &SessionContext) -> StageResult<Capabilities> {
        ctx.transition(SessionState::ProbingCapabilities);
        ctx.sink.info("Querying capabilities...");

        CapabilityProbe::local(&ctx.config.tool_path, &ctx.runner, ctx.config.transport_timeout())
            .probe()
            .await
            .map_err(|e| Abort::failed(Stage::Probe, e))
    }

    pub(crate) async fn prepare(&mut self, ctx: &SessionContext) -> StageResult<()> {
        let request = &ctx.request;
        let fail = |e: ScanError| Abort::failed(Stage::Prepare, e);

        if !request.input.is_file() {
            return Err(fail(ScanError::ConfigError(format!(
                "Input document '{}' does not exist",
                request.input.display()
            ))));
        }

        let workdir = tempfile::Builder::new()
            .prefix("scap-runner-")
            .tempdir()
            .map_err(|e| fail(e.into()))?;

        let tailoring = match &request.tailoring {
            None => None,
            Some(Tailoring::File(path)) => {
                if !path.is_file() {
                    return Err(fail(ScanError::ConfigError(format!(
                        "Tailoring file '{}' does not exist",
                        path.display()
                    ))));
                }
                Some(path.display().to_string())
            }
            Some(Tailoring::Inline(document)) => {
                let path = workdir.path().join("tailoring.xml");
                tokio::fs::write(&path, document).await.map_err(|e| fail(e.into()))?;
                Some(path.display().to_string())
            }
        };

        let outputs: BTreeMap<ArtifactKind, String> = request
            .requested_artifacts()
            .into_iter()
            .map(|kind| (kind, workdir.path().join(kind.remote_name()).display().to_string()))
            .collect();

        self.paths = Some(EvaluationPaths {
            input: request.input.display().to_string(),
            tailoring,
            outputs,
        });
        self.workdir = Some(workdir);
        Ok(())
    }

    pub(crate) fn command(&self, ctx: &SessionContext, capabilities: &Capabilities) -> StageResult<CommandSpec> {
        let paths = self.paths.as_ref().ok_or_else(|| {
            Abort::failed(
                Stage::Prepare,
                ScanError::ConfigError("Session has not been prepared".to_string()),
            )
        })?;

        let spec = CommandSpec::new(&ctx.config.tool_path).args(ctx.evaluation_args(capabilities, paths));
        let context = match ctx.config.niceness {
            Some(niceness) => ExecutionContext::Nice {
                nice_path: ctx.config.nice_path.clone(),
                niceness,
            },
            None => ExecutionContext::Direct,
        };
        Ok(context.apply(spec))
    }

    pub(crate) async fn run(&mut self, ctx: &SessionContext, command: &CommandSpec) -> StageResult<ExitReport> {
        let mut process = ctx
            .runner
            .start(command)
            .map_err(|e| Abort::failed(Stage::Run, e))?;
        monitor(ctx, &mut process, &LocalStopper).await
    }

    pub(crate) async fn collect_artifacts(&mut self, ctx: &SessionContext) -> StageResult<()> {
        let workdir = self.workdir_path()?.to_path_buf();

        for kind in ctx.request.requested_artifacts() {
            let produced = workdir.join(kind.remote_name());
            if !produced.is_file() {
                ctx.sink.warning(format!("The scanner did not produce the {}.", kind));
                continue;
            }

            let destination = ctx.request.artifact_path(kind);
            match move_file(&produced, &destination).await {
                Ok(()) => self.artifacts.set(kind, destination),
                Err(e) => ctx.sink.warning(format!(
                    "Failed to store the {} at '{}': {}",
                    kind,
                    destination.display(),
                    e
                )),
            }
        }

        Ok(())
    }

    pub(crate) async fn release(&mut self, ctx: &SessionContext, _succeeded: bool) {
        if let Some(workdir) = self.workdir.take() {
            let path = workdir.path().to_path_buf();
            if let Err(e) = workdir.close() {
                ctx.sink.warning(format!(
                    "Failed to remove temporary directory '{}': {}",
                    path.display(),
                    e
                ));
            }
        }
    }
}

/// Rename, falling back to copy when crossing file systems
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("results.xml");
        tokio::fs::write(&from, "<TestResult/>").await.unwrap();

        let to = dir.path().join("out").join("nested").join("scan-xccdf.results.xml");
        move_file(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(tokio::fs::read_to_string(&to).await.unwrap(), "<TestResult/>");
    }

    #[test]
    fn test_unprepared_session_has_no_workdir() {
        let session = LocalScanSession::new();
        assert!(session.workdir_path().is_err());
        assert!(session.artifacts().is_empty());
    }
}
