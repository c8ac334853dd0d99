//! Scan sessions
//!
//! A session drives one evaluation from capability probing to a terminal
//! state. Local and remote sessions share the lifecycle below and differ only
//! in how each stage is carried out:
//!
//! ```text
//! Idle -> [Connecting] -> ProbingCapabilities -> Preparing -> Running
//!      -> [Retrieving -> CleaningUp -> Disconnecting] -> Finished
//! Running -> Cancelling -> Cancelled
//! any non-terminal -> Failed
//! ```
//!
//! Every state change, progress record and diagnostic is delivered, in order,
//! on one event channel. Nothing is emitted after the terminal state.

mod local;
mod remote;

pub use local::LocalScanSession;
pub use remote::{RemoteScanSession, RemoteTempDir};

use crate::capabilities::Capabilities;
use crate::config::RunnerConfig;
use crate::diagnostics::{DiagnosticMessage, DiagnosticsSink};
use crate::error::ScanError;
use crate::process::{CommandSpec, ExitReport, ProcessControl, ProcessOutput, ProcessRunner, RunningProcess};
use crate::progress::{Decoded, ProgressEvent, ProgressParser};
use crate::request::{build_evaluation_args, EvaluationPaths, ResultArtifacts, ScanRequest, ScanTarget, TargetKind};
use crate::transport::{RemoteTransport, SshTransport};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    ProbingCapabilities,
    Preparing,
    Running,
    Cancelling,
    Retrieving,
    CleaningUp,
    Disconnecting,
    Finished,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::ProbingCapabilities => "probing capabilities",
            SessionState::Preparing => "preparing",
            SessionState::Running => "running",
            SessionState::Cancelling => "cancelling",
            SessionState::Retrieving => "retrieving results",
            SessionState::CleaningUp => "cleaning up",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Finished => "finished",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Stage a fatal error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Connect,
    Probe,
    Prepare,
    Run,
    Retrieve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::Probe => "capability probe",
            Stage::Prepare => "prepare",
            Stage::Run => "run",
            Stage::Retrieve => "result retrieval",
        };
        write!(f, "{}", name)
    }
}

/// Everything a session reports while it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Progress(ProgressEvent),
    Diagnostic(DiagnosticMessage),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::StateChanged(state) if state.is_terminal())
    }
}

/// Fatal error of a session together with where it happened
#[derive(Debug, Serialize)]
pub struct SessionFailure {
    pub stage: Stage,
    pub class: &'static str,
    pub message: String,
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub error: ScanError,
}

impl SessionFailure {
    pub fn new(stage: Stage, error: ScanError) -> Self {
        Self {
            stage,
            class: error.class(),
            message: error.to_string(),
            exit_code: None,
            error,
        }
    }
}

/// Why a session stopped making forward progress
#[derive(Debug)]
pub(crate) enum Abort {
    Cancelled,
    Failed(SessionFailure),
}

impl Abort {
    pub(crate) fn failed(stage: Stage, error: impl Into<ScanError>) -> Self {
        Abort::Failed(SessionFailure::new(stage, error.into()))
    }

    pub(crate) fn with_exit_code(mut self, code: Option<i32>) -> Self {
        if let Abort::Failed(failure) = &mut self {
            failure.exit_code = code;
        }
        self
    }
}

pub(crate) type StageResult<T> = std::result::Result<T, Abort>;

/// Final outcome of a session
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub target: TargetKind,
    pub state: SessionState,
    pub capabilities: Option<Capabilities>,
    pub artifacts: ResultArtifacts,
    pub failure: Option<SessionFailure>,
    pub exit_code: Option<i32>,
    pub progress: Vec<ProgressEvent>,
    pub diagnostics: Vec<DiagnosticMessage>,
    pub duration: Duration,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.state == SessionState::Finished
    }
}

struct EmitterRecord {
    state: SessionState,
    sealed: bool,
    progress: Vec<ProgressEvent>,
}

/// Single ordered outlet for session events
#[derive(Clone)]
pub(crate) struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
    record: Arc<Mutex<EmitterRecord>>,
}

impl EventEmitter {
    fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            tx,
            record: Arc::new(Mutex::new(EmitterRecord {
                state: SessionState::Idle,
                sealed: false,
                progress: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmitterRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn transition(&self, state: SessionState) {
        let mut record = self.lock();
        if record.sealed || record.state == state {
            return;
        }
        debug!("Session state: {} -> {}", record.state, state);
        record.state = state;
        record.sealed = state.is_terminal();
        // the receiver may be gone; the record still tracks the state
        let _ = self.tx.send(SessionEvent::StateChanged(state));
    }

    /// Progress is only accepted while the scanner is running
    pub(crate) fn progress(&self, event: ProgressEvent) {
        let mut record = self.lock();
        if record.sealed || record.state != SessionState::Running {
            return;
        }
        record.progress.push(event.clone());
        let _ = self.tx.send(SessionEvent::Progress(event));
    }

    pub(crate) fn diagnostic(&self, message: &DiagnosticMessage) {
        let record = self.lock();
        if record.sealed {
            return;
        }
        let _ = self.tx.send(SessionEvent::Diagnostic(message.clone()));
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    fn progress_snapshot(&self) -> Vec<ProgressEvent> {
        self.lock().progress.clone()
    }
}

/// Shared per-session plumbing handed to every stage
pub struct SessionContext {
    pub(crate) id: Uuid,
    pub(crate) request: Arc<ScanRequest>,
    pub(crate) config: Arc<RunnerConfig>,
    pub(crate) sink: DiagnosticsSink,
    pub(crate) runner: ProcessRunner,
    pub(crate) events: EventEmitter,
    pub(crate) cancel: CancellationToken,
}

impl SessionContext {
    fn new(request: ScanRequest, config: RunnerConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventEmitter::new(tx);

        let forward = events.clone();
        let sink = DiagnosticsSink::with_listener(Arc::new(move |message: &DiagnosticMessage| {
            forward.diagnostic(message)
        }));
        let runner = ProcessRunner::new(config.termination_grace(), sink.clone());

        let ctx = Self {
            id: Uuid::new_v4(),
            request: Arc::new(request),
            config: Arc::new(config),
            sink,
            runner,
            events,
            cancel: CancellationToken::new(),
        };
        (ctx, rx)
    }

    pub(crate) fn transition(&self, state: SessionState) {
        self.events.transition(state);
    }

    /// Abort forward progress if cancellation is pending. A scan that is
    /// still `Running` always passes through `Cancelling` on its way out.
    pub(crate) fn checkpoint(&self) -> StageResult<()> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.events.state() == SessionState::Running {
            self.transition(SessionState::Cancelling);
        }
        Err(Abort::Cancelled)
    }

    fn deliver(&self, decoded: Decoded) {
        match decoded {
            Decoded::Progress(event) => self.events.progress(event),
            Decoded::Passthrough(line) => self.sink.info(line),
            Decoded::Download { url, status } => {
                self.sink.info(format!("Downloading: {} ... {}", url, status))
            }
        }
    }

    /// Scanner arguments for `paths`, with progress output when available
    pub(crate) fn evaluation_args(&self, capabilities: &Capabilities, paths: &EvaluationPaths) -> Vec<String> {
        if !capabilities.supports_progress {
            self.sink.info(format!(
                "Scanner version {} does not report progress; rule results will only be in the result files.",
                capabilities.raw_version
            ));
        }
        build_evaluation_args(
            self.config.tool_module.as_deref(),
            &self.request,
            paths,
            capabilities.supports_progress,
        )
    }
}

/// Stops a scanner process, reporting how it went
#[async_trait]
pub(crate) trait ProcessStopper: Send + Sync {
    async fn stop(&self, ctx: &SessionContext, process: &ProcessControl) -> ExitReport;
}

/// Stop through the runner's own terminate-then-kill escalation
pub(crate) struct LocalStopper;

#[async_trait]
impl ProcessStopper for LocalStopper {
    async fn stop(&self, _ctx: &SessionContext, process: &ProcessControl) -> ExitReport {
        process.cancel();
        process.wait().await
    }
}

async fn cancel_running<S>(ctx: &SessionContext, process: &RunningProcess, stopper: &S) -> Abort
where
    S: ProcessStopper + ?Sized,
{
    ctx.transition(SessionState::Cancelling);
    ctx.sink.info("Cancellation was requested! Terminating scanning...");
    stopper.stop(ctx, &process.control()).await;
    Abort::Cancelled
}

/// Feed scanner output through the progress parser until the process exits
pub(crate) async fn monitor<S>(
    ctx: &SessionContext,
    process: &mut RunningProcess,
    stopper: &S,
) -> StageResult<ExitReport>
where
    S: ProcessStopper + ?Sized,
{
    let mut parser = ProgressParser::new();

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(cancel_running(ctx, process, stopper).await),
            output = process.next_output() => match output {
                Some(ProcessOutput::Stdout(chunk)) => {
                    if let Err(e) = parser.feed(&chunk, |decoded| ctx.deliver(decoded)) {
                        let report = stopper.stop(ctx, &process.control()).await;
                        return Err(Abort::failed(Stage::Run, e).with_exit_code(report.code));
                    }
                }
                Some(ProcessOutput::Stderr(line)) => ctx.sink.info(line),
                None => break,
            },
        }
    }

    if let Some(rest) = parser.finish() {
        ctx.sink.info(rest);
    }

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(cancel_running(ctx, process, stopper).await),
        report = process.wait() => Ok(report),
    }
}

/// Target specific half of a session
pub enum SessionBackend {
    Local(LocalScanSession),
    Remote(RemoteScanSession),
}

impl SessionBackend {
    async fn probe_capabilities(&mut self, ctx: &SessionContext) -> StageResult<Capabilities> {
        match self {
            SessionBackend::Local(session) => session.probe_capabilities(ctx).await,
            SessionBackend::Remote(session) => session.probe_capabilities(ctx).await,
        }
    }

    async fn prepare(&mut self, ctx: &SessionContext) -> StageResult<()> {
        match self {
            SessionBackend::Local(session) => session.prepare(ctx).await,
            SessionBackend::Remote(session) => session.prepare(ctx).await,
        }
    }

    fn command(&self, ctx: &SessionContext, capabilities: &Capabilities) -> StageResult<CommandSpec> {
        match self {
            SessionBackend::Local(session) => session.command(ctx, capabilities),
            SessionBackend::Remote(session) => session.command(ctx, capabilities),
        }
    }

    async fn run(&mut self, ctx: &SessionContext, command: &CommandSpec) -> StageResult<ExitReport> {
        match self {
            SessionBackend::Local(session) => session.run(ctx, command).await,
            SessionBackend::Remote(session) => session.run(ctx, command).await,
        }
    }

    async fn collect_artifacts(&mut self, ctx: &SessionContext) -> StageResult<()> {
        match self {
            SessionBackend::Local(session) => session.collect_artifacts(ctx).await,
            SessionBackend::Remote(session) => session.collect_artifacts(ctx).await,
        }
    }

    async fn release(&mut self, ctx: &SessionContext, succeeded: bool) {
        match self {
            SessionBackend::Local(session) => session.release(ctx, succeeded).await,
            SessionBackend::Remote(session) => session.release(ctx, succeeded).await,
        }
    }

    pub fn artifacts(&self) -> &ResultArtifacts {
        match self {
            SessionBackend::Local(session) => session.artifacts(),
            SessionBackend::Remote(session) => session.artifacts(),
        }
    }
}

/// One scan of one target
pub struct ScanSession {
    ctx: SessionContext,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    backend: SessionBackend,
    capabilities: Option<Capabilities>,
    exit_code: Option<i32>,
}

impl ScanSession {
    /// Session for `request`; remote targets go through ssh
    pub fn new(request: ScanRequest, config: RunnerConfig) -> crate::Result<Self> {
        request.validate()?;
        config.validate()?;

        let (ctx, events) = SessionContext::new(request, config);
        let backend = match &ctx.request.target {
            ScanTarget::Local => SessionBackend::Local(LocalScanSession::new()),
            ScanTarget::Remote(connection) => {
                let transport = SshTransport::new(connection.clone(), Arc::clone(&ctx.config), ctx.runner.clone());
                SessionBackend::Remote(RemoteScanSession::new(connection.clone(), Box::new(transport)))
            }
        };

        Ok(Self::assemble(ctx, events, backend))
    }

    /// Remote session over a caller supplied transport
    pub fn with_transport(
        request: ScanRequest,
        config: RunnerConfig,
        transport: Box<dyn RemoteTransport>,
    ) -> crate::Result<Self> {
        request.validate()?;
        config.validate()?;

        let connection = match &request.target {
            ScanTarget::Remote(connection) => connection.clone(),
            ScanTarget::Local => {
                return Err(ScanError::ConfigError(
                    "A transport can only be used with a remote target".to_string(),
                ))
            }
        };

        let (ctx, events) = SessionContext::new(request, config);
        let backend = SessionBackend::Remote(RemoteScanSession::new(connection, transport));
        Ok(Self::assemble(ctx, events, backend))
    }

    fn assemble(
        ctx: SessionContext,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        backend: SessionBackend,
    ) -> Self {
        Self {
            ctx,
            events,
            backend,
            capabilities: None,
            exit_code: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id
    }

    pub fn request(&self) -> &ScanRequest {
        &self.ctx.request
    }

    pub fn state(&self) -> SessionState {
        self.ctx.events.state()
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Artifacts produced so far; complete only once the session has finished
    pub fn artifacts(&self) -> &ResultArtifacts {
        self.backend.artifacts()
    }

    /// Request cancellation; idempotent, returns immediately
    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Run the session on the tokio runtime
    pub fn spawn(self) -> SessionHandle {
        let ScanSession {
            ctx,
            events,
            backend,
            capabilities,
            exit_code,
        } = self;

        let id = ctx.id;
        let cancel = ctx.cancel.clone();
        let driver = SessionDriver {
            ctx,
            backend,
            capabilities,
            exit_code,
        };

        SessionHandle {
            id,
            events,
            cancel,
            task: tokio::spawn(driver.drive()),
        }
    }
}

struct SessionDriver {
    ctx: SessionContext,
    backend: SessionBackend,
    capabilities: Option<Capabilities>,
    exit_code: Option<i32>,
}

impl SessionDriver {
    async fn drive(mut self) -> SessionReport {
        let started = Instant::now();
        let outcome = self.execute().await;
        let ctx = &self.ctx;

        let (state, failure) = match outcome {
            Ok(()) => {
                ctx.sink.info("Scanning has been finished.");
                (SessionState::Finished, None)
            }
            Err(Abort::Cancelled) => {
                ctx.sink.info("Scanning has been cancelled.");
                (SessionState::Cancelled, None)
            }
            Err(Abort::Failed(failure)) => {
                ctx.sink
                    .error(format!("Scanning failed during {}: {}", failure.stage, failure.message));
                if failure.exit_code.is_some() {
                    self.exit_code = failure.exit_code;
                }
                (SessionState::Failed, Some(failure))
            }
        };

        let diagnostics = ctx.sink.snapshot();
        ctx.sink.seal();
        ctx.transition(state);

        let artifacts = match state {
            SessionState::Finished => self.backend.artifacts().clone(),
            _ => ResultArtifacts::default(),
        };

        SessionReport {
            id: ctx.id,
            target: ctx.request.target.kind(),
            state,
            capabilities: self.capabilities.clone(),
            artifacts,
            failure,
            exit_code: self.exit_code,
            progress: ctx.events.progress_snapshot(),
            diagnostics,
            duration: started.elapsed(),
        }
    }

    async fn execute(&mut self) -> StageResult<()> {
        let result = self.pipeline().await;
        self.backend.release(&self.ctx, result.is_ok()).await;
        result
    }

    async fn pipeline(&mut self) -> StageResult<()> {
        let ctx = &self.ctx;
        ctx.checkpoint()?;

        let capabilities = self.backend.probe_capabilities(ctx).await?;
        ctx.sink.info(format!("Scanner version {} detected.", capabilities.raw_version));
        self.capabilities = Some(capabilities.clone());
        capabilities
            .check_request(&ctx.request)
            .map_err(|e| Abort::failed(Stage::Probe, e))?;
        ctx.checkpoint()?;

        ctx.transition(SessionState::Preparing);
        self.backend.prepare(ctx).await?;
        ctx.checkpoint()?;

        let command = self.backend.command(ctx, &capabilities)?;
        if ctx.request.options.dry_run {
            ctx.sink.info(format!(
                "Dry run, the scanner would be started as: {}",
                command.describe()
            ));
            return Ok(());
        }

        ctx.transition(SessionState::Running);
        ctx.sink.info("Starting the scanner...");
        let report = self.backend.run(ctx, &command).await?;
        self.exit_code = report.code;

        match report.code {
            Some(code) if ctx.config.is_success_code(code) => {}
            Some(code) => {
                ctx.sink.error(format!(
                    "There was an error during evaluation! Exit code of the scanner was {}.",
                    code
                ));
                return Err(Abort::failed(Stage::Run, ScanError::ExitStatusError { code })
                    .with_exit_code(Some(code)));
            }
            None => {
                let signal = report.signal.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string());
                ctx.sink.error(format!("The scanner was terminated by signal {}.", signal));
                return Err(Abort::failed(Stage::Run, ScanError::ExitStatusError { code: -1 }));
            }
        }

        ctx.checkpoint()?;
        self.backend.collect_artifacts(ctx).await
    }
}

/// Caller side of a spawned session
pub struct SessionHandle {
    id: Uuid,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; safe to call any number of times
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, `None` once the session is over and all events are consumed
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal state and return the report
    pub async fn wait(self) -> crate::Result<SessionReport> {
        self.task
            .await
            .map_err(|e| ScanError::TaskError(e.to_string()))
    }

    /// All events up to and including the terminal state, plus the report
    pub async fn collect(mut self) -> crate::Result<(Vec<SessionEvent>, SessionReport)> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        let report = self.wait().await?;
        Ok((events, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RuleResult;

    fn emitter() -> (EventEmitter, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventEmitter::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_progress_only_while_running() {
        let (events, mut rx) = emitter();
        let record = ProgressEvent::new("rule_a", RuleResult::Pass);

        events.progress(record.clone());
        events.transition(SessionState::Running);
        events.progress(record.clone());
        events.transition(SessionState::Cancelling);
        events.progress(record.clone());

        let received = drain(&mut rx);
        assert_eq!(
            received,
            vec![
                SessionEvent::StateChanged(SessionState::Running),
                SessionEvent::Progress(record),
                SessionEvent::StateChanged(SessionState::Cancelling),
            ]
        );
    }

    #[test]
    fn test_terminal_state_seals_emitter() {
        let (events, mut rx) = emitter();
        events.transition(SessionState::Running);
        events.transition(SessionState::Failed);
        events.transition(SessionState::Finished);
        events.progress(ProgressEvent::new("late", RuleResult::Fail));

        let received = drain(&mut rx);
        assert_eq!(received.len(), 2);
        assert!(received[1].is_terminal());
        assert_eq!(events.state(), SessionState::Failed);
    }

    #[test]
    fn test_diagnostics_are_forwarded_until_sealed() {
        let (request, config) = (ScanRequest::local("ssg-ds.xml", "default"), RunnerConfig::default());
        let (ctx, mut rx) = SessionContext::new(request, config);

        ctx.sink.warning("first");
        ctx.transition(SessionState::Cancelled);
        ctx.sink.warning("second");

        let received = drain(&mut rx);
        assert_eq!(received.len(), 2);
        match &received[0] {
            SessionEvent::Diagnostic(message) => assert_eq!(message.text, "first"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_observes_cancel() {
        let (ctx, _rx) = SessionContext::new(ScanRequest::local("a.xml", "p"), RunnerConfig::default());
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(ctx.checkpoint(), Err(Abort::Cancelled)));
    }

    #[test]
    fn test_cancel_after_scanner_exit_still_reports_cancelling() {
        let (ctx, mut rx) = SessionContext::new(ScanRequest::local("a.xml", "p"), RunnerConfig::default());
        ctx.transition(SessionState::Running);
        // the scanner has exited, cancellation lands before retrieval
        ctx.cancel.cancel();
        assert!(matches!(ctx.checkpoint(), Err(Abort::Cancelled)));
        ctx.transition(SessionState::Cancelled);

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::StateChanged(SessionState::Running),
                SessionEvent::StateChanged(SessionState::Cancelling),
                SessionEvent::StateChanged(SessionState::Cancelled),
            ]
        );
    }

    #[test]
    fn test_transport_requires_remote_target() {
        struct Unused;
        #[async_trait]
        impl RemoteTransport for Unused {
            fn describe(&self) -> String {
                "unused".to_string()
            }
            async fn connect(&mut self) -> crate::Result<()> {
                Ok(())
            }
            async fn exec(&self, _command: &str) -> crate::Result<crate::process::CommandOutput> {
                Ok(Default::default())
            }
            async fn upload(&self, _l: &std::path::Path, _r: &str) -> crate::Result<crate::process::CommandOutput> {
                Ok(Default::default())
            }
            async fn download(&self, _r: &str, _l: &std::path::Path) -> crate::Result<crate::process::CommandOutput> {
                Ok(Default::default())
            }
            async fn check(&self) -> crate::Result<()> {
                Ok(())
            }
            fn streaming_command(&self, remote_command: &str) -> CommandSpec {
                CommandSpec::new("sh").arg("-c").arg(remote_command)
            }
            async fn disconnect(&mut self) -> crate::Result<()> {
                Ok(())
            }
        }

        let result = ScanSession::with_transport(
            ScanRequest::local("a.xml", "p"),
            RunnerConfig::default(),
            Box::new(Unused),
        );
        assert!(matches!(result, Err(ScanError::ConfigError(_))));
    }
}
