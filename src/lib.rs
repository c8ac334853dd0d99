//! scap-runner - drive an external SCAP evaluator on the local machine or
//! over ssh, turning its output into an ordered stream of state changes,
//! per-rule progress records and diagnostics.

pub mod capabilities;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod process;
pub mod progress;
pub mod request;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use capabilities::{Capabilities, CapabilityProbe, ToolVersion};
pub use config::RunnerConfig;
pub use diagnostics::{DiagnosticLevel, DiagnosticMessage, DiagnosticsSink};
pub use error::{CapabilityError, ParseError, ParseErrorKind, ScanError};
pub use process::{CommandOutput, CommandSpec, ProcessRunner};
pub use progress::{ProgressEvent, ProgressParser, RuleResult};
pub use request::{
    ArtifactKind, InputKind, RemoteConnection, ResultArtifacts, ScanOptions, ScanRequest, ScanTarget,
    Tailoring, TargetKind,
};
pub use session::{ScanSession, SessionEvent, SessionHandle, SessionReport, SessionState};
pub use transport::{RemoteTransport, SshTransport};

pub type Result<T> = std::result::Result<T, ScanError>;
