//! Scan requests, remote targets, result artifacts and the scanner invocation
//! contract.

use crate::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where the scan is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Local,
    Remote,
}

/// Secure shell destination of a remote scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Run the remote scanner through `sudo -n`
    pub sudo: bool,
}

impl RemoteConnection {
    pub fn new(username: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            sudo: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// `user@host` as understood by ssh and scp
    pub fn destination(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

impl fmt::Display for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination(), self.port)
    }
}

impl FromStr for RemoteConnection {
    type Err = ScanError;

    /// Parses `[user@]host[:port]`
    fn from_str(s: &str) -> Result<Self> {
        let (username, rest) = match s.rsplit_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (String::new(), s),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    ScanError::ConfigError(format!("Invalid ssh port in '{}'", s))
                })?;
                (host.to_string(), port)
            }
            _ => (rest.to_string(), 22),
        };

        if host.is_empty() {
            return Err(ScanError::ConfigError(format!("Missing host in '{}'", s)));
        }

        Ok(Self {
            host,
            port,
            username,
            sudo: false,
        })
    }
}

/// Execution target together with its connection descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanTarget {
    Local,
    Remote(RemoteConnection),
}

impl ScanTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            ScanTarget::Local => TargetKind::Local,
            ScanTarget::Remote(_) => TargetKind::Remote,
        }
    }
}

/// Format of the input document handed to the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    /// Plain XCCDF benchmark
    Xccdf,
    /// Source datastream bundling XCCDF, OVAL and CPE components
    SourceDataStream,
    /// Result datastream produced by an earlier scan
    ResultDataStream,
}

impl InputKind {
    /// Best guess from the usual file naming of SCAP content
    pub fn guess(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with("-arf.xml") || name.ends_with(".arf.xml") {
            InputKind::ResultDataStream
        } else if name.ends_with("-ds.xml") || name.ends_with("-ds-1.2.xml") {
            InputKind::SourceDataStream
        } else {
            InputKind::Xccdf
        }
    }
}

/// Tailoring input: an existing file or a document to be written at prepare time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tailoring {
    File(PathBuf),
    Inline(String),
}

/// Behavioural flags of one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub dry_run: bool,
    pub fetch_remote_resources: bool,
    pub remediate: bool,
    pub online_remediation: bool,
    pub skip_valid: bool,
}

/// Result files a scan can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    Results,
    Report,
    Arf,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Results, ArtifactKind::Report, ArtifactKind::Arf];

    /// Suffix appended to the input basename when no explicit path is given
    pub fn file_suffix(&self) -> &'static str {
        match self {
            ArtifactKind::Results => "-xccdf.results.xml",
            ArtifactKind::Report => "-xccdf.report.html",
            ArtifactKind::Arf => "-arf.xml",
        }
    }

    /// Scanner flag that asks for this artifact
    pub fn flag(&self) -> &'static str {
        match self {
            ArtifactKind::Results => "--results",
            ArtifactKind::Report => "--report",
            ArtifactKind::Arf => "--results-arf",
        }
    }

    /// File name used inside a remote working directory
    pub fn remote_name(&self) -> &'static str {
        match self {
            ArtifactKind::Results => "results.xml",
            ArtifactKind::Report => "report.html",
            ArtifactKind::Arf => "arf.xml",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Results => write!(f, "XCCDF results"),
            ArtifactKind::Report => write!(f, "HTML report"),
            ArtifactKind::Arf => write!(f, "result datastream (ARF)"),
        }
    }
}

/// Paths of the artifacts a finished session actually produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultArtifacts {
    pub results: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub arf: Option<PathBuf>,
}

impl ResultArtifacts {
    pub fn get(&self, kind: ArtifactKind) -> Option<&PathBuf> {
        match kind {
            ArtifactKind::Results => self.results.as_ref(),
            ArtifactKind::Report => self.report.as_ref(),
            ArtifactKind::Arf => self.arf.as_ref(),
        }
    }

    pub fn set(&mut self, kind: ArtifactKind, path: PathBuf) {
        match kind {
            ArtifactKind::Results => self.results = Some(path),
            ArtifactKind::Report => self.report = Some(path),
            ArtifactKind::Arf => self.arf = Some(path),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_none() && self.report.is_none() && self.arf.is_none()
    }
}

/// Everything a session needs to run one evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub target: ScanTarget,
    pub input: PathBuf,
    pub input_kind: InputKind,
    pub tailoring: Option<Tailoring>,
    pub profile: String,
    pub datastream_id: Option<String>,
    pub xccdf_id: Option<String>,
    pub options: ScanOptions,
    /// Requested artifacts; explicit path or `None` for the naming convention
    pub outputs: BTreeMap<ArtifactKind, Option<PathBuf>>,
    /// Directory for conventionally named artifacts (defaults to the working directory)
    pub output_dir: Option<PathBuf>,
}

impl ScanRequest {
    /// Local scan of `input` with `profile`, requesting all three artifacts
    pub fn local(input: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
        let input = input.into();
        Self {
            target: ScanTarget::Local,
            input_kind: InputKind::guess(&input),
            input,
            tailoring: None,
            profile: profile.into(),
            datastream_id: None,
            xccdf_id: None,
            options: ScanOptions::default(),
            outputs: ArtifactKind::ALL.iter().map(|k| (*k, None)).collect(),
            output_dir: None,
        }
    }

    /// Remote scan over the given connection
    pub fn remote(
        input: impl Into<PathBuf>,
        profile: impl Into<String>,
        connection: RemoteConnection,
    ) -> Self {
        Self {
            target: ScanTarget::Remote(connection),
            ..Self::local(input, profile)
        }
    }

    pub fn with_input_kind(mut self, kind: InputKind) -> Self {
        self.input_kind = kind;
        self
    }

    pub fn with_tailoring(mut self, tailoring: Tailoring) -> Self {
        self.tailoring = Some(tailoring);
        self
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_datastream_id(mut self, id: impl Into<String>) -> Self {
        self.datastream_id = Some(id.into());
        self
    }

    pub fn with_xccdf_id(mut self, id: impl Into<String>) -> Self {
        self.xccdf_id = Some(id.into());
        self
    }

    /// Request only the listed artifacts, all conventionally named
    pub fn with_outputs(mut self, kinds: &[ArtifactKind]) -> Self {
        self.outputs = kinds.iter().map(|k| (*k, None)).collect();
        self
    }

    /// Request one artifact at an explicit path
    pub fn with_output_path(mut self, kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        self.outputs.insert(kind, Some(path.into()));
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Requested artifact kinds in a stable order
    pub fn requested_artifacts(&self) -> Vec<ArtifactKind> {
        self.outputs.keys().copied().collect()
    }

    /// Input file name without its extension
    pub fn basename(&self) -> String {
        self.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scan".to_string())
    }

    /// Local path an artifact is written to
    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        if let Some(Some(explicit)) = self.outputs.get(&kind) {
            return explicit.clone();
        }

        let dir = self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        dir.join(format!("{}{}", self.basename(), kind.file_suffix()))
    }

    /// Reject requests that cannot be turned into a scanner invocation
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(ScanError::ConfigError("Input document path is empty".to_string()));
        }

        if self.profile.trim().is_empty() {
            return Err(ScanError::ConfigError("Profile identifier is empty".to_string()));
        }

        if let Some(Tailoring::Inline(doc)) = &self.tailoring {
            if doc.trim().is_empty() {
                return Err(ScanError::ConfigError("Inline tailoring document is empty".to_string()));
            }
        }

        if let ScanTarget::Remote(conn) = &self.target {
            if conn.host.trim().is_empty() {
                return Err(ScanError::ConfigError("Remote host is empty".to_string()));
            }
            if conn.port == 0 {
                return Err(ScanError::ConfigError("Remote port must be non-zero".to_string()));
            }
        }

        Ok(())
    }
}

/// Concrete locations substituted into the scanner command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationPaths {
    pub input: String,
    pub tailoring: Option<String>,
    pub outputs: BTreeMap<ArtifactKind, String>,
}

/// Build `[module] eval --profile <id> [--progress] [outputs] [flags] [--tailoring-file] <input>`
pub fn build_evaluation_args(
    module: Option<&str>,
    request: &ScanRequest,
    paths: &EvaluationPaths,
    progress: bool,
) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(module) = module {
        args.push(module.to_string());
    }
    args.push("eval".to_string());

    args.push("--profile".to_string());
    args.push(request.profile.clone());

    if progress {
        args.push("--progress".to_string());
    }

    for kind in ArtifactKind::ALL {
        if let Some(path) = paths.outputs.get(&kind) {
            args.push(kind.flag().to_string());
            args.push(path.clone());
        }
    }

    if request.options.remediate {
        args.push("--remediate".to_string());
    }
    if request.options.online_remediation {
        args.push("--online-remediation".to_string());
    }
    if request.options.fetch_remote_resources {
        args.push("--fetch-remote-resources".to_string());
    }

    if let Some(tailoring) = &paths.tailoring {
        args.push("--tailoring-file".to_string());
        args.push(tailoring.clone());
    }

    if let Some(id) = &request.datastream_id {
        args.push("--datastream-id".to_string());
        args.push(id.clone());
    }
    if let Some(id) = &request.xccdf_id {
        args.push("--xccdf-id".to_string());
        args.push(id.clone());
    }
    if request.options.skip_valid {
        args.push("--skip-valid".to_string());
    }

    args.push(paths.input.clone());
    args
}

/// Quote one word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Join a command line into one shell-safe string
pub fn shell_join<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
