//! Scanner capability detection
//!
//! The scanner is asked for its version (`<tool> -V`). The first line ends
//! with a dotted version number, and an optional "Supported specifications"
//! section lists the versions of the standards it implements. Feature flags
//! are derived purely from the version number.

use crate::error::CapabilityError;
use crate::process::{CommandOutput, CommandSpec, ProcessRunner};
use crate::request::{shell_quote, InputKind, ScanRequest};
use crate::transport::RemoteTransport;
use crate::{Result, ScanError};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+\.){2,}[0-9]+$").expect("valid version regex"));

/// Exit status shells use for "command not found"
const COMMAND_NOT_FOUND: i32 = 127;

/// Dotted scanner version; only the first three components are significant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub const BASELINE: ToolVersion = ToolVersion::new(0, 8, 0);
    pub const SOURCE_DATASTREAMS: ToolVersion = ToolVersion::new(0, 9, 0);
    pub const PROGRESS: ToolVersion = ToolVersion::new(0, 9, 3);
    pub const ONLINE_REMEDIATION: ToolVersion = ToolVersion::new(0, 9, 5);
    pub const TAILORING: ToolVersion = ToolVersion::new(0, 9, 12);
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ToolVersion {
    type Err = CapabilityError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let unrecognized = || CapabilityError::UnrecognizedVersion { raw: s.to_string() };

        if !VERSION_RE.is_match(s) {
            return Err(unrecognized());
        }

        let mut parts = s.split('.').map(|p| p.parse::<u32>());
        let mut next = || parts.next().unwrap_or(Ok(0)).map_err(|_| unrecognized());
        Ok(ToolVersion::new(next()?, next()?, next()?))
    }
}

/// What the installed scanner can do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub version: ToolVersion,
    /// Version string exactly as reported
    pub raw_version: String,

    pub supports_baseline: bool,
    pub supports_progress: bool,
    pub supports_online_remediation: bool,
    pub supports_source_datastreams: bool,
    pub supports_tailoring: bool,
    /// Result datastreams as input are not supported by any version
    pub supports_arf_input: bool,

    pub xccdf_version: Option<String>,
    pub oval_version: Option<String>,
    pub cpe_version: Option<String>,
    pub sce_version: Option<String>,
}

impl Capabilities {
    /// Flags implied by `version` alone
    pub fn from_version(version: ToolVersion) -> Self {
        Self {
            version,
            raw_version: version.to_string(),
            supports_baseline: version >= ToolVersion::BASELINE,
            supports_progress: version >= ToolVersion::PROGRESS,
            supports_online_remediation: version >= ToolVersion::ONLINE_REMEDIATION,
            supports_source_datastreams: version >= ToolVersion::SOURCE_DATASTREAMS,
            supports_tailoring: version >= ToolVersion::TAILORING,
            supports_arf_input: false,
            xccdf_version: None,
            oval_version: None,
            cpe_version: None,
            sce_version: None,
        }
    }

    /// Parse the output of `<tool> -V`
    pub fn parse(output: &str) -> std::result::Result<Self, CapabilityError> {
        let first_line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let raw = first_line.split_whitespace().last().unwrap_or("");

        let version = raw
            .parse::<ToolVersion>()
            .map_err(|_| CapabilityError::UnrecognizedVersion {
                raw: first_line.trim().to_string(),
            })?;

        let mut caps = Self::from_version(version);
        caps.raw_version = raw.to_string();

        let mut in_specifications = false;
        for line in output.lines().skip(1) {
            let line = line.trim();
            if line.contains("Supported specifications") {
                in_specifications = true;
                continue;
            }
            if !in_specifications {
                continue;
            }
            // the section ends at the next heading
            if line.starts_with("====") {
                break;
            }

            if let Some((key, value)) = line.split_once(':') {
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                match key.trim() {
                    "XCCDF Version" => caps.xccdf_version = value,
                    "OVAL Version" => caps.oval_version = value,
                    "CPE Version" => caps.cpe_version = value,
                    "Script check engine" => caps.sce_version = value,
                    _ => {}
                }
            }
        }

        Ok(caps)
    }

    /// Fail unless the scanner meets the minimum supported version
    pub fn check_baseline(&self) -> std::result::Result<(), CapabilityError> {
        if self.supports_baseline {
            Ok(())
        } else {
            Err(CapabilityError::BelowBaseline {
                version: self.raw_version.clone(),
            })
        }
    }

    /// Pre-flight gate: fail with the first feature `request` needs that is missing
    pub fn check_request(&self, request: &ScanRequest) -> std::result::Result<(), CapabilityError> {
        if request.input_kind == InputKind::ResultDataStream {
            return Err(CapabilityError::ArfInputUnsupported);
        }

        self.check_baseline()?;

        if request.input_kind == InputKind::SourceDataStream {
            self.require(
                self.supports_source_datastreams,
                "source datastreams",
                ToolVersion::SOURCE_DATASTREAMS,
            )?;
        }

        if request.tailoring.is_some() {
            self.require(self.supports_tailoring, "tailoring", ToolVersion::TAILORING)?;
        }

        if request.options.remediate || request.options.online_remediation {
            self.require(
                self.supports_online_remediation,
                "online remediation",
                ToolVersion::ONLINE_REMEDIATION,
            )?;
        }

        Ok(())
    }

    fn require(
        &self,
        supported: bool,
        feature: &str,
        minimum: ToolVersion,
    ) -> std::result::Result<(), CapabilityError> {
        if supported {
            return Ok(());
        }
        Err(CapabilityError::MissingFeature {
            feature: feature.to_string(),
            minimum: minimum.to_string(),
            version: self.raw_version.clone(),
        })
    }

    /// Feature name and support flag pairs, for display
    pub fn features(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("baseline", self.supports_baseline),
            ("progress reporting", self.supports_progress),
            ("online remediation", self.supports_online_remediation),
            ("source datastreams", self.supports_source_datastreams),
            ("tailoring", self.supports_tailoring),
            ("result datastream input", self.supports_arf_input),
        ]
    }
}

/// Where the scanner to be probed lives
pub enum ProbeTarget<'a> {
    Local(&'a ProcessRunner),
    Remote(&'a dyn RemoteTransport),
}

/// Queries the scanner's version and derives its capabilities
pub struct CapabilityProbe<'a> {
    tool: &'a str,
    target: ProbeTarget<'a>,
    timeout: Duration,
}

impl<'a> CapabilityProbe<'a> {
    pub fn local(tool: &'a str, runner: &'a ProcessRunner, timeout: Duration) -> Self {
        Self {
            tool,
            target: ProbeTarget::Local(runner),
            timeout,
        }
    }

    pub fn remote(tool: &'a str, transport: &'a dyn RemoteTransport) -> Self {
        Self {
            tool,
            target: ProbeTarget::Remote(transport),
            timeout: Duration::ZERO,
        }
    }

    fn target_name(&self) -> String {
        match &self.target {
            ProbeTarget::Local(_) => "localhost".to_string(),
            ProbeTarget::Remote(transport) => transport.describe(),
        }
    }

    pub async fn probe(&self) -> Result<Capabilities> {
        let output = match &self.target {
            ProbeTarget::Local(runner) => {
                let spec = CommandSpec::new(self.tool).arg("-V");
                runner.output(&spec, self.timeout).await?
            }
            ProbeTarget::Remote(transport) => {
                let tool = shell_quote(self.tool);
                let command = format!(
                    "command -v {tool} >/dev/null 2>&1 || exit {missing}; {tool} -V",
                    tool = tool,
                    missing = COMMAND_NOT_FOUND
                );
                transport.exec(&command).await.map_err(|e| {
                    ScanError::from(CapabilityError::ProbeFailed {
                        target: self.target_name(),
                        diagnostic: e.to_string(),
                    })
                })?
            }
        };

        self.interpret(output)
    }

    fn interpret(&self, output: CommandOutput) -> Result<Capabilities> {
        debug!("Version output of '{}': {:?}", self.tool, output.stdout);

        let missing = output.exit_code == Some(COMMAND_NOT_FOUND)
            || output.stderr.to_lowercase().contains("not found");
        if missing && !output.success() {
            return Err(CapabilityError::ToolNotFound {
                target: self.target_name(),
                diagnostic: output.diagnostic_info(),
            }
            .into());
        }

        if !output.success() {
            return Err(CapabilityError::ProbeFailed {
                target: self.target_name(),
                diagnostic: output.diagnostic_info(),
            }
            .into());
        }

        Ok(Capabilities::parse(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ScanOptions, Tailoring};

    const VERSION_OUTPUT: &str = "\
OpenSCAP command line tool (oscap) 1.3.5
Copyright 2009--2021 Red Hat Inc., Durham, North Carolina.

==== Supported specifications ====
SCAP Version: 1.3
XCCDF Version: 1.2
OVAL Version: 5.11.2
CPE Version: 2.3
Script check engine: 1.0

==== Capabilities added by auto-loaded plugins ====
SCE Version: 1.0 (from libopenscap_sce.so.25)
";

    #[test]
    fn test_parse_full_output() {
        let caps = Capabilities::parse(VERSION_OUTPUT).unwrap();
        assert_eq!(caps.version, ToolVersion::new(1, 3, 5));
        assert_eq!(caps.raw_version, "1.3.5");
        assert!(caps.supports_baseline);
        assert!(caps.supports_progress);
        assert!(caps.supports_tailoring);
        assert!(!caps.supports_arf_input);
        assert_eq!(caps.xccdf_version.as_deref(), Some("1.2"));
        assert_eq!(caps.oval_version.as_deref(), Some("5.11.2"));
        assert_eq!(caps.cpe_version.as_deref(), Some("2.3"));
        assert_eq!(caps.sce_version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_thresholds() {
        let caps = Capabilities::parse("oscap 0.9.4").unwrap();
        assert!(caps.supports_progress);
        assert!(caps.supports_source_datastreams);
        assert!(!caps.supports_online_remediation);
        assert!(!caps.supports_tailoring);

        let old = Capabilities::parse("oscap 0.9.2").unwrap();
        assert!(!old.supports_progress);

        let tailoring = Capabilities::parse("oscap 0.9.12").unwrap();
        assert!(tailoring.supports_tailoring);
    }

    #[test]
    fn test_four_component_version() {
        let caps = Capabilities::parse("tool 1.2.17.1").unwrap();
        assert_eq!(caps.version, ToolVersion::new(1, 2, 17));
        assert_eq!(caps.raw_version, "1.2.17.1");
    }

    #[test]
    fn test_unrecognized_version() {
        let err = Capabilities::parse("OpenSCAP command line tool, version unknown").unwrap_err();
        assert!(matches!(err, CapabilityError::UnrecognizedVersion { .. }));
        assert!(Capabilities::parse("").is_err());
        assert!(Capabilities::parse("oscap 1.3").is_err());
    }

    #[test]
    fn test_below_baseline_carries_raw_version() {
        let caps = Capabilities::parse("oscap 0.7.9").unwrap();
        let err = caps.check_baseline().unwrap_err();
        assert_eq!(
            err,
            CapabilityError::BelowBaseline {
                version: "0.7.9".to_string()
            }
        );
    }

    #[test]
    fn test_online_remediation_gate() {
        let request = ScanRequest::local("ssg-ds.xml", "xccdf_org.ssgproject.content_profile_ospp")
            .with_input_kind(InputKind::Xccdf)
            .with_options(ScanOptions {
                online_remediation: true,
                ..Default::default()
            });

        let old = Capabilities::parse("oscap 0.9.4").unwrap();
        match old.check_request(&request).unwrap_err() {
            CapabilityError::MissingFeature { feature, minimum, version } => {
                assert_eq!(feature, "online remediation");
                assert_eq!(minimum, "0.9.5");
                assert_eq!(version, "0.9.4");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let new = Capabilities::parse("oscap 0.9.5").unwrap();
        assert!(new.check_request(&request).is_ok());
    }

    #[test]
    fn test_arf_input_always_rejected() {
        let request = ScanRequest::local("old-arf.xml", "default")
            .with_input_kind(InputKind::ResultDataStream);
        for version in ["oscap 0.7.0", "oscap 1.3.5", "oscap 99.0.0"] {
            let caps = Capabilities::parse(version).unwrap();
            assert_eq!(
                caps.check_request(&request).unwrap_err(),
                CapabilityError::ArfInputUnsupported
            );
        }
    }

    #[test]
    fn test_tailoring_and_datastream_gates() {
        let caps = Capabilities::parse("oscap 0.8.9").unwrap();
        let ds = ScanRequest::local("ssg-ds.xml", "default")
            .with_input_kind(InputKind::SourceDataStream);
        assert!(matches!(
            caps.check_request(&ds),
            Err(CapabilityError::MissingFeature { .. })
        ));

        let caps = Capabilities::parse("oscap 0.9.11").unwrap();
        let tailored = ScanRequest::local("ssg-xccdf.xml", "default")
            .with_input_kind(InputKind::Xccdf)
            .with_tailoring(Tailoring::File("tailoring.xml".into()));
        assert!(matches!(
            caps.check_request(&tailored),
            Err(CapabilityError::MissingFeature { .. })
        ));
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let runner = ProcessRunner::new(Duration::from_millis(100), Default::default());
        let probe = CapabilityProbe::local("tool", &runner, Duration::from_secs(1));
        let err = probe
            .interpret(CommandOutput {
                exit_code: Some(127),
                stdout: String::new(),
                stderr: "sh: tool: command not found".to_string(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ScanError::Capability(CapabilityError::ToolNotFound { .. })
        ));
    }
}
