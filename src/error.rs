//! Error handling for scan sessions
//!
//! Fatal errors abort a session and are reported together with the stage that
//! produced them. Post-run problems (artifact copy-back, cleanup) are never
//! returned as errors from a session; they are downgraded to diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for scan operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Failed to start process '{command}': {reason}")]
    ProcessStartError { command: String, reason: String },

    #[error(transparent)]
    ParseError(#[from] ParseError),

    #[error("Failed to copy '{file}': {diagnostic}")]
    RemoteCopyError { file: String, diagnostic: String },

    #[error("Failed to remove remote temporary data '{path}': {diagnostic}")]
    CleanupError { path: String, diagnostic: String },

    #[error("The scanner exited with code {code}")]
    ExitStatusError { code: i32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Session task failed: {0}")]
    TaskError(String),
}

/// Pre-flight failures derived from the scanner's reported version
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("Scanner version {version} is older than the minimum supported version 0.8.0")]
    BelowBaseline { version: String },

    #[error("Scanner version {version} does not support {feature}; version {minimum} or newer is required")]
    MissingFeature {
        feature: String,
        minimum: String,
        version: String,
    },

    #[error("Result datastreams (ARF) are not supported as scan input")]
    ArfInputUnsupported,

    #[error("Scanner tool not found on {target}: {diagnostic}")]
    ToolNotFound { target: String, diagnostic: String },

    #[error("Failed to query scanner capabilities on {target}: {diagnostic}")]
    ProbeFailed { target: String, diagnostic: String },

    #[error("Could not find a version number in the scanner's version output: {raw:?}")]
    UnrecognizedVersion { raw: String },
}

/// The two recognised classes of malformed progress output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseErrorKind {
    /// A further ':' arrived after the rule id was already terminated
    AmbiguousRuleId,
    /// A line ended before any ':' separated the rule id from its result
    MissingResult,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::AmbiguousRuleId => write!(f, "ambiguous rule id"),
            ParseErrorKind::MissingResult => write!(f, "record without a result"),
        }
    }
}

/// Malformed progress output; carries everything buffered for the record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed progress output ({kind}): {buffer:?}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub buffer: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, buffer: impl Into<String>) -> Self {
        Self {
            kind,
            buffer: buffer.into(),
        }
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::ConfigError(format!("Failed to parse TOML: {}", e))
    }
}

impl ScanError {
    /// Short machine-friendly name of the error class
    pub fn class(&self) -> &'static str {
        match self {
            ScanError::ConnectionError(_) => "connection",
            ScanError::Capability(_) => "capability",
            ScanError::ProcessStartError { .. } => "process-start",
            ScanError::ParseError(_) => "parse",
            ScanError::RemoteCopyError { .. } => "remote-copy",
            ScanError::CleanupError { .. } => "cleanup",
            ScanError::ExitStatusError { .. } => "exit-status",
            ScanError::ConfigError(_) => "config",
            ScanError::IoError(_) => "io",
            ScanError::TimeoutError(_) => "timeout",
            ScanError::TaskError(_) => "task",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_messages_carry_context() {
        let err = ScanError::from(CapabilityError::MissingFeature {
            feature: "online remediation".to_string(),
            minimum: "0.9.5".to_string(),
            version: "0.9.4".to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("0.9.4"));
        assert!(msg.contains("0.9.5"));
        assert!(msg.contains("online remediation"));
        assert_eq!(err.class(), "capability");
    }

    #[test]
    fn test_parse_error_shows_buffer() {
        let err = ScanError::from(ParseError::new(ParseErrorKind::MissingResult, "rule1"));
        assert!(err.to_string().contains("rule1"));
        assert!(err.to_string().contains("record without a result"));
        assert_eq!(err.class(), "parse");
    }

    #[test]
    fn test_copy_error_names_file() {
        let err = ScanError::RemoteCopyError {
            file: "/tmp/ssg-ds.xml".to_string(),
            diagnostic: "scp: permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to copy '/tmp/ssg-ds.xml': scp: permission denied"
        );
    }
}
