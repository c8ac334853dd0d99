//! Incremental decoder for the scanner's `--progress` output
//!
//! The scanner prints one `<ruleId>:<result>\n` record per evaluated rule.
//! Output arrives in arbitrary chunks, so decoding is a byte-at-a-time state
//! machine (`step`) that never looks ahead:
//!
//! ```text
//! AwaitingId --':'--> AwaitingResult --'\n'--> emit, AwaitingId
//! AwaitingId --"Downloading:"--> Download --'\n'--> emit, AwaitingId
//! ```
//!
//! A ':' after the id was already terminated and a non-empty line without any
//! ':' are both fatal. Records whose result is not a known token are passed
//! through verbatim so they can be logged.

use crate::error::{ParseError, ParseErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

const DOWNLOAD_PREFIX: &[u8] = b"Downloading";

/// Outcome of evaluating one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleResult {
    Pass,
    Fail,
    Error,
    Unknown,
    NotApplicable,
    NotChecked,
    NotSelected,
    Informational,
    Fixed,
    Processing,
}

impl RuleResult {
    /// Parse a result token as printed by the scanner
    pub fn from_token(token: &str) -> Option<Self> {
        let result = match token {
            "pass" => RuleResult::Pass,
            "fail" => RuleResult::Fail,
            "error" => RuleResult::Error,
            "unknown" => RuleResult::Unknown,
            "notapplicable" => RuleResult::NotApplicable,
            "notchecked" => RuleResult::NotChecked,
            "notselected" => RuleResult::NotSelected,
            "informational" => RuleResult::Informational,
            "fixed" => RuleResult::Fixed,
            "processing" => RuleResult::Processing,
            _ => return None,
        };
        Some(result)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleResult::Pass => "pass",
            RuleResult::Fail => "fail",
            RuleResult::Error => "error",
            RuleResult::Unknown => "unknown",
            RuleResult::NotApplicable => "notapplicable",
            RuleResult::NotChecked => "notchecked",
            RuleResult::NotSelected => "notselected",
            RuleResult::Informational => "informational",
            RuleResult::Fixed => "fixed",
            RuleResult::Processing => "processing",
        }
    }
}

impl fmt::Display for RuleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded progress record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub rule_id: String,
    pub result: RuleResult,
}

impl ProgressEvent {
    pub fn new(rule_id: impl Into<String>, result: RuleResult) -> Self {
        Self {
            rule_id: rule_id.into(),
            result,
        }
    }
}

/// Anything the decoder can emit at a record boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Progress(ProgressEvent),
    /// A well-formed line that is not a progress record
    Passthrough(String),
    /// `Downloading: <url> ... <status>` reported while fetching remote resources
    Download { url: String, status: String },
}

/// Decoder state between two bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserState {
    AwaitingId { id: Vec<u8> },
    AwaitingResult { id: Vec<u8>, result: Vec<u8> },
    Download { line: Vec<u8> },
}

impl Default for ParserState {
    fn default() -> Self {
        ParserState::AwaitingId { id: Vec::new() }
    }
}

impl ParserState {
    /// Bytes of the record currently being assembled
    pub fn pending(&self) -> String {
        match self {
            ParserState::AwaitingId { id } => lossy(id),
            ParserState::AwaitingResult { id, result } => format!("{}:{}", lossy(id), lossy(result)),
            ParserState::Download { line } => format!("Downloading:{}", lossy(line)),
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn trim_cr(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Advance the decoder by one byte
pub fn step(state: ParserState, byte: u8) -> Result<(ParserState, Option<Decoded>), ParseError> {
    match state {
        ParserState::AwaitingId { mut id } => match byte {
            b':' if id == DOWNLOAD_PREFIX => Ok((ParserState::Download { line: Vec::new() }, None)),
            b':' => Ok((ParserState::AwaitingResult { id, result: Vec::new() }, None)),
            b'\n' => {
                if trim_cr(&id).iter().all(|b| b.is_ascii_whitespace()) {
                    // blank line between records
                    Ok((ParserState::default(), None))
                } else {
                    Err(ParseError::new(ParseErrorKind::MissingResult, lossy(trim_cr(&id))))
                }
            }
            _ => {
                id.push(byte);
                Ok((ParserState::AwaitingId { id }, None))
            }
        },
        ParserState::AwaitingResult { id, mut result } => match byte {
            b':' => Err(ParseError::new(
                ParseErrorKind::AmbiguousRuleId,
                format!("{}:{}:", lossy(&id), lossy(&result)),
            )),
            b'\n' => {
                let raw = lossy(trim_cr(&result));
                let rule_id = lossy(&id);
                let decoded = match RuleResult::from_token(raw.trim()) {
                    Some(result) if !rule_id.is_empty() => Decoded::Progress(ProgressEvent { rule_id, result }),
                    _ => Decoded::Passthrough(format!("{}:{}", rule_id, raw)),
                };
                Ok((ParserState::default(), Some(decoded)))
            }
            _ => {
                result.push(byte);
                Ok((ParserState::AwaitingResult { id, result }, None))
            }
        },
        ParserState::Download { mut line } => match byte {
            b'\n' => {
                let text = lossy(trim_cr(&line));
                let (url, status) = match text.rsplit_once(" ... ") {
                    Some((url, status)) => (url.trim().to_string(), status.trim().to_string()),
                    None => (text.trim().to_string(), String::new()),
                };
                Ok((ParserState::default(), Some(Decoded::Download { url, status })))
            }
            _ => {
                line.push(byte);
                Ok((ParserState::Download { line }, None))
            }
        },
    }
}

/// Streaming wrapper around `step`; poisoned by the first error
#[derive(Debug, Default)]
pub struct ProgressParser {
    state: ParserState,
    failure: Option<ParseError>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, handing every completed record to `on_decoded` in order.
    ///
    /// Records completed before a malformed one are still delivered; the error
    /// is returned afterwards and every later call returns it again.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_decoded: F) -> Result<(), ParseError>
    where
        F: FnMut(Decoded),
    {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        for &byte in chunk {
            let state = std::mem::take(&mut self.state);
            match step(state, byte) {
                Ok((next, decoded)) => {
                    self.state = next;
                    if let Some(decoded) = decoded {
                        on_decoded(decoded);
                    }
                }
                Err(e) => {
                    self.failure = Some(e.clone());
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Decode a chunk and collect the completed records
    pub fn feed_collect(&mut self, chunk: &[u8]) -> Result<Vec<Decoded>, ParseError> {
        let mut out = Vec::new();
        self.feed(chunk, |d| out.push(d))?;
        Ok(out)
    }

    /// End of stream: returns any unterminated record text
    pub fn finish(&mut self) -> Option<String> {
        let pending = std::mem::take(&mut self.state).pending();
        if pending.trim().is_empty() {
            None
        } else {
            Some(pending)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}
