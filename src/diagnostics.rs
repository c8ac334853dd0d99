//! Ordered, append-only diagnostics log shared by the components of one session

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Severity of a diagnostic message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
    Exception,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticLevel::Info => "info",
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Exception => "exception",
        };
        write!(f, "{}", name)
    }
}

/// One leveled message; `sequence` is its insertion index within the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    pub sequence: u64,
    pub level: DiagnosticLevel,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked for each accepted message, in insertion order
pub type DiagnosticListener = Arc<dyn Fn(&DiagnosticMessage) + Send + Sync>;

struct SinkInner {
    messages: Vec<DiagnosticMessage>,
    sealed: bool,
}

/// Cheaply clonable handle to a session's diagnostics log
#[derive(Clone)]
pub struct DiagnosticsSink {
    inner: Arc<Mutex<SinkInner>>,
    listener: Option<DiagnosticListener>,
}

impl Default for DiagnosticsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DiagnosticsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsSink")
            .field("len", &self.len())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl DiagnosticsSink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                messages: Vec::new(),
                sealed: false,
            })),
            listener: None,
        }
    }

    /// Sink that forwards each message to `listener` while holding the log lock
    pub fn with_listener(listener: DiagnosticListener) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        // poisoning is ignored, the log stays append-only
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message. Messages arriving after `seal` are dropped.
    pub fn append(&self, level: DiagnosticLevel, text: impl Into<String>) {
        let text = text.into();
        let mut inner = self.lock();

        if inner.sealed {
            debug!("Dropping diagnostic after session end: {}", text);
            return;
        }

        match level {
            DiagnosticLevel::Info => info!("{}", text),
            DiagnosticLevel::Warning => warn!("{}", text),
            DiagnosticLevel::Error | DiagnosticLevel::Exception => error!("{}", text),
        }

        let message = DiagnosticMessage {
            sequence: inner.messages.len() as u64,
            level,
            text,
            timestamp: Utc::now(),
        };

        if let Some(listener) = &self.listener {
            listener(&message);
        }
        inner.messages.push(message);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.append(DiagnosticLevel::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.append(DiagnosticLevel::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.append(DiagnosticLevel::Error, text);
    }

    /// Stop accepting messages; called when the session reaches a terminal state
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Ordered copy of everything appended so far
    pub fn snapshot(&self) -> Vec<DiagnosticMessage> {
        self.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages at exactly `level`
    pub fn count(&self, level: DiagnosticLevel) -> usize {
        self.lock().messages.iter().filter(|m| m.level == level).count()
    }
}
