//! Configuration module for the scanner driver

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runner-wide settings shared by every session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Path (or name on PATH) of the scanner tool
    pub tool_path: String,

    /// Module word placed before `eval`; `None` invokes `<tool> eval` directly
    pub tool_module: Option<String>,

    /// Secure shell client used for remote targets
    pub ssh_path: String,

    /// Secure copy client used to stage and retrieve files
    pub scp_path: String,

    /// Extra `-o` options passed to every ssh/scp invocation
    pub ssh_options: Vec<String>,

    /// Grace period between terminate and kill in milliseconds
    pub termination_grace_ms: u64,

    /// Timeout for one synchronous transport command in milliseconds
    pub transport_timeout_ms: u64,

    /// Run the local scanner under `nice -n <niceness>`
    pub niceness: Option<i32>,

    /// Path of the `nice` utility
    pub nice_path: String,

    /// Exit codes of the scanner that count as a successful run
    pub accepted_exit_codes: Vec<i32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool_path: "oscap".to_string(),
            tool_module: Some("xccdf".to_string()),
            ssh_path: "ssh".to_string(),
            scp_path: "scp".to_string(),
            ssh_options: vec!["BatchMode=yes".to_string()],
            termination_grace_ms: 3000, // 3 seconds should be enough to terminate
            transport_timeout_ms: 30_000,
            niceness: None,
            nice_path: "nice".to_string(),
            accepted_exit_codes: vec![0],
        }
    }
}

impl RunnerConfig {
    /// Create a configuration for the given scanner tool
    pub fn new(tool_path: impl Into<String>) -> Self {
        Self {
            tool_path: tool_path.into(),
            ..Default::default()
        }
    }

    /// Set the scanner module word
    pub fn with_tool_module(mut self, module: Option<String>) -> Self {
        self.tool_module = module;
        self
    }

    /// Set the terminate-to-kill grace period
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the synchronous transport command timeout
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the local niceness wrapper
    pub fn with_niceness(mut self, niceness: Option<i32>) -> Self {
        self.niceness = niceness;
        self
    }

    /// Set which exit codes count as success
    pub fn with_accepted_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.accepted_exit_codes = codes;
        self
    }

    /// Get the termination grace period as Duration
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    /// Get the transport timeout as Duration
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    /// Whether an exit code means the evaluation completed
    pub fn is_success_code(&self, code: i32) -> bool {
        self.accepted_exit_codes.contains(&code)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::ScanError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: RunnerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default location of the user configuration file
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".scap-runner.toml")
    }

    /// Load configuration from the default location, falling back to defaults
    pub fn load_default_config() -> Self {
        let path = Self::default_path();

        if path.exists() {
            match Self::from_toml_file(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", path.display(), e),
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.tool_path.trim().is_empty() {
            return Err(crate::ScanError::ConfigError(
                "Scanner tool path cannot be empty".to_string(),
            ));
        }

        if self.ssh_path.trim().is_empty() || self.scp_path.trim().is_empty() {
            return Err(crate::ScanError::ConfigError(
                "ssh and scp paths cannot be empty".to_string(),
            ));
        }

        if self.transport_timeout_ms == 0 {
            return Err(crate::ScanError::ConfigError(
                "Transport timeout must be greater than 0".to_string(),
            ));
        }

        if self.accepted_exit_codes.is_empty() {
            return Err(crate::ScanError::ConfigError(
                "At least one accepted exit code is required".to_string(),
            ));
        }

        if let Some(niceness) = self.niceness {
            if !(-20..=19).contains(&niceness) {
                return Err(crate::ScanError::ConfigError(format!(
                    "Niceness {} is outside -20..=19",
                    niceness
                )));
            }
        }

        Ok(())
    }
}
