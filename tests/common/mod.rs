//! Shared fixtures: a scriptable fake scanner and a transport that treats
//! the local machine as the remote one

#![allow(dead_code)]

use async_trait::async_trait;
use scap_runner::{
    diagnostics::{DiagnosticLevel, DiagnosticsSink},
    process::{CommandOutput, CommandSpec, ProcessRunner},
    session::{SessionEvent, SessionReport, SessionState},
    RemoteTransport, Result, RunnerConfig, ScanError,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RULE_A: &str = "xccdf_org.ssgproject.content_rule_accounts_password_minlen";
pub const RULE_B: &str = "xccdf_org.ssgproject.content_rule_audit_rules_immutable";

/// Builder for a shell script that behaves like the scanner
#[derive(Debug, Clone)]
pub struct FakeScanner {
    pub version: String,
    pub records: Vec<(String, String)>,
    pub raw_stdout: Option<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    pub sleep_secs: Option<u32>,
    pub ignore_term: bool,
    pub write_outputs: bool,
}

impl Default for FakeScanner {
    fn default() -> Self {
        Self {
            version: "1.3.5".to_string(),
            records: vec![
                (RULE_A.to_string(), "pass".to_string()),
                (RULE_B.to_string(), "notapplicable".to_string()),
            ],
            raw_stdout: None,
            stderr: Vec::new(),
            exit_code: 0,
            sleep_secs: None,
            ignore_term: false,
            write_outputs: true,
        }
    }
}

impl FakeScanner {
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn raw_stdout(mut self, raw: &str) -> Self {
        self.raw_stdout = Some(raw.to_string());
        self
    }

    pub fn stderr_line(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    pub fn sleep(mut self, secs: u32) -> Self {
        self.sleep_secs = Some(secs);
        self
    }

    pub fn ignore_term(mut self) -> Self {
        self.ignore_term = true;
        self
    }

    /// Write the script into `dir`; it records its arguments in `dir/args.txt`
    pub fn install(&self, dir: &Path) -> PathBuf {
        let mut script = String::from("#!/bin/sh\n");
        script.push_str(&format!(
            "if [ \"$1\" = \"-V\" ]; then\n\
             echo \"OpenSCAP command line tool (oscap) {version}\"\n\
             echo \"Copyright 2009--2021 Red Hat Inc., Durham, North Carolina.\"\n\
             echo \"\"\n\
             echo \"==== Supported specifications ====\"\n\
             echo \"XCCDF Version: 1.2\"\n\
             echo \"OVAL Version: 5.11.2\"\n\
             exit 0\n\
             fi\n",
            version = self.version
        ));

        let record = dir.join("args.txt");
        let tailoring_copy = dir.join("tailoring.seen");
        script.push_str(&format!(
            "printf '%s\\n' \"$@\" > '{record}'\n\
             results=\"\"; report=\"\"; arf=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             case \"$1\" in\n\
             --results) results=\"$2\"; shift ;;\n\
             --report) report=\"$2\"; shift ;;\n\
             --results-arf) arf=\"$2\"; shift ;;\n\
             --tailoring-file) cp \"$2\" '{tailoring}'; shift ;;\n\
             esac\n\
             shift\n\
             done\n",
            record = record.display(),
            tailoring = tailoring_copy.display()
        ));

        if self.ignore_term {
            script.push_str("trap '' TERM\n");
        } else {
            script.push_str("trap 'kill $child 2>/dev/null; exit 143' TERM\n");
        }

        for line in &self.stderr {
            script.push_str(&format!("echo '{}' >&2\n", line));
        }
        for (id, result) in &self.records {
            script.push_str(&format!("printf '%s:%s\\n' '{}' '{}'\n", id, result));
        }
        if let Some(raw) = &self.raw_stdout {
            script.push_str(&format!("printf '{}'\n", raw.replace('\n', "\\n")));
        }

        if let Some(secs) = self.sleep_secs {
            if self.ignore_term {
                script.push_str(&format!("i=0; while [ $i -lt {} ]; do sleep 1; i=$((i+1)); done\n", secs));
            } else {
                script.push_str(&format!("sleep {} & child=$!\nwait $child\n", secs));
            }
            script.push_str(&format!("printf '%s:%s\\n' '{}_late' 'pass'\n", RULE_B));
        }

        if self.write_outputs {
            script.push_str(
                "[ -n \"$results\" ] && echo '<TestResult/>' > \"$results\"\n\
                 [ -n \"$report\" ] && echo '<html></html>' > \"$report\"\n\
                 [ -n \"$arf\" ] && echo '<arf:asset-report-collection/>' > \"$arf\"\n",
            );
        }
        script.push_str(&format!("exit {}\n", self.exit_code));

        let path = dir.join("fake-oscap");
        fs::write(&path, script).expect("write fake scanner");
        let mut perms = fs::metadata(&path).expect("stat fake scanner").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod fake scanner");
        path
    }
}

/// Arguments the fake scanner was evaluated with, if it ever was
pub fn recorded_args(dir: &Path) -> Option<Vec<String>> {
    fs::read_to_string(dir.join("args.txt"))
        .ok()
        .map(|s| s.lines().map(str::to_string).collect())
}

/// Write a dummy input document and return its path
pub fn input_document(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "<Benchmark/>").expect("write input");
    path
}

pub fn config_for(tool: &Path) -> RunnerConfig {
    RunnerConfig::new(tool.display().to_string()).with_termination_grace(Duration::from_millis(1500))
}

pub fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

pub fn progress_ids(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress(p) => Some(p.rule_id.clone()),
            _ => None,
        })
        .collect()
}

pub fn diagnostics_at(report: &SessionReport, level: DiagnosticLevel) -> Vec<String> {
    report
        .diagnostics
        .iter()
        .filter(|m| m.level == level)
        .map(|m| m.text.clone())
        .collect()
}

/// Failures a `LoopbackTransport` should simulate
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub connect: bool,
    pub upload: bool,
    /// Remote file names whose download fails
    pub download: Vec<String>,
    /// The connection is gone once a download has failed
    pub lose_connection: bool,
    pub cleanup: bool,
    /// The remote temporary directory cannot be created
    pub mktemp: bool,
}

/// Transport whose "remote" side is a local `sh`
pub struct LoopbackTransport {
    runner: ProcessRunner,
    faults: Faults,
    lost: Arc<Mutex<bool>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl LoopbackTransport {
    pub fn new(faults: Faults) -> Self {
        Self {
            runner: ProcessRunner::new(Duration::from_millis(500), DiagnosticsSink::new()),
            faults,
            lost: Arc::new(Mutex::new(false)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    async fn copy(&self, from: &Path, to: &Path) -> CommandOutput {
        match tokio::fs::copy(from, to).await {
            Ok(_) => CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            },
            Err(e) => Self::failed(&e.to_string()),
        }
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    fn describe(&self) -> String {
        "loopback".to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        self.record("connect".to_string());
        if self.faults.connect {
            return Err(ScanError::ConnectionError("ssh: connect to host loopback: Connection refused".to_string()));
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.record(format!("exec {}", command));
        if self.faults.cleanup && command.starts_with("rm -rf") {
            return Ok(Self::failed("rm: cannot remove: Permission denied"));
        }
        if self.faults.mktemp && command.starts_with("mktemp") {
            return Ok(Self::failed("mktemp: failed to create directory via template: No space left on device"));
        }
        let spec = CommandSpec::new("sh").arg("-c").arg(command);
        self.runner.output(&spec, Duration::from_secs(10)).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<CommandOutput> {
        self.record(format!("upload {} {}", local.display(), remote));
        if self.faults.upload {
            return Ok(Self::failed("scp: remote: Disk quota exceeded"));
        }
        Ok(self.copy(local, Path::new(remote)).await)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<CommandOutput> {
        self.record(format!("download {} {}", remote, local.display()));
        if self.faults.download.iter().any(|name| remote.ends_with(name.as_str())) {
            if self.faults.lose_connection {
                *self.lost.lock().unwrap() = true;
            }
            return Ok(Self::failed("scp: No such file or directory"));
        }
        Ok(self.copy(Path::new(remote), local).await)
    }

    async fn check(&self) -> Result<()> {
        self.record("check".to_string());
        if *self.lost.lock().unwrap() {
            return Err(ScanError::ConnectionError("Connection to loopback closed".to_string()));
        }
        Ok(())
    }

    fn streaming_command(&self, remote_command: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(remote_command)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.record("disconnect".to_string());
        Ok(())
    }
}
