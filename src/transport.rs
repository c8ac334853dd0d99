//! Remote command and file transfer transport
//!
//! `SshTransport` keeps a single ssh master connection (ControlMaster) for the
//! lifetime of a session; every command and copy is multiplexed over its
//! control socket, which lives in a private local temporary directory.

use crate::config::RunnerConfig;
use crate::process::{CommandOutput, CommandSpec, ExecutionContext, ProcessRunner};
use crate::request::RemoteConnection;
use crate::{Result, ScanError};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;

/// ssh reports its own failures (as opposed to the remote command's) with 255
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// Executes commands and copies files on a remote machine
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Human readable name of the remote end
    fn describe(&self) -> String;

    /// Establish the connection
    async fn connect(&mut self) -> Result<()>;

    /// Run a shell command remotely and collect its output; `Err` only for
    /// transport level failures
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Copy a local file to a remote path
    async fn upload(&self, local: &Path, remote: &str) -> Result<CommandOutput>;

    /// Copy a remote file to a local path
    async fn download(&self, remote: &str, local: &Path) -> Result<CommandOutput>;

    /// Fail with a connection error if the connection is no longer usable
    async fn check(&self) -> Result<()>;

    /// Local command that runs `remote_command` remotely with streamed output
    fn streaming_command(&self, remote_command: &str) -> CommandSpec;

    /// Tear the connection down
    async fn disconnect(&mut self) -> Result<()>;
}

/// ssh/scp based transport with a multiplexed master connection
pub struct SshTransport {
    connection: RemoteConnection,
    config: Arc<RunnerConfig>,
    runner: ProcessRunner,
    control_dir: Option<TempDir>,
}

impl SshTransport {
    pub fn new(connection: RemoteConnection, config: Arc<RunnerConfig>, runner: ProcessRunner) -> Self {
        Self {
            connection,
            config,
            runner,
            control_dir: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.control_dir.is_some()
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control_dir.as_ref().map(|dir| dir.path().join("socket"))
    }

    /// Options shared by ssh and scp; `port_flag` differs between the two
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(path) = self.control_path() {
            args.push("-o".to_string());
            args.push(format!("ControlPath={}", path.display()));
        }

        args.push(port_flag.to_string());
        args.push(self.connection.port.to_string());

        for option in &self.config.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }

        args
    }

    fn ssh_command(&self, remote_command: &str) -> CommandSpec {
        let mut args = self.common_args("-p");
        args.push(self.connection.destination());
        let remote = ExecutionContext::Wrapper {
            program: self.config.ssh_path.clone(),
            args,
        };
        remote.apply(CommandSpec::new(remote_command))
    }

    fn remote_spec(&self, remote: &str) -> String {
        format!("{}:{}", self.connection.destination(), remote)
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner.output(spec, self.config.transport_timeout()).await
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn describe(&self) -> String {
        self.connection.to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let dir = tempfile::Builder::new()
            .prefix("scap-runner-ssh-")
            .tempdir()
            .map_err(|e| {
                ScanError::ConnectionError(format!(
                    "Failed to create a directory for the ssh control socket: {}",
                    e
                ))
            })?;
        let socket = dir.path().join("socket");

        let spec = CommandSpec::new(&self.config.ssh_path)
            .args(["-M", "-f", "-N", "-o"])
            .arg(format!("ControlPath={}", socket.display()))
            .args(self.common_args("-p"))
            .arg(self.connection.destination());

        info!("Establishing master connection to {}", self.describe());
        let output = self.run(&spec).await.map_err(|e| match e {
            ScanError::TimeoutError(msg) => ScanError::ConnectionError(msg),
            other => other,
        })?;

        if !output.success() {
            return Err(ScanError::ConnectionError(format!(
                "Failed to connect to {}. Diagnostic info:\n\n{}",
                self.describe(),
                output.diagnostic_info()
            )));
        }

        self.control_dir = Some(dir);
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        debug!("Remote exec on {}: {}", self.describe(), command);
        let output = self.run(&self.ssh_command(command)).await.map_err(|e| match e {
            ScanError::TimeoutError(msg) => ScanError::ConnectionError(msg),
            other => other,
        })?;

        if output.exit_code == Some(SSH_CONNECTION_FAILURE) {
            return Err(ScanError::ConnectionError(format!(
                "Lost connection to {}. Diagnostic info:\n\n{}",
                self.describe(),
                output.diagnostic_info()
            )));
        }

        Ok(output)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<CommandOutput> {
        let spec = CommandSpec::new(&self.config.scp_path)
            .args(self.common_args("-P"))
            .arg(local.display().to_string())
            .arg(self.remote_spec(remote));
        self.run(&spec).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<CommandOutput> {
        let spec = CommandSpec::new(&self.config.scp_path)
            .args(self.common_args("-P"))
            .arg(self.remote_spec(remote))
            .arg(local.display().to_string());
        self.run(&spec).await
    }

    async fn check(&self) -> Result<()> {
        let output = match self.control_path() {
            Some(socket) => {
                let spec = CommandSpec::new(&self.config.ssh_path)
                    .arg("-O")
                    .arg("check")
                    .arg("-o")
                    .arg(format!("ControlPath={}", socket.display()))
                    .arg(self.connection.destination());
                self.run(&spec).await?
            }
            None => self.exec("true").await?,
        };

        if output.success() {
            Ok(())
        } else {
            Err(ScanError::ConnectionError(format!(
                "The connection to {} is gone. Diagnostic info:\n\n{}",
                self.describe(),
                output.diagnostic_info()
            )))
        }
    }

    fn streaming_command(&self, remote_command: &str) -> CommandSpec {
        self.ssh_command(remote_command)
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(socket) = self.control_path() else {
            return Ok(());
        };

        let spec = CommandSpec::new(&self.config.ssh_path)
            .arg("-S")
            .arg(socket.display().to_string())
            .args(["-O", "exit"])
            .arg(self.connection.destination());
        let output = self.run(&spec).await;

        if let Some(dir) = self.control_dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove the ssh control directory: {}", e);
            }
        }

        let output = output?;
        if !output.success() {
            return Err(ScanError::ConnectionError(format!(
                "Failed to close the master connection to {}. Diagnostic info:\n\n{}",
                self.describe(),
                output.diagnostic_info()
            )));
        }

        info!("Disconnected from {}", self.describe());
        Ok(())
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        // a forgotten master process would outlive us otherwise
        let Some(socket) = self.control_path() else {
            return;
        };

        let mut command = std::process::Command::new(&self.config.ssh_path);
        command
            .arg("-S")
            .arg(&socket)
            .args(["-O", "exit"])
            .arg(self.connection.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // the socket directory has to outlive the exit request
                let control_dir = self.control_dir.take();
                match tokio::process::Command::from(command).spawn() {
                    Ok(mut child) => {
                        handle.spawn(async move {
                            let _ = child.wait().await;
                            drop(control_dir);
                        });
                    }
                    Err(e) => debug!("Could not stop the ssh master connection: {}", e),
                }
            }
            Err(_) => {
                let _ = command.status();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticsSink;
    use std::time::Duration;

    fn transport(port: u16) -> SshTransport {
        let config = Arc::new(RunnerConfig {
            ssh_options: vec!["BatchMode=yes".to_string(), "StrictHostKeyChecking=no".to_string()],
            ..Default::default()
        });
        let runner = ProcessRunner::new(Duration::from_millis(100), DiagnosticsSink::new());
        SshTransport::new(
            RemoteConnection::new("scanner", "db.example.com").with_port(port),
            config,
            runner,
        )
    }

    #[test]
    fn test_streaming_command_layout() {
        let t = transport(2222);
        let spec = t.streaming_command("oscap -V");
        assert_eq!(spec.program, "ssh");
        assert_eq!(
            spec.args,
            vec![
                "-p",
                "2222",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "scanner@db.example.com",
                "oscap -V",
            ]
        );
    }

    #[test]
    fn test_scp_uses_upper_case_port_flag() {
        let t = transport(2222);
        let args = t.common_args("-P");
        assert_eq!(&args[..2], &["-P".to_string(), "2222".to_string()]);
        assert_eq!(t.remote_spec("/tmp/x/results.xml"), "scanner@db.example.com:/tmp/x/results.xml");
    }

    #[test]
    fn test_describe_and_initial_state() {
        let t = transport(22);
        assert_eq!(t.describe(), "scanner@db.example.com:22");
        assert!(!t.is_connected());
        assert!(t.control_path().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let mut t = transport(22);
        assert!(t.disconnect().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_does_not_wait_for_the_master() {
        use std::os::unix::fs::PermissionsExt;

        let bin = tempfile::tempdir().unwrap();
        let slow_ssh = bin.path().join("ssh");
        std::fs::write(&slow_ssh, "#!/bin/sh\nsleep 1\n").unwrap();
        std::fs::set_permissions(&slow_ssh, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Arc::new(RunnerConfig {
            ssh_path: slow_ssh.display().to_string(),
            ..Default::default()
        });
        let runner = ProcessRunner::new(Duration::from_millis(100), DiagnosticsSink::new());
        let mut t = SshTransport::new(RemoteConnection::new("scanner", "db.example.com"), config, runner);
        let control_dir = tempfile::tempdir().unwrap();
        let control_path = control_dir.path().to_path_buf();
        t.control_dir = Some(control_dir);

        let started = std::time::Instant::now();
        drop(t);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(control_path.exists());

        // removed once the exit request is done
        let mut waited = 0;
        while control_path.exists() && waited < 50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += 1;
        }
        assert!(!control_path.exists());
    }
}
