//! External command execution.
//!
//! Every interaction with the host (`ip`, `nft` and the `nfqlb` binary) goes
//! through a [`CommandRunner`]. The drivers only build command lines; the
//! runner decides how they are executed. [`HostCommandRunner`] spawns real
//! processes, `testing::FakeHost` simulates the host in memory.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Deadline applied to each invocation when none is configured.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages the kernel and host tools print when the object to delete is
/// already gone.
const NOT_FOUND_MARKERS: &[&str] = &[
    "No such file or directory",
    "No such process",
    "Cannot find",
];

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,

    /// Data written to the process standard input, if any.
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Errors from running external commands.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be started (or its pipes failed).
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("{command} exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    /// The deadline passed. The process has been killed.
    #[error("{command} did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl ExecError {
    /// Returns true if the command failed because its target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ExecError::Failed { output, .. } => {
                NOT_FOUND_MARKERS.iter().any(|marker| output.contains(marker))
            }
            _ => false,
        }
    }
}

/// Runs host commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion. A non-zero exit is an error carrying the
    /// captured output.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Run a long-lived `command` until it exits or `shutdown` flips to
    /// true. On shutdown the process is killed and `Ok` is returned.
    async fn supervise(
        &self,
        command: &CommandSpec,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExecError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone)]
pub struct HostCommandRunner {
    timeout: Duration,
}

impl HostCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HostCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let spawn_error = |source: std::io::Error| ExecError::Spawn {
            command: command.to_string(),
            source,
        };

        debug!(command = %command, "Running command");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child.stdin.take();
        let completion = async move {
            if let (Some(input), Some(mut pipe)) = (&command.stdin, stdin) {
                pipe.write_all(input.as_bytes()).await?;
                // Dropping the pipe closes stdin.
            }
            child.wait_with_output().await
        };

        // On timeout the child is dropped with the future and killed.
        let output = match tokio::time::timeout(self.timeout, completion).await {
            Ok(output) => output.map_err(spawn_error)?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ExecError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
                output: format!("{}{}", stdout, stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    async fn supervise(
        &self,
        command: &CommandSpec,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ExecError> {
        let spawn_error = |source: std::io::Error| ExecError::Spawn {
            command: command.to_string(),
            source,
        };

        // Output goes straight to our own stdout/stderr so a chatty process
        // never blocks on a full pipe.
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        info!(command = %command, pid = ?child.id(), "Process started");

        loop {
            if *shutdown.borrow() {
                info!(command = %command, "Stopping process");
                if let Err(e) = child.kill().await {
                    warn!(command = %command, error = %e, "Failed to kill process");
                }
                return Ok(());
            }

            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(spawn_error)?;
                    if status.success() {
                        info!(command = %command, "Process exited");
                        return Ok(());
                    }
                    return Err(ExecError::Failed {
                        command: command.to_string(),
                        status: status.to_string(),
                        output: String::new(),
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can ask us to stop anymore.
                        let status = child.wait().await.map_err(spawn_error)?;
                        if status.success() {
                            return Ok(());
                        }
                        return Err(ExecError::Failed {
                            command: command.to_string(),
                            status: status.to_string(),
                            output: String::new(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_command_spec_display() {
        let command = CommandSpec::new("nfqlb")
            .arg("init")
            .args(["--shm=svc-a", "--N=2"]);
        assert_eq!(command.to_string(), "nfqlb init --shm=svc-a --N=2");
    }

    #[test]
    fn test_is_not_found() {
        let err = ExecError::Failed {
            command: "ip -4 rule del fwmark 5000 table 5000".to_string(),
            status: "exit status: 2".to_string(),
            output: "RTNETLINK answers: No such file or directory".to_string(),
        };
        assert!(err.is_not_found());

        let err = ExecError::Failed {
            command: "ip -4 rule add fwmark 5000 table 5000".to_string(),
            status: "exit status: 2".to_string(),
            output: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = HostCommandRunner::default();
        let output = runner.run(&sh("echo hello")).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_writes_stdin() {
        let runner = HostCommandRunner::default();
        let output = runner
            .run(&CommandSpec::new("cat").stdin("add table inet t\n"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "add table inet t\n");
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() {
        let runner = HostCommandRunner::default();
        let err = runner.run(&sh("echo oops >&2; exit 3")).await.unwrap_err();

        match err {
            ExecError::Failed { output, .. } => assert_eq!(output, "oops"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let runner = HostCommandRunner::default();
        let err = runner
            .run(&CommandSpec::new("/nonexistent/slb-test-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let runner = HostCommandRunner::new(Duration::from_millis(50));
        let err = runner.run(&sh("sleep 5")).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_timeout_covers_unread_stdin() {
        let runner = HostCommandRunner::new(Duration::from_millis(50));
        let command = CommandSpec::new("sleep").arg("5").stdin("x".repeat(1 << 20));

        let err = tokio::time::timeout(Duration::from_secs(3), runner.run(&command))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let runner = HostCommandRunner::new(Duration::from_millis(50));

        let err = runner
            .run(&sh(&format!("sleep 0.5; touch {}", marker.display())))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_supervise_stops_on_shutdown() {
        let runner = HostCommandRunner::default();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { runner.supervise(&sh("sleep 30"), rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_supervise_reports_exit_failure() {
        let runner = HostCommandRunner::default();
        let (_tx, rx) = watch::channel(false);

        let err = runner.supervise(&sh("exit 1"), rx).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { .. }));
    }
}
