use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::format_command_output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failed,
    TimedOut,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: CommandStatus::TimedOut,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn exception(detail: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Exception,
            exit_code: None,
            stdout: String::new(),
            stderr: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    pub fn log_text(&self) -> String {
        format_command_output(&self.stdout, &self.stderr)
    }
}

/// A host-side command with a hard timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HostCommand {
    pub fn new<I, S>(timeout: Duration, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Runs host commands and owns the notion of sleeping between polls, so that
/// retry loops can be driven by a fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: HostCommand) -> CommandResult;

    async fn run_timed_cmd(&self, timeout: Duration, argv: &[&str]) -> CommandResult {
        self.run(HostCommand::new(timeout, argv.iter().copied())).await
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Default, Clone)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, command: HostCommand) -> CommandResult {
        let Some((program, args)) = command.argv.split_first() else {
            return CommandResult::exception("empty command line");
        };
        debug!("running `{}` (timeout {:?})", command.display(), command.timeout);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return CommandResult::exception(format!("{program} not found"));
            }
            Err(err) => return CommandResult::exception(err.to_string()),
        };

        match tokio::time::timeout(command.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandResult {
                status: if output.status.success() {
                    CommandStatus::Success
                } else {
                    CommandStatus::Failed
                },
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
            Ok(Err(err)) => CommandResult::exception(err.to_string()),
            Err(_) => CommandResult::timed_out(),
        }
    }
}
