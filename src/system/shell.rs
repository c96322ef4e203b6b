//! OS command execution.
//!
//! Every external tool (`iptables`, `pidof`, ...) is run through a [`CommandRunner`] so
//! the callers can interpret exit codes themselves and tests can script the output.

use std::time::Duration;

use tokio::process::Command;

use crate::error::{GuestNetError, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn this output into a [`GuestNetError::CommandError`] for `command`.
    pub fn into_error(self, command: String) -> GuestNetError {
        GuestNetError::CommandError {
            command,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Runs a program to completion and captures its output.
///
/// A non-zero exit status is NOT an error at this level; only failing to run the
/// program at all is.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        (**self).run(program, args).await
    }
}

/// Runs commands through `tokio::process`, optionally bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let rendered = command_line(program, args);
        tracing::trace!(command = %rendered, "running command");

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| GuestNetError::CommandFailed {
                    command: rendered.clone(),
                    message: format!("timed out after {}s", limit.as_secs()),
                })?,
            None => command.output().await,
        }
        .map_err(|e| GuestNetError::CommandFailed {
            command: rendered.clone(),
            message: e.to_string(),
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render `program args...` for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
