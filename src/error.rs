//! Error types for routing, firewall and DHCP operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuestNetError {
    /// The command could not be run at all (missing binary, spawn failure, timeout).
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    /// The command ran but exited with a status the caller did not expect.
    #[error("Command '{command}' exited with {}: {}", exit_label(.exit_code), .stderr.trim())]
    CommandError {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to parse output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuestNetError {
    /// Whether this error came from running an OS command.
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            GuestNetError::CommandFailed { .. } | GuestNetError::CommandError { .. }
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, GuestNetError>;
