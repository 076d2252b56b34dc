//! Command-execution abstraction (spec §6.3): the shell-style fallback
//! invoked when the native firewall/netlink backend is unavailable.
//!
//! Grounded on `gnosis_vpn-lib/src/shell_command_ext.rs`'s
//! `ShellCommandExt` extension trait: capture stdout/stderr
//! unconditionally, log non-empty stderr on success as a warning, and
//! turn a non-zero exit into an error.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command exited with a non-zero status")]
    CommandFailed,
    #[error("IO error running command: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether to log non-fatal stderr/warnings from a command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logs {
    Print,
    Suppress,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs a command to completion, discarding stdout.
    async fn run(&self, program: &str, args: &[&str], logs: Logs) -> Result<(), Error>;

    /// Runs a command to completion, returning trimmed stdout.
    async fn run_stdout(&self, program: &str, args: &[&str], logs: Logs) -> Result<String, Error>;
}

/// Production [`CommandExecutor`] using `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellCommandExecutor;

#[async_trait]
impl CommandExecutor for ShellCommandExecutor {
    async fn run(&self, program: &str, args: &[&str], logs: Logs) -> Result<(), Error> {
        self.run_stdout(program, args, logs).await?;
        Ok(())
    }

    async fn run_stdout(&self, program: &str, args: &[&str], logs: Logs) -> Result<String, Error> {
        let output = Command::new(program).args(args).output().await?;
        let stderr_empty = output.stderr.is_empty();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match (stderr_empty, output.status.success()) {
            (true, true) => Ok(stdout),
            (false, true) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::warn!(program, ?args, %stderr, "non-empty stderr on successful command");
                }
                Ok(stdout)
            }
            (_, false) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::error!(program, ?args, status = ?output.status.code(), %stdout, %stderr, "command failed");
                }
                Err(Error::CommandFailed)
            }
        }
    }
}
