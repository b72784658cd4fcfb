//! Structured outcome of a one-shot command.

use std::time::Duration;

use crate::error::CommandError;

/// Outcome of one command run through [`CommandExecutor`](super::CommandExecutor).
///
/// Failures are carried in [`failure`](Self::failure) instead of being
/// returned as `Err`, so polling loops branch on [`success`](Self::success).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// The command as the caller gave it (before any sudo/time wrapper).
    pub command: String,

    /// Standard output.
    pub stdout: String,

    /// Standard error, with timing wrapper lines removed.
    pub stderr: String,

    /// Remote exit status; `-1` when unknown.
    pub exit_code: i32,

    /// Remote execution time when reported by `time`, otherwise round trip.
    pub exec_time: Duration,

    /// Time until the request was accepted.
    pub send_time: Duration,

    /// Time spent draining output.
    pub read_time: Duration,

    /// Time spent post-processing output.
    pub parsed_time: Duration,

    /// Why the command failed, if it did.
    pub failure: Option<CommandError>,
}

impl CommandResult {
    /// A result for a command that never ran.
    pub fn failed(command: impl Into<String>, failure: CommandError) -> Self {
        Self {
            command: command.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            exec_time: Duration::ZERO,
            send_time: Duration::ZERO,
            read_time: Duration::ZERO,
            parsed_time: Duration::ZERO,
            failure: Some(failure),
        }
    }

    /// Exit code was zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get the stdout lines as an iterator.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout)
    }
}
