//! One-shot command execution over a tunnel.
//!
//! [`CommandExecutor`] wraps [`TunnelConnection::exec`] and turns every
//! outcome, including a missing connection, into a [`CommandResult`].

mod result;
mod timing;

pub use result::CommandResult;
pub use timing::{parse_real_time, strip_time_report};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::error::{CommandError, ConnectionError};
use crate::transport::TunnelConnection;

/// How a command is wrapped before it is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandShape {
    /// Sent as is.
    #[default]
    Plain,
    /// Run through `sudo -S` with the target's secret piped on stdin.
    Elevated,
    /// Run under `time -p`; the reported wall time becomes `exec_time`.
    Timed,
}

impl CommandShape {
    /// Short name used in worker signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandShape::Plain => "plain",
            CommandShape::Elevated => "sudo",
            CommandShape::Timed => "timed",
        }
    }

    /// The command line actually sent to the device.
    pub fn wrap(&self, command: &str) -> String {
        match self {
            CommandShape::Plain => command.to_string(),
            CommandShape::Elevated => format!("sudo -S -p '' {}", command),
            CommandShape::Timed => format!("time -p {}", command),
        }
    }
}

/// Runs one-shot commands on the target of a tunnel.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    tunnel: Arc<TunnelConnection>,
    timeout: Duration,
}

impl CommandExecutor {
    /// Create an executor with a 30 second command timeout.
    pub fn new(tunnel: Arc<TunnelConnection>) -> Self {
        Self {
            tunnel,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The tunnel commands run on.
    pub fn tunnel(&self) -> &Arc<TunnelConnection> {
        &self.tunnel
    }

    /// Run a plain command.
    pub async fn run(&self, command: &str) -> CommandResult {
        self.run_shaped(command, CommandShape::Plain).await
    }

    /// Run a command with elevated privileges.
    pub async fn sudo(&self, command: &str) -> CommandResult {
        self.run_shaped(command, CommandShape::Elevated).await
    }

    /// Run a command under `time -p`.
    pub async fn timed(&self, command: &str) -> CommandResult {
        self.run_shaped(command, CommandShape::Timed).await
    }

    /// Run a command in the given shape.
    pub async fn run_shaped(&self, command: &str, shape: CommandShape) -> CommandResult {
        if !self.tunnel.is_connected() {
            debug!("Not running {:?}: no connection to {}", command, self.tunnel.label());
            return CommandResult::failed(command, CommandError::NoConnection);
        }

        let wire = shape.wrap(command);
        let stdin = match shape {
            CommandShape::Elevated => {
                let secret = self.tunnel.chain().target().secret.expose_secret();
                Some(Bytes::from(format!("{}\n", secret)))
            }
            _ => None,
        };

        let start = Instant::now();
        let output = match self.tunnel.exec(&wire, stdin, self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Command {:?} on {} failed: {}", command, self.tunnel.label(), e);
                let failure = match e {
                    ConnectionError::NotConnected => CommandError::NoConnection,
                    ConnectionError::Timeout { timeout, .. } => CommandError::Timeout(timeout),
                    other => CommandError::Channel(other.to_string()),
                };
                let mut result = CommandResult::failed(command, failure);
                result.exec_time = start.elapsed();
                return result;
            }
        };
        let round_trip = start.elapsed();

        let parse_start = Instant::now();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let exec_time = if shape == CommandShape::Timed {
            let reported = parse_real_time(&stderr);
            stderr = strip_time_report(&stderr);
            reported.unwrap_or(round_trip)
        } else {
            round_trip
        };

        let exit_code = output
            .exit_status
            .map_or(-1, |status| i32::try_from(status).unwrap_or(i32::MAX));
        let failure = (exit_code != 0).then_some(CommandError::NonZeroExit { code: exit_code });

        if let Some(ref failure) = failure {
            debug!("{:?} on {}: {}", command, self.tunnel.label(), failure);
        }

        CommandResult {
            command: command.to_string(),
            stdout,
            stderr,
            exit_code,
            exec_time,
            send_time: output.send_time,
            read_time: output.read_time,
            parsed_time: parse_start.elapsed(),
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, connected_tunnel};

    #[tokio::test]
    async fn test_plain_command() {
        let connector = Arc::new(MockConnector::new());
        connector.exec().reply("rx_packets: 42\n", "", 0);
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);

        let result = executor.run("ethtool -S eth0").await;
        assert!(result.success());
        assert_eq!(result.stdout, "rx_packets: 42\n");
        assert_eq!(result.failure, None);
        assert_eq!(connector.exec().calls()[0], ("ethtool -S eth0".to_string(), None));
    }

    #[tokio::test]
    async fn test_sudo_pipes_secret() {
        let connector = Arc::new(MockConnector::new());
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);

        let result = executor.sudo("ethtool -m eth0").await;
        assert!(result.success());

        let (command, stdin) = connector.exec().calls().remove(0);
        assert_eq!(command, "sudo -S -p '' ethtool -m eth0");
        assert!(!command.contains("secret"));
        assert_eq!(stdin, Some(Bytes::from_static(b"secret\n")));
    }

    #[tokio::test]
    async fn test_timed_command_uses_reported_time() {
        let connector = Arc::new(MockConnector::new());
        connector
            .exec()
            .reply("42\n", "real 1.25\nuser 0.00\nsys 0.01\n", 0);
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);

        let result = executor.timed("cat /sys/class/net/eth0/carrier").await;
        assert_eq!(result.exec_time, Duration::from_millis(1250));
        assert_eq!(result.stderr, "");
        assert_eq!(result.command, "cat /sys/class/net/eth0/carrier");
        assert_eq!(
            connector.exec().calls()[0].0,
            "time -p cat /sys/class/net/eth0/carrier"
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_structured() {
        let connector = Arc::new(MockConnector::new());
        connector.exec().reply("", "No such device\n", 1);
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);

        let result = executor.run("ethtool eth9").await;
        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.failure, Some(CommandError::NonZeroExit { code: 1 }));
        assert_eq!(result.stderr, "No such device\n");
    }

    #[tokio::test]
    async fn test_no_connection_is_structured() {
        let connector = Arc::new(MockConnector::new());
        let tunnel = connected_tunnel(&connector).await;
        tunnel.disconnect().await;

        let result = CommandExecutor::new(tunnel).run("uptime").await;
        assert!(!result.success());
        assert_eq!(result.failure, Some(CommandError::NoConnection));
        assert!(connector.exec().calls().is_empty());
    }

    #[tokio::test]
    async fn test_channel_failure_is_structured() {
        let connector = Arc::new(MockConnector::new());
        connector.exec().fail("channel open refused");
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);

        let result = executor.run("uptime").await;
        assert!(matches!(result.failure, Some(CommandError::Channel(_))));
        assert_eq!(result.exit_code, -1);
    }

    #[test]
    fn test_shape_wrap() {
        assert_eq!(CommandShape::Plain.wrap("ls"), "ls");
        assert_eq!(CommandShape::Timed.wrap("ls"), "time -p ls");
    }
}
