//! SSH transport layer.
//!
//! A [`TunnelConnection`] walks a [`JumpChain`] hop by hop. Each hop is
//! opened by a [`HopConnector`] and represented by a [`HopSession`]; the
//! next hop is reached over a forwarded stream opened on the previous one.
//! [`SshConnector`] is the russh implementation of these traits.

pub mod config;
mod ssh;
mod tunnel;

pub use config::{AuthMethod, Host, HostKeyVerification, JumpChain, TunnelConfig};
pub use ssh::SshConnector;
pub use tunnel::{TunnelConnection, TunnelState};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ConnectionError, ShellError};

/// Byte stream that carries the SSH session of the next hop.
pub trait HopIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> HopIo for T {}

/// Boxed forwarded stream handed from one hop to the next.
pub type HopStream = Box<dyn HopIo>;

/// Raw outcome of a remote exec request.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Bytes,
    pub stderr: Bytes,
    /// Remote exit status, if the server reported one.
    pub exit_status: Option<u32>,
    /// Time until the exec request was accepted.
    pub send_time: Duration,
    /// Time spent draining output after the request was accepted.
    pub read_time: Duration,
}

/// Terminal geometry requested for interactive shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u32,
    pub height: u32,
}

/// Opens and authenticates one hop of a jump chain.
#[async_trait]
pub trait HopConnector: Send + Sync {
    /// Connect to `host`, over `via` when it is not the first hop.
    async fn connect(
        &self,
        host: &Host,
        via: Option<HopStream>,
    ) -> Result<Box<dyn HopSession>, ConnectionError>;
}

/// One authenticated SSH session in a chain.
#[async_trait]
pub trait HopSession: Send + Sync {
    /// Whether the underlying transport is still running.
    fn is_active(&self) -> bool;

    /// Open a forwarded stream from this hop to `host`.
    async fn open_tunnel(&self, host: &Host) -> Result<HopStream, ConnectionError>;

    /// Send a no-op keepalive packet.
    async fn keepalive(&self) -> Result<(), ConnectionError>;

    /// Run one command, feeding `stdin` if given.
    async fn exec(
        &self,
        command: &str,
        stdin: Option<Bytes>,
        timeout: Duration,
    ) -> Result<ExecOutput, ConnectionError>;

    /// Open an interactive PTY shell.
    async fn open_shell(&self, size: TerminalSize)
    -> Result<Box<dyn ShellChannel>, ConnectionError>;

    /// Disconnect this hop.
    async fn close(&self);
}

/// Raw interactive channel underneath a [`ShellSession`](crate::channel::ShellSession).
#[async_trait]
pub trait ShellChannel: Send {
    /// Write bytes to the remote terminal.
    async fn write(&mut self, data: &[u8]) -> Result<(), ShellError>;

    /// Wait for the next chunk of output; `None` once the channel has closed.
    ///
    /// Must be cancel-safe: callers race it against a poll timer.
    async fn read(&mut self) -> Result<Option<Bytes>, ShellError>;

    /// Close the channel.
    async fn close(&mut self);
}
