//! Multi-hop tunnel with keepalive and serialized command execution.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::config::{JumpChain, TunnelConfig};
use super::ssh::SshConnector;
use super::{ExecOutput, HopConnector, HopSession, ShellChannel, TerminalSize};
use crate::error::{ConnectionError, Result};

/// Lifecycle of a [`TunnelConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Chain of SSH sessions ending at one target device.
///
/// The chain is all-or-nothing: a failure at hop *i* closes hops `0..i`
/// and never attempts hop `i+1`. Connect attempts are serialized, and at
/// most one command runs on the target at a time.
pub struct TunnelConnection {
    chain: JumpChain,
    config: TunnelConfig,
    connector: Arc<dyn HopConnector>,
    state: Mutex<TunnelState>,
    hops: Mutex<Vec<Arc<dyn HopSession>>>,
    keepalive: Mutex<Option<CancellationToken>>,
    connect_lock: tokio::sync::Mutex<()>,
    exec_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("target", &self.chain.target().label())
            .field("jumps", &self.chain.jumps.len())
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelConnection {
    /// Create a tunnel that connects with russh.
    pub fn new(chain: JumpChain, config: TunnelConfig) -> Self {
        let connector = Arc::new(SshConnector::new(config.clone()));
        Self::with_connector(chain, config, connector)
    }

    /// Create a tunnel with a custom hop connector.
    pub fn with_connector(
        chain: JumpChain,
        config: TunnelConfig,
        connector: Arc<dyn HopConnector>,
    ) -> Self {
        Self {
            chain,
            config,
            connector,
            state: Mutex::new(TunnelState::Disconnected),
            hops: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The jump chain this tunnel walks.
    pub fn chain(&self) -> &JumpChain {
        &self.chain
    }

    /// Tunnel configuration.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Target label for logs (`user@host:port`).
    pub fn label(&self) -> String {
        self.chain.target().label()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TunnelState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(TunnelState::Failed)
    }

    fn set_state(&self, state: TunnelState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn target(&self) -> Option<Arc<dyn HopSession>> {
        self.hops.lock().ok().and_then(|hops| hops.last().cloned())
    }

    /// Connected and the target transport is still running.
    pub fn is_connected(&self) -> bool {
        self.state() == TunnelState::Connected
            && self.target().is_some_and(|target| target.is_active())
    }

    /// Connect the whole chain; `false` on any hop failure (already logged).
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                error!("Tunnel to {} failed: {}", self.label(), e);
                false
            }
        }
    }

    /// Connect the whole chain, reporting why it failed.
    ///
    /// A no-op returning `Ok` when already connected.
    pub async fn try_connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        if self.state() == TunnelState::Connected {
            return Ok(());
        }

        self.set_state(TunnelState::Connecting);
        info!(
            "Connecting to {} via {} jump host(s)",
            self.label(),
            self.chain.jumps.len()
        );

        let mut opened: Vec<Arc<dyn HopSession>> = Vec::with_capacity(self.chain.len());
        for (i, host) in self.chain.hops().enumerate() {
            debug!("Hop {}: connecting to {}", i, host.label());

            let attempt = match opened.last() {
                None => self.connector.connect(host, None).await,
                Some(previous) => match previous.open_tunnel(host).await {
                    Ok(stream) => self.connector.connect(host, Some(stream)).await,
                    Err(e) => Err(e),
                },
            };

            match attempt {
                Ok(hop) => opened.push(Arc::from(hop)),
                Err(e) => {
                    warn!("Hop {} ({}) failed: {}", i, host.label(), e);
                    close_all(&opened).await;
                    self.set_state(TunnelState::Failed);
                    return Err(e.into());
                }
            }
        }

        if !opened.last().is_some_and(|target| target.is_active()) {
            close_all(&opened).await;
            self.set_state(TunnelState::Failed);
            return Err(ConnectionError::TransportInactive { host: self.label() }.into());
        }

        if let Ok(mut hops) = self.hops.lock() {
            *hops = opened.clone();
        }
        self.set_state(TunnelState::Connected);
        self.start_keepalive(opened);

        info!("Tunnel to {} established", self.label());
        Ok(())
    }

    /// Tear the chain down, target first.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.stop_keepalive();

        let hops = self
            .hops
            .lock()
            .map(|mut hops| std::mem::take(&mut *hops))
            .unwrap_or_default();

        if !hops.is_empty() {
            info!("Disconnecting tunnel to {}", self.label());
            close_all(&hops).await;
        }
        self.set_state(TunnelState::Disconnected);
    }

    /// Rebuild the chain if it is unhealthy; one connect attempt.
    ///
    /// A healthy tunnel is left untouched and reported as connected.
    pub async fn reconnect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        warn!("Reconnecting tunnel to {}", self.label());
        self.disconnect().await;
        self.connect().await
    }

    /// Stop the keepalive task without closing the chain.
    pub fn stop_keepalive(&self) {
        if let Some(token) = self.keepalive.lock().ok().and_then(|mut k| k.take()) {
            token.cancel();
        }
    }

    fn start_keepalive(&self, hops: Vec<Arc<dyn HopSession>>) {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let interval = self.config.keepalive_interval;
        let label = self.label();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Keepalive for {} stopped", label);
                        break;
                    }
                    _ = ticker.tick() => {
                        let mut active = 0usize;
                        for hop in &hops {
                            if let Err(e) = hop.keepalive().await {
                                debug!("Keepalive on {} failed: {}", label, e);
                            }
                            if hop.is_active() {
                                active += 1;
                            }
                        }
                        if active == 0 {
                            warn!("No active transports left for {}; reconnect needed", label);
                        }
                    }
                }
            }
        });
    }

    /// Run one command on the target.
    ///
    /// Serialized per connection. Fails with `NotConnected` when the chain
    /// is down.
    pub async fn exec(
        &self,
        command: &str,
        stdin: Option<Bytes>,
        timeout: Duration,
    ) -> std::result::Result<ExecOutput, ConnectionError> {
        let _guard = self.exec_lock.lock().await;

        let target = match self.target() {
            Some(target) if self.state() == TunnelState::Connected => target,
            _ => return Err(ConnectionError::NotConnected),
        };

        let start = Instant::now();
        let output = target.exec(command, stdin, timeout).await?;
        debug!(
            "exec on {} took {:?}: {:?}",
            self.label(),
            start.elapsed(),
            command
        );
        Ok(output)
    }

    /// Open an interactive PTY shell on the target.
    pub async fn open_shell(&self) -> std::result::Result<Box<dyn ShellChannel>, ConnectionError> {
        let target = match self.target() {
            Some(target) if self.is_connected() => target,
            _ => return Err(ConnectionError::NotConnected),
        };

        target
            .open_shell(TerminalSize {
                width: self.config.terminal_width,
                height: self.config.terminal_height,
            })
            .await
    }
}

async fn close_all(hops: &[Arc<dyn HopSession>]) {
    for hop in hops.iter().rev() {
        hop.close().await;
    }
}
