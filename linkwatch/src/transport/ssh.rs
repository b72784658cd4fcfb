//! russh implementation of the hop traits.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg};
use secrecy::ExposeSecret;

use super::config::{AuthMethod, Host, HostKeyVerification, TunnelConfig};
use super::{ExecOutput, HopConnector, HopSession, HopStream, ShellChannel, TerminalSize};
use crate::error::{ConnectionError, ShellError};

/// Opens hops with russh, directly over TCP or SSH-over-SSH through a
/// forwarded `direct-tcpip` stream.
#[derive(Debug, Clone)]
pub struct SshConnector {
    config: TunnelConfig,
}

impl SshConnector {
    /// Create a connector using the timeouts and host key policy in `config`.
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    async fn authenticate(
        session: &mut Handle<SshHandler>,
        host: &Host,
    ) -> Result<(), ConnectionError> {
        let success = match host.auth_method() {
            AuthMethod::Password(secret) => session
                .authenticate_password(&host.username, secret.expose_secret())
                .await?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.map(|p| p.expose_secret()))
                    .map_err(|e| ConnectionError::Key(e.to_string()))?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = session.best_supported_rsa_hash().await?.flatten();

                session
                    .authenticate_publickey(
                        &host.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await?
                    .success()
            }
        };

        if !success {
            return Err(ConnectionError::AuthFailure {
                user: host.username.clone(),
                host: host.hostname().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl HopConnector for SshConnector {
    async fn connect(
        &self,
        host: &Host,
        via: Option<HopStream>,
    ) -> Result<Box<dyn HopSession>, ConnectionError> {
        // Liveness is handled by the tunnel's own keepalive task.
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<ConnectionError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: host.hostname().to_string(),
            port: host.port(),
            host_key_verification: self.config.host_key_verification.clone(),
            known_hosts_path: self.config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        let tunneled = via.is_some();
        let handshake = async {
            match via {
                Some(stream) => client::connect_stream(ssh_config, stream, handler).await,
                None => client::connect(ssh_config, (host.hostname(), host.port()), handler).await,
            }
        };

        let mut session = tokio::time::timeout(self.config.timeout, handshake)
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: host.label(),
                timeout: self.config.timeout,
            })?
            .map_err(|e| {
                // Prefer the detailed host key error over russh's generic UnknownKey
                let detailed = host_key_error.lock().ok().and_then(|mut slot| slot.take());
                detailed.unwrap_or_else(|| ConnectionError::ProtocolError {
                    host: host.label(),
                    message: e.to_string(),
                })
            })?;

        debug!(
            "SSH handshake with {} completed ({})",
            host.label(),
            if tunneled { "tunneled" } else { "direct" }
        );

        tokio::time::timeout(self.config.timeout, Self::authenticate(&mut session, host))
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: host.label(),
                timeout: self.config.timeout,
            })??;

        info!("Authenticated to {}", host.label());

        Ok(Box::new(SshHop {
            label: host.label(),
            session,
        }))
    }
}

/// One authenticated russh session.
struct SshHop {
    label: String,
    session: Handle<SshHandler>,
}

impl SshHop {
    fn protocol_error(&self, e: impl ToString) -> ConnectionError {
        ConnectionError::ProtocolError {
            host: self.label.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl HopSession for SshHop {
    fn is_active(&self) -> bool {
        !self.session.is_closed()
    }

    async fn open_tunnel(&self, host: &Host) -> Result<HopStream, ConnectionError> {
        debug!("{}: opening tunnel to {}", self.label, host.label());
        let channel = self
            .session
            .channel_open_direct_tcpip(host.hostname(), u32::from(host.port()), "127.0.0.1", 0)
            .await
            .map_err(|e| self.protocol_error(e))?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn keepalive(&self) -> Result<(), ConnectionError> {
        self.session
            .send_keepalive(false)
            .await
            .map_err(|e| self.protocol_error(e))
    }

    async fn exec(
        &self,
        command: &str,
        stdin: Option<Bytes>,
        timeout: Duration,
    ) -> Result<ExecOutput, ConnectionError> {
        let start = Instant::now();

        let run = async {
            let mut channel = self.session.channel_open_session().await?;
            channel.exec(true, command).await?;
            if let Some(input) = stdin {
                channel.data(&input[..]).await?;
                channel.eof().await?;
            }
            let send_time = start.elapsed();

            let mut stdout = BytesMut::new();
            let mut stderr = BytesMut::new();
            let mut exit_status = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    // ext 1 is SSH_EXTENDED_DATA_STDERR
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            Ok::<_, russh::Error>(ExecOutput {
                stdout: stdout.freeze(),
                stderr: stderr.freeze(),
                exit_status,
                send_time,
                read_time: start.elapsed().saturating_sub(send_time),
            })
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: self.label.clone(),
                timeout,
            })?
            .map_err(|e| self.protocol_error(e))
    }

    async fn open_shell(
        &self,
        size: TerminalSize,
    ) -> Result<Box<dyn ShellChannel>, ConnectionError> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| self.protocol_error(e))?;

        channel
            .request_pty(true, "xterm", size.width, size.height, 0, 0, &[])
            .await
            .map_err(|e| self.protocol_error(e))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| self.protocol_error(e))?;

        Ok(Box::new(SshShell { channel }))
    }

    async fn close(&self) {
        if let Err(e) = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("{}: disconnect error ignored: {}", self.label, e);
        }
    }
}

/// PTY shell channel.
struct SshShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), ShellError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ShellError::Channel(e.to_string()))
    }

    async fn read(&mut self) -> Result<Option<Bytes>, ShellError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => {
                    return Ok(Some(Bytes::copy_from_slice(data)));
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    return Ok(Some(Bytes::copy_from_slice(data)));
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!("shell channel close error ignored: {}", e);
        }
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<ConnectionError>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found,
    /// `Err(ConnectionError::HostKeyChanged)` if key changed.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> Result<bool, ConnectionError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(ConnectionError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(ConnectionError::KnownHosts(e.to_string())),
        }
    }

    /// Save a new host key to known_hosts.
    fn learn_host_key(&self, pubkey: &PublicKey) -> Result<(), ConnectionError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey)
        };

        result.map_err(|e| ConnectionError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: ConnectionError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.host_key_verification {
            HostKeyVerification::Disabled => Ok(true),

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key for {}: {}", self.host, e);
                    }
                    Ok(true)
                }
                Err(e) => Ok(self.reject(e)),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(ConnectionError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                })),
                Err(e) => Ok(self.reject(e)),
            },
        }
    }
}
