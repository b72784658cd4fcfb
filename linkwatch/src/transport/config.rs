//! Hosts, jump chains and tunnel configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    #[default]
    AcceptNew,

    /// Accept all keys without checking. Lab use only.
    Disabled,
}

/// One SSH endpoint: a jump host or the target device.
///
/// `address` is `host` or `host:port` (`[v6addr]:port` for IPv6). The secret
/// is the login password, or the key passphrase when `key_path` is set, and
/// doubles as the sudo credential for elevated commands.
#[derive(Clone, Deserialize)]
pub struct Host {
    pub address: String,
    pub username: String,
    #[serde(deserialize_with = "deserialize_secret", default = "empty_secret")]
    pub secret: SecretString,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// Borrowed view of how a [`Host`] authenticates.
#[derive(Debug, Clone, Copy)]
pub enum AuthMethod<'a> {
    /// Password authentication.
    Password(&'a SecretString),

    /// Private key authentication.
    PrivateKey {
        path: &'a Path,
        passphrase: Option<&'a SecretString>,
    },
}

impl Host {
    /// Create a host that authenticates with a password.
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            secret: SecretString::from(secret.into()),
            key_path: None,
        }
    }

    /// Authenticate with a private key instead; the secret becomes its passphrase.
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Hostname part of the address.
    pub fn hostname(&self) -> &str {
        split_address(&self.address).0
    }

    /// Port part of the address (default: 22).
    pub fn port(&self) -> u16 {
        split_address(&self.address).1
    }

    /// `user@host:port`, safe for logs.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname(), self.port())
    }

    /// How this host authenticates.
    pub fn auth_method(&self) -> AuthMethod<'_> {
        match &self.key_path {
            Some(path) => AuthMethod::PrivateKey {
                path: path.as_path(),
                passphrase: self.has_secret().then_some(&self.secret),
            },
            None => AuthMethod::Password(&self.secret),
        }
    }

    /// Whether a non-empty secret was configured.
    pub fn has_secret(&self) -> bool {
        !self.secret.expose_secret().is_empty()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("key_path", &self.key_path)
            .finish()
    }
}

fn split_address(address: &str) -> (&str, u16) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(22);
            return (host, port);
        }
    }

    match address.rsplit_once(':') {
        // A bare IPv6 address has several colons and no port.
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (address, 22),
        },
        _ => (address, 22),
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

/// Ordered jump hosts followed by one target.
///
/// Hops are connected strictly left to right; see
/// [`TunnelConnection`](super::TunnelConnection).
#[derive(Debug, Clone, Deserialize)]
pub struct JumpChain {
    #[serde(default)]
    pub jumps: Vec<Host>,
    pub target: Host,
}

impl JumpChain {
    /// A chain that reaches the target directly.
    pub fn direct(target: Host) -> Self {
        Self {
            jumps: Vec::new(),
            target,
        }
    }

    /// Append a jump host (before the target).
    pub fn with_jump(mut self, host: Host) -> Self {
        self.jumps.push(host);
        self
    }

    /// All hops in connection order, target last.
    pub fn hops(&self) -> impl Iterator<Item = &Host> {
        self.jumps.iter().chain(std::iter::once(&self.target))
    }

    /// Number of hops including the target.
    pub fn len(&self) -> usize {
        self.jumps.len() + 1
    }

    /// Always false: a chain has at least its target.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The final hop.
    pub fn target(&self) -> &Host {
        &self.target
    }
}

/// Tunnel connection configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Per-hop connect and authentication timeout.
    pub timeout: Duration,

    /// How often the keepalive task pings every hop.
    pub keepalive_interval: Duration,

    /// Terminal width for interactive shells.
    pub terminal_width: u32,

    /// Terminal height for interactive shells.
    pub terminal_height: u32,

    /// Host key verification mode (applies to every hop).
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file (default: ~/.ssh/known_hosts).
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            terminal_width: 511,
            terminal_height: 24,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
        }
    }
}

impl TunnelConfig {
    /// Set the per-hop timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the host key verification mode.
    pub fn with_host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }
}
