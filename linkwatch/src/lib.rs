//! # Linkwatch
//!
//! Async SSH polling engine for network link diagnostics.
//!
//! Linkwatch reaches switches and hosts through chains of SSH jump hosts,
//! polls metric commands on an interval, drives vendor diagnostic shells
//! and keeps log files that rotate while a link is flapping.
//!
//! ## Features
//!
//! - Multi-hop SSH tunnels via russh, with keepalive and reconnect
//! - Interactive shells with regex, prompt-like and inactivity prompt detection
//! - Sampling workers with bounded, lossy sample queues
//! - Flap-aware log rotation
//! - Vendor scan workflows (port mapping, port toggling, eye scan, DSC)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use linkwatch::exec::CommandExecutor;
//! use linkwatch::sampling::{CommandSource, SamplingWorker, WorkerConfig, WorkerPool};
//! use linkwatch::transport::{Host, JumpChain, TunnelConfig, TunnelConnection};
//!
//! #[tokio::main]
//! async fn main() {
//!     let chain = JumpChain::direct(Host::new("10.0.0.7", "admin", "secret"))
//!         .with_jump(Host::new("bastion.lab", "ops", "secret"));
//!     let tunnel = Arc::new(TunnelConnection::new(chain, TunnelConfig::default()));
//!     if !tunnel.connect().await {
//!         return;
//!     }
//!
//!     let pool = WorkerPool::new();
//!     let queue = pool.add(SamplingWorker::new(
//!         "ethtool -S eth0",
//!         CommandSource::exec(CommandExecutor::new(tunnel.clone())),
//!         WorkerConfig::default(),
//!     ));
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     for sample in queue.drain() {
//!         println!("{}", sample.to_log_line());
//!     }
//!     pool.stop_all().await;
//!     tunnel.disconnect().await;
//! }
//! ```

pub mod channel;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod profile;
pub mod rotation;
pub mod sampling;
pub mod scan;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use channel::{SharedShell, ShellConfig, ShellSession};
pub use error::{Error, Result};
pub use exec::{CommandExecutor, CommandResult, CommandShape};
pub use monitor::Monitor;
pub use profile::DeviceProfile;
pub use rotation::{FlapCoordinator, LogStream, RotationRegistry};
pub use sampling::{Parser, Sample, SampleQueue, SamplingWorker, WorkerPool};
pub use scan::{ScanOrchestrator, ScanSpec, TogglePolicy};
pub use transport::{Host, JumpChain, TunnelConfig, TunnelConnection};
