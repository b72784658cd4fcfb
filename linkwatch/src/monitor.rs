//! Process-level owner of everything that runs in the background.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::channel::SharedShell;
use crate::sampling::WorkerPool;
use crate::scan::ScanOrchestrator;
use crate::transport::TunnelConnection;

/// Collects scan orchestrators, the worker pool, shells and tunnels so
/// they can be torn down in order.
///
/// Shutdown order:
/// 1. scan loops
/// 2. sampling workers (bounded join)
/// 3. keepalive tasks
/// 4. shells
/// 5. tunnels
pub struct Monitor {
    scans: Vec<Arc<ScanOrchestrator>>,
    pool: Arc<WorkerPool>,
    shells: Vec<SharedShell>,
    tunnels: Vec<Arc<TunnelConnection>>,
    shell_lock_timeout: Duration,
}

impl Monitor {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            scans: Vec::new(),
            pool,
            shells: Vec::new(),
            tunnels: Vec::new(),
            shell_lock_timeout: Duration::from_secs(5),
        }
    }

    /// How long shutdown waits for a busy shell before leaving it open.
    pub fn with_shell_lock_timeout(mut self, timeout: Duration) -> Self {
        self.shell_lock_timeout = timeout;
        self
    }

    pub fn add_scan(&mut self, scan: Arc<ScanOrchestrator>) {
        self.scans.push(scan);
    }

    pub fn add_shell(&mut self, shell: SharedShell) {
        if !self.shells.iter().any(|s| Arc::ptr_eq(s, &shell)) {
            self.shells.push(shell);
        }
    }

    pub fn add_tunnel(&mut self, tunnel: Arc<TunnelConnection>) {
        if !self.tunnels.iter().any(|t| Arc::ptr_eq(t, &tunnel)) {
            self.tunnels.push(tunnel);
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scans(&self) -> &[Arc<ScanOrchestrator>] {
        &self.scans
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down");

        for scan in &self.scans {
            scan.stop().await;
        }

        let exits = self.pool.stop_all().await;
        let stuck = exits.iter().filter(|(_, exit)| exit.is_none()).count();
        if stuck > 0 {
            warn!("{} worker(s) still busy at shutdown", stuck);
        }

        for tunnel in &self.tunnels {
            tunnel.stop_keepalive();
        }

        for shell in &self.shells {
            match tokio::time::timeout(self.shell_lock_timeout, shell.lock()).await {
                Ok(mut shell) => shell.close().await,
                Err(_) => warn!("Shell still in use after {:?}; not closing it", self.shell_lock_timeout),
            }
        }

        for tunnel in &self.tunnels {
            tunnel.disconnect().await;
        }
        info!("Shutdown complete");
    }

    /// Wait for Ctrl-C, then shut down.
    pub async fn run_until_signal(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Interrupt received");
        self.shutdown().await;
        Ok(())
    }
}
