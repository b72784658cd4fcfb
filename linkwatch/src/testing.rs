//! In-memory hops and shells for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ConnectionError, ShellError};
use crate::transport::{
    ExecOutput, HopConnector, HopSession, HopStream, Host, JumpChain, ShellChannel, TerminalSize,
    TunnelConfig, TunnelConnection,
};

/// `hops` hosts named `hop0..hopN`, the last one being the target.
pub(crate) fn chain_of(hops: usize) -> JumpChain {
    assert!(hops >= 1);
    let mut chain = JumpChain::direct(Host::new(format!("hop{}", hops - 1), "admin", "secret"));
    for i in 0..hops - 1 {
        chain = chain.with_jump(Host::new(format!("hop{}", i), "ops", "secret"));
    }
    chain
}

/// Connected single-hop tunnel backed by `connector`.
pub(crate) async fn connected_tunnel(connector: &Arc<MockConnector>) -> Arc<TunnelConnection> {
    let tunnel = Arc::new(TunnelConnection::with_connector(
        chain_of(1),
        TunnelConfig::default(),
        connector.clone(),
    ));
    assert!(tunnel.connect().await);
    tunnel
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum MockOutcome {
    Auth,
    Timeout,
}

/// Observable state of one mock hop.
#[derive(Debug, Default)]
pub(crate) struct MockHopState {
    closed: AtomicBool,
    dead: AtomicBool,
    keepalives: AtomicUsize,
}

impl MockHopState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate the transport dying underneath the tunnel.
    pub(crate) fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub(crate) fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }
}

/// Scripted exec replies; falls back to `ok` with status 0.
#[derive(Debug, Default)]
pub(crate) struct MockExec {
    replies: Mutex<VecDeque<Result<ExecOutput, String>>>,
    calls: Mutex<Vec<(String, Option<Bytes>)>>,
}

impl MockExec {
    pub(crate) fn reply(&self, stdout: &str, stderr: &str, status: u32) {
        self.replies.lock().unwrap().push_back(Ok(ExecOutput {
            stdout: Bytes::from(stdout.to_string()),
            stderr: Bytes::from(stderr.to_string()),
            exit_status: Some(status),
            ..Default::default()
        }));
    }

    pub(crate) fn fail(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub(crate) fn calls(&self) -> Vec<(String, Option<Bytes>)> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, command: &str, stdin: Option<Bytes>) -> Result<ExecOutput, String> {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), stdin));
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ExecOutput {
                stdout: Bytes::from_static(b"ok\n"),
                exit_status: Some(0),
                ..Default::default()
            })
        })
    }
}

/// Connector that hands out [`MockHop`]s and records every attempt.
#[derive(Default)]
pub(crate) struct MockConnector {
    fail_at: Option<(usize, MockOutcome)>,
    inactive_target: bool,
    attempts: Mutex<Vec<(String, bool)>>,
    sessions: Mutex<Vec<Arc<MockHopState>>>,
    exec: Arc<MockExec>,
    shells: Arc<Mutex<VecDeque<ScriptedShell>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the hop named `hop{index}`.
    pub(crate) fn fail_at(mut self, index: usize, outcome: MockOutcome) -> Self {
        self.fail_at = Some((index, outcome));
        self
    }

    /// Every hop reports an inactive transport.
    pub(crate) fn inactive_target(mut self) -> Self {
        self.inactive_target = true;
        self
    }

    /// Queue a shell handed out by the next `open_shell`.
    pub(crate) fn with_shell(self, shell: ScriptedShell) -> Self {
        self.shells.lock().unwrap().push_back(shell);
        self
    }

    pub(crate) fn push_shell(&self, shell: ScriptedShell) {
        self.shells.lock().unwrap().push_back(shell);
    }

    pub(crate) fn attempts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn tunneled(&self) -> Vec<bool> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, via)| *via)
            .collect()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<MockHopState>> {
        self.sessions.lock().unwrap().clone()
    }

    pub(crate) fn exec(&self) -> Arc<MockExec> {
        self.exec.clone()
    }
}

#[async_trait]
impl HopConnector for MockConnector {
    async fn connect(
        &self,
        host: &Host,
        via: Option<HopStream>,
    ) -> Result<Box<dyn HopSession>, ConnectionError> {
        let name = host.hostname().to_string();
        self.attempts
            .lock()
            .unwrap()
            .push((name.clone(), via.is_some()));

        if let Some((index, outcome)) = self.fail_at {
            if name == format!("hop{}", index) {
                return Err(match outcome {
                    MockOutcome::Auth => ConnectionError::AuthFailure {
                        user: host.username.clone(),
                        host: name,
                    },
                    MockOutcome::Timeout => ConnectionError::Timeout {
                        host: name,
                        timeout: Duration::from_secs(10),
                    },
                });
            }
        }

        let state = Arc::new(MockHopState::default());
        if self.inactive_target {
            state.kill();
        }
        self.sessions.lock().unwrap().push(state.clone());

        Ok(Box::new(MockHop {
            state,
            exec: self.exec.clone(),
            shells: self.shells.clone(),
        }))
    }
}

pub(crate) struct MockHop {
    state: Arc<MockHopState>,
    exec: Arc<MockExec>,
    shells: Arc<Mutex<VecDeque<ScriptedShell>>>,
}

#[async_trait]
impl HopSession for MockHop {
    fn is_active(&self) -> bool {
        !self.state.dead.load(Ordering::SeqCst) && !self.state.is_closed()
    }

    async fn open_tunnel(&self, _host: &Host) -> Result<HopStream, ConnectionError> {
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }

    async fn keepalive(&self) -> Result<(), ConnectionError> {
        self.state.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(
        &self,
        command: &str,
        stdin: Option<Bytes>,
        _timeout: Duration,
    ) -> Result<ExecOutput, ConnectionError> {
        self.exec
            .next(command, stdin)
            .map_err(|message| ConnectionError::ProtocolError {
                host: "mock".to_string(),
                message,
            })
    }

    async fn open_shell(
        &self,
        _size: TerminalSize,
    ) -> Result<Box<dyn ShellChannel>, ConnectionError> {
        match self.shells.lock().unwrap().pop_front() {
            Some(shell) => Ok(Box::new(shell)),
            None => Err(ConnectionError::ProtocolError {
                host: "mock".to_string(),
                message: "no shell scripted".to_string(),
            }),
        }
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Shell that replies to known commands with canned chunks.
///
/// Unknown commands are echoed followed by the default prompt, if one is
/// set. Reads with nothing queued never complete, unless [`hang_up`]
/// was set.
///
/// [`hang_up`]: ScriptedShell::hang_up
#[derive(Default)]
pub(crate) struct ScriptedShell {
    pending: VecDeque<Bytes>,
    rules: Vec<(String, Vec<Bytes>)>,
    default_prompt: Option<String>,
    hang_up: bool,
    written: Arc<Mutex<Vec<String>>>,
}

impl ScriptedShell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Output available before any command is sent.
    pub(crate) fn banner(mut self, text: &str) -> Self {
        self.pending.push_back(Bytes::from(text.to_string()));
        self
    }

    /// Reply to `command` with `chunks`, one read per chunk.
    pub(crate) fn on(mut self, command: &str, chunks: &[&str]) -> Self {
        self.rules.push((
            command.to_string(),
            chunks.iter().map(|c| Bytes::from(c.to_string())).collect(),
        ));
        self
    }

    pub(crate) fn default_prompt(mut self, prompt: &str) -> Self {
        self.default_prompt = Some(prompt.to_string());
        self
    }

    /// Report EOF once the queued output has been read.
    pub(crate) fn hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }

    /// Shared log of every command written to the shell.
    pub(crate) fn written(&self) -> Arc<Mutex<Vec<String>>> {
        self.written.clone()
    }
}

#[async_trait]
impl ShellChannel for ScriptedShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), ShellError> {
        let command = String::from_utf8_lossy(data).trim_end().to_string();
        self.written.lock().unwrap().push(command.clone());

        if let Some((_, chunks)) = self.rules.iter().find(|(c, _)| *c == command) {
            self.pending.extend(chunks.iter().cloned());
        } else if let Some(prompt) = &self.default_prompt {
            self.pending
                .push_back(Bytes::from(format!("{}\r\n{}", command, prompt)));
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Bytes>, ShellError> {
        match self.pending.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.hang_up => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}
