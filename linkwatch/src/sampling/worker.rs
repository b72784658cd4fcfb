//! Polling loop for one metric command.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::queue::SampleQueue;
use super::sample::{Parser, Sample, raw_payload};
use crate::channel::SharedShell;
use crate::error::WorkerError;
use crate::exec::{CommandExecutor, CommandShape};
use crate::rotation::{SharedLogStream, append_line};
use crate::transport::TunnelConnection;

/// Where a worker's command runs.
#[derive(Clone)]
pub enum CommandSource {
    /// One-shot exec requests.
    Exec {
        executor: CommandExecutor,
        shape: CommandShape,
    },
    /// The interactive shell, for CLIs without an exec mode.
    Shell {
        shell: SharedShell,
        tunnel: Arc<TunnelConnection>,
    },
}

impl CommandSource {
    /// Plain exec requests.
    pub fn exec(executor: CommandExecutor) -> Self {
        Self::shaped(executor, CommandShape::Plain)
    }

    /// Exec requests wrapped in `shape`.
    pub fn shaped(executor: CommandExecutor, shape: CommandShape) -> Self {
        Self::Exec { executor, shape }
    }

    /// Commands sent through a shared shell.
    pub async fn shell(shell: SharedShell) -> Self {
        let tunnel = shell.lock().await.tunnel().clone();
        Self::Shell { shell, tunnel }
    }

    pub fn tunnel(&self) -> &Arc<TunnelConnection> {
        match self {
            Self::Exec { executor, .. } => executor.tunnel(),
            Self::Shell { tunnel, .. } => tunnel,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Shell { .. } => "shell",
        }
    }

    fn shape(&self) -> CommandShape {
        match self {
            Self::Exec { shape, .. } => *shape,
            Self::Shell { .. } => CommandShape::Plain,
        }
    }
}

/// Lifecycle of a [`SamplingWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, never started.
    Idle,
    /// Task spawned, first collection not yet begun.
    Running,
    Collecting,
    Sleeping,
    /// Cancelled and exited.
    Stopped,
    /// Gave up after too many consecutive failures.
    Failed,
}

/// How a worker task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Fatal(WorkerError),
}

/// Polling parameters for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Time between the starts of two collections.
    pub interval: Duration,
    /// Queue capacity; older samples are evicted beyond it.
    pub max_samples: usize,
    /// Consecutive failures tolerated before the worker gives up.
    pub max_reconnect: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_samples: 100,
            max_reconnect: 10,
        }
    }
}

impl WorkerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn with_max_reconnect(mut self, max_reconnect: u32) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }
}

#[derive(Debug)]
struct WorkerStatus {
    state: Mutex<WorkerState>,
    reconnect_count: AtomicU32,
    attempts: AtomicU64,
    /// Set while a polling task exists, whether or not anyone holds its handle.
    alive: AtomicBool,
}

/// Clears `alive` when the polling task ends, including by panic.
struct AliveGuard(Arc<WorkerStatus>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

impl WorkerStatus {
    fn state(&self) -> WorkerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(WorkerState::Failed)
    }

    fn set_state(&self, state: WorkerState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }
}

/// Everything the polling task needs, cloned out of the worker on start.
struct WorkerCore {
    source_id: String,
    command: String,
    source: CommandSource,
    parser: Option<Arc<dyn Parser>>,
    config: WorkerConfig,
    queue: SampleQueue,
    log: Option<SharedLogStream>,
    status: Arc<WorkerStatus>,
}

/// Polls one command on an interval and queues the parsed samples.
///
/// Each failed collection counts towards `max_reconnect` and triggers one
/// reconnect attempt; any successful collection resets the count. Past
/// the limit the worker stops for good. Cancellation is checked before
/// each collection and during the sleep, never in the middle of a command.
pub struct SamplingWorker {
    source_id: String,
    command: String,
    source: CommandSource,
    parser: Option<Arc<dyn Parser>>,
    config: WorkerConfig,
    queue: SampleQueue,
    log: Option<SharedLogStream>,
    status: Arc<WorkerStatus>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<WorkerExit>>,
}

impl fmt::Debug for SamplingWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingWorker")
            .field("source_id", &self.source_id)
            .field("command", &self.command)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl SamplingWorker {
    /// Create an idle worker for `command`.
    pub fn new(command: impl Into<String>, source: CommandSource, config: WorkerConfig) -> Self {
        let command = command.into();
        Self {
            source_id: signature(&source, &command),
            queue: SampleQueue::new(config.max_samples),
            command,
            source,
            parser: None,
            config,
            log: None,
            status: Arc::new(WorkerStatus {
                state: Mutex::new(WorkerState::Idle),
                reconnect_count: AtomicU32::new(0),
                attempts: AtomicU64::new(0),
                alive: AtomicBool::new(false),
            }),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Parse output with `parser`; without one the raw text is the payload.
    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Also write every sample to `log`.
    pub fn with_log(mut self, log: SharedLogStream) -> Self {
        self.log = Some(log);
        self
    }

    /// Name samples with `source_id` instead of the signature.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    /// Identity used by the pool to deduplicate workers.
    pub fn signature(&self) -> String {
        signature(&self.source, &self.command)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Handle to this worker's samples.
    pub fn queue(&self) -> SampleQueue {
        self.queue.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.status.state()
    }

    /// Consecutive failed collections.
    pub fn reconnect_count(&self) -> u32 {
        self.status.reconnect_count.load(Ordering::SeqCst)
    }

    /// Collections started since creation.
    pub fn attempts(&self) -> u64 {
        self.status.attempts.load(Ordering::SeqCst)
    }

    /// Whether the polling task is alive, even if its handle was taken.
    pub fn is_running(&self) -> bool {
        self.status.alive.load(Ordering::SeqCst)
    }

    /// Spawn the polling task.
    ///
    /// A no-op while a previous task is still alive, including one that was
    /// stopped but has not finished its command yet, and after the worker
    /// has failed for good.
    pub fn start(&mut self) {
        if self.state() == WorkerState::Failed {
            warn!("Worker {} failed permanently; not restarting", self.source_id);
            return;
        }
        if self.status.alive.swap(true, Ordering::SeqCst) {
            debug!("Worker {} already running", self.source_id);
            return;
        }

        self.cancel = CancellationToken::new();
        self.status.reconnect_count.store(0, Ordering::SeqCst);
        self.status.set_state(WorkerState::Running);

        let core = Arc::new(WorkerCore {
            source_id: self.source_id.clone(),
            command: self.command.clone(),
            source: self.source.clone(),
            parser: self.parser.clone(),
            config: self.config,
            queue: self.queue.clone(),
            log: self.log.clone(),
            status: self.status.clone(),
        });
        let alive = AliveGuard(self.status.clone());
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            let _alive = alive;
            run(core, cancel).await
        }));
    }

    /// Ask the polling task to stop. Returns immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Hand out the task handle for joining.
    pub fn take_handle(&mut self) -> Option<JoinHandle<WorkerExit>> {
        self.handle.take()
    }

    /// Stop and wait up to `timeout` for the task to exit.
    pub async fn shutdown(&mut self, timeout: Duration) -> Option<WorkerExit> {
        self.stop();
        let handle = self.take_handle()?;
        join(&self.source_id, handle, timeout).await
    }
}

/// Wait up to `timeout` for a worker task. A task that overruns is left
/// running.
pub async fn join(
    source_id: &str,
    handle: JoinHandle<WorkerExit>,
    timeout: Duration,
) -> Option<WorkerExit> {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(e)) => {
            error!("Worker {} panicked: {}", source_id, e);
            None
        }
        Err(_) => {
            warn!(
                "Worker {} did not stop within {:?}; leaving it to finish its command",
                source_id, timeout
            );
            None
        }
    }
}

fn signature(source: &CommandSource, command: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        source.tunnel().label(),
        source.kind(),
        source.shape().as_str(),
        command
    )
}

async fn run(core: Arc<WorkerCore>, cancel: CancellationToken) -> WorkerExit {
    info!("Worker {} started ({:?})", core.source_id, core.command);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        core.status.set_state(WorkerState::Collecting);
        core.status.attempts.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        match core.collect().await {
            Ok(Some(sample)) => {
                core.record(sample).await;
                core.status.reconnect_count.store(0, Ordering::SeqCst);
            }
            // Output arrived but did not parse; the transport is fine.
            Ok(None) => {}
            Err(reason) => {
                let failures = core.status.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Worker {} collection failed ({}/{}): {}",
                    core.source_id, failures, core.config.max_reconnect, reason
                );

                if failures > core.config.max_reconnect {
                    let fatal = WorkerError::ReconnectLimitExceeded {
                        source_id: core.source_id.clone(),
                        limit: core.config.max_reconnect,
                    };
                    error!("{}; worker stopped permanently", fatal);
                    core.status.set_state(WorkerState::Failed);
                    return WorkerExit::Fatal(fatal);
                }

                core.reconnect().await;
            }
        }

        core.status.set_state(WorkerState::Sleeping);
        let pause = core.config.interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    info!("Worker {} stopped", core.source_id);
    core.status.set_state(WorkerState::Stopped);
    WorkerExit::Stopped
}

impl WorkerCore {
    /// `Ok(None)` when the command ran but its output did not parse.
    async fn collect(&self) -> Result<Option<Sample>, String> {
        let mut sample_meta = Vec::new();

        let raw = match &self.source {
            CommandSource::Exec { executor, shape } => {
                let result = executor.run_shaped(&self.command, *shape).await;
                if !result.success() {
                    return Err(match result.failure {
                        Some(failure) => failure.to_string(),
                        None => format!("exit code {}", result.exit_code),
                    });
                }
                sample_meta.push((
                    "exec_time_ms",
                    result.exec_time.as_millis().to_string(),
                ));
                result.stdout
            }
            CommandSource::Shell { shell, .. } => {
                let mut shell = shell.lock().await;
                if !shell.is_open() {
                    return Err("shell is closed".to_string());
                }
                let started = Instant::now();
                let output = shell
                    .send(&self.command, true)
                    .await
                    .map_err(|e| e.to_string())?;
                sample_meta.push(("exec_time_ms", started.elapsed().as_millis().to_string()));
                output
            }
        };

        let payload = match &self.parser {
            Some(parser) => match parser.parse_from(&self.source_id, &raw) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Worker {}: skipping unparseable output: {}", self.source_id, e);
                    return Ok(None);
                }
            },
            None => raw_payload(&raw),
        };

        let mut sample = Sample::new(self.source_id.clone(), payload)
            .with_metadata("command", self.command.clone())
            .with_metadata("host", self.source.tunnel().label());
        for (key, value) in sample_meta {
            sample = sample.with_metadata(key, value);
        }
        Ok(Some(sample))
    }

    async fn record(&self, sample: Sample) {
        if let Some(log) = &self.log {
            if let Err(e) = append_line(log, sample.to_log_line()).await {
                warn!("Worker {}: {}", self.source_id, e);
            }
        }

        if self.queue.push(sample).is_some() {
            debug!("Worker {}: queue full, evicted oldest sample", self.source_id);
        }
    }

    /// One reconnect attempt; reopens the shell if the tunnel was rebuilt.
    async fn reconnect(&self) {
        let tunnel = self.source.tunnel();
        let was_healthy = tunnel.is_connected();
        if !tunnel.reconnect().await {
            warn!("Worker {}: reconnect to {} failed", self.source_id, tunnel.label());
            return;
        }

        if let CommandSource::Shell { shell, .. } = &self.source {
            let mut shell = shell.lock().await;
            if !was_healthy || !shell.is_open() {
                shell.close().await;
                if !shell.open().await {
                    warn!("Worker {}: shell reopen failed", self.source_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ShellConfig, ShellSession};
    use crate::error::ParseError;
    use crate::sampling::KeyValueParser;
    use crate::testing::{MockConnector, ScriptedShell, connected_tunnel};
    use serde_json::{Value, json};

    fn counting_parser() -> Arc<dyn Parser> {
        let counter = Arc::new(AtomicU32::new(0));
        Arc::new(move |_raw: &str| -> Result<Value, ParseError> {
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1))
        })
    }

    async fn exec_worker(connector: &Arc<MockConnector>, config: WorkerConfig) -> SamplingWorker {
        let executor = CommandExecutor::new(connected_tunnel(connector).await);
        SamplingWorker::new("ethtool -S eth0", CommandSource::exec(executor), config)
    }

    fn every_second() -> WorkerConfig {
        WorkerConfig::default().with_interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_keeps_last_samples() {
        let connector = Arc::new(MockConnector::new());
        let mut worker = exec_worker(&connector, every_second().with_max_samples(3))
            .await
            .with_parser(counting_parser());

        worker.start();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(worker.shutdown(Duration::from_secs(5)).await, Some(WorkerExit::Stopped));

        assert_eq!(worker.attempts(), 5);
        let payloads: Vec<_> = worker.queue().drain().into_iter().map(|s| s.payload).collect();
        assert_eq!(payloads, vec![json!(3), json!(4), json!(5)]);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_reconnect_count() {
        let connector = Arc::new(MockConnector::new());
        for _ in 0..3 {
            connector.exec().fail("channel refused");
        }
        let mut worker = exec_worker(&connector, every_second()).await;

        worker.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(worker.reconnect_count(), 3);
        assert!(worker.queue().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(worker.reconnect_count(), 0);
        assert_eq!(worker.queue().len(), 1);

        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_reconnect() {
        let connector = Arc::new(MockConnector::new());
        for _ in 0..20 {
            connector.exec().reply("", "ethtool: no such device", 1);
        }
        let mut worker = exec_worker(&connector, every_second()).await;

        worker.start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(worker.state(), WorkerState::Failed);
        assert!(!worker.is_running());
        assert_eq!(worker.attempts(), 11);
        assert_eq!(connector.exec().calls().len(), 11);

        let exit = worker.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(
            exit,
            Some(WorkerExit::Fatal(WorkerError::ReconnectLimitExceeded { limit: 10, .. }))
        ));

        worker.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!worker.is_running());
        assert_eq!(connector.exec().calls().len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_while_handle_taken() {
        let connector = Arc::new(MockConnector::new());
        let mut worker = exec_worker(&connector, every_second()).await;

        worker.start();
        let handle = worker.take_handle().unwrap();
        assert!(worker.is_running());
        worker.start();
        assert!(worker.take_handle().is_none());

        worker.stop();
        assert_eq!(handle.await.unwrap(), WorkerExit::Stopped);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_is_not_a_failure() {
        let connector = Arc::new(MockConnector::new());
        let mut worker = exec_worker(&connector, every_second())
            .await
            .with_parser(Arc::new(KeyValueParser::default()));

        // Default mock output is "ok", which has no key/value pairs.
        worker.start();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(worker.attempts(), 4);
        assert_eq!(worker.reconnect_count(), 0);
        assert!(worker.queue().is_empty());
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_dead_tunnel() {
        let connector = Arc::new(MockConnector::new());
        let mut worker = exec_worker(&connector, every_second()).await;
        connector.sessions()[0].kill();

        worker.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // First collection failed without a connection, then the tunnel was rebuilt.
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(worker.queue().len(), 1);
        assert_eq!(worker.reconnect_count(), 0);
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_worker_samples() {
        let shell = ScriptedShell::new().banner("SLX# ").on(
            "show environment temp",
            &["show environment temp\r\nsensor1: 41\r\nsensor2: 44.5\r\nSLX# "],
        );
        let connector = Arc::new(MockConnector::new().with_shell(shell));
        let tunnel = connected_tunnel(&connector).await;
        let mut session =
            ShellSession::new(tunnel, ShellConfig::default().with_prompt("SLX#")).unwrap();
        assert!(session.open().await);

        let source = CommandSource::shell(session.shared()).await;
        let mut worker = SamplingWorker::new("show environment temp", source, every_second())
            .with_parser(Arc::new(KeyValueParser::default()))
            .with_source_id("slx:temp");
        assert!(worker.signature().ends_with(":shell:plain:show environment temp"));

        worker.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        worker.shutdown(Duration::from_secs(5)).await;

        let sample = worker.queue().peek_latest().unwrap();
        assert_eq!(sample.source_id, "slx:temp");
        assert_eq!(sample.payload, json!({ "sensor1": 41, "sensor2": 44.5 }));
        assert_eq!(sample.metadata["command"], "show environment temp");
        assert_eq!(worker.queue().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_written_to_log() {
        use crate::rotation::{FlapCoordinator, LogStream, RotationRegistry, StreamOptions};

        let dir = tempfile::tempdir().unwrap();
        let log = LogStream::open(
            dir.path(),
            "eth0_stats",
            "log",
            StreamOptions::default(),
            Arc::new(FlapCoordinator::default()),
            Arc::new(RotationRegistry::new()),
        )
        .unwrap()
        .shared();

        let connector = Arc::new(MockConnector::new());
        connector.exec().reply("rx: 5\n", "", 0);
        let mut worker = exec_worker(&connector, every_second())
            .await
            .with_parser(Arc::new(KeyValueParser::default()))
            .with_log(log);

        worker.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        worker.shutdown(Duration::from_secs(5)).await;

        let written = std::fs::read_to_string(dir.path().join("eth0_stats.log")).unwrap();
        assert!(written.trim_end().ends_with(r#"{"rx":5}"#));
    }
}
