//! Vendor diagnostic scans driven through a shared shell.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::mapping::{MappingCache, PortMapping, capture, render};
use super::toggle::{TogglePolicy, ToggleTracker};
use crate::channel::{SharedShell, ShellSession};
use crate::error::{Error, Result, RotationError, ScanError, ShellError};
use crate::profile::{DeviceProfile, SubCli};
use crate::rotation::{
    FlapCoordinator, LogStream, RotationRegistry, SharedLogStream, StreamOptions, append_line,
};
use crate::sampling::{Parser, Sample, SampleQueue, raw_payload};

/// One diagnostic run per interface, repeated on an interval.
///
/// `command` may use `{interface}`, `{port}` and `{asic}`.
#[derive(Clone)]
pub struct ScanSpec {
    pub name: String,
    pub command: String,
    pub interval: Duration,
    pub max_samples: usize,
    /// Without a parser the raw text is the payload.
    pub parser: Option<Arc<dyn Parser>>,
    /// Write samples to a log stream per interface.
    pub log: bool,
    /// Run the command inside the profile's sub-CLI.
    pub in_sub_cli: bool,
}

impl fmt::Debug for ScanSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSpec")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("interval", &self.interval)
            .field("max_samples", &self.max_samples)
            .field("parser", &self.parser.is_some())
            .field("log", &self.log)
            .field("in_sub_cli", &self.in_sub_cli)
            .finish()
    }
}

impl ScanSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            interval: Duration::from_secs(60),
            max_samples: 100,
            parser: None,
            log: true,
            in_sub_cli: false,
        }
    }

    /// Broadcom eye scan of the interface's ASIC port.
    pub fn eye() -> Self {
        Self::new("eye", "phy diag {asic} eyescan").in_sub_cli()
    }

    /// Broadcom DSC dump of the interface's ASIC port.
    pub fn dsc() -> Self {
        Self::new("dsc", "phy diag {asic} dsc").in_sub_cli()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn in_sub_cli(mut self) -> Self {
        self.in_sub_cli = true;
        self
    }

    fn needs_asic(&self) -> bool {
        self.command.contains("{asic}")
    }
}

/// Where and how per-interface log streams are created.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub ext: String,
    pub options: StreamOptions,
    pub flap: Arc<FlapCoordinator>,
    pub registry: Arc<RotationRegistry>,
}

impl LogSettings {
    pub fn new(
        dir: impl Into<PathBuf>,
        flap: Arc<FlapCoordinator>,
        registry: Arc<RotationRegistry>,
    ) -> Self {
        Self {
            dir: dir.into(),
            ext: "log".to_string(),
            options: StreamOptions::default(),
            flap,
            registry,
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = ext.into();
        self
    }

    /// Open the stream `{name}_{interface}`.
    pub fn open(&self, name: &str, interface: &str) -> std::result::Result<SharedLogStream, RotationError> {
        let metric = stream_name(name, interface);
        LogStream::open(
            &self.dir,
            &metric,
            &self.ext,
            self.options.clone(),
            self.flap.clone(),
            self.registry.clone(),
        )
        .map(LogStream::shared)
    }
}

/// File-safe `{name}_{interface}`.
fn stream_name(name: &str, interface: &str) -> String {
    let interface: String = interface
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}_{}", name, interface)
}

/// Builder for [`ScanOrchestrator`].
pub struct ScanOrchestratorBuilder {
    profile: DeviceProfile,
    shell: SharedShell,
    interfaces: Vec<String>,
    toggle: TogglePolicy,
    settle_delay: Duration,
    logs: Option<LogSettings>,
    join_timeout: Duration,
}

impl ScanOrchestratorBuilder {
    /// Interfaces every scan covers, in order.
    pub fn interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces = interfaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn toggle_policy(mut self, policy: TogglePolicy) -> Self {
        self.toggle = policy;
        self
    }

    /// Pause between taking a port down and bringing it back up.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn logs(mut self, logs: LogSettings) -> Self {
        self.logs = Some(logs);
        self
    }

    /// How long [`ScanOrchestrator::stop`] waits for each loop.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn build(self) -> ScanOrchestrator {
        ScanOrchestrator {
            inner: Arc::new(Inner {
                profile: self.profile,
                shell: self.shell,
                interfaces: self.interfaces,
                toggles: ToggleTracker::new(self.toggle),
                settle_delay: self.settle_delay,
                mappings: MappingCache::new(),
                queues: Mutex::new(IndexMap::new()),
                streams: Mutex::new(HashMap::new()),
                logs: self.logs,
            }),
            loops: Mutex::new(Vec::new()),
            join_timeout: self.join_timeout,
        }
    }
}

struct ScanLoop {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs vendor scan workflows against one device shell.
///
/// A cycle resolves each interface to its device port (cached), optionally
/// toggles the port, enters the sub-CLI, runs the diagnostic per interface
/// and returns to the management CLI. The shell lock is held for the whole
/// cycle, so concurrent scan loops on one device run one after the other.
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
    loops: Mutex<Vec<ScanLoop>>,
    join_timeout: Duration,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("profile", &self.inner.profile.name)
            .field("interfaces", &self.inner.interfaces)
            .field("scans", &self.scan_names())
            .finish()
    }
}

impl ScanOrchestrator {
    pub fn builder(profile: DeviceProfile, shell: SharedShell) -> ScanOrchestratorBuilder {
        ScanOrchestratorBuilder {
            profile,
            shell,
            interfaces: Vec::new(),
            toggle: TogglePolicy::Disabled,
            settle_delay: Duration::from_secs(5),
            logs: None,
            join_timeout: Duration::from_secs(5),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.inner.profile
    }

    pub fn shell(&self) -> &SharedShell {
        &self.inner.shell
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    /// Cached mapping of `interface`, if it was resolved already.
    pub fn cached_mapping(&self, interface: &str) -> Option<PortMapping> {
        self.inner.mappings.get(interface)
    }

    /// Toggles performed on `interface` so far.
    pub fn toggle_count(&self, interface: &str) -> u32 {
        self.inner.toggles.count(interface)
    }

    /// Resolve `interface` to its port and, where the profile supports it,
    /// its ASIC port.
    pub async fn resolve(&self, interface: &str) -> Result<PortMapping> {
        let mut guard = self.inner.shell.lock().await;
        let shell = &mut *guard;
        if !self.inner.ensure_open(shell).await {
            return Err(ShellError::NotOpen.into());
        }

        let mut mapping = self.inner.resolve_port(shell, interface).await?;
        if mapping.asic.is_some() || self.inner.profile.asic_query.is_none() {
            return Ok(mapping);
        }

        let asic = match &self.inner.profile.sub_cli {
            Some(sub_cli) => {
                let asic = match self.inner.send_all(shell, &sub_cli.enter, &[]).await {
                    Ok(()) => self.inner.resolve_asic(shell, &mapping).await,
                    Err(e) => Err(e),
                };
                self.inner.leave(shell, sub_cli).await;
                asic
            }
            None => self.inner.resolve_asic(shell, &mapping).await,
        };

        mapping.asic = Some(asic?);
        self.inner.mappings.insert(mapping.clone());
        Ok(mapping)
    }

    /// Run one cycle of `spec` over every interface now.
    ///
    /// Samples are also queued and logged like those of a running loop.
    pub async fn run_scan_cycle(&self, spec: &ScanSpec) -> Vec<Sample> {
        self.inner.run_cycle(spec).await
    }

    /// Start a background loop for `spec`. A no-op if a loop with the same
    /// name is running.
    pub fn start_scan(&self, spec: ScanSpec) {
        let mut loops = self.loops();
        if loops
            .iter()
            .any(|l| l.name == spec.name && !l.handle.is_finished())
        {
            debug!("Scan {} already running", spec.name);
            return;
        }
        loops.retain(|l| l.name != spec.name);

        for interface in &self.inner.interfaces {
            self.inner.queue_for(&spec, interface);
        }

        let cancel = CancellationToken::new();
        let name = spec.name.clone();
        let handle = tokio::spawn(scan_loop(self.inner.clone(), spec, cancel.clone()));
        info!("Scan {} started on {} interface(s)", name, self.inner.interfaces.len());
        loops.push(ScanLoop {
            name,
            cancel,
            handle,
        });
    }

    /// Names of the scans whose loops have not been joined.
    pub fn scan_names(&self) -> Vec<String> {
        self.loops().iter().map(|l| l.name.clone()).collect()
    }

    /// Whether the loop for `name` is alive.
    pub fn is_running(&self, name: &str) -> bool {
        self.loops()
            .iter()
            .any(|l| l.name == name && !l.handle.is_finished())
    }

    /// Samples of `scan` on `interface`.
    pub fn queue(&self, scan: &str, interface: &str) -> Option<SampleQueue> {
        self.inner.queues().get(&queue_key(scan, interface)).cloned()
    }

    /// Cancel every loop and wait for them.
    ///
    /// A loop in the middle of a device command is left to finish it; the
    /// wait is bounded by the join timeout.
    pub async fn stop(&self) {
        let loops: Vec<ScanLoop> = std::mem::take(&mut *self.loops());
        if loops.is_empty() {
            return;
        }

        for scan in &loops {
            scan.cancel.cancel();
        }

        let timeout = self.join_timeout;
        let stuck = join_all(loops.into_iter().map(|mut scan| async move {
            let joined = tokio::time::timeout(timeout, &mut scan.handle).await;
            match joined {
                Ok(Ok(())) => debug!("Scan {} joined", scan.name),
                Ok(Err(e)) => error!("Scan {} panicked: {}", scan.name, e),
                Err(_) => {
                    warn!(
                        "Scan {} did not stop within {:?}; leaving it to finish its command",
                        scan.name, timeout
                    );
                    return Some(scan);
                }
            }
            None
        }))
        .await;

        // Still tracked, so start_scan cannot run a second loop beside them.
        self.loops().extend(stuck.into_iter().flatten());
    }

    fn loops(&self) -> MutexGuard<'_, Vec<ScanLoop>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn queue_key(scan: &str, interface: &str) -> String {
    format!("{}:{}", scan, interface)
}

async fn scan_loop(inner: Arc<Inner>, spec: ScanSpec, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let samples = inner.run_cycle(&spec).await;
        debug!("Scan {} cycle produced {} sample(s)", spec.name, samples.len());

        let pause = spec.interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    info!("Scan {} stopped", spec.name);
}

struct Inner {
    profile: DeviceProfile,
    shell: SharedShell,
    interfaces: Vec<String>,
    toggles: ToggleTracker,
    settle_delay: Duration,
    mappings: MappingCache,
    queues: Mutex<IndexMap<String, SampleQueue>>,
    streams: Mutex<HashMap<String, SharedLogStream>>,
    logs: Option<LogSettings>,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, IndexMap<String, SampleQueue>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue_for(&self, spec: &ScanSpec, interface: &str) -> SampleQueue {
        self.queues()
            .entry(queue_key(&spec.name, interface))
            .or_insert_with(|| SampleQueue::new(spec.max_samples))
            .clone()
    }

    async fn run_cycle(&self, spec: &ScanSpec) -> Vec<Sample> {
        // Every scanned interface has a queue, even before its first sample.
        for interface in &self.interfaces {
            self.queue_for(spec, interface);
        }

        let mut guard = self.shell.lock().await;
        let shell = &mut *guard;
        if !self.ensure_open(shell).await {
            warn!("Scan {} skipped: shell unavailable", spec.name);
            return Vec::new();
        }
        let host = shell.tunnel().label();

        let mut mappings = Vec::with_capacity(self.interfaces.len());
        for interface in &self.interfaces {
            match self.resolve_port(shell, interface).await {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => warn!("Scan {}: {}", spec.name, e),
            }
        }

        for mapping in &mappings {
            if let Err(e) = self.toggle(shell, &mapping.interface).await {
                warn!("Scan {}: toggling {} failed: {}", spec.name, mapping.interface, e);
            }
        }

        if mappings.is_empty() || !shell.is_open() {
            return Vec::new();
        }

        let sub_cli = match &self.profile.sub_cli {
            Some(sub_cli) if spec.in_sub_cli => Some(sub_cli),
            _ => None,
        };
        if let Some(sub_cli) = sub_cli {
            if let Err(e) = self.send_all(shell, &sub_cli.enter, &[]).await {
                warn!("Scan {}: entering sub-CLI failed: {}", spec.name, e);
                self.leave(shell, sub_cli).await;
                return Vec::new();
            }
        }

        if spec.needs_asic() && self.profile.asic_query.is_some() {
            for mapping in mappings.iter_mut().filter(|m| m.asic.is_none()) {
                match self.resolve_asic(shell, mapping).await {
                    Ok(asic) => {
                        mapping.asic = Some(asic);
                        self.mappings.insert(mapping.clone());
                    }
                    Err(e) => warn!("Scan {}: {}", spec.name, e),
                }
            }
        }

        let mut samples = Vec::new();
        for mapping in &mappings {
            match self.diagnose(shell, spec, mapping, &host).await {
                Ok(Some(sample)) => {
                    self.record(spec, &mapping.interface, &sample).await;
                    samples.push(sample);
                }
                Ok(None) => {}
                Err(Error::Shell(ShellError::Closed)) => {
                    warn!("Scan {}: shell closed mid-cycle", spec.name);
                    break;
                }
                Err(e) => warn!("Scan {} on {}: {}", spec.name, mapping.interface, e),
            }
        }

        if let Some(sub_cli) = sub_cli {
            self.leave(shell, sub_cli).await;
        }
        samples
    }

    /// One tunnel reconnect and one shell reopen if the shell is closed.
    async fn ensure_open(&self, shell: &mut ShellSession) -> bool {
        if shell.is_open() {
            return true;
        }

        let tunnel = shell.tunnel().clone();
        warn!("Shell on {} is closed, reopening", tunnel.label());
        if !tunnel.reconnect().await {
            return false;
        }
        shell.open().await
    }

    /// Without a port query the interface name is the port id.
    async fn resolve_port(&self, shell: &mut ShellSession, interface: &str) -> Result<PortMapping> {
        if let Some(mapping) = self.mappings.get(interface) {
            return Ok(mapping);
        }

        let port = match &self.profile.port_query {
            Some(query) => {
                let command = render(&query.command, &[("interface", interface)]);
                let output = self.send_checked(shell, &command).await?;
                capture(&query.pattern, &output, "port")?.ok_or_else(|| {
                    ScanError::PortNotFound {
                        interface: interface.to_string(),
                    }
                })?
            }
            None => interface.to_string(),
        };

        let mapping = PortMapping {
            interface: interface.to_string(),
            port,
            asic: None,
        };
        debug!("Interface {} is port {}", interface, mapping.port);
        self.mappings.insert(mapping.clone());
        Ok(mapping)
    }

    async fn resolve_asic(&self, shell: &mut ShellSession, mapping: &PortMapping) -> Result<String> {
        let query = self
            .profile
            .asic_query
            .as_ref()
            .ok_or_else(|| ScanError::Unsupported {
                profile: self.profile.name.clone(),
                what: "ASIC query",
            })?;

        let command = render(&query.command, &[("port", &mapping.port)]);
        let output = self.send_checked(shell, &command).await?;
        let pattern = query.pattern.replace("{port}", &regex::escape(&mapping.port));
        let asic = capture(&pattern, &output, "asic")?.ok_or_else(|| ScanError::AsicPortNotFound {
            port: mapping.port.clone(),
        })?;

        debug!("Port {} is ASIC port {}", mapping.port, asic);
        Ok(asic)
    }

    /// Take `interface` down and back up if the toggle policy allows it.
    async fn toggle(&self, shell: &mut ShellSession, interface: &str) -> Result<()> {
        if self.profile.disable_commands.is_empty() || !self.toggles.try_acquire(interface) {
            return Ok(());
        }

        info!(
            "Toggling {} ({} of {:?})",
            interface,
            self.toggles.count(interface),
            self.toggles.policy()
        );
        let vars = [("interface", interface)];
        let down = self.send_all(shell, &self.profile.disable_commands, &vars).await;
        tokio::time::sleep(self.settle_delay).await;
        // Bring the port back up even if taking it down failed half way.
        let up = self.send_all(shell, &self.profile.enable_commands, &vars).await;
        down.and(up)
    }

    async fn diagnose(
        &self,
        shell: &mut ShellSession,
        spec: &ScanSpec,
        mapping: &PortMapping,
        host: &str,
    ) -> Result<Option<Sample>> {
        if spec.needs_asic() && mapping.asic.is_none() {
            return Err(match self.profile.asic_query {
                Some(_) => ScanError::AsicPortNotFound {
                    port: mapping.port.clone(),
                },
                None => ScanError::Unsupported {
                    profile: self.profile.name.clone(),
                    what: "ASIC query",
                },
            }
            .into());
        }

        let command = render(&spec.command, &mapping.vars());
        let started = Instant::now();
        let output = self.send_checked(shell, &command).await?;
        let elapsed = started.elapsed();

        let source_id = format!("{}:{}:{}", host, spec.name, mapping.interface);
        let payload = match &spec.parser {
            Some(parser) => match parser.parse_from(&source_id, &output) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(
                        "Scan {} on {}: skipping unparseable output: {}",
                        spec.name, mapping.interface, e
                    );
                    return Ok(None);
                }
            },
            None => raw_payload(&output),
        };

        let mut sample = Sample::new(source_id, payload)
            .with_metadata("command", command)
            .with_metadata("host", host)
            .with_metadata("interface", mapping.interface.clone())
            .with_metadata("port", mapping.port.clone())
            .with_metadata("exec_time_ms", elapsed.as_millis().to_string());
        if let Some(asic) = &mapping.asic {
            sample = sample.with_metadata("asic", asic.clone());
        }
        Ok(Some(sample))
    }

    async fn record(&self, spec: &ScanSpec, interface: &str, sample: &Sample) {
        if spec.log {
            if let Some(stream) = self.stream_for(spec, interface) {
                if let Err(e) = append_line(&stream, sample.to_log_line()).await {
                    warn!("Scan {}: {}", spec.name, e);
                }
            }
        }

        if self.queue_for(spec, interface).push(sample.clone()).is_some() {
            debug!("Scan {} on {}: queue full, evicted oldest sample", spec.name, interface);
        }
    }

    fn stream_for(&self, spec: &ScanSpec, interface: &str) -> Option<SharedLogStream> {
        let logs = self.logs.as_ref()?;
        let key = queue_key(&spec.name, interface);
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = streams.get(&key) {
            return Some(stream.clone());
        }

        match logs.open(&spec.name, interface) {
            Ok(stream) => {
                streams.insert(key, stream.clone());
                Some(stream)
            }
            Err(e) => {
                warn!("Scan {}: cannot open log stream: {}", spec.name, e);
                None
            }
        }
    }

    /// Send a command and reject output carrying a failure marker.
    async fn send_checked(&self, shell: &mut ShellSession, command: &str) -> Result<String> {
        let output = shell.send(command, true).await?;
        if let Some(marker) = self.profile.detect_failure(&output) {
            return Err(ScanError::DeviceFailure {
                command: command.to_string(),
                marker: marker.to_string(),
            }
            .into());
        }
        Ok(output)
    }

    async fn send_all(
        &self,
        shell: &mut ShellSession,
        commands: &[String],
        vars: &[(&str, &str)],
    ) -> Result<()> {
        for command in commands {
            self.send_checked(shell, &render(command, vars)).await?;
        }
        Ok(())
    }

    /// Best effort return to the management CLI.
    async fn leave(&self, shell: &mut ShellSession, sub_cli: &SubCli) {
        for command in &sub_cli.exit {
            if !shell.is_open() {
                return;
            }
            if let Err(e) = shell.send(command, true).await {
                warn!("Leaving sub-CLI: '{}' failed: {}", command, e);
                return;
            }
        }
    }
}
