//! Per-interface exec metrics on the system under test.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use log::info;

use super::mapping::render;
use super::orchestrator::LogSettings;
use crate::error::RotationError;
use crate::exec::{CommandExecutor, CommandShape};
use crate::sampling::{
    CommandSource, Parser, SampleQueue, SamplingWorker, WorkerConfig, WorkerPool,
};

/// An exec command polled once per interface, e.g. `ethtool -S {interface}`.
#[derive(Clone)]
pub struct MetricTemplate {
    pub name: String,
    pub command: String,
    pub shape: CommandShape,
    pub config: WorkerConfig,
    pub parser: Option<Arc<dyn Parser>>,
    /// Write samples to `{name}_{interface}` log streams.
    pub log: bool,
}

impl fmt::Debug for MetricTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricTemplate")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("shape", &self.shape)
            .field("config", &self.config)
            .finish()
    }
}

impl MetricTemplate {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            shape: CommandShape::Plain,
            config: WorkerConfig::default(),
            parser: None,
            log: true,
        }
    }

    pub fn with_shape(mut self, shape: CommandShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
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

    /// Worker polling this metric on `interface`.
    pub fn worker(&self, executor: &CommandExecutor, interface: &str) -> SamplingWorker {
        let source_id = format!("{}:{}:{}", executor.tunnel().label(), self.name, interface);
        let source = CommandSource::shaped(executor.clone(), self.shape);
        let worker = SamplingWorker::new(
            render(&self.command, &[("interface", interface)]),
            source,
            self.config,
        )
        .with_source_id(source_id);

        match &self.parser {
            Some(parser) => worker.with_parser(parser.clone()),
            None => worker,
        }
    }
}

/// Start one worker per template and interface in `pool`.
///
/// Returns the queues keyed by worker source id. A template without
/// `{interface}` runs the same command everywhere, so the pool keeps one
/// worker for it and every interface gets that worker's queue. Log streams
/// are only opened for workers the pool does not have yet. Fails before
/// starting anything if a log stream cannot be opened.
pub fn register_metrics(
    pool: &WorkerPool,
    executor: &CommandExecutor,
    interfaces: &[String],
    templates: &[MetricTemplate],
    logs: Option<&LogSettings>,
) -> Result<Vec<(String, SampleQueue)>, RotationError> {
    let mut workers = Vec::with_capacity(interfaces.len() * templates.len());
    let mut fresh = HashSet::new();
    for template in templates {
        for interface in interfaces {
            let mut worker = template.worker(executor, interface);
            let signature = worker.signature();
            if !pool.contains(&signature) && fresh.insert(signature) {
                if let Some(logs) = logs.filter(|_| template.log) {
                    worker = worker.with_log(logs.open(&template.name, interface)?);
                }
            }
            workers.push(worker);
        }
    }

    info!(
        "Registering {} metric worker(s) on {}",
        workers.len(),
        executor.tunnel().label()
    );
    Ok(workers
        .into_iter()
        .map(|worker| {
            let source_id = worker.source_id().to_string();
            (source_id, pool.add(worker))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::rotation::{FlapCoordinator, RotationRegistry};
    use crate::sampling::KeyValueParser;
    use crate::testing::{MockConnector, connected_tunnel};

    #[tokio::test(start_paused = true)]
    async fn test_register_metrics_per_interface() {
        let connector = Arc::new(MockConnector::new());
        connector.exec().reply("rx_packets: 7\n", "", 0);
        connector.exec().reply("rx_packets: 9\n", "", 0);
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);

        let dir = tempfile::tempdir().unwrap();
        let logs = LogSettings::new(
            dir.path(),
            Arc::new(FlapCoordinator::default()),
            Arc::new(RotationRegistry::new()),
        );
        let interfaces = vec!["eth0".to_string(), "eth1".to_string()];
        let stats = MetricTemplate::new("stats", "ethtool -S {interface}")
            .with_config(WorkerConfig::default().with_interval(Duration::from_secs(1)))
            .with_parser(Arc::new(KeyValueParser::default()));

        let pool = WorkerPool::new();
        let queues = register_metrics(&pool, &executor, &interfaces, &[stats], Some(&logs)).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(queues[0].0.ends_with(":stats:eth0"));
        assert!(queues[1].0.ends_with(":stats:eth1"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.stop_all().await;

        let calls: Vec<_> = connector.exec().calls().into_iter().map(|(c, _)| c).collect();
        assert_eq!(calls, vec!["ethtool -S eth0", "ethtool -S eth1"]);
        assert_eq!(queues[0].1.peek_latest().unwrap().payload, json!({ "rx_packets": 7 }));
        assert!(dir.path().join("stats_eth1.log").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registering_twice_reuses_workers() {
        let connector = Arc::new(MockConnector::new());
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);
        let template = MetricTemplate::new("uptime", "cat /proc/uptime").with_log(false);
        let interfaces = vec!["eth0".to_string()];

        let pool = WorkerPool::new();
        register_metrics(&pool, &executor, &interfaces, &[template.clone()], None).unwrap();
        register_metrics(&pool, &executor, &interfaces, &[template], None).unwrap();
        assert_eq!(pool.len(), 1);
        pool.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_command_opens_one_log() {
        let connector = Arc::new(MockConnector::new());
        let executor = CommandExecutor::new(connected_tunnel(&connector).await);
        let dir = tempfile::tempdir().unwrap();
        let logs = LogSettings::new(
            dir.path(),
            Arc::new(FlapCoordinator::default()),
            Arc::new(RotationRegistry::new()),
        );
        let interfaces = vec!["eth0".to_string(), "eth1".to_string()];
        let template = MetricTemplate::new("uptime", "cat /proc/uptime");

        let pool = WorkerPool::new();
        let queues =
            register_metrics(&pool, &executor, &interfaces, &[template.clone()], Some(&logs))
                .unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(queues.len(), 2);
        assert!(dir.path().join("uptime_eth0.log").exists());
        assert!(!dir.path().join("uptime_eth1.log").exists());

        std::fs::remove_file(dir.path().join("uptime_eth0.log")).unwrap();
        register_metrics(&pool, &executor, &interfaces, &[template], Some(&logs)).unwrap();
        assert!(!dir.path().join("uptime_eth0.log").exists());
        pool.stop_all().await;
    }
}
