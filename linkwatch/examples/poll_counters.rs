//! Poll NIC counters on a host behind jump hosts.
//!
//! Runs `ethtool -S <interface>` for every interface on an interval, watches
//! the kernel log for link flaps and writes everything to rotating log files
//! until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example poll_counters -- \
//!     --jump ops@bastion.lab --target admin@10.0.0.7 --password secret \
//!     --interface eth0 --interface eth1 --log-dir ./logs
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use linkwatch::exec::CommandShape;
use linkwatch::rotation::{FlapCoordinator, LinkEventParser, RotationRegistry, StreamOptions};
use linkwatch::sampling::{KeyValueParser, WorkerConfig};
use linkwatch::scan::{LogSettings, MetricTemplate, register_metrics};
use linkwatch::{
    CommandExecutor, Host, JumpChain, Monitor, TunnelConfig, TunnelConnection, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let Some(target) = &args.target else {
        eprintln!("Error: --target is required");
        std::process::exit(1);
    };

    let mut chain = JumpChain::direct(parse_host(target, &args.password));
    for jump in &args.jumps {
        chain = chain.with_jump(parse_host(jump, &args.password));
    }

    let tunnel = Arc::new(TunnelConnection::new(chain, TunnelConfig::default()));
    println!("Connecting to {}...", tunnel.label());
    tunnel.try_connect().await?;
    println!("Connected!");

    let flap = Arc::new(FlapCoordinator::new(Duration::from_secs(args.flap_timeout)));
    let logs = LogSettings::new(&args.log_dir, flap.clone(), Arc::new(RotationRegistry::new()))
        .with_options(StreamOptions::default().with_max_size_kb(args.max_size_kb));

    let worker_config = WorkerConfig::default()
        .with_interval(Duration::from_secs(args.interval))
        .with_max_samples(args.max_samples);
    let templates = [
        MetricTemplate::new("stats", "ethtool -S {interface}")
            .with_config(worker_config)
            .with_parser(Arc::new(KeyValueParser::default())),
        MetricTemplate::new("link", "dmesg | grep -i '{interface}' | tail -n 50")
            .with_shape(CommandShape::Elevated)
            .with_config(worker_config)
            .with_parser(Arc::new(LinkEventParser::new(flap.clone())))
            .with_log(false),
    ];

    let pool = Arc::new(WorkerPool::new());
    let executor = CommandExecutor::new(tunnel.clone());
    let queues = register_metrics(&pool, &executor, &args.interfaces, &templates, Some(&logs))?;
    println!("Polling {} metric(s); press Ctrl-C to stop", queues.len());

    let mut monitor = Monitor::new(pool);
    monitor.add_tunnel(tunnel);

    let printer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            for (source_id, queue) in &queues {
                if let Some(sample) = queue.peek_latest() {
                    println!("{} ({} queued): {}", source_id, queue.len(), sample.payload);
                }
            }
        }
    });

    monitor.run_until_signal().await?;
    printer.abort();
    println!("Done!");
    Ok(())
}

/// `user@host[:port]`
fn parse_host(spec: &str, password: &str) -> Host {
    match spec.split_once('@') {
        Some((user, address)) => Host::new(address, user, password),
        None => Host::new(spec, env::var("USER").unwrap_or_else(|_| "root".to_string()), password),
    }
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    jumps: Vec<String>,
    target: Option<String>,
    password: String,
    interfaces: Vec<String>,
    interval: u64,
    max_samples: usize,
    log_dir: PathBuf,
    max_size_kb: u64,
    flap_timeout: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut parsed = Self {
            jumps: Vec::new(),
            target: None,
            password: String::new(),
            interfaces: Vec::new(),
            interval: 5,
            max_samples: 100,
            log_dir: PathBuf::from("logs"),
            max_size_kb: 10240,
            flap_timeout: 120,
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match (args[i].as_str(), value) {
                ("--jump" | "-j", Some(v)) => parsed.jumps.push(v),
                ("--target" | "-t", Some(v)) => parsed.target = Some(v),
                ("--password" | "-P", Some(v)) => parsed.password = v,
                ("--interface" | "-i", Some(v)) => parsed.interfaces.push(v),
                ("--interval", Some(v)) => parsed.interval = v.parse().unwrap_or(5),
                ("--max-samples", Some(v)) => parsed.max_samples = v.parse().unwrap_or(100),
                ("--log-dir", Some(v)) => parsed.log_dir = PathBuf::from(v),
                ("--max-size-kb", Some(v)) => parsed.max_size_kb = v.parse().unwrap_or(10240),
                ("--flap-timeout", Some(v)) => parsed.flap_timeout = v.parse().unwrap_or(120),
                ("--help", _) => {
                    Self::print_help();
                    std::process::exit(0);
                }
                (other, _) => {
                    eprintln!("Unknown or incomplete argument: {}", other);
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        if parsed.interfaces.is_empty() {
            parsed.interfaces.push("eth0".to_string());
        }
        parsed
    }

    fn print_help() {
        println!(
            r#"linkwatch poll_counters example

USAGE:
    cargo run --example poll_counters -- [OPTIONS]

OPTIONS:
    -j, --jump <USER@HOST>       Jump host, repeatable, in order
    -t, --target <USER@HOST>     Host to poll
    -P, --password <PASS>        Password for every hop
    -i, --interface <NAME>       Interface to poll, repeatable [default: eth0]
        --interval <SECS>        Polling interval [default: 5]
        --max-samples <N>        Samples kept per metric [default: 100]
        --log-dir <DIR>          Log directory [default: logs]
        --max-size-kb <KB>       Log size limit [default: 10240]
        --flap-timeout <SECS>    Quiet time that ends a flap cycle [default: 120]
    --help                       Print this help message
"#
        );
    }
}
