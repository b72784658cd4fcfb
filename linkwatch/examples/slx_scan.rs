//! Eye scan and DSC diagnostics on an SLX-OS switch.
//!
//! Opens a shell on the switch, maps each interface to its Broadcom port
//! and runs `phy diag <port> eyescan` and `phy diag <port> dsc` on an
//! interval. Both scans share the one shell and run one after the other.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example slx_scan -- \
//!     --jump ops@bastion.lab --switch admin@slx-7 --password secret \
//!     --interface 0/1 --interface 0/2 --toggle 1
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use linkwatch::profile::vendors::slx;
use linkwatch::rotation::{FlapCoordinator, RotationRegistry};
use linkwatch::scan::LogSettings;
use linkwatch::{
    Host, JumpChain, Monitor, ScanOrchestrator, ScanSpec, ShellSession, TogglePolicy,
    TunnelConfig, TunnelConnection, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let Some(switch) = &args.switch else {
        eprintln!("Error: --switch is required");
        std::process::exit(1);
    };

    let mut chain = JumpChain::direct(parse_host(switch, &args.password));
    for jump in &args.jumps {
        chain = chain.with_jump(parse_host(jump, &args.password));
    }

    let tunnel = Arc::new(TunnelConnection::new(chain, TunnelConfig::default()));
    println!("Connecting to {}...", tunnel.label());
    tunnel.try_connect().await?;

    let profile = slx::profile();
    let mut session = ShellSession::new(tunnel.clone(), profile.shell_config())?;
    if !session.open().await {
        eprintln!("Error: could not open a shell on {}", tunnel.label());
        tunnel.disconnect().await;
        std::process::exit(1);
    }
    let shell = session.shared();
    println!("Shell open");

    let toggle = match args.toggle {
        Some(0) | None => TogglePolicy::Disabled,
        Some(n) => TogglePolicy::Times(n),
    };
    let scans = Arc::new(
        ScanOrchestrator::builder(profile, shell.clone())
            .interfaces(args.interfaces.iter().cloned())
            .toggle_policy(toggle)
            .logs(LogSettings::new(
                &args.log_dir,
                Arc::new(FlapCoordinator::default()),
                Arc::new(RotationRegistry::new()),
            ))
            .build(),
    );

    for interface in &args.interfaces {
        match scans.resolve(interface).await {
            Ok(mapping) => println!(
                "{} -> port {} ({})",
                interface,
                mapping.port,
                mapping.asic.as_deref().unwrap_or("no ASIC port")
            ),
            Err(e) => eprintln!("{}: {}", interface, e),
        }
    }

    let interval = Duration::from_secs(args.interval);
    scans.start_scan(ScanSpec::eye().with_interval(interval));
    scans.start_scan(ScanSpec::dsc().with_interval(interval));
    println!("Scanning every {:?}; press Ctrl-C to stop", interval);

    let mut monitor = Monitor::new(Arc::new(WorkerPool::new()));
    monitor.add_scan(scans.clone());
    monitor.add_shell(shell);
    monitor.add_tunnel(tunnel);
    monitor.run_until_signal().await?;

    for interface in &args.interfaces {
        for scan in ["eye", "dsc"] {
            if let Some(queue) = scans.queue(scan, interface) {
                println!("{} {}: {} sample(s)", scan, interface, queue.len());
            }
        }
    }
    println!("Done!");
    Ok(())
}

/// `user@host[:port]`
fn parse_host(spec: &str, password: &str) -> Host {
    match spec.split_once('@') {
        Some((user, address)) => Host::new(address, user, password),
        None => Host::new(spec, "admin", password),
    }
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    jumps: Vec<String>,
    switch: Option<String>,
    password: String,
    interfaces: Vec<String>,
    interval: u64,
    toggle: Option<u32>,
    log_dir: PathBuf,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut parsed = Self {
            jumps: Vec::new(),
            switch: None,
            password: String::new(),
            interfaces: Vec::new(),
            interval: 300,
            toggle: None,
            log_dir: PathBuf::from("logs"),
        };

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match (args[i].as_str(), value) {
                ("--jump" | "-j", Some(v)) => parsed.jumps.push(v),
                ("--switch" | "-s", Some(v)) => parsed.switch = Some(v),
                ("--password" | "-P", Some(v)) => parsed.password = v,
                ("--interface" | "-i", Some(v)) => parsed.interfaces.push(v),
                ("--interval", Some(v)) => parsed.interval = v.parse().unwrap_or(300),
                ("--toggle", Some(v)) => parsed.toggle = v.parse().ok(),
                ("--log-dir", Some(v)) => parsed.log_dir = PathBuf::from(v),
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
            parsed.interfaces.push("0/1".to_string());
        }
        parsed
    }

    fn print_help() {
        println!(
            r#"linkwatch slx_scan example

USAGE:
    cargo run --example slx_scan -- [OPTIONS]

OPTIONS:
    -j, --jump <USER@HOST>       Jump host, repeatable, in order
    -s, --switch <USER@HOST>     SLX-OS switch
    -P, --password <PASS>        Password for every hop
    -i, --interface <SLOT/PORT>  Interface to scan, repeatable [default: 0/1]
        --interval <SECS>        Scan interval [default: 300]
        --toggle <N>             Toggle each port off/on in the first N scan cycles
        --log-dir <DIR>          Log directory [default: logs]
    --help                       Print this help message
"#
        );
    }
}
