//! `dispatchd`: process entry point. Loads configuration, wires the demo
//! handler table to [`dispatch::HttpServer`], installs a signal-driven
//! graceful shutdown, and runs the async-job TTL sweep on a timer.
//!
//! Grounded on the teacher's `examples/example_server.rs` (the one place
//! the teacher wires a listener up to a running process) promoted from a
//! dev-only example into a real binary, since this workspace's scheduler
//! and dispatcher now do everything that example's `MultiListener`-per-
//! core loop did and more.

mod handlers;

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use dispatch::config::{ListenEndpoint, ServerConfig};
use dispatch::HttpServer;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Command-line flags needed to boot the server (distilled spec §6: CLI
/// option parsing is out of scope beyond what's needed to boot).
#[derive(Parser, Debug)]
#[command(name = "dispatchd", about = "dispatchd HTTP front end")]
struct Cli {
    /// Path to a TOML configuration file. Defaults compiled in if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen addresses (repeatable).
    #[arg(long = "listen")]
    listen: Vec<SocketAddr>,

    /// Override the configured number of event-loop threads.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    for endpoint in &config.listen {
        if let Err(e) = dispatch::scheduler::preflight_bind(endpoint) {
            error!(address = %endpoint.address, error = %e, "cannot bind listen endpoint");
            std::process::exit(1);
        }
    }

    let (factory, server_cell) = handlers::new_factory();
    let server = match HttpServer::start(config, Box::new(factory), None) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    server_cell
        .set(server.clone())
        .expect("server handle set exactly once, before any request can reach a handler");

    info!("dispatchd started");

    let shutting_down = Arc::new(AtomicBool::new(false));
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "failed to install signal handler");
            std::process::exit(1);
        }
    };

    let sweep_server = server.clone();
    let sweep_flag = shutting_down.clone();
    let sweeper = std::thread::Builder::new()
        .name("async-job-sweep".to_string())
        .spawn(move || {
            while !sweep_flag.load(Ordering::Relaxed) {
                std::thread::sleep(SWEEP_INTERVAL);
                sweep_server.sweep_async_jobs();
            }
        })
        .expect("failed to spawn async-job sweep thread");

    // Blocks until SIGINT/SIGTERM; `forever()` only yields real signals.
    if let Some(signal) = signals.forever().next() {
        info!(signal, "received shutdown signal");
    }

    shutting_down.store(true, Ordering::Relaxed);
    server.shutdown();
    let _ = sweeper.join();
    info!("dispatchd stopped");
}

fn load_config(cli: &Cli) -> Result<ServerConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("reading {}: {e}", path.display()))?;
            ServerConfig::from_toml(&text).map_err(|e| format!("parsing {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if !cli.listen.is_empty() {
        config.listen = cli
            .listen
            .iter()
            .map(|address| ListenEndpoint {
                address: *address,
                encrypted: false,
            })
            .collect();
    }

    if let Some(workers) = cli.workers {
        config.event_loops = workers;
    }

    Ok(config)
}
