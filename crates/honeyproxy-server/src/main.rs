//! honeyproxy: decoy services behind managed proxies.
//!
//! Starts each selected emulator plugin on a private port, exposes it on its
//! public port through a TCP or UDP proxy, and drains everything on
//! SIGINT/SIGTERM.

mod config;
mod honeypot;

use clap::Parser;
use config::ServerConfig;
use honeypot::Honeypot;
use honeyproxy_core::PluginRegistry;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// honeyproxy: honeypot proxy server
#[derive(Parser, Debug)]
#[command(name = "honeyproxy", version, about = "Low-interaction honeypot proxy server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.honeyproxy/config.toml")]
    config: String,

    /// Comma-separated list of plugins to start (default: all configured)
    #[arg(long, value_delimiter = ',')]
    services: Vec<String>,

    /// Address proxies listen on (overrides the config file)
    #[arg(long)]
    bind_host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the compiled-in plugins and exit
    #[arg(long)]
    list_plugins: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.log_level, cli.output.as_ref()) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let registry = PluginRegistry::builtin();
    if cli.list_plugins {
        for name in registry.names() {
            if let Ok(spec) = registry.get(name) {
                println!("{}\t{}/{}", spec.name, spec.network, spec.default_port);
            }
        }
        return;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting honeyproxy");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind_host.as_deref(),
        &cli.services,
        &registry,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };

    let honeypot = match Honeypot::start(&server_config, &registry).await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start honeypot");
            std::process::exit(1);
        }
    };

    match serde_json::to_string(&honeypot.snapshot().await) {
        Ok(proxies) => info!(proxies = %proxies, "honeyproxy running, press ctrl+c to exit"),
        Err(e) => error!(error = %e, "cannot serialize proxy listing"),
    }

    shutdown_signal().await;
    info!("received shutdown signal");

    honeypot.shutdown().await;
    info!("honeyproxy stopped");
}

/// Install the global subscriber. `RUST_LOG` wins over `--log-level`.
fn init_tracing(log_level: &str, output: Option<&PathBuf>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match output {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
