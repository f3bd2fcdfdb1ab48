mod activation;
mod agent;
mod broadcast;
mod collectors;
mod command;
mod config;
mod http;
mod metrics;
mod state;

use agent::{Agent, Collaborators};
use axum::serve;
use clap::Parser;
use collectors::latency::LatencyUpdate;
use config::{Config, ConfigError};
use metrics::Metrics;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatchd")]
#[command(version)]
struct Cli {
    /// YAML configuration; built-in defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen_addr(),
        ping_targets = cfg.ping_targets.len(),
        watched_disks = cfg.disk_watch.len(),
        "starting hostwatchd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let agent = Agent::build(&cfg, Collaborators::system(&cfg), metrics.clone());

    let listener = match TcpListener::bind(cfg.listen_addr()).await {
        Ok(l) => l,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen_addr(), "failed to bind listen socket");
            std::process::exit(1);
        }
    };

    tokio::spawn(log_latency_updates(agent.prober.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app = http::build_router(metrics, &agent, shutdown_rx.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "http server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!(
        observers = agent.controller.observers().await,
        "received Ctrl+C, shutting down"
    );

    let _ = shutdown_tx.send(true);
    let _ = http_task.await;
    agent.controller.shutdown().await;
    info!("hostwatchd stopped");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn log_latency_updates(mut updates: Receiver<LatencyUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => debug!(host = %update.target, value = ?update.value, "latency update"),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "latency update log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut cfg = match path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}
