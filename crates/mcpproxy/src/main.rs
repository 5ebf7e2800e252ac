use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use mpx_config::ProxyConfig;
use mpx_fleet::{Supervisor, SupervisorOptions};
use mpx_store::StateStore;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout stays clean for the MCP client side.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            shutdown_timeout,
        } => serve(&config, Duration::from_secs(shutdown_timeout)).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

async fn serve(config_path: &Path, shutdown_timeout: Duration) -> Result<()> {
    let config = ProxyConfig::load(config_path)?;
    let store = StateStore::open(&database_path(config_path, &config))
        .context("failed to open state database")?;

    let supervisor = Supervisor::new(
        config,
        store,
        SupervisorOptions {
            config_path: Some(config_path.to_path_buf()),
            total_shutdown_timeout: Some(shutdown_timeout),
            ..SupervisorOptions::default()
        },
    );

    let report = supervisor.start().await?;
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "mcpproxy is running"
    );
    for (name, err) in &report.failed {
        error!(server = %name, error = %err, "upstream failed to start");
    }

    wait_for_stop_signal().await;
    info!("stop signal received, shutting down");

    let report = supervisor.shutdown().await;
    if !report.is_clean() {
        for line in &report.errors {
            error!(error = %line, "shutdown error");
        }
        anyhow::bail!("shutdown finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn check_config(config_path: &Path) -> Result<()> {
    let config = ProxyConfig::load(config_path)?;
    println!(
        "{} ok: {} server(s), max_concurrent_connections={}, auto_disable_threshold={}",
        config_path.display(),
        config.servers.len(),
        config.max_concurrent_connections,
        config.auto_disable_threshold
    );
    for server in &config.servers {
        println!(
            "  {} [{}] startup_mode={}",
            server.name,
            server.transport.label(),
            server.startup_mode
        );
    }
    Ok(())
}

/// Database lives in `data_dir` when configured, else next to the config.
fn database_path(config_path: &Path, config: &ProxyConfig) -> PathBuf {
    let dir = config
        .data_dir
        .clone()
        .or_else(|| config_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join("mcpproxy.db")
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
