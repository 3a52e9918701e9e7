use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use xray_exporter::config::{self, Config};
use xray_exporter::metrics::TunnelMetrics;
use xray_exporter::tunnel::{TunnelManager, XrayProcessProvider};
use xray_exporter::{server, watcher};

/// HTTP 服务停止的宽限时间
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("xray-exporter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Health-monitoring Prometheus exporter for VLESS tunnels")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (overrides CONFIG_FILE)"),
        )
        .arg(
            Arg::new("validate")
                .long("validate")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    init_logging(config::debug_from_env());

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .cloned()
            .unwrap_or_else(config::config_file_from_env),
    );

    let cfg = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    cfg.validate().context("configuration validation failed")?;

    if matches.get_flag("validate") {
        info!("configuration is valid");
        return Ok(());
    }

    info!(
        tunnels = cfg.tunnels.len(),
        file = %config_path.display(),
        "configuration loaded"
    );

    let metrics =
        Arc::new(TunnelMetrics::new(Registry::new()).context("failed to create metrics")?);
    let provider = Arc::new(XrayProcessProvider::from_env());
    let manager = Arc::new(TunnelManager::new(metrics.clone(), provider));

    manager
        .initialize(&cfg)
        .await
        .context("failed to initialize tunnels")?;

    let shutdown = CancellationToken::new();

    // 配置热重载：watcher 去抖后发信号，这里串行执行重载
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    {
        let watch_path = config_path.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher::watch(&watch_path, reload_tx, cancel).await {
                error!(error = %e, "file watcher stopped");
            }
        });
    }
    {
        let manager = manager.clone();
        let reload_path = config_path.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                if let Err(e) = manager.reload(&reload_path).await {
                    error!(error = %e, "failed to reload config");
                }
            }
        });
    }

    let listen_addr = config::listen_addr_from_env();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    let server_task = tokio::spawn(server::serve(
        listener,
        manager.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, stopping");

    shutdown.cancel();
    match tokio::time::timeout(GRACEFUL_TIMEOUT, server_task).await {
        Ok(Ok(Err(e))) => error!(error = %e, "metrics server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "metrics server task panicked"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => error!("metrics server did not stop within graceful timeout"),
    }

    manager.stop_all().await;

    info!("shutdown complete");
    Ok(())
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xray_exporter={default_level},info")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}
