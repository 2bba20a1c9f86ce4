use anyhow::Context;
use clap::Parser;
use poem::listener::TcpListener;
use poem::Server;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod asyncio;
mod config;
mod pages;
mod targets;

/// Caching reverse proxy for package mirrors, release archives and other
/// immutable-ish assets.
#[derive(Parser)]
#[command(version)]
struct CliOpts {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli_opts = CliOpts::parse();
    let cfg = config::ServerConfig::load(&cli_opts.config)
        .with_context(|| format!("could not load configuration: {}", cli_opts.config))?;
    let meta_interval = gc_interval(&cfg.gc.meta, "gc.meta")?;
    let blob_interval = gc_interval(&cfg.gc.blob, "gc.blob")?;

    let worker = Arc::new(targets::build_worker(&cfg)?);
    let pages = pages::Pages::load(cfg.page.as_deref())
        .with_context(|| format!("could not load error page: {:?}", cfg.page))?;
    if let Some(monitor) = &cfg.monitor {
        // Metrics are exposed by an external collaborator; the setting is
        // only validated here.
        info!(bind = %monitor.bind, path = %monitor.path, "monitor endpoint configured externally");
    }
    app::spawn_gc_tasks(worker.clone(), meta_interval, blob_interval);

    let endpoint = app::ProxyApp::new(worker.clone(), pages);
    info!(bind = %cfg.bind, "listening");
    Server::new(TcpListener::bind(cfg.bind.clone()))
        .run_with_graceful_shutdown(
            endpoint,
            shutdown_signal(),
            Some(Duration::from_secs(10)),
        )
        .await
        .context("server failed")?;

    info!("draining in-flight requests");
    worker.close();
    Ok(())
}

fn gc_interval(value: &str, what: &str) -> anyhow::Result<Duration> {
    hoard::util::duration::parse_duration_from_str(value)
        .with_context(|| format!("invalid {what} interval: {value:?}"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
}
