//! argusd: watches configured Kubernetes resources and ships change notifications.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argus_config::Config;
use argus_engine::{Engine, KubeSource, SessionPhase};
use argus_notify::{LogNotifier, Notifier, WebhookNotifier};
use clap::Parser;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "argusd", version, about = "Kubernetes resource change watcher")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml", env = "CONFIG_PATH")]
    config: PathBuf,
}

fn init_tracing() {
    let env = std::env::var("ARGUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARGUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ARGUS_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    info!(
        cluster = %config.cluster_name,
        resources = config.resources.len(),
        "configuration loaded"
    );

    let notifier: Arc<dyn Notifier> = match config.notify.webhook_url.clone() {
        Some(url) => {
            info!(url = %url, "webhook notifier enabled");
            Arc::new(WebhookNotifier::new(
                url,
                config.cluster_name.clone(),
                config.notify.timeout(),
            )?)
        }
        None => {
            info!("no webhook configured; notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let client = argus_kubehub::default_client().await?;
    let cancel = CancellationToken::new();
    let engine = Engine::new(config.watcher.clone(), notifier, cancel.clone());

    let mut handles = Vec::new();
    for filter in &config.resources {
        match KubeSource::connect(&client, filter, &config.watcher).await {
            Ok(source) => handles.push(engine.launch(filter.clone(), Arc::new(source))),
            Err(e) => {
                error!(session = %filter.session_key(), error = %e, "cannot resolve resource; skipping");
            }
        }
    }
    if handles.is_empty() {
        bail!("no watch sessions could be started");
    }
    info!(sessions = handles.len(), "argusd running");

    // ready once every session is past its first baseline (or has given up)
    let ready = {
        let registry = engine.registry();
        tokio::spawn(async move {
            loop {
                let sessions = registry.snapshot();
                if !sessions.is_empty()
                    && sessions
                        .values()
                        .all(|s| s.phase != SessionPhase::LoadingSnapshot)
                {
                    gauge!("argus_ready", 1.0);
                    info!("all sessions past their first baseline");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
    };

    shutdown_signal().await;
    ready.abort();
    info!("shutdown signal received; draining sessions");
    gauge!("argus_ready", 0.0);
    cancel.cancel();

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(15), drain)
        .await
        .is_err()
    {
        warn!("some sessions did not stop within the drain window");
    }
    info!("argusd stopped");
    Ok(())
}
