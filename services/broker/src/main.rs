// Broker service main entry point.
use anyhow::{Context, Result};
use broker::config::ServerConfig;
use broker::{observability, transport};
use relay_broker::Broker;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = ServerConfig::from_env_or_yaml()?;

    let broker = Arc::new(
        Broker::new()
            .with_outbound_queue_depth(config.outbound_queue_depth)
            .context("configure broker")?,
    );

    // A bind failure is fatal; everything after this point is recoverable.
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tracing::info!(addr = %listener.local_addr()?, "listener started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_task = tokio::spawn(transport::serve(
        listener,
        Arc::clone(&broker),
        config.clone(),
        shutdown_rx.clone(),
    ));
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));
    let stats_task = spawn_stats_logger(
        Arc::clone(&broker),
        config.stats_interval_secs,
        shutdown_rx,
    );

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, stopping broker");
    let _ = shutdown_tx.send(true);
    broker.shutdown();

    accept_task.await.context("join accept loop")??;
    if let Some(stats_task) = stats_task {
        let _ = stats_task.await;
    }
    metrics_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("wait for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

// Periodic one-line health summary, handy when tailing broker logs.
fn spawn_stats_logger(
    broker: Arc<Broker>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick fires immediately; skip it so startup logs stay clean.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sessions = broker.session_count();
                    let topics = broker.topic_count();
                    metrics::gauge!("relay_topics_active").set(topics as f64);
                    tracing::info!(sessions, topics, "broker stats");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}
