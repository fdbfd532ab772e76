//! TCP accept loop and per-connection session setup.
//!
//! The broker's transport entrypoint; it wires accepted sockets to the
//! line-protocol session handler. Accepting a connection never waits on any
//! session's progress: each accepted socket runs in a task of its own.
mod session;

use crate::config::ServerConfig;
use anyhow::Result;
use relay_broker::Broker;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serve incoming connections until the shutdown signal flips.
///
/// Transient accept failures are logged and the loop continues; only the
/// shutdown signal stops it.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if config.log_connections {
                            tracing::info!(%peer, "accepted connection");
                        }
                        metrics::counter!("relay_connections_total").increment(1);
                        let broker = Arc::clone(&broker);
                        let config = config.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            session::run(stream, peer, broker, config, shutdown).await;
                        });
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("listener stopped");
    Ok(())
}
