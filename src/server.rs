//! The TCP acceptor (spec.md §4.11 step 1): binds the listen address, spawns
//! a [`crate::connection::handle_connection`] task per accepted socket, and
//! shuts every live connection down together on cancellation.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::connection;
use crate::registry::Registry;

/// Binds `config.listen_addr()` and serves connections until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> std::io::Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening for RTMP connections");
    serve(listener, Arc::new(config), Arc::new(Registry::new()), cancel).await;
    Ok(())
}

/// Accepts connections off an already-bound `listener` until `cancel`
/// fires. Every accepted connection shares `registry` and runs under a
/// child of `cancel`, so a server-wide shutdown tears every session down
/// instead of leaving orphaned tasks behind. Split out from [`run`] so
/// tests can bind an ephemeral port and learn its address before serving.
pub async fn serve(listener: TcpListener, config: Arc<Config>, registry: Arc<Registry>, cancel: CancellationToken) {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let registry = registry.clone();
                        let config = config.clone();
                        tracker.spawn(connection::handle_connection(stream, peer_addr, registry, config, cancel.clone()));
                    }
                    Err(err) => tracing::warn!(%err, "accept error"),
                }
            }
        }
    }

    tracing::info!("shutting down, waiting for connections to drain");
    tracker.close();
    tracker.wait().await;
}
