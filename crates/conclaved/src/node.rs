//! `conclaved run`: host one coordination node.

use std::net::SocketAddr;
use std::sync::Arc;

use conclave_cluster::{ClusterConfig, Coordinator, GrpcPeers, NodeServer};
use conclave_raft::GrpcTransport;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub async fn run(config: ClusterConfig) -> anyhow::Result<()> {
    let local = config
        .nodes
        .iter()
        .find(|n| n.name == config.name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("node {:?} is not in the directory", config.name))?;
    info!(name = %local.name, ip = %local.ip, port = local.port, "conclave daemon starting");

    let transport = Arc::new(GrpcTransport::new(config.request_timeout()));
    let peers = Arc::new(GrpcPeers::new(
        &config.cluster_token,
        config.request_timeout() * 2,
    ));
    let interval = config.ensure_interval();
    let coordinator = Arc::new(
        Coordinator::new(config, transport, peers).with_feed(Arc::new(|| {
            info!("leadership acquired");
        })),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Ensure-started driver ──────────────────────────────────

    let driver = {
        let coordinator = Arc::clone(&coordinator);
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                match coordinator.ensure_started().await {
                    Ok(true) => {}
                    Ok(false) => debug!("store not running yet"),
                    Err(e) => warn!(error = %e, "ensure-started failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            debug!("ensure-started driver stopped");
        })
    };

    // ── Node service ───────────────────────────────────────────

    let addr = SocketAddr::from(([0, 0, 0, 0], local.port));
    info!(%addr, "node service starting");
    tonic::transport::Server::builder()
        .add_service(NodeServer::new(Arc::clone(&coordinator)).into_service())
        .serve_with_shutdown(addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = driver.await;
    if coordinator.is_running().await {
        coordinator.stop().await?;
    }

    info!("conclave daemon stopped");
    Ok(())
}
