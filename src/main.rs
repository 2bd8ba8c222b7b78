//! Chuted daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use chuted::confd::ConfdClient;
use chuted::config::Config;
use chuted::executor;
use chuted::network::NetworkResourceManager;
use chuted::reconcile;
use chuted::runtime::{docker, ContainerRuntime, DockerRuntime};
use chuted::store::ChuteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting chuted daemon with config: {:?}", cfg);

    // The runtime must not restart containers on its own; boot
    // reconciliation owns that decision.
    if let Some(path) = &cfg.docker_conf {
        docker::write_daemon_options(path).await;
    }

    // Chute state store
    let store = Arc::new(ChuteStore::open(&cfg.storage_dir).await?);

    // Network resources: seed the pool with persisted leases so none
    // of them can be double-allocated before reconciliation runs.
    let net = Arc::new(NetworkResourceManager::new(&cfg)?);
    for chute in store.list().await {
        net.adopt(&chute).await;
    }

    // Container runtime adapter and update executor
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(cfg.router_id.clone(), Arc::clone(&net)));
    let handle = executor::spawn(Arc::clone(&store), runtime, Arc::clone(&net));

    // Boot reconciliation: runs before any externally submitted
    // update is accepted.
    let confd = ConfdClient::new(cfg.confd_socket.clone());
    match reconcile::reload_chutes(&cfg, &store, &net, &confd, &handle).await {
        Ok(updates) => {
            info!("boot reconciliation queued {} restart(s)", updates.len());
            for update in updates {
                handle.submit(update).await;
            }
        }
        Err(e) => error!("boot reconciliation failed: {}", e),
    }

    info!("chuted ready; accepting updates from the control plane");

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
