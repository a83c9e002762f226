//! Process-wide shutdown
//!
//! On Ctrl-C or SIGTERM every session is disconnected, then any forwarding
//! process group still registered is force-killed, so no tunnel outlives
//! the parent.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::process::ProcessRegistry;
use crate::registry::ConnectionRegistry;

/// Disconnect everything, then sweep leftover process groups
pub async fn shutdown(registry: &ConnectionRegistry, processes: &ProcessRegistry) {
    let stopped = registry.disconnect_all().await;
    let swept = processes.sweep();
    info!("Shutdown complete: {} tunnel(s) stopped, {} group(s) swept", stopped, swept);
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run [`shutdown`] when the process is asked to terminate
pub fn install(registry: Arc<ConnectionRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        termination_signal().await;
        info!("Termination signal received, closing tunnels");
        shutdown(&registry, &ProcessRegistry::global()).await;
    })
}
