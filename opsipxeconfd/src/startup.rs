//! Startup reconciliation: materialise pipes for every client of this depot
//! with a pending netboot action.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::Backend;
use crate::types::{BootAction, HostId};
use crate::updater::BootConfigUpdater;

/// Handle for the one-shot reconciliation task.
pub struct StartupTask {
    should_stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StartupTask {
    pub fn spawn(
        backend: Arc<dyn Backend>,
        updater: Arc<BootConfigUpdater>,
        depot_id: String,
    ) -> Self {
        let should_stop = Arc::new(AtomicBool::new(false));
        let stop_flag = should_stop.clone();
        let handle = tokio::spawn(async move {
            run(backend, updater, depot_id, stop_flag).await;
        });
        Self { should_stop, handle }
    }

    /// Request termination and wait for the task to finish the current host.
    pub async fn stop(self) {
        self.should_stop.store(true, Ordering::SeqCst);
        let _ = self.handle.await;
    }
}

async fn run(
    backend: Arc<dyn Backend>,
    updater: Arc<BootConfigUpdater>,
    depot_id: String,
    should_stop: Arc<AtomicBool>,
) {
    info!("Start setting initial boot configurations");

    let clients = match backend.depot_clients(&depot_id).await {
        Ok(clients) => clients,
        Err(err) => {
            error!(depot_id = %depot_id, error = %err, "Failed to list depot clients");
            return;
        }
    };
    if clients.is_empty() {
        info!(depot_id = %depot_id, "No clients assigned to depot");
        return;
    }

    let actions = match backend.netboot_actions(&clients, &BootAction::PENDING).await {
        Ok(actions) => actions,
        Err(err) => {
            error!(error = %err, "Failed to list pending netboot actions");
            return;
        }
    };

    // One update per client, first occurrence wins the order.
    let mut pending: Vec<HostId> = Vec::new();
    for action in &actions {
        if !pending.contains(&action.host_id) {
            pending.push(action.host_id.clone());
        }
    }

    for host_id in pending {
        if should_stop.load(Ordering::SeqCst) {
            info!("Startup task stopped before finishing");
            return;
        }
        // One failing host never aborts the batch.
        if let Err(err) = updater.update(host_id.as_str(), None).await {
            error!(
                host_id = %host_id,
                error = %err,
                "Failed to set initial PXE boot configuration"
            );
        }
    }

    info!("Finished setting initial boot configurations");
}
