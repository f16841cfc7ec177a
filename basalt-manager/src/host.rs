//! The per-host service loop: drains the bus receiver and hands each
//! envelope to the manager. Cast failures end up on the affected records
//! and are only logged here; call failures go back to the caller.

use basalt_rpc::Envelope;
use basalt_store::RecordStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::manager::VolumeManager;

pub struct HostService;

impl HostService {
    /// Register the host's presence and consume its envelope stream until
    /// the bus side is dropped.
    pub fn spawn(
        manager: Arc<VolumeManager>,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(host = %manager.host(), "host service started");
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Cast(request) => {
                        let method = request.method();
                        if let Err(e) = manager.dispatch(request).await {
                            warn!(host = %manager.host(), method, error = %e, "cast failed");
                        }
                    }
                    Envelope::Call { request, reply } => {
                        let _ = reply.send(manager.handle_call(request).await);
                    }
                }
            }
            info!(host = %manager.host(), "host service stopped");
        })
    }

    /// Convenience for tests and embedded deployments: register a service
    /// row alongside the envelope loop so availability predicates see the
    /// host as up.
    pub async fn register_service(
        store: &RecordStore,
        host: &str,
        topic: &str,
        availability_zone: &str,
    ) -> basalt_core::Result<()> {
        store.service_register(host, topic, availability_zone).await?;
        Ok(())
    }
}
