//! Asynchronous dispatch between the API tier and per-host volume
//! managers. Casts are fire-and-forget and FIFO per host; calls carry a
//! oneshot reply channel. Topics may name a pool (`host@pool`) but
//! delivery is keyed on the host component only.

use basalt_core::{AttachMode, DriverKind, Host, Result, StorageError};
use basalt_quota::Reservation;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// One-way operation dispatched to the owning host of a volume.
#[derive(Debug)]
pub enum VolumeRequest {
    CreateVolume {
        volume_id: Uuid,
        reservation: Option<Reservation>,
        image_id: Option<String>,
        allow_reschedule: bool,
        /// Hosts that already failed this create, excluded on reschedule.
        scheduled_hosts: Vec<String>,
        retry_count: u32,
    },
    DeleteVolume {
        volume_id: Uuid,
    },
    CreateSnapshot {
        volume_id: Uuid,
        snapshot_id: Uuid,
        reservation: Option<Reservation>,
    },
    DeleteSnapshot {
        snapshot_id: Uuid,
    },
    AttachVolume {
        volume_id: Uuid,
        instance_uuid: Option<Uuid>,
        host_name: Option<String>,
        mountpoint: String,
        mode: AttachMode,
    },
    DetachVolume {
        volume_id: Uuid,
    },
    ExtendVolume {
        volume_id: Uuid,
        new_size: u64,
        reservation: Option<Reservation>,
    },
    MigrateVolume {
        volume_id: Uuid,
        dest_host: String,
    },
    CopyVolumeToImage {
        volume_id: Uuid,
        image_id: String,
    },
    CreateBackup {
        backup_id: Uuid,
        volume_id: Uuid,
    },
    RestoreBackup {
        backup_id: Uuid,
        volume_id: Uuid,
    },
    DeleteBackup {
        backup_id: Uuid,
    },
}

impl VolumeRequest {
    /// Pull the quota reservation out of a request, leaving `None` behind.
    /// Used to recover the hold from a request that failed to dispatch.
    pub fn take_reservation(&mut self) -> Option<Reservation> {
        match self {
            VolumeRequest::CreateVolume { reservation, .. }
            | VolumeRequest::CreateSnapshot { reservation, .. }
            | VolumeRequest::ExtendVolume { reservation, .. } => reservation.take(),
            _ => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            VolumeRequest::CreateVolume { .. } => "create_volume",
            VolumeRequest::DeleteVolume { .. } => "delete_volume",
            VolumeRequest::CreateSnapshot { .. } => "create_snapshot",
            VolumeRequest::DeleteSnapshot { .. } => "delete_snapshot",
            VolumeRequest::AttachVolume { .. } => "attach_volume",
            VolumeRequest::DetachVolume { .. } => "detach_volume",
            VolumeRequest::ExtendVolume { .. } => "extend_volume",
            VolumeRequest::MigrateVolume { .. } => "migrate_volume",
            VolumeRequest::CopyVolumeToImage { .. } => "copy_volume_to_image",
            VolumeRequest::CreateBackup { .. } => "create_backup",
            VolumeRequest::RestoreBackup { .. } => "restore_backup",
            VolumeRequest::DeleteBackup { .. } => "delete_backup",
        }
    }
}

/// Synchronous request/response messages.
#[derive(Debug, Clone)]
pub enum CallRequest {
    /// Local device path of a volume on the receiving host.
    GetDevicePath { volume_id: Uuid },
    /// Which backend variant serves the receiving host.
    GetDriverInfo,
    Ping,
}

#[derive(Debug, Clone)]
pub enum CallReply {
    DevicePath(PathBuf),
    DriverInfo { kind: DriverKind, host: String },
    Pong,
}

pub enum Envelope {
    Cast(VolumeRequest),
    Call {
        request: CallRequest,
        reply: oneshot::Sender<Result<CallReply>>,
    },
}

/// A failed cast hands the request back so the caller can recover any
/// quota reservation still inside it.
#[derive(Debug)]
pub struct CastError {
    pub request: VolumeRequest,
    pub error: StorageError,
}

impl From<CastError> for StorageError {
    fn from(failure: CastError) -> Self {
        failure.error
    }
}

/// In-process topic router. Each host registers once and consumes its
/// receiver from a single task, which gives per-host delivery order.
pub struct MessageBus {
    topics: RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, host: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = Host::parse(host).host;
        self.topics.write().await.insert(key.clone(), tx);
        debug!(host = %key, "host registered on message bus");
        rx
    }

    pub async fn unregister(&self, host: &str) {
        let key = Host::parse(host).host;
        self.topics.write().await.remove(&key);
    }

    /// Fire-and-forget dispatch. Returns as soon as the message is
    /// queued; the sender learns nothing about execution. On failure the
    /// undelivered request comes back inside the error.
    pub async fn cast(
        &self,
        topic: &str,
        request: VolumeRequest,
    ) -> std::result::Result<(), CastError> {
        let key = Host::parse(topic).host;
        let topics = self.topics.read().await;
        let Some(sender) = topics.get(&key) else {
            return Err(CastError {
                request,
                error: StorageError::RpcError {
                    topic: topic.to_string(),
                    reason: "no such topic".to_string(),
                },
            });
        };
        debug!(topic = %key, method = request.method(), "cast");
        sender.send(Envelope::Cast(request)).map_err(|failed| {
            let Envelope::Cast(request) = failed.0 else {
                unreachable!("cast sends only cast envelopes");
            };
            CastError {
                request,
                error: StorageError::RpcError {
                    topic: topic.to_string(),
                    reason: "receiver dropped".to_string(),
                },
            }
        })
    }

    /// Request/response round trip, blocking the caller until the host
    /// replies.
    pub async fn call(&self, topic: &str, request: CallRequest) -> Result<CallReply> {
        let key = Host::parse(topic).host;
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let topics = self.topics.read().await;
            let sender = topics.get(&key).ok_or_else(|| StorageError::RpcError {
                topic: topic.to_string(),
                reason: "no such topic".to_string(),
            })?;
            debug!(topic = %key, ?request, "call");
            sender
                .send(Envelope::Call {
                    request,
                    reply: reply_tx,
                })
                .map_err(|_| StorageError::RpcError {
                    topic: topic.to_string(),
                    reason: "receiver dropped".to_string(),
                })?;
        }
        reply_rx.await.map_err(|_| StorageError::RpcError {
            topic: topic.to_string(),
            reason: "call dropped without reply".to_string(),
        })?
    }

    pub async fn registered_hosts(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
