use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Invalid volume: {reason}")]
    InvalidVolume { reason: String },

    #[error("Invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("Invalid backup: {reason}")]
    InvalidBackup { reason: String },

    #[error("Invalid attach mode {mode} for volume {volume_id}")]
    InvalidVolumeAttachMode { mode: String, volume_id: Uuid },

    #[error("Volume {volume_id} is still attached, detach volume first")]
    VolumeAttached { volume_id: Uuid },

    #[error("Volume {volume_id} is busy")]
    VolumeIsBusy { volume_id: Uuid },

    #[error("Snapshot {snapshot_id} is busy")]
    SnapshotIsBusy { snapshot_id: Uuid },

    #[error("Quota exceeded for resources: {overs:?}")]
    OverQuota {
        overs: Vec<String>,
        quotas: HashMap<String, i64>,
        usages: HashMap<String, QuotaUsage>,
    },

    #[error("Volume {volume_id} could not be found")]
    VolumeNotFound { volume_id: Uuid },

    #[error("Snapshot {snapshot_id} could not be found")]
    SnapshotNotFound { snapshot_id: Uuid },

    #[error("Backup {backup_id} could not be found")]
    BackupNotFound { backup_id: Uuid },

    #[error("Image {image_id} could not be found")]
    ImageNotFound { image_id: String },

    #[error("Service {service} could not be found")]
    ServiceNotFound { service: String },

    #[error("No valid host was found: {reason}")]
    NoValidHost { reason: String },

    #[error("Policy doesn't allow {action} to be performed")]
    NotAuthorized { action: String },

    #[error("User does not have admin privileges")]
    AdminRequired,

    #[error("No more target ids available")]
    NoMoreTargets,

    #[error("RPC dispatch to topic {topic} failed: {reason}")]
    RpcError { topic: String, reason: String },

    #[error("Backend error during {operation}: {message}")]
    DriverError { operation: String, message: String },

    #[error("Migration of volume {volume_id} failed: {reason}")]
    MigrationError { volume_id: Uuid, reason: String },

    #[error("Operation {operation} timed out")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// In-use and reserved counters for one resource of one project, reported
/// back inside `OverQuota` so callers can see why a reservation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaUsage {
    pub in_use: i64,
    pub reserved: i64,
}

impl QuotaUsage {
    pub fn total(&self) -> i64 {
        self.in_use + self.reserved
    }
}
