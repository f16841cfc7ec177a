use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Number of bytes in one gigabyte, the allocation granularity for volumes.
pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Creating,
    Available,
    #[serde(rename = "in-use")]
    InUse,
    Attaching,
    Detaching,
    Extending,
    #[serde(rename = "backing-up")]
    BackingUp,
    #[serde(rename = "restoring-backup")]
    RestoringBackup,
    Deleting,
    Deleted,
    Migrating,
    Uploading,
    Downloading,
    Error,
    ErrorDeleting,
    ErrorExtending,
    ErrorAttaching,
    ErrorRestoring,
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::Extending => "extending",
            VolumeStatus::BackingUp => "backing-up",
            VolumeStatus::RestoringBackup => "restoring-backup",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Deleted => "deleted",
            VolumeStatus::Migrating => "migrating",
            VolumeStatus::Uploading => "uploading",
            VolumeStatus::Downloading => "downloading",
            VolumeStatus::Error => "error",
            VolumeStatus::ErrorDeleting => "error_deleting",
            VolumeStatus::ErrorExtending => "error_extending",
            VolumeStatus::ErrorAttaching => "error_attaching",
            VolumeStatus::ErrorRestoring => "error_restoring",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachStatus {
    Detached,
    Attaching,
    Attached,
}

impl std::fmt::Display for AttachStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachStatus::Detached => write!(f, "detached"),
            AttachStatus::Attaching => write!(f, "attaching"),
            AttachStatus::Attached => write!(f, "attached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Deleting,
    Deleted,
    Error,
    ErrorDeleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Available,
    Deleting,
    Deleted,
    Restoring,
    Error,
}

/// Closed set of configured backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    LvmIscsi,
    RemoteFs,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::LvmIscsi => write!(f, "lvm_iscsi"),
            DriverKind::RemoteFs => write!(f, "remote_fs"),
        }
    }
}

/// Requested access mode for an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

impl AttachMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachMode::ReadWrite => "rw",
            AttachMode::ReadOnly => "ro",
        }
    }
}

impl std::fmt::Display for AttachMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A backend identity of the form `host` or `host@pool`. Routing and
/// service matching always use the host component only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub host: String,
    pub pool: Option<String>,
}

impl Host {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('@') {
            Some((host, pool)) => Self {
                host: host.to_string(),
                pool: Some(pool.to_string()),
            },
            None => Self {
                host: raw.to_string(),
                pool: None,
            },
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pool {
            Some(pool) => write!(f, "{}@{}", self.host, pool),
            None => write!(f, "{}", self.host),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: Uuid,
    /// Identity used for backend object naming when it differs from `id`.
    /// Set when a generic migration adopts the interim destination volume,
    /// whose backend objects keep the interim id.
    #[serde(default)]
    pub name_id: Option<Uuid>,
    pub project_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub status: VolumeStatus,
    pub attach_status: AttachStatus,
    pub migration_status: Option<String>,
    /// Size in whole gigabytes, always >= 1.
    pub size: u64,
    pub host: Option<String>,
    pub availability_zone: String,
    pub snapshot_id: Option<Uuid>,
    pub source_volid: Option<Uuid>,
    pub volume_type_id: Option<String>,
    pub encryption_key_id: Option<String>,
    pub instance_uuid: Option<Uuid>,
    pub attached_host: Option<String>,
    pub mountpoint: Option<String>,
    pub provider_location: Option<String>,
    pub metadata: HashMap<String, String>,
    pub admin_metadata: HashMap<String, String>,
    pub glance_metadata: HashMap<String, String>,
    pub launched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Volume {
    /// The id backend objects for this volume are named after.
    pub fn backend_id(&self) -> Uuid {
        self.name_id.unwrap_or(self.id)
    }

    /// The host component of the owning backend, without any pool suffix.
    pub fn host_only(&self) -> Option<String> {
        self.host.as_deref().map(|h| Host::parse(h).host)
    }

    pub fn has_attachment_target(&self) -> bool {
        self.instance_uuid.is_some() || self.attached_host.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub volume_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub status: SnapshotStatus,
    /// Size of the parent volume, captured at snapshot creation.
    pub volume_size: u64,
    pub metadata: HashMap<String, String>,
    pub provider_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub volume_id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub status: BackupStatus,
    pub host: Option<String>,
    pub container: Option<String>,
    /// Size in gigabytes, copied from the source volume at creation.
    pub size: Option<u64>,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One row per running service process, used by the backup coordinator to
/// decide whether a host has a live backup worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub host: String,
    pub topic: String,
    pub availability_zone: String,
    pub disabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Admin metadata keys with defined semantics.
pub mod admin_keys {
    pub const READONLY: &str = "readonly";
    pub const ATTACHED_MODE: &str = "attached_mode";
}
