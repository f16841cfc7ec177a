//! The storage driver contract and its backend implementations.
//!
//! Every backend exposes the same capability set; the volume manager is the
//! only caller. Operations are host-local and blocking from the manager's
//! point of view. Volumes are thin-provisioned: backing files hold written
//! payload only, while capacity accounting runs against the record size.

pub mod backup_service;
pub mod image;
pub mod lvm;
pub mod remotefs;
pub mod target;

use async_trait::async_trait;
use basalt_core::{Backup, Result, Snapshot, StorageError, Volume, VolumeStatus};
use std::path::PathBuf;

pub use backup_service::{BackupService, LocalBackupService};
pub use image::{ImageMeta, ImageService, MemoryImageService};
pub use lvm::LvmIscsiDriver;
pub use remotefs::RemoteFsDriver;
pub use target::TargetAllocator;

pub use basalt_core::DriverKind;

/// Record fields a driver may ask the manager to persist after an
/// operation, e.g. a new provider location after a create or migrate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelUpdate {
    pub provider_location: Option<String>,
}

/// Identity of a migration destination as seen by the source driver.
#[derive(Debug, Clone)]
pub struct DriverTarget {
    pub host: String,
    pub kind: DriverKind,
}

/// Properties of the host asking for a connection.
#[derive(Debug, Clone)]
pub struct Connector {
    pub host: String,
    pub initiator: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub driver_volume_type: &'static str,
    pub device_path: PathBuf,
    pub target_iqn: Option<String>,
    pub target_lun: Option<u32>,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn driver_kind(&self) -> DriverKind;

    /// Host identity this driver serves, without pool suffix.
    fn host(&self) -> &str;

    /// Verify the backend is usable before the host starts serving.
    async fn check_setup(&self) -> Result<()>;

    async fn create_volume(&self, volume: &Volume) -> Result<Option<ModelUpdate>>;

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<Option<ModelUpdate>>;

    async fn create_cloned_volume(
        &self,
        volume: &Volume,
        source: &Volume,
    ) -> Result<Option<ModelUpdate>>;

    /// Fails with `VolumeIsBusy` while backend-side snapshots depend on
    /// the volume; the caller treats that as recoverable.
    async fn delete_volume(&self, volume: &Volume) -> Result<()>;

    async fn create_snapshot(&self, volume: &Volume, snapshot: &Snapshot) -> Result<()>;

    /// Busy-tolerant like `delete_volume`, reporting `SnapshotIsBusy`.
    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn extend_volume(&self, volume: &Volume, new_size_gb: u64) -> Result<()>;

    /// Optimized migration. Returns `(false, None)` whenever this driver
    /// cannot move the volume itself: missing or malformed location info,
    /// a different driver kind or host on the target, or a volume outside
    /// a movable state. Only an exact kind+host match with the volume
    /// `available` performs the move.
    async fn migrate_volume(
        &self,
        volume: &Volume,
        target: &DriverTarget,
    ) -> Result<(bool, Option<ModelUpdate>)>;

    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &Connector,
    ) -> Result<ConnectionInfo>;

    async fn terminate_connection(&self, volume: &Volume, connector: &Connector) -> Result<()>;

    /// Host-local attach, returning the device path to read/write.
    async fn attach_volume(&self, volume: &Volume) -> Result<PathBuf>;

    async fn detach_volume(&self, volume: &Volume) -> Result<()>;

    fn local_path(&self, volume: &Volume) -> PathBuf;

    /// Backend-optimized create-from-image. `(None, false)` means the
    /// driver has no shortcut and the caller must stream the image in.
    async fn clone_image(
        &self,
        _volume: &Volume,
        _image_location: Option<&str>,
    ) -> Result<(Option<ModelUpdate>, bool)> {
        Ok((None, false))
    }

    async fn copy_image_to_volume(
        &self,
        volume: &Volume,
        image_service: &dyn ImageService,
        image_id: &str,
    ) -> Result<()> {
        let path = self.local_path(volume);
        let mut file = tokio::fs::File::create(&path).await?;
        image_service.download(image_id, &mut file).await
    }

    async fn copy_volume_to_image(
        &self,
        volume: &Volume,
        image_service: &dyn ImageService,
        image_id: &str,
    ) -> Result<()> {
        let path = self.local_path(volume);
        let mut file = tokio::fs::File::open(&path).await?;
        let meta = ImageMeta {
            id: image_id.to_string(),
            size_bytes: std::fs::metadata(&path)?.len(),
            min_disk_gb: 0,
            properties: std::collections::HashMap::new(),
        };
        image_service.upload(image_id, meta, &mut file).await
    }

    /// Open a local connection, attach, stream the volume into the backup
    /// service, then detach and terminate. Cleanup runs on every exit path
    /// after the attach, and a copy failure wins over a cleanup failure.
    async fn backup_volume(
        &self,
        volume: &Volume,
        backup: &Backup,
        service: &dyn BackupService,
    ) -> Result<()> {
        let connector = Connector {
            host: self.host().to_string(),
            initiator: None,
        };
        self.initialize_connection(volume, &connector).await?;

        let result = match self.attach_volume(volume).await {
            Ok(device) => {
                let copied = match std::fs::metadata(&device) {
                    Ok(meta) => {
                        let saved = meta.permissions();
                        let copied = match tokio::fs::File::open(&device).await {
                            Ok(mut file) => service.backup(backup, &mut file).await,
                            Err(e) => Err(e.into()),
                        };
                        let _ = std::fs::set_permissions(&device, saved);
                        copied
                    }
                    Err(e) => Err(e.into()),
                };
                copied.and(self.detach_volume(volume).await)
            }
            Err(e) => Err(e),
        };

        result.and(self.terminate_connection(volume, &connector).await)
    }

    /// The inverse of `backup_volume`, with the same cleanup guarantee.
    async fn restore_backup(
        &self,
        volume: &Volume,
        backup: &Backup,
        service: &dyn BackupService,
    ) -> Result<()> {
        let connector = Connector {
            host: self.host().to_string(),
            initiator: None,
        };
        self.initialize_connection(volume, &connector).await?;

        let result = match self.attach_volume(volume).await {
            Ok(device) => {
                let copied = match std::fs::metadata(&device) {
                    Ok(meta) => {
                        let saved = meta.permissions();
                        let copied = match tokio::fs::File::create(&device).await {
                            Ok(mut file) => service.restore(backup, &mut file).await,
                            Err(e) => Err(e.into()),
                        };
                        let _ = std::fs::set_permissions(&device, saved);
                        copied
                    }
                    Err(e) => Err(e.into()),
                };
                copied.and(self.detach_volume(volume).await)
            }
            Err(e) => Err(e),
        };

        result.and(self.terminate_connection(volume, &connector).await)
    }
}

/// Shared movable-state rule for optimized migration.
pub(crate) fn migration_declined(volume: &Volume, target: &DriverTarget, kind: DriverKind, host: &str) -> bool {
    if volume.status != VolumeStatus::Available {
        return true;
    }
    if target.kind != kind {
        return true;
    }
    if basalt_core::Host::parse(&target.host).host != host {
        return true;
    }
    false
}

pub(crate) async fn copy_file_payload(src: &std::path::Path, dst: &std::path::Path) -> Result<u64> {
    Ok(tokio::fs::copy(src, dst).await.map_err(StorageError::from)?)
}
