//! Remote-filesystem driver: volumes are files on a mounted share.
//! There is no export machinery and no optimized migration path, so
//! `migrate_volume` always declines and the manager falls back to the
//! generic host-copy workflow.

use crate::{
    ConnectionInfo, Connector, DriverKind, DriverTarget, ModelUpdate, StorageDriver,
    copy_file_payload,
};
use async_trait::async_trait;
use basalt_core::{Result, Snapshot, StorageError, Volume};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub struct RemoteFsDriver {
    host: String,
    mount_dir: PathBuf,
    /// Snapshot id -> origin volume id.
    snapshots: Mutex<HashMap<Uuid, Uuid>>,
}

impl RemoteFsDriver {
    pub fn new(host: impl Into<String>, mount_dir: PathBuf) -> Self {
        Self {
            host: host.into(),
            mount_dir,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn volume_path(&self, volume_id: &Uuid) -> PathBuf {
        self.mount_dir.join(format!("volume-{volume_id}"))
    }

    fn snapshot_file(&self, snapshot_id: &Uuid) -> PathBuf {
        self.mount_dir.join(format!("snapshot-{snapshot_id}"))
    }
}

#[async_trait]
impl StorageDriver for RemoteFsDriver {
    fn driver_kind(&self) -> DriverKind {
        DriverKind::RemoteFs
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn check_setup(&self) -> Result<()> {
        fs::create_dir_all(&self.mount_dir).await?;
        Ok(())
    }

    async fn create_volume(&self, volume: &Volume) -> Result<Option<ModelUpdate>> {
        fs::File::create(self.volume_path(&volume.backend_id())).await?;
        info!(volume_id = %volume.id, "remotefs volume file created");
        Ok(Some(ModelUpdate {
            provider_location: Some(format!("{}:{}", self.host, self.mount_dir.display())),
        }))
    }

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<Option<ModelUpdate>> {
        let update = self.create_volume(volume).await?;
        copy_file_payload(
            &self.snapshot_file(&snapshot.id),
            &self.volume_path(&volume.backend_id()),
        )
        .await?;
        Ok(update)
    }

    async fn create_cloned_volume(
        &self,
        volume: &Volume,
        source: &Volume,
    ) -> Result<Option<ModelUpdate>> {
        let update = self.create_volume(volume).await?;
        copy_file_payload(
            &self.volume_path(&source.backend_id()),
            &self.volume_path(&volume.backend_id()),
        )
        .await?;
        Ok(update)
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<()> {
        let id = volume.backend_id();
        {
            let snapshots = self.snapshots.lock().await;
            if snapshots.values().any(|origin| *origin == id) {
                return Err(StorageError::VolumeIsBusy {
                    volume_id: volume.id,
                });
            }
        }
        let path = self.volume_path(&id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn create_snapshot(&self, volume: &Volume, snapshot: &Snapshot) -> Result<()> {
        let id = volume.backend_id();
        copy_file_payload(&self.volume_path(&id), &self.snapshot_file(&snapshot.id)).await?;
        self.snapshots.lock().await.insert(snapshot.id, id);
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.snapshot_file(&snapshot.id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        self.snapshots.lock().await.remove(&snapshot.id);
        Ok(())
    }

    async fn extend_volume(&self, _volume: &Volume, _new_size_gb: u64) -> Result<()> {
        // Files on the share are thin; growth is a record-level change.
        Ok(())
    }

    async fn migrate_volume(
        &self,
        _volume: &Volume,
        _target: &DriverTarget,
    ) -> Result<(bool, Option<ModelUpdate>)> {
        Ok((false, None))
    }

    async fn initialize_connection(
        &self,
        volume: &Volume,
        _connector: &Connector,
    ) -> Result<ConnectionInfo> {
        Ok(ConnectionInfo {
            driver_volume_type: "remotefs",
            device_path: self.volume_path(&volume.backend_id()),
            target_iqn: None,
            target_lun: None,
        })
    }

    async fn terminate_connection(&self, _volume: &Volume, _connector: &Connector) -> Result<()> {
        Ok(())
    }

    async fn attach_volume(&self, volume: &Volume) -> Result<PathBuf> {
        let path = self.volume_path(&volume.backend_id());
        if !path.exists() {
            return Err(StorageError::DriverError {
                operation: "attach_volume".to_string(),
                message: format!("volume file {} missing", volume.id),
            });
        }
        Ok(path)
    }

    async fn detach_volume(&self, _volume: &Volume) -> Result<()> {
        Ok(())
    }

    fn local_path(&self, volume: &Volume) -> PathBuf {
        self.volume_path(&volume.backend_id())
    }
}
