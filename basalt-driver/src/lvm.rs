//! LVM-backed driver exporting volumes over iSCSI targets.
//!
//! The volume group is modeled as a directory of thin logical volumes with
//! capacity accounting, which keeps the driver self-contained while
//! preserving the contract the manager depends on: capacity rejection,
//! busy-on-dependent-snapshot deletes, target allocation and the optimized
//! migration tie-break.

use crate::{
    ConnectionInfo, Connector, DriverKind, DriverTarget, ModelUpdate, StorageDriver,
    TargetAllocator, copy_file_payload, migration_declined,
};
use async_trait::async_trait;
use basalt_core::{Result, Snapshot, StorageError, Volume};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct LvmIscsiDriver {
    host: String,
    vg_name: String,
    vg_dir: PathBuf,
    capacity_gb: u64,
    allocations: Mutex<VgAllocations>,
    targets: Arc<TargetAllocator>,
}

#[derive(Default)]
struct VgAllocations {
    /// Logical volume sizes by volume id, in GB.
    volumes: HashMap<Uuid, u64>,
    /// Snapshot id -> (origin volume id, size in GB).
    snapshots: HashMap<Uuid, (Uuid, u64)>,
}

impl LvmIscsiDriver {
    pub fn new(
        host: impl Into<String>,
        vg_name: impl Into<String>,
        vg_dir: PathBuf,
        capacity_gb: u64,
        targets: Arc<TargetAllocator>,
    ) -> Self {
        Self {
            host: host.into(),
            vg_name: vg_name.into(),
            vg_dir,
            capacity_gb,
            allocations: Mutex::new(VgAllocations::default()),
            targets,
        }
    }

    fn lv_path(&self, volume_id: &Uuid) -> PathBuf {
        self.vg_dir.join(format!("volume-{volume_id}"))
    }

    fn snapshot_path(&self, snapshot_id: &Uuid) -> PathBuf {
        self.vg_dir.join(format!("snapshot-{snapshot_id}"))
    }

    fn provider_location(&self, target_id: u32) -> String {
        format!("{}:{}:{}", self.host, self.vg_name, target_id)
    }

    fn iqn(&self, volume_id: &Uuid) -> String {
        format!("iqn.2010-10.org.basalt:{}:volume-{volume_id}", self.host)
    }

    /// Reserve `size_gb` in the group or fail with a backend error.
    async fn allocate(&self, volume_id: Uuid, size_gb: u64) -> Result<()> {
        let mut allocations = self.allocations.lock().await;
        let used: u64 = allocations.volumes.values().sum::<u64>()
            + allocations.snapshots.values().map(|(_, s)| s).sum::<u64>();
        if used + size_gb > self.capacity_gb {
            return Err(StorageError::DriverError {
                operation: "create_volume".to_string(),
                message: format!(
                    "volume group {} out of space: {used} of {} GB allocated, {size_gb} GB requested",
                    self.vg_name, self.capacity_gb
                ),
            });
        }
        allocations.volumes.insert(volume_id, size_gb);
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for LvmIscsiDriver {
    fn driver_kind(&self) -> DriverKind {
        DriverKind::LvmIscsi
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn check_setup(&self) -> Result<()> {
        fs::create_dir_all(&self.vg_dir).await?;
        Ok(())
    }

    async fn create_volume(&self, volume: &Volume) -> Result<Option<ModelUpdate>> {
        let id = volume.backend_id();
        self.allocate(id, volume.size).await?;
        fs::File::create(self.lv_path(&id)).await?;
        let target_id = match self.targets.allocate(id).await {
            Ok(tid) => tid,
            Err(e) => {
                // Undo the allocation so a failed export does not leak space.
                self.allocations.lock().await.volumes.remove(&id);
                let _ = fs::remove_file(self.lv_path(&id)).await;
                return Err(e);
            }
        };
        info!(volume_id = %volume.id, vg = %self.vg_name, target_id, "lv created");
        Ok(Some(ModelUpdate {
            provider_location: Some(self.provider_location(target_id)),
        }))
    }

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<Option<ModelUpdate>> {
        let src = self.snapshot_path(&snapshot.id);
        if !src.exists() {
            return Err(StorageError::DriverError {
                operation: "create_volume_from_snapshot".to_string(),
                message: format!("snapshot lv {} missing", snapshot.id),
            });
        }
        let update = self.create_volume(volume).await?;
        copy_file_payload(&src, &self.lv_path(&volume.backend_id())).await?;
        Ok(update)
    }

    async fn create_cloned_volume(
        &self,
        volume: &Volume,
        source: &Volume,
    ) -> Result<Option<ModelUpdate>> {
        let src = self.lv_path(&source.backend_id());
        if !src.exists() {
            return Err(StorageError::DriverError {
                operation: "create_cloned_volume".to_string(),
                message: format!("source lv {} missing", source.id),
            });
        }
        let update = self.create_volume(volume).await?;
        copy_file_payload(&src, &self.lv_path(&volume.backend_id())).await?;
        Ok(update)
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<()> {
        let id = volume.backend_id();
        {
            let allocations = self.allocations.lock().await;
            let busy = allocations
                .snapshots
                .values()
                .any(|(origin, _)| *origin == id);
            if busy {
                warn!(volume_id = %volume.id, "delete refused, lv has dependent snapshots");
                return Err(StorageError::VolumeIsBusy {
                    volume_id: volume.id,
                });
            }
        }
        let path = self.lv_path(&id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        self.allocations.lock().await.volumes.remove(&id);
        self.targets.free(&id).await;
        info!(volume_id = %volume.id, "lv removed");
        Ok(())
    }

    async fn create_snapshot(&self, volume: &Volume, snapshot: &Snapshot) -> Result<()> {
        let origin = self.lv_path(&volume.backend_id());
        if !origin.exists() {
            return Err(StorageError::DriverError {
                operation: "create_snapshot".to_string(),
                message: format!("origin lv {} missing", volume.id),
            });
        }
        {
            let mut allocations = self.allocations.lock().await;
            allocations
                .snapshots
                .insert(snapshot.id, (volume.backend_id(), snapshot.volume_size));
        }
        copy_file_payload(&origin, &self.snapshot_path(&snapshot.id)).await?;
        debug!(snapshot_id = %snapshot.id, volume_id = %volume.id, "snapshot lv created");
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        self.allocations.lock().await.snapshots.remove(&snapshot.id);
        Ok(())
    }

    async fn extend_volume(&self, volume: &Volume, new_size_gb: u64) -> Result<()> {
        let id = volume.backend_id();
        let mut allocations = self.allocations.lock().await;
        let current = allocations.volumes.get(&id).copied().unwrap_or(volume.size);
        let delta = new_size_gb.saturating_sub(current);
        let used: u64 = allocations.volumes.values().sum::<u64>()
            + allocations.snapshots.values().map(|(_, s)| s).sum::<u64>();
        if used + delta > self.capacity_gb {
            return Err(StorageError::DriverError {
                operation: "extend_volume".to_string(),
                message: format!("volume group {} out of space", self.vg_name),
            });
        }
        allocations.volumes.insert(id, new_size_gb);
        Ok(())
    }

    async fn migrate_volume(
        &self,
        volume: &Volume,
        target: &DriverTarget,
    ) -> Result<(bool, Option<ModelUpdate>)> {
        // No location info, or location info we cannot parse: decline.
        let Some(location) = volume.provider_location.as_deref() else {
            return Ok((false, None));
        };
        let parts: Vec<&str> = location.split(':').collect();
        let [loc_host, _vg, target_id] = parts.as_slice() else {
            return Ok((false, None));
        };
        if *loc_host != self.host || target_id.parse::<u32>().is_err() {
            return Ok((false, None));
        }
        if migration_declined(volume, target, DriverKind::LvmIscsi, &self.host) {
            return Ok((false, None));
        }

        // Same host and driver: the lv stays where it is, only the pool
        // binding in the location changes.
        let target_id = self
            .targets
            .lookup(&volume.backend_id())
            .await
            .ok_or(StorageError::DriverError {
                operation: "migrate_volume".to_string(),
                message: format!("volume {} has no export", volume.id),
            })?;
        info!(volume_id = %volume.id, dest = %target.host, "optimized lvm migration");
        Ok((
            true,
            Some(ModelUpdate {
                provider_location: Some(self.provider_location(target_id)),
            }),
        ))
    }

    async fn initialize_connection(
        &self,
        volume: &Volume,
        _connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let id = volume.backend_id();
        let target_lun = self.targets.lookup(&id).await;
        Ok(ConnectionInfo {
            driver_volume_type: "iscsi",
            device_path: self.lv_path(&id),
            target_iqn: Some(self.iqn(&id)),
            target_lun,
        })
    }

    async fn terminate_connection(&self, _volume: &Volume, _connector: &Connector) -> Result<()> {
        Ok(())
    }

    async fn attach_volume(&self, volume: &Volume) -> Result<PathBuf> {
        let path = self.lv_path(&volume.backend_id());
        if !path.exists() {
            return Err(StorageError::DriverError {
                operation: "attach_volume".to_string(),
                message: format!("lv {} missing", volume.id),
            });
        }
        Ok(path)
    }

    async fn detach_volume(&self, _volume: &Volume) -> Result<()> {
        Ok(())
    }

    fn local_path(&self, volume: &Volume) -> PathBuf {
        self.lv_path(&volume.backend_id())
    }
}
