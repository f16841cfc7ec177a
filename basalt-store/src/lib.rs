//! The authoritative record store for volumes, snapshots, backups and
//! service heartbeats. In-memory tables with JSON snapshot persistence;
//! all reads are soft-delete aware and the manager-facing mutations are
//! atomic under one write lock.

use basalt_core::{
    AttachStatus, Backup, BackupStatus, Result, ServiceRecord, Snapshot, SnapshotStatus,
    StorageError, Volume, VolumeStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    volumes: HashMap<Uuid, Volume>,
    snapshots: HashMap<Uuid, Snapshot>,
    backups: HashMap<Uuid, Backup>,
    services: HashMap<Uuid, ServiceRecord>,
}

pub struct RecordStore {
    state: Arc<RwLock<StoreState>>,
    state_file: Option<PathBuf>,
}

impl RecordStore {
    /// A store that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            state_file: None,
        }
    }

    /// A store persisted as a JSON snapshot at `state_file`.
    pub fn with_state_file(state_file: PathBuf) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            state_file: Some(state_file),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(path).await?;
        let loaded: StoreState = serde_json::from_str(&content)?;
        *self.state.write().await = loaded;
        Ok(())
    }

    async fn save(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(state)?;
        fs::write(path, content).await?;
        Ok(())
    }

    // ---- volumes ----

    pub async fn volume_create(&self, volume: Volume) -> Result<Volume> {
        let mut state = self.state.write().await;
        state.volumes.insert(volume.id, volume.clone());
        self.save(&state).await?;
        debug!(volume_id = %volume.id, "volume record created");
        Ok(volume)
    }

    pub async fn volume_get(&self, id: &Uuid) -> Result<Volume> {
        let state = self.state.read().await;
        state
            .volumes
            .get(id)
            .filter(|v| !v.deleted)
            .cloned()
            .ok_or(StorageError::VolumeNotFound { volume_id: *id })
    }

    /// Point lookup that also returns soft-deleted rows.
    pub async fn volume_get_include_deleted(&self, id: &Uuid) -> Result<Volume> {
        let state = self.state.read().await;
        state
            .volumes
            .get(id)
            .cloned()
            .ok_or(StorageError::VolumeNotFound { volume_id: *id })
    }

    pub async fn volume_get_all(&self) -> Vec<Volume> {
        let state = self.state.read().await;
        state.volumes.values().filter(|v| !v.deleted).cloned().collect()
    }

    pub async fn volume_get_all_by_host(&self, host: &str) -> Vec<Volume> {
        let state = self.state.read().await;
        state
            .volumes
            .values()
            .filter(|v| !v.deleted)
            .filter(|v| v.host_only().as_deref() == Some(host))
            .cloned()
            .collect()
    }

    /// Apply `mutate` to the volume under the write lock and persist.
    pub async fn volume_update<F>(&self, id: &Uuid, mutate: F) -> Result<Volume>
    where
        F: FnOnce(&mut Volume),
    {
        let mut state = self.state.write().await;
        let volume = state
            .volumes
            .get_mut(id)
            .filter(|v| !v.deleted)
            .ok_or(StorageError::VolumeNotFound { volume_id: *id })?;
        mutate(volume);
        volume.updated_at = Utc::now();
        let updated = volume.clone();
        self.save(&state).await?;
        Ok(updated)
    }

    /// Soft delete: the row stays readable via `volume_get_include_deleted`
    /// and keeps participating in windowed queries through `deleted_at`.
    pub async fn volume_destroy(&self, id: &Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let volume = state
            .volumes
            .get_mut(id)
            .filter(|v| !v.deleted)
            .ok_or(StorageError::VolumeNotFound { volume_id: *id })?;
        volume.status = VolumeStatus::Deleted;
        volume.deleted = true;
        volume.deleted_at = Some(Utc::now());
        volume.updated_at = Utc::now();
        self.save(&state).await?;
        debug!(volume_id = %id, "volume record destroyed");
        Ok(())
    }

    /// Atomic attachment: status, attach_status, mountpoint and the
    /// attachment target are updated as one group, never partially.
    pub async fn volume_attached(
        &self,
        id: &Uuid,
        instance_uuid: Option<Uuid>,
        attached_host: Option<String>,
        mountpoint: &str,
    ) -> Result<Volume> {
        let mut state = self.state.write().await;
        let volume = state
            .volumes
            .get_mut(id)
            .filter(|v| !v.deleted)
            .ok_or(StorageError::VolumeNotFound { volume_id: *id })?;
        volume.status = VolumeStatus::InUse;
        volume.attach_status = AttachStatus::Attached;
        volume.mountpoint = Some(mountpoint.to_string());
        volume.instance_uuid = instance_uuid;
        volume.attached_host = attached_host;
        volume.updated_at = Utc::now();
        let updated = volume.clone();
        self.save(&state).await?;
        Ok(updated)
    }

    /// Atomic detachment: the inverse field group of `volume_attached`.
    pub async fn volume_detached(&self, id: &Uuid) -> Result<Volume> {
        let mut state = self.state.write().await;
        let volume = state
            .volumes
            .get_mut(id)
            .filter(|v| !v.deleted)
            .ok_or(StorageError::VolumeNotFound { volume_id: *id })?;
        volume.status = VolumeStatus::Available;
        volume.attach_status = AttachStatus::Detached;
        volume.mountpoint = None;
        volume.instance_uuid = None;
        volume.attached_host = None;
        volume.updated_at = Utc::now();
        let updated = volume.clone();
        self.save(&state).await?;
        Ok(updated)
    }

    pub async fn volume_admin_metadata_update(
        &self,
        id: &Uuid,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.volume_update(id, |v| {
            v.admin_metadata.insert(key.to_string(), value.to_string());
        })
        .await?;
        Ok(())
    }

    pub async fn volume_admin_metadata_delete(&self, id: &Uuid, key: &str) -> Result<()> {
        self.volume_update(id, |v| {
            v.admin_metadata.remove(key);
        })
        .await?;
        Ok(())
    }

    /// Volumes active inside `[begin, end]`: created no later than `end`
    /// and not deleted before `begin`. Ascending by creation time, each
    /// with its snapshots (same window rule applied to the snapshots).
    pub async fn volume_get_active_by_window(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(Volume, Vec<Snapshot>)> {
        let state = self.state.read().await;
        let mut volumes: Vec<Volume> = state
            .volumes
            .values()
            .filter(|v| in_window(v.created_at, v.deleted_at, begin, end))
            .cloned()
            .collect();
        volumes.sort_by_key(|v| v.created_at);
        volumes
            .into_iter()
            .map(|volume| {
                let mut snaps: Vec<Snapshot> = state
                    .snapshots
                    .values()
                    .filter(|s| s.volume_id == volume.id)
                    .filter(|s| in_window(s.created_at, s.deleted_at, begin, end))
                    .cloned()
                    .collect();
                snaps.sort_by_key(|s| s.created_at);
                (volume, snaps)
            })
            .collect()
    }

    // ---- snapshots ----

    pub async fn snapshot_create(&self, snapshot: Snapshot) -> Result<Snapshot> {
        let mut state = self.state.write().await;
        state.snapshots.insert(snapshot.id, snapshot.clone());
        self.save(&state).await?;
        Ok(snapshot)
    }

    pub async fn snapshot_get(&self, id: &Uuid) -> Result<Snapshot> {
        let state = self.state.read().await;
        state
            .snapshots
            .get(id)
            .filter(|s| !s.deleted)
            .cloned()
            .ok_or(StorageError::SnapshotNotFound { snapshot_id: *id })
    }

    pub async fn snapshot_update<F>(&self, id: &Uuid, mutate: F) -> Result<Snapshot>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut state = self.state.write().await;
        let snapshot = state
            .snapshots
            .get_mut(id)
            .filter(|s| !s.deleted)
            .ok_or(StorageError::SnapshotNotFound { snapshot_id: *id })?;
        mutate(snapshot);
        let updated = snapshot.clone();
        self.save(&state).await?;
        Ok(updated)
    }

    pub async fn snapshot_destroy(&self, id: &Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let snapshot = state
            .snapshots
            .get_mut(id)
            .filter(|s| !s.deleted)
            .ok_or(StorageError::SnapshotNotFound { snapshot_id: *id })?;
        snapshot.status = SnapshotStatus::Deleted;
        snapshot.deleted = true;
        snapshot.deleted_at = Some(Utc::now());
        self.save(&state).await?;
        Ok(())
    }

    /// Non-deleted snapshots of one volume.
    pub async fn snapshot_get_all_for_volume(&self, volume_id: &Uuid) -> Vec<Snapshot> {
        let state = self.state.read().await;
        state
            .snapshots
            .values()
            .filter(|s| !s.deleted && s.volume_id == *volume_id)
            .cloned()
            .collect()
    }

    // ---- backups ----

    pub async fn backup_create(&self, backup: Backup) -> Result<Backup> {
        let mut state = self.state.write().await;
        state.backups.insert(backup.id, backup.clone());
        self.save(&state).await?;
        Ok(backup)
    }

    pub async fn backup_get(&self, id: &Uuid) -> Result<Backup> {
        let state = self.state.read().await;
        state
            .backups
            .get(id)
            .filter(|b| !b.deleted)
            .cloned()
            .ok_or(StorageError::BackupNotFound { backup_id: *id })
    }

    pub async fn backup_update<F>(&self, id: &Uuid, mutate: F) -> Result<Backup>
    where
        F: FnOnce(&mut Backup),
    {
        let mut state = self.state.write().await;
        let backup = state
            .backups
            .get_mut(id)
            .filter(|b| !b.deleted)
            .ok_or(StorageError::BackupNotFound { backup_id: *id })?;
        mutate(backup);
        let updated = backup.clone();
        self.save(&state).await?;
        Ok(updated)
    }

    pub async fn backup_destroy(&self, id: &Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let backup = state
            .backups
            .get_mut(id)
            .filter(|b| !b.deleted)
            .ok_or(StorageError::BackupNotFound { backup_id: *id })?;
        backup.status = BackupStatus::Deleted;
        backup.deleted = true;
        backup.deleted_at = Some(Utc::now());
        self.save(&state).await?;
        Ok(())
    }

    // ---- service records ----

    pub async fn service_register(
        &self,
        host: &str,
        topic: &str,
        availability_zone: &str,
    ) -> Result<ServiceRecord> {
        let record = ServiceRecord {
            id: Uuid::new_v4(),
            host: host.to_string(),
            topic: topic.to_string(),
            availability_zone: availability_zone.to_string(),
            disabled: false,
            updated_at: Utc::now(),
        };
        let mut state = self.state.write().await;
        state.services.insert(record.id, record.clone());
        self.save(&state).await?;
        Ok(record)
    }

    pub async fn service_heartbeat(&self, id: &Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(service) = state.services.get_mut(id) {
            service.updated_at = Utc::now();
        }
        self.save(&state).await?;
        Ok(())
    }

    pub async fn service_set_disabled(&self, id: &Uuid, disabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(service) = state.services.get_mut(id) {
            service.disabled = disabled;
        }
        self.save(&state).await?;
        Ok(())
    }

    pub async fn service_get_all_by_topic(&self, topic: &str) -> Vec<ServiceRecord> {
        let state = self.state.read().await;
        state
            .services
            .values()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect()
    }
}

fn in_window(
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    created_at <= end && deleted_at.map_or(true, |d| d >= begin)
}
