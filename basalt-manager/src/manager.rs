//! The per-host volume manager. Receives casts from the API tier,
//! drives the storage driver, and lands every outcome in the record
//! store. Cast handlers never panic the host loop; failures become
//! error statuses on the affected records.

use basalt_core::{
    AttachMode, AttachStatus, BackupStatus, Notification, Notifier, Result, SnapshotStatus,
    StorageError, Volume, VolumeStatus, admin_keys,
};
use basalt_driver::{BackupService, DriverTarget, ImageService, ModelUpdate, StorageDriver};
use basalt_quota::{QuotaDeltas, QuotaEngine, Reservation};
use basalt_rpc::{CallReply, CallRequest, MessageBus, VolumeRequest};
use basalt_store::RecordStore;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// Migration target records carry this prefix in `migration_status` so
/// their deletion never touches project quota.
const MIGRATION_TARGET_PREFIX: &str = "target:";

pub struct VolumeManager {
    host: String,
    driver: Arc<dyn StorageDriver>,
    store: Arc<RecordStore>,
    quota: Arc<QuotaEngine>,
    notifier: Arc<dyn Notifier>,
    image_service: Arc<dyn ImageService>,
    backup_service: Arc<dyn BackupService>,
    bus: Arc<MessageBus>,
    scheduler: Arc<dyn Scheduler>,
    max_create_attempts: u32,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl VolumeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: impl Into<String>,
        driver: Arc<dyn StorageDriver>,
        store: Arc<RecordStore>,
        quota: Arc<QuotaEngine>,
        notifier: Arc<dyn Notifier>,
        image_service: Arc<dyn ImageService>,
        backup_service: Arc<dyn BackupService>,
        bus: Arc<MessageBus>,
        scheduler: Arc<dyn Scheduler>,
        max_create_attempts: u32,
        poll_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            driver,
            store,
            quota,
            notifier,
            image_service,
            backup_service,
            bus,
            scheduler,
            max_create_attempts,
            poll_attempts,
            poll_interval,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn notify(&self, event_type: &str, volume: &Volume) {
        self.notifier
            .notify(Notification::new(
                event_type,
                json!({
                    "volume_id": volume.id,
                    "project_id": volume.project_id,
                    "user_id": volume.user_id,
                    "status": volume.status.to_string(),
                    "size": volume.size,
                    "host": volume.host,
                    "created_at": volume.created_at,
                }),
            ))
            .await;
    }

    async fn notify_snapshot(&self, event_type: &str, snapshot_id: &Uuid, volume_id: &Uuid) {
        self.notifier
            .notify(Notification::new(
                event_type,
                json!({
                    "snapshot_id": snapshot_id,
                    "volume_id": volume_id,
                }),
            ))
            .await;
    }

    /// Recover in-flight work left behind by a previous run of this host.
    pub async fn init_host(&self) -> Result<()> {
        self.driver.check_setup().await?;

        let volumes = self.store.volume_get_all_by_host(&self.host).await;
        info!(host = %self.host, count = volumes.len(), "resuming host volumes");
        for volume in volumes {
            match volume.status {
                // An interrupted image download leaves a half-written
                // volume; there is nothing to resume.
                VolumeStatus::Downloading => {
                    self.store
                        .volume_update(&volume.id, |v| v.status = VolumeStatus::Error)
                        .await?;
                }
                VolumeStatus::Deleting => {
                    info!(volume_id = %volume.id, "re-driving interrupted delete");
                    if let Err(e) = self.delete_volume(&volume.id).await {
                        warn!(volume_id = %volume.id, error = %e, "resumed delete failed");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Entry point for the host loop; one cast envelope at a time.
    pub async fn dispatch(&self, request: VolumeRequest) -> Result<()> {
        match request {
            VolumeRequest::CreateVolume {
                volume_id,
                reservation,
                image_id,
                allow_reschedule,
                scheduled_hosts,
                retry_count,
            } => {
                self.create_volume(
                    &volume_id,
                    reservation,
                    image_id,
                    allow_reschedule,
                    scheduled_hosts,
                    retry_count,
                )
                .await
            }
            VolumeRequest::DeleteVolume { volume_id } => self.delete_volume(&volume_id).await,
            VolumeRequest::CreateSnapshot {
                volume_id,
                snapshot_id,
                reservation,
            } => self.create_snapshot(&volume_id, &snapshot_id, reservation).await,
            VolumeRequest::DeleteSnapshot { snapshot_id } => {
                self.delete_snapshot(&snapshot_id).await
            }
            VolumeRequest::AttachVolume {
                volume_id,
                instance_uuid,
                host_name,
                mountpoint,
                mode,
            } => {
                self.attach_volume(&volume_id, instance_uuid, host_name, &mountpoint, mode)
                    .await
            }
            VolumeRequest::DetachVolume { volume_id } => self.detach_volume(&volume_id).await,
            VolumeRequest::ExtendVolume {
                volume_id,
                new_size,
                reservation,
            } => self.extend_volume(&volume_id, new_size, reservation).await,
            VolumeRequest::MigrateVolume {
                volume_id,
                dest_host,
            } => self.migrate_volume(&volume_id, &dest_host).await,
            VolumeRequest::CopyVolumeToImage {
                volume_id,
                image_id,
            } => self.copy_volume_to_image(&volume_id, &image_id).await,
            VolumeRequest::CreateBackup {
                backup_id,
                volume_id,
            } => self.create_backup(&backup_id, &volume_id).await,
            VolumeRequest::RestoreBackup {
                backup_id,
                volume_id,
            } => self.restore_backup(&backup_id, &volume_id).await,
            VolumeRequest::DeleteBackup { backup_id } => self.delete_backup(&backup_id).await,
        }
    }

    pub async fn handle_call(&self, request: CallRequest) -> Result<CallReply> {
        match request {
            CallRequest::GetDevicePath { volume_id } => {
                let volume = self.store.volume_get(&volume_id).await?;
                Ok(CallReply::DevicePath(self.driver.local_path(&volume)))
            }
            CallRequest::GetDriverInfo => Ok(CallReply::DriverInfo {
                kind: self.driver.driver_kind(),
                host: self.host.clone(),
            }),
            CallRequest::Ping => Ok(CallReply::Pong),
        }
    }

    // ---- create ----

    async fn create_volume(
        &self,
        volume_id: &Uuid,
        reservation: Option<Reservation>,
        image_id: Option<String>,
        allow_reschedule: bool,
        scheduled_hosts: Vec<String>,
        retry_count: u32,
    ) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        self.notify("volume.create.start", &volume).await;

        match self.do_create(&volume, image_id.as_deref()).await {
            Ok(model_update) => {
                // Resolve the reservation before any fallible store write
                // so an update failure cannot strand held quota.
                if let Some(reservation) = reservation {
                    self.quota.commit(reservation).await;
                }
                let updated = self
                    .store
                    .volume_update(volume_id, |v| {
                        if let Some(update) = &model_update {
                            if update.provider_location.is_some() {
                                v.provider_location = update.provider_location.clone();
                            }
                        }
                        v.status = VolumeStatus::Available;
                        v.launched_at = Some(Utc::now());
                    })
                    .await?;
                self.notify("volume.create.end", &updated).await;
                info!(volume_id = %volume_id, host = %self.host, "volume created");
                Ok(())
            }
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "volume create failed");
                // Only image-sourced creates without explicit placement may
                // move to another host.
                if allow_reschedule && retry_count + 1 < self.max_create_attempts {
                    match self.scheduler.select_host(&scheduled_hosts).await {
                        Ok(next_host) => {
                            return self
                                .reschedule_create(
                                    volume_id,
                                    reservation,
                                    image_id,
                                    scheduled_hosts,
                                    retry_count,
                                    next_host,
                                )
                                .await;
                        }
                        Err(schedule_err) => {
                            warn!(volume_id = %volume_id, error = %schedule_err, "no host to reschedule to");
                        }
                    }
                }
                if let Some(reservation) = reservation {
                    self.quota.rollback(reservation).await;
                }
                let updated = self
                    .store
                    .volume_update(volume_id, |v| v.status = VolumeStatus::Error)
                    .await?;
                self.notify("volume.create.end", &updated).await;
                Err(e)
            }
        }
    }

    async fn do_create(
        &self,
        volume: &Volume,
        image_id: Option<&str>,
    ) -> Result<Option<ModelUpdate>> {
        if let Some(snapshot_id) = &volume.snapshot_id {
            let snapshot = self.store.snapshot_get(snapshot_id).await?;
            return self
                .driver
                .create_volume_from_snapshot(volume, &snapshot)
                .await;
        }
        if let Some(source_volid) = &volume.source_volid {
            let source = self.store.volume_get(source_volid).await?;
            return self.driver.create_cloned_volume(volume, &source).await;
        }
        if let Some(image_id) = image_id {
            let (update, cloned) = self.driver.clone_image(volume, None).await?;
            if cloned {
                return Ok(update);
            }
            let update = self.driver.create_volume(volume).await?;
            self.store
                .volume_update(&volume.id, |v| v.status = VolumeStatus::Downloading)
                .await?;
            self.driver
                .copy_image_to_volume(volume, self.image_service.as_ref(), image_id)
                .await?;
            return Ok(update);
        }
        self.driver.create_volume(volume).await
    }

    async fn reschedule_create(
        &self,
        volume_id: &Uuid,
        reservation: Option<Reservation>,
        image_id: Option<String>,
        mut scheduled_hosts: Vec<String>,
        retry_count: u32,
        next_host: String,
    ) -> Result<()> {
        info!(volume_id = %volume_id, next_host = %next_host, retry = retry_count + 1, "rescheduling create");
        if let Err(e) = self
            .store
            .volume_update(volume_id, |v| {
                v.status = VolumeStatus::Creating;
                v.host = Some(next_host.clone());
                v.provider_location = None;
            })
            .await
        {
            if let Some(reservation) = reservation {
                self.quota.rollback(reservation).await;
            }
            return Err(e);
        }
        scheduled_hosts.push(basalt_core::Host::parse(&next_host).host);
        let cast = self
            .bus
            .cast(
                &next_host,
                VolumeRequest::CreateVolume {
                    volume_id: *volume_id,
                    reservation,
                    image_id,
                    allow_reschedule: true,
                    scheduled_hosts,
                    retry_count: retry_count + 1,
                },
            )
            .await;
        if let Err(mut failure) = cast {
            warn!(volume_id = %volume_id, error = %failure.error, "reschedule dispatch failed");
            if let Some(reservation) = failure.request.take_reservation() {
                self.quota.rollback(reservation).await;
            }
            let _ = self
                .store
                .volume_update(volume_id, |v| v.status = VolumeStatus::Error)
                .await;
            return Err(failure.error);
        }
        Ok(())
    }

    // ---- delete ----

    async fn delete_volume(&self, volume_id: &Uuid) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        self.notify("volume.delete.start", &volume).await;

        match self.driver.delete_volume(&volume).await {
            Ok(()) => {}
            // Backend snapshots still depend on the volume; surface it as
            // available again rather than wedging the record.
            Err(StorageError::VolumeIsBusy { .. }) => {
                let updated = self
                    .store
                    .volume_update(volume_id, |v| v.status = VolumeStatus::Available)
                    .await?;
                warn!(volume_id = %volume_id, "volume busy, delete deferred");
                self.notify("volume.delete.end", &updated).await;
                return Ok(());
            }
            Err(e) => {
                self.store
                    .volume_update(volume_id, |v| v.status = VolumeStatus::ErrorDeleting)
                    .await?;
                return Err(e);
            }
        }

        let is_migration_target = volume
            .migration_status
            .as_deref()
            .is_some_and(|s| s.starts_with(MIGRATION_TARGET_PREFIX));
        if !is_migration_target {
            let release = self
                .quota
                .reserve(
                    &volume.project_id,
                    QuotaDeltas::volume(volume.size as i64).negated(),
                )
                .await?;
            self.quota.commit(release).await;
        }

        self.store.volume_destroy(volume_id).await?;
        self.notify("volume.delete.end", &volume).await;
        info!(volume_id = %volume_id, "volume deleted");
        Ok(())
    }

    // ---- snapshots ----

    async fn create_snapshot(
        &self,
        volume_id: &Uuid,
        snapshot_id: &Uuid,
        reservation: Option<Reservation>,
    ) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        let snapshot = self.store.snapshot_get(snapshot_id).await?;
        self.notify_snapshot("snapshot.create.start", snapshot_id, volume_id).await;

        let result = match self.driver.create_snapshot(&volume, &snapshot).await {
            Ok(()) => {
                if let Some(reservation) = reservation {
                    self.quota.commit(reservation).await;
                }
                self.store
                    .snapshot_update(snapshot_id, |s| s.status = SnapshotStatus::Available)
                    .await?;
                info!(snapshot_id = %snapshot_id, volume_id = %volume_id, "snapshot created");
                Ok(())
            }
            Err(e) => {
                if let Some(reservation) = reservation {
                    self.quota.rollback(reservation).await;
                }
                self.store
                    .snapshot_update(snapshot_id, |s| s.status = SnapshotStatus::Error)
                    .await?;
                Err(e)
            }
        };
        self.notify_snapshot("snapshot.create.end", snapshot_id, volume_id).await;
        result
    }

    async fn delete_snapshot(&self, snapshot_id: &Uuid) -> Result<()> {
        let snapshot = self.store.snapshot_get(snapshot_id).await?;
        self.notify_snapshot("snapshot.delete.start", snapshot_id, &snapshot.volume_id)
            .await;

        match self.driver.delete_snapshot(&snapshot).await {
            Ok(()) => {}
            Err(StorageError::SnapshotIsBusy { .. }) => {
                self.store
                    .snapshot_update(snapshot_id, |s| s.status = SnapshotStatus::Available)
                    .await?;
                warn!(snapshot_id = %snapshot_id, "snapshot busy, delete deferred");
                return Ok(());
            }
            Err(e) => {
                self.store
                    .snapshot_update(snapshot_id, |s| s.status = SnapshotStatus::ErrorDeleting)
                    .await?;
                return Err(e);
            }
        }

        let release = self
            .quota
            .reserve(
                &snapshot.project_id,
                QuotaDeltas::snapshot(snapshot.volume_size as i64).negated(),
            )
            .await?;
        self.quota.commit(release).await;
        self.store.snapshot_destroy(snapshot_id).await?;
        self.notify_snapshot("snapshot.delete.end", snapshot_id, &snapshot.volume_id)
            .await;
        info!(snapshot_id = %snapshot_id, "snapshot deleted");
        Ok(())
    }

    // ---- attach / detach ----

    async fn attach_volume(
        &self,
        volume_id: &Uuid,
        instance_uuid: Option<Uuid>,
        host_name: Option<String>,
        mountpoint: &str,
        mode: AttachMode,
    ) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;

        // Record the attempted mode before any checks so an operator can
        // see what was asked for even when the attach is refused.
        self.store
            .volume_admin_metadata_update(volume_id, admin_keys::ATTACHED_MODE, mode.as_str())
            .await?;

        let readonly = volume
            .admin_metadata
            .get(admin_keys::READONLY)
            .is_some_and(|v| v == "True");
        if readonly && mode == AttachMode::ReadWrite {
            // The attempted mode stays in admin metadata as an audit trail.
            self.store
                .volume_update(volume_id, |v| v.status = VolumeStatus::ErrorAttaching)
                .await?;
            return Err(StorageError::InvalidVolumeAttachMode {
                mode: mode.as_str().to_string(),
                volume_id: *volume_id,
            });
        }

        self.store
            .volume_attached(volume_id, instance_uuid, host_name, mountpoint)
            .await?;
        info!(volume_id = %volume_id, mode = %mode, "volume attached");
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &Uuid) -> Result<()> {
        self.store.volume_detached(volume_id).await?;
        // The readonly flag is an operator setting and survives the detach;
        // only the per-attachment mode goes away.
        self.store
            .volume_admin_metadata_delete(volume_id, admin_keys::ATTACHED_MODE)
            .await?;
        info!(volume_id = %volume_id, "volume detached");
        Ok(())
    }

    // ---- extend ----

    async fn extend_volume(
        &self,
        volume_id: &Uuid,
        new_size: u64,
        reservation: Option<Reservation>,
    ) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;

        match self.driver.extend_volume(&volume, new_size).await {
            Ok(()) => {
                if let Some(reservation) = reservation {
                    self.quota.commit(reservation).await;
                }
                self.store
                    .volume_update(volume_id, |v| {
                        v.size = new_size;
                        v.status = VolumeStatus::Available;
                    })
                    .await?;
                info!(volume_id = %volume_id, new_size, "volume extended");
                Ok(())
            }
            Err(e) => {
                if let Some(reservation) = reservation {
                    self.quota.rollback(reservation).await;
                }
                self.store
                    .volume_update(volume_id, |v| v.status = VolumeStatus::ErrorExtending)
                    .await?;
                Err(e)
            }
        }
    }

    // ---- migrate ----

    async fn migrate_volume(&self, volume_id: &Uuid, dest_host: &str) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        self.store
            .volume_update(volume_id, |v| {
                v.migration_status = Some("migrating".to_string())
            })
            .await?;

        let result = self.do_migrate(&volume, dest_host).await;
        match &result {
            Ok(()) => {
                self.store
                    .volume_update(volume_id, |v| v.migration_status = None)
                    .await?;
                info!(volume_id = %volume_id, dest_host, "volume migrated");
            }
            Err(e) => {
                error!(volume_id = %volume_id, dest_host, error = %e, "migration failed");
                self.store
                    .volume_update(volume_id, |v| v.migration_status = None)
                    .await?;
            }
        }
        result
    }

    async fn do_migrate(&self, volume: &Volume, dest_host: &str) -> Result<()> {
        let info = self.bus.call(dest_host, CallRequest::GetDriverInfo).await?;
        let CallReply::DriverInfo { kind, host } = info else {
            return Err(StorageError::MigrationError {
                volume_id: volume.id,
                reason: "unexpected reply to driver info call".to_string(),
            });
        };
        let target = DriverTarget {
            host: host.clone(),
            kind,
        };

        // Let the source driver try a backend-native move first.
        let (moved, model_update) = self.driver.migrate_volume(volume, &target).await?;
        if moved {
            self.store
                .volume_update(&volume.id, |v| {
                    v.host = Some(dest_host.to_string());
                    if let Some(update) = &model_update {
                        if update.provider_location.is_some() {
                            v.provider_location = update.provider_location.clone();
                        }
                    }
                })
                .await?;
            return Ok(());
        }

        self.migrate_volume_generic(volume, dest_host).await
    }

    /// Host-agnostic fallback: create a fresh volume on the destination,
    /// copy the payload over, delete the source backend volume, then point
    /// the original record at the destination. Any failure after the
    /// destination record exists tears the destination down and leaves the
    /// source untouched.
    async fn migrate_volume_generic(&self, volume: &Volume, dest_host: &str) -> Result<()> {
        let now = Utc::now();
        let target = Volume {
            id: Uuid::new_v4(),
            name_id: None,
            status: VolumeStatus::Creating,
            attach_status: AttachStatus::Detached,
            migration_status: Some(format!("{MIGRATION_TARGET_PREFIX}{}", volume.id)),
            host: Some(dest_host.to_string()),
            provider_location: None,
            snapshot_id: None,
            source_volid: None,
            instance_uuid: None,
            attached_host: None,
            mountpoint: None,
            launched_at: None,
            created_at: now,
            updated_at: now,
            deleted: false,
            deleted_at: None,
            ..volume.clone()
        };
        let target = self.store.volume_create(target).await?;

        // No reservation in the envelope: the capacity already belongs to
        // the original record.
        self.bus
            .cast(
                dest_host,
                VolumeRequest::CreateVolume {
                    volume_id: target.id,
                    reservation: None,
                    image_id: None,
                    allow_reschedule: false,
                    scheduled_hosts: Vec::new(),
                    retry_count: 0,
                },
            )
            .await?;

        match self.copy_to_migration_target(volume, &target.id, dest_host).await {
            Ok(new_location) => {
                self.driver.delete_volume(volume).await?;
                // The destination backend objects are named after the
                // interim id; the surviving record adopts it as its
                // backend identity so driver operations keep resolving.
                self.store
                    .volume_update(&volume.id, |v| {
                        v.host = Some(dest_host.to_string());
                        v.provider_location = new_location.clone();
                        v.name_id = Some(target.id);
                    })
                    .await?;
                self.store.volume_destroy(&target.id).await?;
                Ok(())
            }
            Err(e) => {
                // Destination teardown; failures here only get logged, the
                // original volume must stay intact either way.
                if let Err(cleanup) = self
                    .bus
                    .cast(dest_host, VolumeRequest::DeleteVolume { volume_id: target.id })
                    .await
                {
                    warn!(volume_id = %target.id, error = %cleanup.error, "migration target cleanup cast failed");
                    let _ = self.store.volume_destroy(&target.id).await;
                }
                Err(e)
            }
        }
    }

    async fn copy_to_migration_target(
        &self,
        volume: &Volume,
        target_id: &Uuid,
        dest_host: &str,
    ) -> Result<Option<String>> {
        // The destination create runs asynchronously on the other host
        // loop; poll the record until it settles.
        let mut created = self.store.volume_get(target_id).await?;
        let mut attempts = 0;
        while created.status == VolumeStatus::Creating {
            attempts += 1;
            if attempts > self.poll_attempts {
                return Err(StorageError::Timeout {
                    operation: "migration target create".to_string(),
                });
            }
            sleep(self.poll_interval).await;
            created = self.store.volume_get(target_id).await?;
        }
        if created.status != VolumeStatus::Available {
            return Err(StorageError::MigrationError {
                volume_id: volume.id,
                reason: format!("destination volume entered status {}", created.status),
            });
        }

        let reply = self
            .bus
            .call(dest_host, CallRequest::GetDevicePath { volume_id: *target_id })
            .await?;
        let CallReply::DevicePath(dest_path) = reply else {
            return Err(StorageError::MigrationError {
                volume_id: volume.id,
                reason: "unexpected reply to device path call".to_string(),
            });
        };

        let src_path = self.driver.local_path(volume);
        tokio::fs::copy(&src_path, &dest_path).await?;
        Ok(created.provider_location)
    }

    // ---- image upload ----

    async fn copy_volume_to_image(&self, volume_id: &Uuid, image_id: &str) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        let prior = if volume.has_attachment_target() {
            VolumeStatus::InUse
        } else {
            VolumeStatus::Available
        };
        self.store
            .volume_update(volume_id, |v| v.status = VolumeStatus::Uploading)
            .await?;

        let result = self
            .driver
            .copy_volume_to_image(&volume, self.image_service.as_ref(), image_id)
            .await;

        // The volume itself is unharmed whatever the upload did.
        self.store
            .volume_update(volume_id, |v| v.status = prior)
            .await?;
        if result.is_ok() {
            info!(volume_id = %volume_id, image_id, "volume uploaded to image");
        }
        result
    }

    // ---- backups ----

    async fn create_backup(&self, backup_id: &Uuid, volume_id: &Uuid) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        let backup = self.store.backup_get(backup_id).await?;
        self.notify("backup.create.start", &volume).await;

        let result = self
            .driver
            .backup_volume(&volume, &backup, self.backup_service.as_ref())
            .await;

        match &result {
            Ok(()) => {
                self.store
                    .backup_update(backup_id, |b| b.status = BackupStatus::Available)
                    .await?;
                info!(backup_id = %backup_id, volume_id = %volume_id, "backup created");
            }
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .backup_update(backup_id, |b| {
                        b.status = BackupStatus::Error;
                        b.fail_reason = Some(reason.clone());
                    })
                    .await?;
            }
        }
        let updated = self
            .store
            .volume_update(volume_id, |v| v.status = VolumeStatus::Available)
            .await?;
        self.notify("backup.create.end", &updated).await;
        result
    }

    async fn restore_backup(&self, backup_id: &Uuid, volume_id: &Uuid) -> Result<()> {
        let volume = self.store.volume_get(volume_id).await?;
        let backup = self.store.backup_get(backup_id).await?;
        self.notify("backup.restore.start", &volume).await;

        let result = self
            .driver
            .restore_backup(&volume, &backup, self.backup_service.as_ref())
            .await;

        let volume_status = if result.is_ok() {
            VolumeStatus::Available
        } else {
            VolumeStatus::ErrorRestoring
        };
        let updated = self
            .store
            .volume_update(volume_id, |v| v.status = volume_status)
            .await?;
        // The backup object is untouched by a failed restore.
        self.store
            .backup_update(backup_id, |b| b.status = BackupStatus::Available)
            .await?;
        self.notify("backup.restore.end", &updated).await;
        if result.is_ok() {
            info!(backup_id = %backup_id, volume_id = %volume_id, "backup restored");
        }
        result
    }

    async fn delete_backup(&self, backup_id: &Uuid) -> Result<()> {
        let backup = self.store.backup_get(backup_id).await?;
        match self.backup_service.delete(&backup).await {
            Ok(()) => {
                self.store.backup_destroy(backup_id).await?;
                info!(backup_id = %backup_id, "backup deleted");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .backup_update(backup_id, |b| {
                        b.status = BackupStatus::Error;
                        b.fail_reason = Some(reason.clone());
                    })
                    .await?;
                Err(e)
            }
        }
    }
}
