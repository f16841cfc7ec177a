//! API-tier orchestration: request validation, policy and quota
//! enforcement, record creation and dispatch to the owning host. No
//! driver work happens here; everything backend-bound goes out as a cast.

use basalt_core::{
    AttachMode, AttachStatus, GIB, Host, PolicyEngine, RequestContext, Result, ServiceConfig,
    Snapshot, SnapshotStatus, StorageError, Volume, VolumeStatus, policy_target,
};
use basalt_driver::ImageService;
use basalt_quota::{QuotaDeltas, QuotaEngine};
use basalt_rpc::{MessageBus, VolumeRequest};
use basalt_store::RecordStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// A configured volume type. A type with an encryption provider forces
/// an encryption key onto every volume created with it.
#[derive(Debug, Clone)]
pub struct VolumeType {
    pub id: String,
    pub encryption_provider: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub size: u64,
    pub snapshot_id: Option<Uuid>,
    pub source_volid: Option<Uuid>,
    pub image_id: Option<String>,
    pub availability_zone: Option<String>,
    pub volume_type_id: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Explicit placement; when unset the scheduler picks.
    pub host: Option<String>,
}

pub struct VolumeService {
    store: Arc<RecordStore>,
    quota: Arc<QuotaEngine>,
    bus: Arc<MessageBus>,
    policy: Arc<dyn PolicyEngine>,
    scheduler: Arc<dyn Scheduler>,
    image_service: Arc<dyn ImageService>,
    volume_types: HashMap<String, VolumeType>,
    config: ServiceConfig,
}

impl VolumeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RecordStore>,
        quota: Arc<QuotaEngine>,
        bus: Arc<MessageBus>,
        policy: Arc<dyn PolicyEngine>,
        scheduler: Arc<dyn Scheduler>,
        image_service: Arc<dyn ImageService>,
        volume_types: HashMap<String, VolumeType>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            quota,
            bus,
            policy,
            scheduler,
            image_service,
            volume_types,
            config,
        }
    }

    fn check_policy(&self, context: &RequestContext, action: &str) -> Result<()> {
        self.policy
            .enforce(context, action, &policy_target(context))
    }

    pub async fn get(&self, context: &RequestContext, volume_id: &Uuid) -> Result<Volume> {
        self.check_policy(context, "volume:get")?;
        self.store.volume_get(volume_id).await
    }

    pub async fn create(
        &self,
        context: &RequestContext,
        request: CreateVolumeRequest,
    ) -> Result<Volume> {
        self.check_policy(context, "volume:create")?;

        let sources = [
            request.snapshot_id.is_some(),
            request.source_volid.is_some(),
            request.image_id.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if sources > 1 {
            return Err(StorageError::InvalidInput {
                reason: "only one of snapshot, source volume or image may be specified"
                    .to_string(),
            });
        }
        if request.size == 0 {
            return Err(StorageError::InvalidInput {
                reason: "volume size must be at least 1 GB".to_string(),
            });
        }

        let mut source_zone = None;

        if let Some(id) = request.snapshot_id {
            let snapshot = self.store.snapshot_get(&id).await?;
            if snapshot.status != SnapshotStatus::Available {
                return Err(StorageError::InvalidSnapshot {
                    reason: "originating snapshot status must be available".to_string(),
                });
            }
            if request.size < snapshot.volume_size {
                return Err(StorageError::InvalidInput {
                    reason: format!(
                        "volume size {} GB cannot be smaller than snapshot size {} GB",
                        request.size, snapshot.volume_size
                    ),
                });
            }
            let parent = self.store.volume_get(&snapshot.volume_id).await?;
            source_zone = Some(parent.availability_zone.clone());
        }

        let source_volume = match request.source_volid {
            Some(id) => {
                let source = self.store.volume_get(&id).await?;
                if source.status != VolumeStatus::Available {
                    return Err(StorageError::InvalidVolume {
                        reason: "source volume must be available".to_string(),
                    });
                }
                if request.size < source.size {
                    return Err(StorageError::InvalidInput {
                        reason: format!(
                            "volume size {} GB cannot be smaller than source volume size {} GB",
                            request.size, source.size
                        ),
                    });
                }
                source_zone = Some(source.availability_zone.clone());
                Some(source)
            }
            None => None,
        };

        if let Some(image_id) = &request.image_id {
            let meta = self.image_service.show(image_id).await?;
            // Images are allocated at 1 GiB granularity.
            let image_gb = meta.size_bytes.div_ceil(GIB);
            if request.size < image_gb {
                return Err(StorageError::InvalidInput {
                    reason: format!(
                        "volume size {} GB is smaller than the image ({image_gb} GB rounded)",
                        request.size
                    ),
                });
            }
            if request.size < meta.min_disk_gb {
                return Err(StorageError::InvalidInput {
                    reason: format!(
                        "volume size {} GB is smaller than the image min_disk {} GB",
                        request.size, meta.min_disk_gb
                    ),
                });
            }
        }

        // Zone precedence: explicit, then the source's zone, then the
        // configured defaults. An explicit zone must agree with the source.
        let availability_zone = match (&request.availability_zone, &source_zone) {
            (Some(explicit), Some(from_source)) if explicit != from_source => {
                return Err(StorageError::InvalidInput {
                    reason: format!(
                        "availability zone {explicit} does not match the source zone {from_source}"
                    ),
                });
            }
            (Some(explicit), _) => explicit.clone(),
            (None, Some(from_source)) => from_source.clone(),
            (None, None) => self
                .config
                .default_availability_zone
                .clone()
                .unwrap_or_else(|| self.config.storage_availability_zone.clone()),
        };

        let encryption_key_id = match &request.volume_type_id {
            Some(type_id) => {
                let volume_type = self.volume_types.get(type_id).ok_or_else(|| {
                    StorageError::InvalidInput {
                        reason: format!("volume type {type_id} does not exist"),
                    }
                })?;
                volume_type
                    .encryption_provider
                    .as_ref()
                    .map(|_| Uuid::new_v4().to_string())
            }
            None => None,
        };

        let reservation = self
            .quota
            .reserve(&context.project_id, QuotaDeltas::volume(request.size as i64))
            .await?;

        let host = match &request.host {
            Some(host) => host.clone(),
            None => match self.scheduler.select_host(&[]).await {
                Ok(host) => host,
                Err(e) => {
                    self.quota.rollback(reservation).await;
                    return Err(e);
                }
            },
        };

        let now = Utc::now();
        let glance_metadata = source_volume
            .as_ref()
            .map(|s| s.glance_metadata.clone())
            .unwrap_or_default();
        let volume = Volume {
            id: Uuid::new_v4(),
            name_id: None,
            project_id: context.project_id.clone(),
            user_id: context.user_id.clone(),
            display_name: request.name.clone(),
            display_description: request.description.clone(),
            status: VolumeStatus::Creating,
            attach_status: AttachStatus::Detached,
            migration_status: None,
            size: request.size,
            host: Some(host.clone()),
            availability_zone,
            snapshot_id: request.snapshot_id,
            source_volid: request.source_volid,
            volume_type_id: request.volume_type_id.clone(),
            encryption_key_id,
            instance_uuid: None,
            attached_host: None,
            mountpoint: None,
            provider_location: None,
            metadata: request.metadata.clone(),
            admin_metadata: HashMap::new(),
            glance_metadata,
            launched_at: None,
            created_at: now,
            updated_at: now,
            deleted: false,
            deleted_at: None,
        };

        let volume = match self.store.volume_create(volume).await {
            Ok(volume) => volume,
            Err(e) => {
                self.quota.rollback(reservation).await;
                return Err(e);
            }
        };

        let allow_reschedule = request.image_id.is_some() && request.host.is_none();
        let cast = self
            .bus
            .cast(
                &host,
                VolumeRequest::CreateVolume {
                    volume_id: volume.id,
                    reservation: Some(reservation),
                    image_id: request.image_id.clone(),
                    allow_reschedule,
                    scheduled_hosts: vec![Host::parse(&host).host],
                    retry_count: 0,
                },
            )
            .await;
        if let Err(mut failure) = cast {
            // The undelivered request comes back with the reservation
            // still inside; release it before surfacing the failure.
            warn!(volume_id = %volume.id, error = %failure.error, "create dispatch failed");
            if let Some(reservation) = failure.request.take_reservation() {
                self.quota.rollback(reservation).await;
            }
            let _ = self
                .store
                .volume_update(&volume.id, |v| v.status = VolumeStatus::Error)
                .await;
            return Err(failure.error);
        }

        info!(volume_id = %volume.id, host = %host, size = request.size, "volume create dispatched");
        self.store.volume_get(&volume.id).await
    }

    /// Statuses a non-forced delete may proceed from.
    const DELETABLE: [VolumeStatus; 5] = [
        VolumeStatus::Available,
        VolumeStatus::Error,
        VolumeStatus::ErrorRestoring,
        VolumeStatus::ErrorExtending,
        VolumeStatus::ErrorAttaching,
    ];

    pub async fn delete(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        force: bool,
    ) -> Result<()> {
        self.check_policy(context, "volume:delete")?;
        let volume = self.store.volume_get(volume_id).await?;

        if !force && !Self::DELETABLE.contains(&volume.status) {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume status must be available or error, is {}", volume.status),
            });
        }
        // Attachment blocks delete even when forced.
        if volume.attach_status == AttachStatus::Attached {
            return Err(StorageError::VolumeAttached {
                volume_id: volume.id,
            });
        }
        let snapshots = self.store.snapshot_get_all_for_volume(volume_id).await;
        if !snapshots.is_empty() {
            return Err(StorageError::InvalidVolume {
                reason: "volume still has snapshots".to_string(),
            });
        }

        // A volume that never reached a host has nothing backend-side;
        // release its quota and drop the record right here.
        let Some(host) = volume.host.clone() else {
            let release = self
                .quota
                .reserve(
                    &volume.project_id,
                    QuotaDeltas::volume(volume.size as i64).negated(),
                )
                .await?;
            self.quota.commit(release).await;
            return self.store.volume_destroy(volume_id).await;
        };

        self.store
            .volume_update(volume_id, |v| v.status = VolumeStatus::Deleting)
            .await?;
        self.bus
            .cast(&host, VolumeRequest::DeleteVolume { volume_id: *volume_id })
            .await?;
        Ok(())
    }

    pub async fn attach(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        instance_uuid: Option<Uuid>,
        host_name: Option<String>,
        mountpoint: &str,
        mode: AttachMode,
    ) -> Result<()> {
        self.check_policy(context, "volume:attach")?;
        let volume = self.store.volume_get(volume_id).await?;

        if volume.attach_status != AttachStatus::Detached {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume is already {}", volume.attach_status),
            });
        }
        // Exactly one attachment target.
        if instance_uuid.is_some() == host_name.is_some() {
            return Err(StorageError::InvalidInput {
                reason: "exactly one of instance_uuid or host_name must be given".to_string(),
            });
        }

        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;
        self.store
            .volume_update(volume_id, |v| v.status = VolumeStatus::Attaching)
            .await?;
        self.bus
            .cast(
                &host,
                VolumeRequest::AttachVolume {
                    volume_id: *volume_id,
                    instance_uuid,
                    host_name,
                    mountpoint: mountpoint.to_string(),
                    mode,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn detach(&self, context: &RequestContext, volume_id: &Uuid) -> Result<()> {
        self.check_policy(context, "volume:detach")?;
        let volume = self.store.volume_get(volume_id).await?;
        if volume.attach_status != AttachStatus::Attached {
            return Err(StorageError::InvalidVolume {
                reason: "volume is not attached".to_string(),
            });
        }
        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;
        self.store
            .volume_update(volume_id, |v| v.status = VolumeStatus::Detaching)
            .await?;
        self.bus
            .cast(&host, VolumeRequest::DetachVolume { volume_id: *volume_id })
            .await?;
        Ok(())
    }

    pub async fn extend(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        new_size: u64,
    ) -> Result<()> {
        self.check_policy(context, "volume:extend")?;
        let volume = self.store.volume_get(volume_id).await?;

        if volume.status != VolumeStatus::Available {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume status must be available to extend, is {}", volume.status),
            });
        }
        if new_size <= volume.size {
            return Err(StorageError::InvalidInput {
                reason: format!(
                    "new size {new_size} GB must be greater than current size {} GB",
                    volume.size
                ),
            });
        }
        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;

        self.store
            .volume_update(volume_id, |v| v.status = VolumeStatus::Extending)
            .await?;
        let delta = (new_size - volume.size) as i64;
        let reservation = match self
            .quota
            .reserve(&volume.project_id, QuotaDeltas::gigabytes_only(delta))
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => {
                self.store
                    .volume_update(volume_id, |v| v.status = VolumeStatus::ErrorExtending)
                    .await?;
                return Err(e);
            }
        };

        let cast = self
            .bus
            .cast(
                &host,
                VolumeRequest::ExtendVolume {
                    volume_id: *volume_id,
                    new_size,
                    reservation: Some(reservation),
                },
            )
            .await;
        if let Err(mut failure) = cast {
            warn!(volume_id = %volume_id, error = %failure.error, "extend dispatch failed");
            if let Some(reservation) = failure.request.take_reservation() {
                self.quota.rollback(reservation).await;
            }
            self.store
                .volume_update(volume_id, |v| v.status = VolumeStatus::ErrorExtending)
                .await?;
            return Err(failure.error);
        }
        Ok(())
    }

    pub async fn migrate(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        dest_host: &str,
    ) -> Result<()> {
        self.check_policy(context, "admin:migrate_volume")?;
        let volume = self.store.volume_get(volume_id).await?;

        if volume.migration_status.is_some() {
            return Err(StorageError::InvalidVolume {
                reason: "volume is already migrating".to_string(),
            });
        }
        if volume.status != VolumeStatus::Available {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume must be available to migrate, is {}", volume.status),
            });
        }
        let snapshots = self.store.snapshot_get_all_for_volume(volume_id).await;
        if !snapshots.is_empty() {
            return Err(StorageError::InvalidVolume {
                reason: "volume must not have snapshots to migrate".to_string(),
            });
        }
        let current = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;
        if Host::parse(&current).host == Host::parse(dest_host).host {
            return Err(StorageError::InvalidInput {
                reason: "destination host is the current host".to_string(),
            });
        }
        if !self
            .bus
            .registered_hosts()
            .await
            .contains(&Host::parse(dest_host).host)
        {
            return Err(StorageError::NoValidHost {
                reason: format!("host {dest_host} is not available"),
            });
        }

        self.store
            .volume_update(volume_id, |v| {
                v.migration_status = Some("starting".to_string())
            })
            .await?;
        self.bus
            .cast(
                &current,
                VolumeRequest::MigrateVolume {
                    volume_id: *volume_id,
                    dest_host: dest_host.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn create_snapshot(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        name: Option<String>,
        description: Option<String>,
        force: bool,
    ) -> Result<Snapshot> {
        self.check_policy(context, "volume:create_snapshot")?;
        let volume = self.store.volume_get(volume_id).await?;

        // The forced variant snapshots an in-use volume, used by
        // backup-from-attached workflows.
        if !force && volume.status != VolumeStatus::Available {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume must be available to snapshot, is {}", volume.status),
            });
        }
        if force
            && !matches!(volume.status, VolumeStatus::Available | VolumeStatus::InUse)
        {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume cannot be snapshotted while {}", volume.status),
            });
        }
        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;

        let reservation = self
            .quota
            .reserve(
                &context.project_id,
                QuotaDeltas::snapshot(volume.size as i64),
            )
            .await?;

        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            volume_id: *volume_id,
            project_id: context.project_id.clone(),
            user_id: context.user_id.clone(),
            display_name: name,
            display_description: description,
            status: SnapshotStatus::Creating,
            volume_size: volume.size,
            metadata: HashMap::new(),
            provider_location: None,
            created_at: Utc::now(),
            deleted: false,
            deleted_at: None,
        };
        let snapshot = match self.store.snapshot_create(snapshot).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.quota.rollback(reservation).await;
                return Err(e);
            }
        };

        let cast = self
            .bus
            .cast(
                &host,
                VolumeRequest::CreateSnapshot {
                    volume_id: *volume_id,
                    snapshot_id: snapshot.id,
                    reservation: Some(reservation),
                },
            )
            .await;
        if let Err(mut failure) = cast {
            warn!(snapshot_id = %snapshot.id, error = %failure.error, "snapshot dispatch failed");
            if let Some(reservation) = failure.request.take_reservation() {
                self.quota.rollback(reservation).await;
            }
            let _ = self
                .store
                .snapshot_update(&snapshot.id, |s| s.status = SnapshotStatus::Error)
                .await;
            return Err(failure.error);
        }
        Ok(snapshot)
    }

    pub async fn delete_snapshot(
        &self,
        context: &RequestContext,
        snapshot_id: &Uuid,
    ) -> Result<()> {
        self.check_policy(context, "volume:delete_snapshot")?;
        let snapshot = self.store.snapshot_get(snapshot_id).await?;
        if !matches!(
            snapshot.status,
            SnapshotStatus::Available | SnapshotStatus::Error
        ) {
            return Err(StorageError::InvalidSnapshot {
                reason: "snapshot status must be available or error".to_string(),
            });
        }
        let volume = self.store.volume_get(&snapshot.volume_id).await?;
        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "parent volume has no host".to_string(),
        })?;

        self.store
            .snapshot_update(snapshot_id, |s| s.status = SnapshotStatus::Deleting)
            .await?;
        self.bus
            .cast(
                &host,
                VolumeRequest::DeleteSnapshot {
                    snapshot_id: *snapshot_id,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn copy_volume_to_image(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        image_id: &str,
    ) -> Result<()> {
        self.check_policy(context, "volume:copy_volume_to_image")?;
        let volume = self.store.volume_get(volume_id).await?;
        if !matches!(
            volume.status,
            VolumeStatus::Available | VolumeStatus::InUse
        ) {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume cannot be uploaded while {}", volume.status),
            });
        }
        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;
        self.bus
            .cast(
                &host,
                VolumeRequest::CopyVolumeToImage {
                    volume_id: *volume_id,
                    image_id: image_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}
