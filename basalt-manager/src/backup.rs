//! API-tier backup coordination. Validates the source volume, proves a
//! live backup worker exists for its host, and dispatches the work.
//! Restores may auto-create their destination volume.

use basalt_core::{
    Backup, BackupStatus, Host, RequestContext, Result, ServiceConfig, StorageError, Volume,
    VolumeStatus, PolicyEngine, policy_target,
};
use basalt_rpc::{MessageBus, VolumeRequest};
use basalt_store::RecordStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

use crate::service::{CreateVolumeRequest, VolumeService};

pub struct BackupCoordinator {
    store: Arc<RecordStore>,
    bus: Arc<MessageBus>,
    policy: Arc<dyn PolicyEngine>,
    volume_service: Arc<VolumeService>,
    config: ServiceConfig,
}

impl BackupCoordinator {
    pub fn new(
        store: Arc<RecordStore>,
        bus: Arc<MessageBus>,
        policy: Arc<dyn PolicyEngine>,
        volume_service: Arc<VolumeService>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            bus,
            policy,
            volume_service,
            config,
        }
    }

    /// A host can take backup work when a backup service row exists for
    /// its host component and zone, is not disabled, and has heartbeated
    /// recently.
    async fn is_backup_service_enabled(&self, volume: &Volume) -> bool {
        let Some(volume_host) = volume.host_only() else {
            return false;
        };
        let services = self
            .store
            .service_get_all_by_topic(&self.config.backup_topic)
            .await;
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.service_down_time_secs);
        services.iter().any(|s| {
            s.availability_zone == volume.availability_zone
                && Host::parse(&s.host).host == volume_host
                && !s.disabled
                && s.updated_at >= cutoff
        })
    }

    pub async fn create(
        &self,
        context: &RequestContext,
        volume_id: &Uuid,
        name: Option<String>,
        description: Option<String>,
        container: Option<String>,
    ) -> Result<Backup> {
        self.policy
            .enforce(context, "backup:create", &policy_target(context))?;
        let volume = self.store.volume_get(volume_id).await?;

        if volume.status != VolumeStatus::Available {
            return Err(StorageError::InvalidVolume {
                reason: format!("volume must be available to back up, is {}", volume.status),
            });
        }
        if !self.is_backup_service_enabled(&volume).await {
            return Err(StorageError::ServiceNotFound {
                service: self.config.backup_topic.clone(),
            });
        }
        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "volume has no host".to_string(),
        })?;

        self.store
            .volume_update(volume_id, |v| v.status = VolumeStatus::BackingUp)
            .await?;

        let backup = Backup {
            id: Uuid::new_v4(),
            volume_id: *volume_id,
            project_id: context.project_id.clone(),
            user_id: context.user_id.clone(),
            display_name: name,
            display_description: description,
            status: BackupStatus::Creating,
            host: volume.host_only(),
            container,
            size: Some(volume.size),
            fail_reason: None,
            created_at: Utc::now(),
            deleted: false,
            deleted_at: None,
        };
        let backup = self.store.backup_create(backup).await?;

        self.bus
            .cast(
                &host,
                VolumeRequest::CreateBackup {
                    backup_id: backup.id,
                    volume_id: *volume_id,
                },
            )
            .await?;
        info!(backup_id = %backup.id, volume_id = %volume_id, "backup dispatched");
        Ok(backup)
    }

    pub async fn delete(&self, context: &RequestContext, backup_id: &Uuid) -> Result<()> {
        self.policy
            .enforce(context, "backup:delete", &policy_target(context))?;
        let backup = self.store.backup_get(backup_id).await?;
        if !matches!(backup.status, BackupStatus::Available | BackupStatus::Error) {
            return Err(StorageError::InvalidBackup {
                reason: "backup status must be available or error".to_string(),
            });
        }
        let host = backup.host.clone().ok_or(StorageError::InvalidBackup {
            reason: "backup has no host".to_string(),
        })?;

        self.store
            .backup_update(backup_id, |b| b.status = BackupStatus::Deleting)
            .await?;
        self.bus
            .cast(&host, VolumeRequest::DeleteBackup { backup_id: *backup_id })
            .await?;
        Ok(())
    }

    /// Restore into `volume_id`, or into a freshly created volume when no
    /// destination is given.
    pub async fn restore(
        &self,
        context: &RequestContext,
        backup_id: &Uuid,
        volume_id: Option<Uuid>,
    ) -> Result<Volume> {
        self.policy
            .enforce(context, "backup:restore", &policy_target(context))?;
        let backup = self.store.backup_get(backup_id).await?;
        if backup.status != BackupStatus::Available {
            return Err(StorageError::InvalidBackup {
                reason: format!("backup must be available to restore, is {:?}", backup.status),
            });
        }
        let size = backup.size.ok_or(StorageError::InvalidBackup {
            reason: "backup has no size recorded".to_string(),
        })?;

        let volume = match volume_id {
            Some(id) => {
                let volume = self.store.volume_get(&id).await?;
                if volume.size < size {
                    return Err(StorageError::InvalidVolume {
                        reason: format!(
                            "destination volume size {} GB is smaller than the backup ({size} GB)",
                            volume.size
                        ),
                    });
                }
                if volume.status != VolumeStatus::Available {
                    return Err(StorageError::InvalidVolume {
                        reason: format!(
                            "destination volume must be available, is {}",
                            volume.status
                        ),
                    });
                }
                volume
            }
            None => self.create_restore_target(context, &backup, size).await?,
        };

        let host = volume.host.clone().ok_or(StorageError::InvalidVolume {
            reason: "destination volume has no host".to_string(),
        })?;
        self.store
            .backup_update(backup_id, |b| b.status = BackupStatus::Restoring)
            .await?;
        let volume = self
            .store
            .volume_update(&volume.id, |v| v.status = VolumeStatus::RestoringBackup)
            .await?;
        self.bus
            .cast(
                &host,
                VolumeRequest::RestoreBackup {
                    backup_id: *backup_id,
                    volume_id: volume.id,
                },
            )
            .await?;
        info!(backup_id = %backup_id, volume_id = %volume.id, "restore dispatched");
        Ok(volume)
    }

    /// Create a destination volume sized to the backup and wait for its
    /// create to settle, backing off linearly between polls.
    async fn create_restore_target(
        &self,
        context: &RequestContext,
        backup: &Backup,
        size: u64,
    ) -> Result<Volume> {
        let created = self
            .volume_service
            .create(
                context,
                CreateVolumeRequest {
                    name: Some(format!("restore_backup_{}", backup.id)),
                    description: Some(format!("auto-created_from_restore_from_backup_{}", backup.id)),
                    size,
                    ..Default::default()
                },
            )
            .await?;

        let base = Duration::from_millis(self.config.restore_poll_interval_ms);
        for attempt in 1..=self.config.restore_poll_attempts {
            let volume = self.store.volume_get(&created.id).await?;
            if volume.status != VolumeStatus::Creating {
                if volume.status != VolumeStatus::Available {
                    return Err(StorageError::InvalidVolume {
                        reason: format!(
                            "auto-created restore volume entered status {}",
                            volume.status
                        ),
                    });
                }
                return Ok(volume);
            }
            sleep(base * attempt).await;
        }
        Err(StorageError::Timeout {
            operation: "restore destination create".to_string(),
        })
    }
}
