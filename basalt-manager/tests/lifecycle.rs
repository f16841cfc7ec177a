//! End-to-end lifecycle tests running the API tier against real host
//! loops, with LVM drivers over temp directories.

use basalt_core::{
    admin_keys, AttachMode, AttachStatus, DefaultPolicy, MemoryNotifier, RequestContext,
    ServiceConfig, StorageError, Volume, VolumeStatus,
};
use basalt_driver::{
    ImageMeta, LocalBackupService, LvmIscsiDriver, MemoryImageService, TargetAllocator,
};
use basalt_manager::{
    BackupCoordinator, ChanceScheduler, CreateVolumeRequest, HostService, VolumeManager,
    VolumeService,
};
use basalt_quota::{QuotaEngine, Resource};
use basalt_rpc::MessageBus;
use basalt_store::RecordStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use uuid::Uuid;

struct Deployment {
    store: Arc<RecordStore>,
    quota: Arc<QuotaEngine>,
    bus: Arc<MessageBus>,
    notifier: Arc<MemoryNotifier>,
    images: Arc<MemoryImageService>,
    service: Arc<VolumeService>,
    backups: Arc<BackupCoordinator>,
    vg_dirs: HashMap<String, PathBuf>,
    _dirs: Vec<TempDir>,
}

impl Deployment {
    fn lv_path(&self, host: &str, volume_id: &Uuid) -> PathBuf {
        self.vg_dirs[host].join(format!("volume-{volume_id}"))
    }
}

async fn deploy(hosts: &[&str]) -> Deployment {
    deploy_with_capacity(hosts, 100).await
}

async fn deploy_with_capacity(hosts: &[&str], capacity_gb: u64) -> Deployment {
    let mut config = ServiceConfig::default();
    config.restore_poll_interval_ms = 10;
    config.restore_poll_attempts = 100;

    let store = Arc::new(RecordStore::in_memory());
    let quota = Arc::new(QuotaEngine::new(config.quota.clone()));
    let bus = Arc::new(MessageBus::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let images = Arc::new(MemoryImageService::new());
    let policy = Arc::new(DefaultPolicy);
    let scheduler = Arc::new(ChanceScheduler::new(bus.clone()));

    let backup_dir = TempDir::new().unwrap();
    let backup_service = Arc::new(LocalBackupService::new(backup_dir.path().to_path_buf()));

    let mut dirs = vec![backup_dir];
    let mut vg_dirs = HashMap::new();
    for host in hosts {
        let vg_dir = TempDir::new().unwrap();
        vg_dirs.insert(host.to_string(), vg_dir.path().to_path_buf());

        let rx = bus.register(host).await;
        let driver = Arc::new(LvmIscsiDriver::new(
            *host,
            "vg0",
            vg_dir.path().to_path_buf(),
            capacity_gb,
            Arc::new(TargetAllocator::new(32)),
        ));
        let manager = Arc::new(VolumeManager::new(
            *host,
            driver,
            store.clone(),
            quota.clone(),
            notifier.clone(),
            images.clone(),
            backup_service.clone(),
            bus.clone(),
            scheduler.clone(),
            3,
            200,
            Duration::from_millis(10),
        ));
        manager.init_host().await.unwrap();
        HostService::spawn(manager, rx);
        dirs.push(vg_dir);
    }

    let service = Arc::new(VolumeService::new(
        store.clone(),
        quota.clone(),
        bus.clone(),
        policy.clone(),
        scheduler,
        images.clone(),
        HashMap::new(),
        config.clone(),
    ));
    let backups = Arc::new(BackupCoordinator::new(
        store.clone(),
        bus.clone(),
        policy,
        service.clone(),
        config,
    ));

    Deployment {
        store,
        quota,
        bus,
        notifier,
        images,
        service,
        backups,
        vg_dirs,
        _dirs: dirs,
    }
}

async fn wait_for<F>(store: &RecordStore, volume_id: &Uuid, pred: F, what: &str) -> Volume
where
    F: Fn(&Volume) -> bool,
{
    for _ in 0..500 {
        if let Ok(volume) = store.volume_get(volume_id).await {
            if pred(&volume) {
                return volume;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    let last = store.volume_get(volume_id).await;
    panic!("timed out waiting for {what}, last state: {last:?}");
}

async fn wait_gone(store: &RecordStore, volume_id: &Uuid) {
    for _ in 0..500 {
        match store.volume_get(volume_id).await {
            Err(StorageError::VolumeNotFound { .. }) => return,
            _ => sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("volume {volume_id} never disappeared");
}

fn create_request(size: u64, host: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        size,
        host: Some(host.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_and_delete_full_lifecycle() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let created = d
        .service
        .create(&ctx, create_request(2, "node-1"))
        .await
        .unwrap();
    assert_eq!(created.status, VolumeStatus::Creating);

    let available = wait_for(
        &d.store,
        &created.id,
        |v| v.status == VolumeStatus::Available,
        "create to finish",
    )
    .await;
    assert!(available.launched_at.is_some());
    assert!(available.provider_location.as_deref().unwrap().starts_with("node-1:vg0:"));
    assert!(d.lv_path("node-1", &created.id).exists());

    let usage = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(usage.in_use, 2);
    assert_eq!(usage.reserved, 0);
    assert_eq!(d.quota.usage("p1", Resource::Volumes).await.in_use, 1);

    d.service.delete(&ctx, &created.id, false).await.unwrap();
    wait_gone(&d.store, &created.id).await;
    assert!(!d.lv_path("node-1", &created.id).exists());

    let usage = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(usage.in_use, 0);
    assert_eq!(usage.reserved, 0);

    let events: Vec<String> = d
        .notifier
        .event_types()
        .await
        .into_iter()
        .filter(|e| e.starts_with("volume."))
        .collect();
    assert_eq!(
        events,
        vec![
            "volume.create.start",
            "volume.create.end",
            "volume.delete.start",
            "volume.delete.end",
        ]
    );
}

#[tokio::test]
async fn delete_rejects_bad_states() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    // A status outside the deletable set is refused without force.
    d.store
        .volume_update(&volume.id, |v| v.status = VolumeStatus::Migrating)
        .await
        .unwrap();
    let err = d.service.delete(&ctx, &volume.id, false).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidVolume { .. }));

    // Force skips the status check.
    d.service.delete(&ctx, &volume.id, true).await.unwrap();
    wait_gone(&d.store, &volume.id).await;
}

#[tokio::test]
async fn delete_attached_volume_is_refused_even_with_force() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    d.service
        .attach(&ctx, &volume.id, Some(Uuid::new_v4()), None, "/dev/vdb", AttachMode::ReadWrite)
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::InUse, "attach").await;

    let err = d.service.delete(&ctx, &volume.id, true).await.unwrap_err();
    assert!(matches!(err, StorageError::VolumeAttached { .. }));
}

#[tokio::test]
async fn attach_detach_round_trip() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    let instance = Uuid::new_v4();
    d.service
        .attach(&ctx, &volume.id, Some(instance), None, "/dev/vdb", AttachMode::ReadWrite)
        .await
        .unwrap();
    let attached = wait_for(
        &d.store,
        &volume.id,
        |v| v.attach_status == AttachStatus::Attached,
        "attach",
    )
    .await;
    assert_eq!(attached.status, VolumeStatus::InUse);
    assert_eq!(attached.instance_uuid, Some(instance));
    assert_eq!(attached.mountpoint.as_deref(), Some("/dev/vdb"));
    assert_eq!(
        attached.admin_metadata.get(admin_keys::ATTACHED_MODE).map(String::as_str),
        Some("rw")
    );

    d.service.detach(&ctx, &volume.id).await.unwrap();
    let detached = wait_for(
        &d.store,
        &volume.id,
        |v| v.attach_status == AttachStatus::Detached && v.status == VolumeStatus::Available,
        "detach",
    )
    .await;
    assert_eq!(detached.instance_uuid, None);
    assert_eq!(detached.mountpoint, None);
    assert!(!detached.admin_metadata.contains_key(admin_keys::ATTACHED_MODE));
}

#[tokio::test]
async fn attach_requires_exactly_one_target() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    let err = d
        .service
        .attach(&ctx, &volume.id, None, None, "/dev/vdb", AttachMode::ReadWrite)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));

    let err = d
        .service
        .attach(
            &ctx,
            &volume.id,
            Some(Uuid::new_v4()),
            Some("compute-7".to_string()),
            "/dev/vdb",
            AttachMode::ReadWrite,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));
}

#[tokio::test]
async fn readonly_volume_refuses_rw_attach() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;
    d.store
        .volume_admin_metadata_update(&volume.id, admin_keys::READONLY, "True")
        .await
        .unwrap();

    d.service
        .attach(&ctx, &volume.id, Some(Uuid::new_v4()), None, "/dev/vdb", AttachMode::ReadWrite)
        .await
        .unwrap();
    let refused = wait_for(
        &d.store,
        &volume.id,
        |v| v.status == VolumeStatus::ErrorAttaching,
        "attach refusal",
    )
    .await;
    assert_eq!(refused.attach_status, AttachStatus::Detached);
    // The refused mode stays behind as an audit trail.
    assert_eq!(
        refused.admin_metadata.get(admin_keys::ATTACHED_MODE).map(String::as_str),
        Some("rw")
    );

    // Read-only attach of the same volume goes through.
    d.store
        .volume_update(&volume.id, |v| v.status = VolumeStatus::Available)
        .await
        .unwrap();
    d.service
        .attach(&ctx, &volume.id, Some(Uuid::new_v4()), None, "/dev/vdb", AttachMode::ReadOnly)
        .await
        .unwrap();
    let attached = wait_for(
        &d.store,
        &volume.id,
        |v| v.attach_status == AttachStatus::Attached,
        "ro attach",
    )
    .await;
    assert_eq!(
        attached.admin_metadata.get(admin_keys::ATTACHED_MODE).map(String::as_str),
        Some("ro")
    );
}

#[tokio::test]
async fn extend_grows_the_volume_and_its_quota() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(2, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    let err = d.service.extend(&ctx, &volume.id, 2).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));

    d.service.extend(&ctx, &volume.id, 5).await.unwrap();
    let extended = wait_for(
        &d.store,
        &volume.id,
        |v| v.status == VolumeStatus::Available && v.size == 5,
        "extend",
    )
    .await;
    assert_eq!(extended.size, 5);
    let usage = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(usage.in_use, 5);
    assert_eq!(usage.reserved, 0);
}

#[tokio::test]
async fn failed_extend_leaves_size_and_quota_untouched() {
    // 10 GB group: the extend below exceeds backend capacity but not quota.
    let d = deploy_with_capacity(&["node-1"], 10).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(4, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    d.service.extend(&ctx, &volume.id, 50).await.unwrap();
    let failed = wait_for(
        &d.store,
        &volume.id,
        |v| v.status == VolumeStatus::ErrorExtending,
        "extend failure",
    )
    .await;
    assert_eq!(failed.size, 4);
    let usage = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(usage.in_use, 4);
    assert_eq!(usage.reserved, 0);
}

#[tokio::test]
async fn over_quota_create_is_rejected_cleanly() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");
    d.quota
        .set_project_quota(
            "p1",
            basalt_core::QuotaConfig {
                volumes: 10,
                gigabytes: 5,
                snapshots: 10,
            },
        )
        .await;

    let err = d
        .service
        .create(&ctx, create_request(8, "node-1"))
        .await
        .unwrap_err();
    match err {
        StorageError::OverQuota { overs, quotas, .. } => {
            assert_eq!(overs, vec!["gigabytes".to_string()]);
            assert_eq!(quotas["gigabytes"], 5);
        }
        other => panic!("expected OverQuota, got {other:?}"),
    }
    let usage = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(usage.reserved, 0);
    assert_eq!(usage.in_use, 0);
}

#[tokio::test]
async fn snapshot_blocks_volume_delete_until_removed() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    let snapshot = d
        .service
        .create_snapshot(&ctx, &volume.id, Some("snap".to_string()), None, false)
        .await
        .unwrap();
    for _ in 0..500 {
        let s = d.store.snapshot_get(&snapshot.id).await.unwrap();
        if s.status == basalt_core::SnapshotStatus::Available {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let err = d.service.delete(&ctx, &volume.id, false).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidVolume { .. }));
    assert_eq!(d.quota.usage("p1", Resource::Snapshots).await.in_use, 1);

    d.service.delete_snapshot(&ctx, &snapshot.id).await.unwrap();
    for _ in 0..500 {
        if d.store.snapshot_get(&snapshot.id).await.is_err() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(d.quota.usage("p1", Resource::Snapshots).await.in_use, 0);

    d.service.delete(&ctx, &volume.id, false).await.unwrap();
    wait_gone(&d.store, &volume.id).await;
}

#[tokio::test]
async fn concurrent_creates_get_distinct_targets() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let mut ids = Vec::new();
    for _ in 0..8 {
        let v = d
            .service
            .create(&ctx, create_request(1, "node-1"))
            .await
            .unwrap();
        ids.push(v.id);
    }

    let mut locations = std::collections::HashSet::new();
    for id in &ids {
        let v = wait_for(&d.store, id, |v| v.status == VolumeStatus::Available, "create").await;
        locations.insert(v.provider_location.unwrap());
    }
    assert_eq!(locations.len(), 8);
    assert_eq!(d.quota.usage("p1", Resource::Volumes).await.in_use, 8);
}

#[tokio::test]
async fn generic_migration_moves_payload_across_hosts() {
    let d = deploy(&["node-1", "node-2"]).await;
    let ctx = RequestContext::new("p1", "u1");
    let admin = RequestContext::admin("p1", "admin");

    let volume = d
        .service
        .create(&ctx, create_request(2, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;
    std::fs::write(d.lv_path("node-1", &volume.id), b"payload-bytes").unwrap();

    d.service.migrate(&admin, &volume.id, "node-2").await.unwrap();
    let migrated = wait_for(
        &d.store,
        &volume.id,
        |v| v.migration_status.is_none() && v.host.as_deref() == Some("node-2"),
        "migration",
    )
    .await;

    assert_eq!(migrated.status, VolumeStatus::Available);
    assert!(migrated.provider_location.as_deref().unwrap().starts_with("node-2:"));
    // The record adopts the interim backend identity, and its backend
    // file on the destination carries the payload.
    assert_ne!(migrated.backend_id(), migrated.id);
    let moved = std::fs::read(d.lv_path("node-2", &migrated.backend_id())).unwrap();
    assert_eq!(moved, b"payload-bytes");
    assert!(!d.lv_path("node-1", &volume.id).exists());

    // The interim destination record must be gone and quota unchanged.
    assert_eq!(d.store.volume_get_all().await.len(), 1);
    assert_eq!(d.quota.usage("p1", Resource::Gigabytes).await.in_use, 2);
    assert_eq!(d.quota.usage("p1", Resource::Volumes).await.in_use, 1);

    // Driver operations keep resolving after the move: a delete removes
    // the destination backend file and releases the quota.
    d.service.delete(&ctx, &volume.id, false).await.unwrap();
    wait_gone(&d.store, &volume.id).await;
    assert!(!d.lv_path("node-2", &migrated.backend_id()).exists());
    assert_eq!(d.quota.usage("p1", Resource::Gigabytes).await.in_use, 0);
    assert_eq!(d.quota.usage("p1", Resource::Volumes).await.in_use, 0);
}

#[tokio::test]
async fn create_dispatch_failure_releases_the_reservation() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    // Explicit placement on a host that never registered.
    let err = d
        .service
        .create(&ctx, create_request(3, "node-9"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RpcError { .. }));

    let gigabytes = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(gigabytes.reserved, 0);
    assert_eq!(gigabytes.in_use, 0);
    let volumes = d.quota.usage("p1", Resource::Volumes).await;
    assert_eq!(volumes.reserved, 0);
    assert_eq!(volumes.in_use, 0);

    // The record is kept but marked failed.
    let all = d.store.volume_get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, VolumeStatus::Error);
}

#[tokio::test]
async fn extend_dispatch_failure_releases_the_reservation() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(2, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    // Host loop goes away between the create and the extend.
    d.bus.unregister("node-1").await;
    let err = d.service.extend(&ctx, &volume.id, 5).await.unwrap_err();
    assert!(matches!(err, StorageError::RpcError { .. }));

    let failed = d.store.volume_get(&volume.id).await.unwrap();
    assert_eq!(failed.status, VolumeStatus::ErrorExtending);
    assert_eq!(failed.size, 2);
    let usage = d.quota.usage("p1", Resource::Gigabytes).await;
    assert_eq!(usage.reserved, 0);
    assert_eq!(usage.in_use, 2);
}

#[tokio::test]
async fn migrate_requires_admin_and_a_registered_destination() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");
    let admin = RequestContext::admin("p1", "admin");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    let err = d.service.migrate(&ctx, &volume.id, "node-2").await.unwrap_err();
    assert!(matches!(err, StorageError::AdminRequired));

    let err = d.service.migrate(&admin, &volume.id, "node-9").await.unwrap_err();
    assert!(matches!(err, StorageError::NoValidHost { .. }));

    let err = d.service.migrate(&admin, &volume.id, "node-1").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));
}

#[tokio::test]
async fn backup_and_restore_round_trip() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");
    d.store
        .service_register("node-1", "basalt-backup", "nova")
        .await
        .unwrap();

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;
    std::fs::write(d.lv_path("node-1", &volume.id), b"precious data").unwrap();

    let backup = d
        .backups
        .create(&ctx, &volume.id, Some("nightly".to_string()), None, None)
        .await
        .unwrap();
    assert_eq!(backup.size, Some(1));

    for _ in 0..500 {
        let b = d.store.backup_get(&backup.id).await.unwrap();
        if b.status == basalt_core::BackupStatus::Available {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "backup end").await;

    // Corrupt the source, then restore into an auto-created volume.
    std::fs::write(d.lv_path("node-1", &volume.id), b"garbage").unwrap();
    let restored = d.backups.restore(&ctx, &backup.id, None).await.unwrap();
    assert_ne!(restored.id, volume.id);
    assert_eq!(restored.status, VolumeStatus::RestoringBackup);

    let done = wait_for(
        &d.store,
        &restored.id,
        |v| v.status == VolumeStatus::Available,
        "restore",
    )
    .await;
    assert_eq!(done.size, 1);
    let data = std::fs::read(d.lv_path("node-1", &restored.id)).unwrap();
    assert_eq!(data, b"precious data");
}

#[tokio::test]
async fn backup_requires_a_live_backup_service() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let volume = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &volume.id, |v| v.status == VolumeStatus::Available, "create").await;

    // No service row at all.
    let err = d
        .backups
        .create(&ctx, &volume.id, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ServiceNotFound { .. }));

    // A disabled row does not count either.
    let record = d
        .store
        .service_register("node-1", "basalt-backup", "nova")
        .await
        .unwrap();
    d.store.service_set_disabled(&record.id, true).await.unwrap();
    let err = d
        .backups
        .create(&ctx, &volume.id, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ServiceNotFound { .. }));

    d.store.service_set_disabled(&record.id, false).await.unwrap();
    d.backups.create(&ctx, &volume.id, None, None, None).await.unwrap();
}

#[tokio::test]
async fn restore_into_too_small_volume_is_refused() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");
    d.store
        .service_register("node-1", "basalt-backup", "nova")
        .await
        .unwrap();

    let big = d
        .service
        .create(&ctx, create_request(3, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &big.id, |v| v.status == VolumeStatus::Available, "create").await;
    let small = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &small.id, |v| v.status == VolumeStatus::Available, "create").await;

    let backup = d.backups.create(&ctx, &big.id, None, None, None).await.unwrap();
    for _ in 0..500 {
        let b = d.store.backup_get(&backup.id).await.unwrap();
        if b.status == basalt_core::BackupStatus::Available {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let err = d
        .backups
        .restore(&ctx, &backup.id, Some(small.id))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidVolume { .. }));
}

#[tokio::test]
async fn create_from_image_streams_the_payload_in() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    d.images
        .add_image(
            ImageMeta {
                id: "cirros".to_string(),
                size_bytes: 13,
                min_disk_gb: 0,
                properties: HashMap::new(),
            },
            b"image-content".to_vec(),
        )
        .await;

    let volume = d
        .service
        .create(
            &ctx,
            CreateVolumeRequest {
                size: 1,
                image_id: Some("cirros".to_string()),
                host: Some("node-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let done = wait_for(
        &d.store,
        &volume.id,
        |v| v.status == VolumeStatus::Available,
        "image create",
    )
    .await;
    assert!(done.provider_location.is_some());
    let data = std::fs::read(d.lv_path("node-1", &volume.id)).unwrap();
    assert_eq!(data, b"image-content");
}

#[tokio::test]
async fn create_from_image_enforces_min_disk() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    d.images
        .add_image(
            ImageMeta {
                id: "big-image".to_string(),
                size_bytes: 13,
                min_disk_gb: 5,
                properties: HashMap::new(),
            },
            b"image-content".to_vec(),
        )
        .await;

    let err = d
        .service
        .create(
            &ctx,
            CreateVolumeRequest {
                size: 1,
                image_id: Some("big-image".to_string()),
                host: Some("node-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));
}

#[tokio::test]
async fn create_rejects_multiple_sources_and_zero_size() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let err = d
        .service
        .create(
            &ctx,
            CreateVolumeRequest {
                size: 1,
                snapshot_id: Some(Uuid::new_v4()),
                image_id: Some("cirros".to_string()),
                host: Some("node-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));

    let err = d
        .service
        .create(&ctx, create_request(0, "node-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));
}

#[tokio::test]
async fn clone_copies_source_payload() {
    let d = deploy(&["node-1"]).await;
    let ctx = RequestContext::new("p1", "u1");

    let source = d
        .service
        .create(&ctx, create_request(1, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &source.id, |v| v.status == VolumeStatus::Available, "create").await;
    std::fs::write(d.lv_path("node-1", &source.id), b"golden").unwrap();

    let clone = d
        .service
        .create(
            &ctx,
            CreateVolumeRequest {
                size: 1,
                source_volid: Some(source.id),
                host: Some("node-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_for(&d.store, &clone.id, |v| v.status == VolumeStatus::Available, "clone").await;
    let data = std::fs::read(d.lv_path("node-1", &clone.id)).unwrap();
    assert_eq!(data, b"golden");

    // A clone smaller than its source never leaves the API tier.
    let big = d
        .service
        .create(&ctx, create_request(2, "node-1"))
        .await
        .unwrap();
    wait_for(&d.store, &big.id, |v| v.status == VolumeStatus::Available, "create").await;
    let err = d
        .service
        .create(
            &ctx,
            CreateVolumeRequest {
                size: 1,
                source_volid: Some(big.id),
                host: Some("node-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidInput { .. }));
}
