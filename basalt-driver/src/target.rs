use basalt_core::{Result, StorageError};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Allocates iSCSI target ids from a fixed slot table shared by every
/// volume on one host. The whole alloc runs under one lock, so concurrent
/// creates always receive distinct ids.
pub struct TargetAllocator {
    state: Mutex<AllocatorState>,
    num_targets: u32,
}

struct AllocatorState {
    by_volume: HashMap<Uuid, u32>,
    in_use: Vec<bool>,
}

impl TargetAllocator {
    pub fn new(num_targets: u32) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                by_volume: HashMap::new(),
                in_use: vec![false; num_targets as usize],
            }),
            num_targets,
        }
    }

    /// Reserve a target id for `volume_id`. Idempotent for a volume that
    /// already holds one.
    pub async fn allocate(&self, volume_id: Uuid) -> Result<u32> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.by_volume.get(&volume_id) {
            return Ok(*existing);
        }
        for slot in 0..self.num_targets as usize {
            if !state.in_use[slot] {
                state.in_use[slot] = true;
                // Target ids are 1-based on the wire.
                let id = slot as u32 + 1;
                state.by_volume.insert(volume_id, id);
                debug!(%volume_id, target_id = id, "iscsi target allocated");
                return Ok(id);
            }
        }
        Err(StorageError::NoMoreTargets)
    }

    pub async fn free(&self, volume_id: &Uuid) {
        let mut state = self.state.lock().await;
        if let Some(id) = state.by_volume.remove(volume_id) {
            state.in_use[(id - 1) as usize] = false;
            debug!(%volume_id, target_id = id, "iscsi target freed");
        }
    }

    pub async fn lookup(&self, volume_id: &Uuid) -> Option<u32> {
        let state = self.state.lock().await;
        state.by_volume.get(volume_id).copied()
    }
}
