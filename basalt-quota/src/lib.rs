//! Per-project quota accounting with reserve/commit/rollback semantics.
//!
//! Every quota-bounded operation reserves its deltas up front, then resolves
//! the reservation exactly once: commit on success, rollback on any failure.
//! Commit and rollback take the reservation by value, so a second resolution
//! is a compile error rather than a runtime bug.

use basalt_core::{QuotaConfig, QuotaUsage, Result, StorageError};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Volumes,
    Gigabytes,
    Snapshots,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Volumes, Resource::Gigabytes, Resource::Snapshots];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Volumes => "volumes",
            Resource::Gigabytes => "gigabytes",
            Resource::Snapshots => "snapshots",
        }
    }
}

/// Signed resource deltas for one reservation. Negative values release
/// usage (delete paths) and are never checked against limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaDeltas {
    pub volumes: i64,
    pub gigabytes: i64,
    pub snapshots: i64,
}

impl QuotaDeltas {
    pub fn volume(size_gb: i64) -> Self {
        Self {
            volumes: 1,
            gigabytes: size_gb,
            snapshots: 0,
        }
    }

    pub fn snapshot(size_gb: i64) -> Self {
        Self {
            volumes: 0,
            gigabytes: size_gb,
            snapshots: 1,
        }
    }

    pub fn gigabytes_only(delta_gb: i64) -> Self {
        Self {
            volumes: 0,
            gigabytes: delta_gb,
            snapshots: 0,
        }
    }

    pub fn negated(&self) -> Self {
        Self {
            volumes: -self.volumes,
            gigabytes: -self.gigabytes,
            snapshots: -self.snapshots,
        }
    }

    fn get(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Volumes => self.volumes,
            Resource::Gigabytes => self.gigabytes,
            Resource::Snapshots => self.snapshots,
        }
    }
}

/// A provisional quota hold. Must reach [`QuotaEngine::commit`] or
/// [`QuotaEngine::rollback`] on every code path; dropping an unresolved
/// reservation logs a leak warning.
#[derive(Debug)]
pub struct Reservation {
    pub id: Uuid,
    project_id: String,
    deltas: QuotaDeltas,
    armed: bool,
}

impl Reservation {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn deltas(&self) -> QuotaDeltas {
        self.deltas
    }

    fn disarm(mut self) -> (String, QuotaDeltas) {
        self.armed = false;
        (std::mem::take(&mut self.project_id), self.deltas)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                reservation_id = %self.id,
                project_id = %self.project_id,
                "reservation dropped without commit or rollback"
            );
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ProjectUsage {
    usages: HashMap<Resource, QuotaUsage>,
}

pub struct QuotaEngine {
    defaults: QuotaConfig,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    usage: HashMap<String, ProjectUsage>,
    overrides: HashMap<String, QuotaConfig>,
}

impl QuotaEngine {
    pub fn new(defaults: QuotaConfig) -> Self {
        Self {
            defaults,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Replace the limits for one project.
    pub async fn set_project_quota(&self, project_id: &str, quota: QuotaConfig) {
        let mut state = self.state.lock().await;
        state.overrides.insert(project_id.to_string(), quota);
    }

    /// Reserve `deltas` against `project_id`, failing with `OverQuota`
    /// when any positive delta would push usage past its limit. The whole
    /// check-and-hold runs under one lock, so concurrent reservations
    /// against the same project cannot double-count.
    pub async fn reserve(&self, project_id: &str, deltas: QuotaDeltas) -> Result<Reservation> {
        let mut state = self.state.lock().await;
        let limits = state
            .overrides
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        // First touch of a project creates its usage rows.
        let project = state.usage.entry(project_id.to_string()).or_default();

        let mut overs = Vec::new();
        for resource in Resource::ALL {
            let delta = deltas.get(resource);
            if delta <= 0 {
                continue;
            }
            let usage = project.usages.entry(resource).or_default();
            let limit = limit_for(&limits, resource);
            if usage.total() + delta > limit {
                overs.push(resource.as_str().to_string());
            }
        }

        if !overs.is_empty() {
            let mut quotas = HashMap::new();
            let mut usages = HashMap::new();
            for resource in Resource::ALL {
                quotas.insert(resource.as_str().to_string(), limit_for(&limits, resource));
                usages.insert(
                    resource.as_str().to_string(),
                    project.usages.get(&resource).copied().unwrap_or_default(),
                );
            }
            return Err(StorageError::OverQuota {
                overs,
                quotas,
                usages,
            });
        }

        for resource in Resource::ALL {
            let delta = deltas.get(resource);
            if delta != 0 {
                project.usages.entry(resource).or_default().reserved += delta;
            }
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            deltas,
            armed: true,
        };
        debug!(reservation_id = %reservation.id, project_id, ?deltas, "quota reserved");
        Ok(reservation)
    }

    /// Apply the held deltas to permanent usage.
    pub async fn commit(&self, reservation: Reservation) {
        let id = reservation.id;
        let (project_id, deltas) = reservation.disarm();
        let mut state = self.state.lock().await;
        let project = state.usage.entry(project_id.clone()).or_default();
        for resource in Resource::ALL {
            let delta = deltas.get(resource);
            if delta != 0 {
                let usage = project.usages.entry(resource).or_default();
                usage.reserved -= delta;
                usage.in_use += delta;
            }
        }
        debug!(reservation_id = %id, project_id, "quota committed");
    }

    /// Discard the held deltas.
    pub async fn rollback(&self, reservation: Reservation) {
        let id = reservation.id;
        let (project_id, deltas) = reservation.disarm();
        let mut state = self.state.lock().await;
        let project = state.usage.entry(project_id.clone()).or_default();
        for resource in Resource::ALL {
            let delta = deltas.get(resource);
            if delta != 0 {
                project.usages.entry(resource).or_default().reserved -= delta;
            }
        }
        debug!(reservation_id = %id, project_id, "quota rolled back");
    }

    pub async fn usage(&self, project_id: &str, resource: Resource) -> QuotaUsage {
        let state = self.state.lock().await;
        state
            .usage
            .get(project_id)
            .and_then(|p| p.usages.get(&resource))
            .copied()
            .unwrap_or_default()
    }
}

fn limit_for(limits: &QuotaConfig, resource: Resource) -> i64 {
    match resource {
        Resource::Volumes => limits.volumes,
        Resource::Gigabytes => limits.gigabytes,
        Resource::Snapshots => limits.snapshots,
    }
}
