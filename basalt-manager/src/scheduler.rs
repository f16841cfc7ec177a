//! Host selection for creates and create-reschedules.

use async_trait::async_trait;
use basalt_core::{Result, StorageError};
use basalt_rpc::MessageBus;
use rand::Rng;
use std::sync::Arc;

/// Placement collaborator consulted when a request carries no explicit
/// host and when a failed image-sourced create is rescheduled.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Pick an up host, never one of `ignore_hosts`.
    async fn select_host(&self, ignore_hosts: &[String]) -> Result<String>;
}

/// Random selection over the hosts currently registered on the bus.
pub struct ChanceScheduler {
    bus: Arc<MessageBus>,
}

impl ChanceScheduler {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Scheduler for ChanceScheduler {
    async fn select_host(&self, ignore_hosts: &[String]) -> Result<String> {
        let hosts = self.bus.registered_hosts().await;
        if hosts.is_empty() {
            return Err(StorageError::NoValidHost {
                reason: "is the appropriate service running?".to_string(),
            });
        }
        let candidates: Vec<String> = hosts
            .into_iter()
            .filter(|h| !ignore_hosts.contains(h))
            .collect();
        if candidates.is_empty() {
            return Err(StorageError::NoValidHost {
                reason: "could not find another host".to_string(),
            });
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }
}
