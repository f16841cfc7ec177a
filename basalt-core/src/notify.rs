use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// A lifecycle event emitted at the start and end of every major
/// operation, e.g. `volume.create.start` / `volume.create.end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget event sink. Implementations must never let a delivery
/// failure escape: a lost notification cannot fail the operation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes each event to the log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        info!(
            event_type = %notification.event_type,
            payload = %notification.payload,
            "notification"
        );
    }
}

/// Captures events in memory so tests can assert on ordering and content.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Arc<RwLock<Vec<Notification>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Notification> {
        self.events.read().await.clone()
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .map(|n| n.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: Notification) {
        self.events.write().await.push(notification);
    }
}
