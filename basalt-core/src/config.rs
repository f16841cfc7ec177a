use serde::{Deserialize, Serialize};
use std::path::Path;

/// Service-wide configuration with defaults matching a single-host
/// development deployment. Loaded from YAML when a config file exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Zone assigned to volumes when neither the request nor a source
    /// object carries one.
    pub default_availability_zone: Option<String>,
    /// Zone this storage service itself runs in, the final fallback.
    pub storage_availability_zone: String,
    pub quota: QuotaConfig,
    /// Number of iSCSI target slots available per host.
    pub iscsi_num_targets: u32,
    /// How many hosts a failed image-sourced create may be retried against.
    pub scheduler_max_attempts: u32,
    /// Poll budget for a restore that has to auto-create its destination.
    pub restore_poll_attempts: u32,
    /// Base interval between destination polls, in milliseconds.
    pub restore_poll_interval_ms: u64,
    /// A service heartbeat older than this is considered down.
    pub service_down_time_secs: i64,
    pub volume_topic: String,
    pub backup_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub volumes: i64,
    pub gigabytes: i64,
    pub snapshots: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            volumes: 10,
            gigabytes: 1000,
            snapshots: 10,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_availability_zone: None,
            storage_availability_zone: "nova".to_string(),
            quota: QuotaConfig::default(),
            iscsi_num_targets: 100,
            scheduler_max_attempts: 3,
            restore_poll_attempts: 30,
            restore_poll_interval_ms: 100,
            service_down_time_secs: 60,
            volume_topic: "basalt-volume".to_string(),
            backup_topic: "basalt-backup".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ServiceConfig = serde_yaml::from_str(&content)
                .map_err(|e| crate::StorageError::ConfigError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::StorageError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
