//! Volume orchestration: the API-tier services, the per-host manager
//! state machine, host placement and the backup coordinator.

pub mod backup;
pub mod host;
pub mod manager;
pub mod scheduler;
pub mod service;

pub use backup::BackupCoordinator;
pub use host::HostService;
pub use manager::VolumeManager;
pub use scheduler::{ChanceScheduler, Scheduler};
pub use service::{CreateVolumeRequest, VolumeService, VolumeType};
