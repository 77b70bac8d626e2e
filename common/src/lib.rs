pub mod alarm;
pub mod clock;
pub mod config;
pub mod monitor;
pub mod provisioning;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;

pub use alarm::{AlarmDecision, AlarmRecord, AlarmTracker, FaultTable, SoundClass};
pub use clock::{ClockHandle, ClockState, LocalTime, SyncError};
pub use config::{ConfigError, DeviceConfig, DisplayFeatures, MonitorSettings};
pub use monitor::{FetchError, FetchNotice, FetchReport, MonitorAction, MonitorEngine, Screen};
pub use provisioning::{Provisioner, ProvisioningReason, ProvisioningResponse, ProvisioningState};
pub use reconcile::{reconcile, DisplayState, Reconciled};
pub use scheduler::{FireMode, Scheduler, TaskId, TimerTask};
pub use snapshot::{DeviceSnapshot, FieldError, SnapshotError};
