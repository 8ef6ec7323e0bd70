pub mod config;
pub mod control;
pub mod drivers;
pub mod hourly_log;
pub mod schedule;
pub mod sensors;
pub mod store;
pub mod telemetry;
pub mod time_source;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, ControllerSettings, NetworkCredentials};
pub use control::{ControlError, ControlLoop, Drivers, LoopState};
pub use drivers::{Channel, DriverError};
pub use schedule::DutyLevels;
pub use sensors::FanPulseCounter;
pub use store::ConfigStore;
pub use time_source::SyncState;
pub use types::{DeviceIdentity, StatusSnapshot};
