pub mod config;
pub mod occupancy;
pub mod platform;
pub mod store;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use config::RoomConfig;
pub use occupancy::monitor::MonitorHandle;
pub use occupancy::monitor::MonitorOptions;
pub use occupancy::monitor::RoomMonitor;
pub use occupancy::monitor::StateChange;
pub use occupancy::state_machine::OccupancyEvent;
pub use occupancy::state_machine::OccupancyState;
pub use occupancy::state_machine::TriggerContext;
