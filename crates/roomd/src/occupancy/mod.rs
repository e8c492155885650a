//! Occupancy inference core.
//!
//! One [`monitor::RoomMonitor`] per room owns the state machine, the door
//! and motion registries, the timeout learner and the checking rendezvous
//! timer, and serializes everything through a single message loop.

pub mod learner;
pub mod monitor;
pub mod registry;
pub mod rendezvous;
pub mod state_machine;

use serde_json::Value;

use self::registry::SensorKind;
use self::state_machine::OccupancyState;

/// Messages processed by a room monitor's event loop.
///
/// All mutation of the monitor's state happens while handling one of
/// these, one at a time.
#[derive(Debug)]
pub enum MonitorMessage {
    /// A sensor reported a capability value (live change or seed).
    SensorChanged {
        kind: SensorKind,
        device_id: String,
        value: Value,
    },

    /// The checking rendezvous barrier for the given run completed.
    CheckingElapsed { generation: u64 },

    /// Reconfigure the monitored sensor sets.
    UpdateSettings {
        door_ids: Vec<String>,
        motion_ids: Vec<String>,
    },

    /// Force the occupancy state, bypassing the event table.
    ForceState { state: OccupancyState },

    /// Stop the monitor's event loop and tear down subscriptions.
    Shutdown,
}
