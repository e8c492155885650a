//! Occupancy state machine.
//!
//! A pure transition table over four states driven by door/motion events.
//! The machine holds no timers and touches no devices; the monitor reacts
//! to the transitions it reports.

use serde::Serialize;
use tracing::debug;
use tracing::trace;

/// The system's externally visible belief about room occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OccupancyState {
    Empty,
    Occupied,
    DoorOpen,
    Checking,
}

/// Events the machine can be driven with.
///
/// `MotionTimeout` is deliberately inert: a single sensor's blind-time
/// elapsing never drives a transition on its own. Whether `Checking`
/// resolves to occupied or empty is decided by the monitor when its own
/// rendezvous timer completes, by re-reading live motion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OccupancyEvent {
    AnyDoorOpen,
    AllDoorsClosed,
    MotionDetected,
    MotionTimeout,
    Timeout,
}

/// Provenance attached to every transition: which sensor or context caused
/// it. Observability only; never consulted by the transition logic.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub timeout_seconds: Option<f64>,
}

impl TriggerContext {
    /// Context for a transition caused by a specific sensor.
    pub fn device(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: Some(id.into()),
            device_name: Some(name.into()),
            timeout_seconds: None,
        }
    }

    /// Context for a transition not attributable to a single sensor
    /// (rendezvous completion, forced state, startup).
    pub fn system(name: impl Into<String>) -> Self {
        Self {
            device_id: None,
            device_name: Some(name.into()),
            timeout_seconds: None,
        }
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Four-state occupancy machine. Starts in [`OccupancyState::Empty`].
#[derive(Debug)]
pub struct OccupancyStateMachine {
    state: OccupancyState,
}

impl OccupancyStateMachine {
    pub fn new() -> Self {
        Self {
            state: OccupancyState::Empty,
        }
    }

    pub fn state(&self) -> OccupancyState {
        self.state
    }

    /// Drive the machine with an event.
    ///
    /// Returns `Some(new_state)` when the event caused a transition, `None`
    /// when the (state, event) pair is not in the table. Unlisted pairs are
    /// no-ops by design, traced but otherwise ignored.
    pub fn register_event(
        &mut self,
        event: OccupancyEvent,
        context: &TriggerContext,
    ) -> Option<OccupancyState> {
        use OccupancyEvent as E;
        use OccupancyState as S;

        let next = match (self.state, event) {
            (S::Empty, E::AnyDoorOpen) => Some(S::DoorOpen),
            (S::Empty, E::MotionDetected) => Some(S::Occupied),
            (S::Occupied, E::AnyDoorOpen) => Some(S::DoorOpen),
            (S::DoorOpen, E::AllDoorsClosed) => Some(S::Checking),
            (S::Checking, E::AnyDoorOpen) => Some(S::DoorOpen),
            (S::Checking, E::MotionDetected) => Some(S::Occupied),
            (S::Checking, E::Timeout) => Some(S::Empty),
            _ => None,
        };

        match next {
            Some(next) => self.apply(next, context),
            None => {
                trace!(state = %self.state, %event, "event ignored in current state");
                None
            }
        }
    }

    /// Set the state directly, bypassing the event table.
    ///
    /// Used for forced/host-driven control and initialization. Follows the
    /// same self-transition no-op rule and the same notification path as
    /// table-driven transitions.
    pub fn set_state(
        &mut self,
        state: OccupancyState,
        context: &TriggerContext,
    ) -> Option<OccupancyState> {
        self.apply(state, context)
    }

    /// Single place state is assigned: self-transitions are no-ops here,
    /// so the rule holds for every path into the machine.
    fn apply(&mut self, next: OccupancyState, context: &TriggerContext) -> Option<OccupancyState> {
        if next == self.state {
            trace!(state = %self.state, "self-transition suppressed");
            return None;
        }
        debug!(
            from = %self.state,
            to = %next,
            device_id = context.device_id.as_deref().unwrap_or("-"),
            "occupancy transition"
        );
        self.state = next;
        Some(next)
    }
}

impl Default for OccupancyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
