//! Room monitor: the orchestrator tying the occupancy core together.
//!
//! Owns one state machine, a door registry, a motion registry wrapped by
//! the timeout learner, and (while in `checking`) a rendezvous timer. Runs
//! as an actor over a single message channel, so every cache and state
//! mutation happens from exactly one place.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::learner::LearnerOptions;
use super::learner::TimeoutLearner;
use super::registry::BooleanSensorRegistry;
use super::registry::SensorKind;
use super::rendezvous::CheckingTimer;
use super::state_machine::OccupancyEvent;
use super::state_machine::OccupancyState;
use super::state_machine::OccupancyStateMachine;
use super::state_machine::TriggerContext;
use super::MonitorMessage;
use crate::platform::CapabilityEvent;
use crate::platform::DevicePlatform;
use crate::store::SettingsStore;

/// Capacity of the state-change broadcast channel.
const STATE_CHANGE_CHANNEL_SIZE: usize = 64;

/// A state transition as published to subscribers.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub room: String,
    pub state: OccupancyState,
    pub trigger: TriggerContext,
}

/// Tunables shared by every monitor, sourced from configuration.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Timeout used for motion sensors with no learned value yet.
    pub default_motion_timeout: Duration,

    /// Clamp floor for learned timeouts.
    pub learned_floor: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            default_motion_timeout: Duration::from_secs(20),
            learned_floor: Duration::from_millis(super::learner::DEFAULT_FLOOR_MS),
        }
    }
}

/// Host-facing handle to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<MonitorMessage>,
    state_changes: broadcast::Sender<StateChange>,
}

impl MonitorHandle {
    /// Subscribe to state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    /// Reconfigure the monitored sensor sets.
    pub fn update_settings(&self, door_ids: Vec<String>, motion_ids: Vec<String>) {
        let _ = self.tx.send(MonitorMessage::UpdateSettings {
            door_ids,
            motion_ids,
        });
    }

    /// Force the occupancy state, bypassing the event table.
    pub fn force_state(&self, state: OccupancyState) {
        let _ = self.tx.send(MonitorMessage::ForceState { state });
    }

    /// Ask the monitor to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(MonitorMessage::Shutdown);
    }
}

/// Per-room occupancy monitor.
pub struct RoomMonitor {
    room: String,
    machine: OccupancyStateMachine,
    doors: BooleanSensorRegistry,
    motion: TimeoutLearner,
    checking: CheckingTimer,
    /// Generation of the rendezvous run backing the current `checking`
    /// state; `None` whenever we are not checking.
    checking_generation: Option<u64>,
    options: MonitorOptions,
    rx: mpsc::UnboundedReceiver<MonitorMessage>,
    state_changes: broadcast::Sender<StateChange>,
}

impl RoomMonitor {
    /// Build a monitor for one room and return it with its handle.
    ///
    /// Subscribes to every configured sensor; individual failures are
    /// logged by the registries and do not abort construction. Call
    /// [`RoomMonitor::run`] (typically via `tokio::spawn`) to start
    /// processing events.
    pub async fn new(
        platform: Arc<dyn DevicePlatform>,
        store: Arc<dyn SettingsStore>,
        room: impl Into<String>,
        door_ids: &[String],
        motion_ids: &[String],
        options: MonitorOptions,
    ) -> (Self, MonitorHandle) {
        let room = room.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_changes, _) = broadcast::channel(STATE_CHANGE_CHANNEL_SIZE);

        let doors = BooleanSensorRegistry::new(
            platform.clone(),
            SensorKind::Door,
            door_ids,
            Self::spawn_sensor_forwarder(SensorKind::Door, tx.clone()),
        )
        .await;

        let motion_registry = BooleanSensorRegistry::new(
            platform.clone(),
            SensorKind::Motion,
            motion_ids,
            Self::spawn_sensor_forwarder(SensorKind::Motion, tx.clone()),
        )
        .await;
        let motion = TimeoutLearner::new(
            motion_registry,
            store,
            LearnerOptions {
                floor: options.learned_floor,
                default_timeout: options.default_motion_timeout,
                store_key: format!("motion_timeouts.{room}"),
            },
        )
        .await;

        let checking = CheckingTimer::new(Vec::new(), tx.clone());

        let handle = MonitorHandle {
            tx,
            state_changes: state_changes.clone(),
        };
        let monitor = Self {
            room,
            machine: OccupancyStateMachine::new(),
            doors,
            motion,
            checking,
            checking_generation: None,
            options,
            rx,
            state_changes,
        };
        (monitor, handle)
    }

    /// Bridge a registry's capability events into the monitor channel,
    /// tagged with the sensor kind.
    fn spawn_sensor_forwarder(
        kind: SensorKind,
        tx: mpsc::UnboundedSender<MonitorMessage>,
    ) -> mpsc::UnboundedSender<CapabilityEvent> {
        let (cap_tx, mut cap_rx) = mpsc::unbounded_channel::<CapabilityEvent>();
        tokio::spawn(async move {
            while let Some(event) = cap_rx.recv().await {
                let forwarded = tx.send(MonitorMessage::SensorChanged {
                    kind,
                    device_id: event.device_id,
                    value: event.value,
                });
                if forwarded.is_err() {
                    break;
                }
            }
        });
        cap_tx
    }

    pub fn state(&self) -> OccupancyState {
        self.machine.state()
    }

    /// Run the monitor's event loop until shutdown.
    pub async fn run(mut self) {
        info!(room = %self.room, "room monitor started");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                MonitorMessage::SensorChanged {
                    kind,
                    device_id,
                    value,
                } => self.handle_sensor_changed(kind, &device_id, value),
                MonitorMessage::CheckingElapsed { generation } => {
                    self.handle_checking_elapsed(generation)
                }
                MonitorMessage::UpdateSettings {
                    door_ids,
                    motion_ids,
                } => self.handle_update_settings(door_ids, motion_ids).await,
                MonitorMessage::ForceState { state } => {
                    let context = TriggerContext::system("forced");
                    let previous = self.machine.state();
                    if let Some(next) = self.machine.set_state(state, &context) {
                        self.on_transition(previous, next, context);
                    }
                }
                MonitorMessage::Shutdown => break,
            }
        }

        self.checking.stop();
        self.doors.destroy().await;
        self.motion.destroy().await;
        info!(room = %self.room, "room monitor stopped");
    }

    fn handle_sensor_changed(
        &mut self,
        kind: SensorKind,
        device_id: &str,
        value: serde_json::Value,
    ) {
        let registry = match kind {
            SensorKind::Door => &mut self.doors,
            SensorKind::Motion => self.motion.registry_mut(),
        };
        let value = match registry.record_value(device_id, &value) {
            Some(value) => value,
            None => return,
        };
        let name = registry
            .device_name(device_id)
            .unwrap_or(device_id)
            .to_string();
        let context = TriggerContext::device(device_id, name);

        debug!(
            room = %self.room,
            %kind,
            device_id,
            value,
            "sensor changed"
        );

        match kind {
            SensorKind::Door => {
                if value {
                    self.dispatch(OccupancyEvent::AnyDoorOpen, context);
                } else if self.doors.is_all_false() {
                    // Only the last door closing emits the event; a single
                    // door closing while another stays open is swallowed.
                    self.dispatch(OccupancyEvent::AllDoorsClosed, context);
                }
            }
            SensorKind::Motion => {
                self.motion.observe(device_id, value, Instant::now());
                if value {
                    self.dispatch(OccupancyEvent::MotionDetected, context);
                }
                // A single sensor's blind-time elapsing only updates the
                // cache; whether checking resolves to empty is decided by
                // the rendezvous, against live state.
            }
        }
    }

    fn handle_checking_elapsed(&mut self, generation: u64) {
        if self.checking_generation != Some(generation) {
            debug!(
                room = %self.room,
                generation,
                "stale rendezvous completion, ignoring"
            );
            return;
        }
        if self.machine.state() != OccupancyState::Checking {
            // The generation is cleared whenever checking is left, so this
            // indicates a bookkeeping bug rather than a normal race.
            warn!(room = %self.room, "rendezvous completion outside checking state, ignoring");
            return;
        }
        self.checking_generation = None;

        let timeout = self
            .motion
            .min_learned_timeout(self.options.default_motion_timeout);
        let context =
            TriggerContext::system("checking rendezvous").with_timeout_seconds(timeout.as_secs_f64());

        if self.motion.registry().is_any_true() {
            // The timers elapsed but a sensor still reports motion: the
            // room is occupied by live evidence.
            self.dispatch(OccupancyEvent::MotionDetected, context);
        } else {
            self.dispatch(OccupancyEvent::Timeout, context);
        }
    }

    async fn handle_update_settings(&mut self, door_ids: Vec<String>, motion_ids: Vec<String>) {
        info!(
            room = %self.room,
            doors = door_ids.len(),
            motion = motion_ids.len(),
            "updating monitored sensors"
        );
        self.doors.update_device_ids(&door_ids).await;
        self.motion.update_device_ids(&motion_ids).await;
    }

    fn dispatch(&mut self, event: OccupancyEvent, context: TriggerContext) {
        let previous = self.machine.state();
        if let Some(next) = self.machine.register_event(event, &context) {
            self.on_transition(previous, next, context);
        }
    }

    /// React to a transition the machine reported.
    ///
    /// Any in-flight rendezvous is stopped before the notification goes
    /// out, so a stray completion can never race a later state change.
    fn on_transition(
        &mut self,
        previous: OccupancyState,
        next: OccupancyState,
        trigger: TriggerContext,
    ) {
        if previous == OccupancyState::Checking {
            self.checking.stop();
            self.checking_generation = None;
        }

        if next == OccupancyState::Checking {
            self.checking.update_devices(self.motion.device_configs());
            self.checking_generation = Some(self.checking.start());
        }

        info!(
            room = %self.room,
            state = %next,
            device_id = trigger.device_id.as_deref().unwrap_or("-"),
            device_name = trigger.device_name.as_deref().unwrap_or("-"),
            "occupancy state changed"
        );

        // No subscribers is fine; the notification is best-effort
        let _ = self.state_changes.send(StateChange {
            room: self.room.clone(),
            state: next,
            trigger,
        });
    }
}
