//! Checking rendezvous timer.
//!
//! A barrier over heterogeneous per-sensor durations: one independent
//! countdown per configured motion sensor, and a single completion message
//! only once every countdown has elapsed. Cancellation always wins over a
//! straggling fire; each run carries a generation the consumer checks
//! before acting.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::MonitorMessage;

/// One motion sensor's entry in a rendezvous run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: String,
    pub timeout: Duration,
}

/// Rendezvous timer over a set of per-sensor countdowns.
///
/// `start` spawns one run; the run sends exactly one
/// [`MonitorMessage::CheckingElapsed`] when the last countdown elapses.
/// `stop` aborts the run without sending anything and bumps the generation
/// so an already-queued completion can be recognized as stale.
pub struct CheckingTimer {
    devices: Vec<DeviceConfig>,
    events_tx: mpsc::UnboundedSender<MonitorMessage>,
    generation: u64,
    run: Option<JoinHandle<()>>,
}

impl CheckingTimer {
    pub fn new(
        devices: Vec<DeviceConfig>,
        events_tx: mpsc::UnboundedSender<MonitorMessage>,
    ) -> Self {
        Self {
            devices,
            events_tx,
            generation: 0,
            run: None,
        }
    }

    /// Replace the device list used by subsequent runs.
    pub fn update_devices(&mut self, devices: Vec<DeviceConfig>) {
        self.devices = devices;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin a new run, cancelling any previous one.
    ///
    /// Returns the run's generation; the completion message carries the
    /// same value so the consumer can discard completions from runs it has
    /// since abandoned.
    pub fn start(&mut self) -> u64 {
        self.stop();
        self.generation += 1;
        let generation = self.generation;

        // A barrier over zero timers resolves the moment it is started.
        if self.devices.is_empty() {
            debug!(generation, "no motion sensors configured, completing immediately");
            let _ = self
                .events_tx
                .send(MonitorMessage::CheckingElapsed { generation });
            return generation;
        }

        debug!(
            generation,
            sensors = self.devices.len(),
            "starting checking rendezvous"
        );

        let devices = self.devices.clone();
        let tx = self.events_tx.clone();
        self.run = Some(tokio::spawn(async move {
            let total = devices.len();
            let mut countdowns = JoinSet::new();
            for device in devices {
                countdowns.spawn(async move {
                    tokio::time::sleep(device.timeout).await;
                    device.id
                });
            }

            let mut fired: HashSet<String> = HashSet::new();
            while let Some(result) = countdowns.join_next().await {
                match result {
                    Ok(device_id) => {
                        trace!(generation, device_id = %device_id, "sensor countdown elapsed");
                        fired.insert(device_id);
                        if fired.len() == total {
                            let _ = tx.send(MonitorMessage::CheckingElapsed { generation });
                            break;
                        }
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(generation, "countdown task failed: {e}"),
                }
            }
        }));

        generation
    }

    /// Cancel the in-flight run, if any, without completing it.
    ///
    /// Aborting the run task drops its `JoinSet`, which cancels every
    /// pending countdown; the generation bump guards against a completion
    /// that was already queued when stop was called.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            debug!(generation = self.generation, "stopping checking rendezvous");
            run.abort();
        }
        self.generation += 1;
    }
}

impl Drop for CheckingTimer {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.abort();
        }
    }
}
