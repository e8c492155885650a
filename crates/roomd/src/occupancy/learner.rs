//! Per-sensor adaptive timeout learner.
//!
//! A motion sensor's internal blind-time is not queryable, so it is
//! discovered opportunistically by timing true->false cycles. A long cycle
//! can only mean something kept retriggering the sensor; a short clean
//! cycle is a trustworthy floor for the real hardware timeout. The minimum
//! observed duration therefore wins.
//!
//! Learned values are persisted through the settings store and reloaded at
//! startup; every persistence failure degrades to "no learned data".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::registry::BooleanSensorRegistry;
use super::rendezvous::DeviceConfig;
use crate::store::SettingsStore;

/// Version of the persisted timeout blob. Bumped when the shape changes;
/// a mismatch on load discards the stored data.
pub const PERSIST_VERSION: u32 = 1;

/// Default clamp floor for learned durations, guarding against a
/// zero-length interval learned from spurious flicker.
pub const DEFAULT_FLOOR_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct LearnerOptions {
    /// Minimum duration a cycle can teach.
    pub floor: Duration,

    /// Timeout substituted for sensors with nothing learned yet.
    pub default_timeout: Duration,

    /// Settings-store key the timeout map is persisted under.
    pub store_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTimeouts {
    version: u32,
    data: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct LearningData {
    last_true_at: Option<Instant>,
    learned: Option<Duration>,
}

/// Wraps the motion sensor registry with timeout learning.
pub struct TimeoutLearner {
    registry: BooleanSensorRegistry,
    store: Arc<dyn SettingsStore>,
    options: LearnerOptions,
    data: HashMap<String, LearningData>,
}

impl TimeoutLearner {
    /// Wrap a motion registry, reloading any previously learned timeouts.
    pub async fn new(
        registry: BooleanSensorRegistry,
        store: Arc<dyn SettingsStore>,
        options: LearnerOptions,
    ) -> Self {
        let mut learner = Self {
            registry,
            store,
            options,
            data: HashMap::new(),
        };
        learner.load().await;
        learner
    }

    /// Load the persisted map. Any failure (store error, bad shape, wrong
    /// version) degrades to empty data; non-positive entries are discarded.
    async fn load(&mut self) {
        let stored = match self.store.get(&self.options.store_key).await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(e) => {
                warn!(key = %self.options.store_key, "failed to read learned timeouts: {e}");
                return;
            }
        };

        let persisted: PersistedTimeouts = match serde_json::from_value(stored) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %self.options.store_key, "stored timeouts have invalid shape, discarding: {e}");
                return;
            }
        };
        if persisted.version != PERSIST_VERSION {
            warn!(
                stored_version = persisted.version,
                expected = PERSIST_VERSION,
                "stored timeout version mismatch, discarding"
            );
            return;
        }

        for (device_id, timeout_ms) in persisted.data {
            if timeout_ms == 0 {
                warn!(device_id = %device_id, "discarding non-positive stored timeout");
                continue;
            }
            self.data.insert(
                device_id,
                LearningData {
                    last_true_at: None,
                    learned: Some(Duration::from_millis(timeout_ms)),
                },
            );
        }
        debug!(
            count = self.data.len(),
            key = %self.options.store_key,
            "reloaded learned timeouts"
        );
    }

    pub fn registry(&self) -> &BooleanSensorRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut BooleanSensorRegistry {
        &mut self.registry
    }

    /// Feed one boolean event into the learning algorithm.
    ///
    /// true stamps the start of a measurement window (repeated trues simply
    /// restart it); false with a pending true closes a cycle and adopts its
    /// duration when it beats the current learned value. false without a
    /// pending true is a no-op.
    pub fn observe(&mut self, device_id: &str, value: bool, now: Instant) {
        let entry = self.data.entry(device_id.to_string()).or_default();

        if value {
            entry.last_true_at = Some(now);
            return;
        }

        let started = match entry.last_true_at.take() {
            Some(started) => started,
            None => return,
        };

        let duration = now.duration_since(started).max(self.options.floor);
        let improved = match entry.learned {
            Some(current) => duration < current,
            None => true,
        };
        if improved {
            debug!(
                device_id,
                timeout_ms = duration.as_millis() as u64,
                "learned new minimum timeout"
            );
            entry.learned = Some(duration);
            self.persist();
        } else {
            trace!(
                device_id,
                cycle_ms = duration.as_millis() as u64,
                "cycle longer than learned timeout, keeping current"
            );
        }
    }

    /// Persist the full learned map as a detached task; write failures are
    /// logged, never surfaced to the event path.
    fn persist(&self) {
        let snapshot = PersistedTimeouts {
            version: PERSIST_VERSION,
            data: self
                .data
                .iter()
                .filter_map(|(id, d)| d.learned.map(|t| (id.clone(), t.as_millis() as u64)))
                .collect(),
        };
        let store = self.store.clone();
        let key = self.options.store_key.clone();
        tokio::spawn(async move {
            let value = match serde_json::to_value(&snapshot) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %key, "failed to encode learned timeouts: {e}");
                    return;
                }
            };
            if let Err(e) = store.set(&key, value).await {
                warn!(key = %key, "failed to persist learned timeouts, save skipped: {e}");
            }
        });
    }

    pub fn learned_timeout(&self, device_id: &str) -> Option<Duration> {
        self.data.get(device_id).and_then(|d| d.learned)
    }

    pub fn all_learned_timeouts(&self) -> HashMap<String, Duration> {
        self.data
            .iter()
            .filter_map(|(id, d)| d.learned.map(|t| (id.clone(), t)))
            .collect()
    }

    /// Minimum learned timeout across all tracked sensors, or `default`
    /// when nothing has been learned yet.
    pub fn min_learned_timeout(&self, default: Duration) -> Duration {
        self.data
            .values()
            .filter_map(|d| d.learned)
            .min()
            .unwrap_or(default)
    }

    /// One config entry per currently configured motion sensor, with the
    /// configured default substituted where nothing has been learned.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.registry
            .device_ids()
            .into_iter()
            .map(|id| {
                let timeout = self
                    .learned_timeout(&id)
                    .unwrap_or(self.options.default_timeout);
                DeviceConfig { id, timeout }
            })
            .collect()
    }

    /// Drop a device's learning data from memory and from the persisted map.
    pub fn remove_device(&mut self, device_id: &str) {
        if self.data.remove(device_id).is_some() {
            debug!(device_id, "dropped learned timeout data");
            self.persist();
        }
    }

    /// Reconfigure the underlying registry; learning data for removed
    /// sensors is dropped so stale timeouts never leak across
    /// reconfiguration.
    pub async fn update_device_ids(&mut self, new_ids: &[String]) {
        let removed = self.registry.update_device_ids(new_ids).await;
        for id in removed {
            self.remove_device(&id);
        }
    }

    pub async fn destroy(&mut self) {
        self.registry.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    use super::*;
    use crate::platform::DevicePlatform;
    use crate::platform::MemoryPlatform;
    use crate::platform::CAPABILITY_MOTION;
    use crate::store::MemoryStore;
    use crate::store::SettingsStore;
    use crate::occupancy::registry::SensorKind;

    const FLOOR: Duration = Duration::from_millis(1000);
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    fn options() -> LearnerOptions {
        LearnerOptions {
            floor: FLOOR,
            default_timeout: DEFAULT_TIMEOUT,
            store_key: "motion_timeouts.test".to_string(),
        }
    }

    async fn learner_with(
        store: Arc<MemoryStore>,
        device_ids: &[&str],
    ) -> TimeoutLearner {
        let platform = Arc::new(MemoryPlatform::new());
        for id in device_ids {
            platform.add_device(id, id, &[CAPABILITY_MOTION]);
        }
        // The monitor normally consumes this channel; these tests drive
        // observe() directly, so the receiver side is simply dropped.
        let (tx, _rx) = mpsc::unbounded_channel();
        let ids: Vec<String> = device_ids.iter().map(|s| s.to_string()).collect();
        let registry = BooleanSensorRegistry::new(
            platform as Arc<dyn DevicePlatform>,
            SensorKind::Motion,
            &ids,
            tx,
        )
        .await;
        TimeoutLearner::new(registry, store, options()).await
    }

    /// Let detached persistence tasks run to completion.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_wins_with_clamp() {
        let store = Arc::new(MemoryStore::new());
        let mut learner = learner_with(store.clone(), &["m1"]).await;

        // Cycles of 5s, 8s, 3s, 200ms: learned value tracks the minimum,
        // clamped to the floor.
        for cycle in [5000u64, 8000, 3000, 200] {
            let start = Instant::now();
            learner.observe("m1", true, start);
            advance(Duration::from_millis(cycle)).await;
            learner.observe("m1", false, Instant::now());
        }

        assert_eq!(learner.learned_timeout("m1"), Some(FLOOR));

        // 5s and 8s never displaced the earlier 3s minimum on the way down
        let all = learner.all_learned_timeouts();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_true_restarts_window() {
        let store = Arc::new(MemoryStore::new());
        let mut learner = learner_with(store.clone(), &["m1"]).await;

        learner.observe("m1", true, Instant::now());
        advance(Duration::from_secs(60)).await;
        // Retrigger: only the most recent true-to-false gap counts
        learner.observe("m1", true, Instant::now());
        advance(Duration::from_secs(4)).await;
        learner.observe("m1", false, Instant::now());

        assert_eq!(learner.learned_timeout("m1"), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_without_pending_true_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let mut learner = learner_with(store.clone(), &["m1"]).await;

        learner.observe("m1", false, Instant::now());
        assert_eq!(learner.learned_timeout("m1"), None);
        assert_eq!(
            learner.min_learned_timeout(DEFAULT_TIMEOUT),
            DEFAULT_TIMEOUT
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_configs_substitute_default() {
        let store = Arc::new(MemoryStore::new());
        let mut learner = learner_with(store.clone(), &["m1", "m2"]).await;

        learner.observe("m1", true, Instant::now());
        advance(Duration::from_secs(7)).await;
        learner.observe("m1", false, Instant::now());

        let mut configs = learner.device_configs();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].id, "m1");
        assert_eq!(configs[0].timeout, Duration::from_secs(7));
        assert_eq!(configs[1].id, "m2");
        assert_eq!(configs[1].timeout, DEFAULT_TIMEOUT);

        assert_eq!(
            learner.min_learned_timeout(DEFAULT_TIMEOUT),
            Duration::from_secs(7)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut learner = learner_with(store.clone(), &["m1"]).await;
            learner.observe("m1", true, Instant::now());
            advance(Duration::from_secs(5)).await;
            learner.observe("m1", false, Instant::now());
            settle().await;
        }

        let stored = store.get("motion_timeouts.test").await.unwrap().unwrap();
        assert_eq!(stored["version"], PERSIST_VERSION);
        assert_eq!(stored["data"]["m1"], 5000);

        // A fresh learner over the same store starts with the learned value
        let learner = learner_with(store.clone(), &["m1"]).await;
        assert_eq!(learner.learned_timeout("m1"), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch_discards_stored_data() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "motion_timeouts.test",
                json!({"version": 99, "data": {"m1": 5000}}),
            )
            .await
            .unwrap();

        let learner = learner_with(store.clone(), &["m1"]).await;
        assert_eq!(learner.learned_timeout("m1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_shape_and_nonpositive_entries_discarded() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("motion_timeouts.test", json!("garbage"))
            .await
            .unwrap();
        let learner = learner_with(store.clone(), &["m1"]).await;
        assert_eq!(learner.learned_timeout("m1"), None);

        store
            .set(
                "motion_timeouts.test",
                json!({"version": PERSIST_VERSION, "data": {"m1": 0, "m2": 4000}}),
            )
            .await
            .unwrap();
        let learner = learner_with(store.clone(), &["m1", "m2"]).await;
        assert_eq!(learner.learned_timeout("m1"), None);
        assert_eq!(learner.learned_timeout("m2"), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_deletes_persisted_entry() {
        let store = Arc::new(MemoryStore::new());
        let mut learner = learner_with(store.clone(), &["m1", "m2"]).await;

        for id in ["m1", "m2"] {
            learner.observe(id, true, Instant::now());
            advance(Duration::from_secs(5)).await;
            learner.observe(id, false, Instant::now());
        }
        settle().await;

        learner.remove_device("m1");
        settle().await;

        assert_eq!(learner.learned_timeout("m1"), None);
        let stored = store.get("motion_timeouts.test").await.unwrap().unwrap();
        assert!(stored["data"].get("m1").is_none());
        assert_eq!(stored["data"]["m2"], 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_device_ids_cascades_cleanup() {
        let store = Arc::new(MemoryStore::new());
        let mut learner = learner_with(store.clone(), &["m1", "m2"]).await;

        learner.observe("m1", true, Instant::now());
        advance(Duration::from_secs(5)).await;
        learner.observe("m1", false, Instant::now());
        settle().await;

        learner
            .update_device_ids(&["m2".to_string()])
            .await;
        settle().await;

        // Memory and persisted entry are both gone
        assert_eq!(learner.learned_timeout("m1"), None);
        let stored = store.get("motion_timeouts.test").await.unwrap().unwrap();
        assert!(stored["data"].get("m1").is_none());
    }
}
