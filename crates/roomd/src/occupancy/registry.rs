//! Boolean sensor registry.
//!
//! Maintains live subscriptions to a configurable set of devices for one
//! fixed boolean capability (door contact or motion), caches each device's
//! last known value and feeds every change into the monitor's event channel.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::platform::CapabilityEvent;
use crate::platform::CapabilityEventSender;
use crate::platform::DevicePlatform;
use crate::platform::SubscriptionId;
use crate::platform::CAPABILITY_CONTACT;
use crate::platform::CAPABILITY_MOTION;

/// Which boolean capability a registry watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SensorKind {
    Door,
    Motion,
}

impl SensorKind {
    pub fn capability(self) -> &'static str {
        match self {
            SensorKind::Door => CAPABILITY_CONTACT,
            SensorKind::Motion => CAPABILITY_MOTION,
        }
    }
}

struct SensorRecord {
    name: String,
    last_known: Option<bool>,
    subscription: SubscriptionId,
}

/// Registry of boolean sensors of one kind.
///
/// The live subscription set is always exactly the configured device ids
/// that resolved and exposed the expected capability; everything else is
/// skipped with a log line and never aborts its siblings.
pub struct BooleanSensorRegistry {
    platform: Arc<dyn DevicePlatform>,
    kind: SensorKind,
    records: HashMap<String, SensorRecord>,
    events_tx: CapabilityEventSender,
}

impl BooleanSensorRegistry {
    /// Build a registry and subscribe to every configured device.
    ///
    /// Each device's current value is fed through the event channel right
    /// after its subscription is set up, so the handler never starts from
    /// stale or absent state.
    pub async fn new(
        platform: Arc<dyn DevicePlatform>,
        kind: SensorKind,
        device_ids: &[String],
        events_tx: CapabilityEventSender,
    ) -> Self {
        let mut registry = Self {
            platform,
            kind,
            records: HashMap::new(),
            events_tx,
        };
        for id in device_ids {
            registry.add_device(id).await;
        }
        registry
    }

    /// Subscribe a single device, logging and skipping on any failure.
    async fn add_device(&mut self, device_id: &str) {
        let capability = self.kind.capability();

        let handle = match self.platform.resolve(device_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(device_id, kind = %self.kind, "failed to resolve device, skipping: {e}");
                return;
            }
        };
        if !handle.has_capability(capability) {
            warn!(
                device_id,
                device_name = %handle.name,
                capability,
                "device does not expose expected capability, skipping"
            );
            return;
        }

        let subscription = match self
            .platform
            .subscribe(device_id, capability, self.events_tx.clone())
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(device_id, capability, "failed to subscribe, skipping: {e}");
                return;
            }
        };

        self.records.insert(
            device_id.to_string(),
            SensorRecord {
                name: handle.name.clone(),
                last_known: None,
                subscription,
            },
        );
        debug!(device_id, device_name = %handle.name, kind = %self.kind, "sensor registered");

        // Seed the handler with the device's current value through the same
        // channel real changes arrive on.
        match self.platform.current_value(device_id, capability).await {
            Ok(Some(value)) => {
                let _ = self.events_tx.send(CapabilityEvent {
                    device_id: device_id.to_string(),
                    capability: capability.to_string(),
                    value,
                });
            }
            Ok(None) => {
                trace!(device_id, "no current value to seed");
            }
            Err(e) => {
                warn!(device_id, "failed to read current value: {e}");
            }
        }
    }

    async fn remove_device(&mut self, device_id: &str) {
        if let Some(record) = self.records.remove(device_id) {
            if let Err(e) = self.platform.unsubscribe(record.subscription).await {
                warn!(device_id, "failed to unsubscribe: {e}");
            }
            debug!(device_id, kind = %self.kind, "sensor removed");
        }
    }

    /// Reconfigure the monitored set, diffing against the current one.
    ///
    /// Removed ids are unsubscribed and their cache entries dropped; added
    /// ids go through the same resolve/verify/subscribe/seed sequence as
    /// construction. Ids present in both sets are untouched.
    ///
    /// Returns the ids that were actually removed so the caller can cascade
    /// cleanup (the learner drops its per-device data this way).
    pub async fn update_device_ids(&mut self, new_ids: &[String]) -> Vec<String> {
        let removed: Vec<String> = self
            .records
            .keys()
            .filter(|id| !new_ids.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            self.remove_device(id).await;
        }

        for id in new_ids {
            if !self.records.contains_key(id) {
                self.add_device(id).await;
            }
        }

        removed
    }

    /// Apply a delivered capability value to the cache.
    ///
    /// Returns the boolean value, or `None` when the device is not (or no
    /// longer) configured or the payload is not a boolean. Both cases are
    /// logged and cause no state mutation.
    pub fn record_value(&mut self, device_id: &str, value: &Value) -> Option<bool> {
        let record = match self.records.get_mut(device_id) {
            Some(record) => record,
            None => {
                debug!(device_id, kind = %self.kind, "event for unconfigured device, ignoring");
                return None;
            }
        };
        let value = match value.as_bool() {
            Some(b) => b,
            None => {
                warn!(device_id, ?value, "non-boolean value for boolean capability, dropping");
                return None;
            }
        };
        record.last_known = Some(value);
        Some(value)
    }

    pub fn is_any_true(&self) -> bool {
        self.observed_values().any(|v| v)
    }

    pub fn is_all_true(&self) -> bool {
        self.observed_values().all(|v| v)
    }

    pub fn is_any_false(&self) -> bool {
        self.observed_values().any(|v| !v)
    }

    /// Vacuously true for an empty registry and for devices never yet seen;
    /// a device only counts as false once a value has been observed.
    pub fn is_all_false(&self) -> bool {
        self.observed_values().all(|v| !v)
    }

    fn observed_values(&self) -> impl Iterator<Item = bool> + '_ {
        self.records.values().filter_map(|r| r.last_known)
    }

    pub fn device_name(&self, device_id: &str) -> Option<&str> {
        self.records.get(device_id).map(|r| r.name.as_str())
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Tear down every subscription.
    pub async fn destroy(&mut self) {
        let ids: Vec<String> = self.records.keys().cloned().collect();
        for id in ids {
            self.remove_device(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::platform::MemoryPlatform;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn motion_registry(
        platform: &Arc<MemoryPlatform>,
        device_ids: &[&str],
    ) -> (
        BooleanSensorRegistry,
        mpsc::UnboundedReceiver<CapabilityEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = BooleanSensorRegistry::new(
            platform.clone() as Arc<dyn DevicePlatform>,
            SensorKind::Motion,
            &ids(device_ids),
            tx,
        )
        .await;
        (registry, rx)
    }

    #[tokio::test]
    async fn test_construction_subscribes_and_seeds() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_device("m1", "Hall Motion", &[CAPABILITY_MOTION]);
        platform.set_value("m1", CAPABILITY_MOTION, json!(true));

        let (registry, mut rx) = motion_registry(&platform, &["m1"]).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(platform.subscription_count(), 1);
        assert_eq!(registry.device_name("m1"), Some("Hall Motion"));

        // The current value is replayed through the event channel
        let seed = rx.try_recv().unwrap();
        assert_eq!(seed.device_id, "m1");
        assert_eq!(seed.value, json!(true));
    }

    #[tokio::test]
    async fn test_missing_device_and_capability_are_skipped() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_device("d1", "Front Door", &[CAPABILITY_CONTACT]);
        platform.add_device("m1", "Hall Motion", &[CAPABILITY_MOTION]);

        // "ghost" does not exist, "d1" lacks alarm_motion; only "m1" sticks,
        // and neither failure aborts the others.
        let (registry, _rx) = motion_registry(&platform, &["ghost", "d1", "m1"]).await;
        assert_eq!(registry.device_ids(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_predicates_over_cache() {
        let platform = Arc::new(MemoryPlatform::new());
        for id in ["m1", "m2"] {
            platform.add_device(id, id, &[CAPABILITY_MOTION]);
        }
        let (mut registry, _rx) = motion_registry(&platform, &["m1", "m2"]).await;

        // Nothing observed yet: "all false" vacuously, "any true" false
        assert!(registry.is_all_false());
        assert!(!registry.is_any_true());

        registry.record_value("m1", &json!(true));
        assert!(registry.is_any_true());
        assert!(!registry.is_all_false());
        // m2 unknown: excluded from the "true" predicates
        assert!(registry.is_all_true());

        registry.record_value("m2", &json!(false));
        assert!(!registry.is_all_true());
        assert!(registry.is_any_false());

        registry.record_value("m1", &json!(false));
        assert!(registry.is_all_false());
        assert!(!registry.is_any_true());
    }

    #[tokio::test]
    async fn test_empty_registry_predicates() {
        let platform = Arc::new(MemoryPlatform::new());
        let (registry, _rx) = motion_registry(&platform, &[]).await;
        assert!(registry.is_all_false());
        assert!(!registry.is_any_true());
        assert!(!registry.is_any_false());
    }

    #[tokio::test]
    async fn test_record_value_rejects_bad_input() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.add_device("m1", "Hall Motion", &[CAPABILITY_MOTION]);
        let (mut registry, _rx) = motion_registry(&platform, &["m1"]).await;

        // Unconfigured device
        assert_eq!(registry.record_value("stranger", &json!(true)), None);
        // Non-boolean payload
        assert_eq!(registry.record_value("m1", &json!("yes")), None);
        assert!(!registry.is_any_true());

        assert_eq!(registry.record_value("m1", &json!(true)), Some(true));
    }

    #[tokio::test]
    async fn test_update_device_ids_diffs() {
        let platform = Arc::new(MemoryPlatform::new());
        for id in ["m1", "m2", "m3"] {
            platform.add_device(id, id, &[CAPABILITY_MOTION]);
        }
        let (mut registry, _rx) = motion_registry(&platform, &["m1", "m2"]).await;
        assert_eq!(platform.subscription_count(), 2);

        let removed = registry.update_device_ids(&ids(&["m2", "m3"])).await;
        assert_eq!(removed, vec!["m1".to_string()]);
        assert_eq!(registry.device_ids(), ids(&["m2", "m3"]));
        assert_eq!(platform.subscription_count(), 2);

        // m1's cache entry is gone; its events are now ignored
        assert_eq!(registry.record_value("m1", &json!(true)), None);
    }

    #[tokio::test]
    async fn test_destroy_unsubscribes_everything() {
        let platform = Arc::new(MemoryPlatform::new());
        for id in ["m1", "m2"] {
            platform.add_device(id, id, &[CAPABILITY_MOTION]);
        }
        let (mut registry, _rx) = motion_registry(&platform, &["m1", "m2"]).await;

        registry.destroy().await;
        assert!(registry.is_empty());
        assert_eq!(platform.subscription_count(), 0);
    }
}
