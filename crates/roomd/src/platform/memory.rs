//! In-memory device platform.
//!
//! Stands in for a real device transport: tests and embedding hosts add
//! devices and push capability values; live subscriptions receive each
//! value as a [`CapabilityEvent`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::CapabilityEvent;
use super::CapabilityEventSender;
use super::DeviceHandle;
use super::DevicePlatform;
use super::PlatformError;
use super::SubscriptionId;

struct MemoryDevice {
    handle: DeviceHandle,
    values: HashMap<String, Value>,
}

struct Subscription {
    device_id: String,
    capability: String,
    tx: CapabilityEventSender,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, MemoryDevice>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_subscription: u64,
}

/// In-memory [`DevicePlatform`] implementation.
#[derive(Default)]
pub struct MemoryPlatform {
    inner: Mutex<Inner>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with the given capabilities.
    ///
    /// The device starts with no reported values.
    pub fn add_device(&self, id: &str, name: &str, capabilities: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.insert(
            id.to_string(),
            MemoryDevice {
                handle: DeviceHandle {
                    id: id.to_string(),
                    name: name.to_string(),
                    capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                },
                values: HashMap::new(),
            },
        );
    }

    /// Remove a device. Live subscriptions for it are dropped.
    pub fn remove_device(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.remove(id);
        inner.subscriptions.retain(|_, s| s.device_id != id);
    }

    /// Report a capability value for a device, fanning it out to every live
    /// subscription for that (device, capability) pair.
    pub fn set_value(&self, device_id: &str, capability: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();

        match inner.devices.get_mut(device_id) {
            Some(device) => {
                device
                    .values
                    .insert(capability.to_string(), value.clone());
            }
            None => {
                debug!(device_id, "set_value for unknown device, ignoring");
                return;
            }
        }

        // Drop subscriptions whose receiver has gone away.
        inner.subscriptions.retain(|_, sub| {
            if sub.device_id != device_id || sub.capability != capability {
                return true;
            }
            sub.tx
                .send(CapabilityEvent {
                    device_id: device_id.to_string(),
                    capability: capability.to_string(),
                    value: value.clone(),
                })
                .is_ok()
        });
    }

    /// Number of live subscriptions, for assertions in tests.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }
}

#[async_trait]
impl DevicePlatform for MemoryPlatform {
    async fn resolve(&self, device_id: &str) -> Result<DeviceHandle, PlatformError> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .get(device_id)
            .map(|d| d.handle.clone())
            .ok_or_else(|| PlatformError::DeviceNotFound(device_id.to_string()))
    }

    async fn current_value(
        &self,
        device_id: &str,
        capability: &str,
    ) -> Result<Option<Value>, PlatformError> {
        let inner = self.inner.lock().unwrap();
        let device = inner
            .devices
            .get(device_id)
            .ok_or_else(|| PlatformError::DeviceNotFound(device_id.to_string()))?;
        Ok(device.values.get(capability).cloned())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        capability: &str,
        tx: CapabilityEventSender,
    ) -> Result<SubscriptionId, PlatformError> {
        let mut inner = self.inner.lock().unwrap();

        let device = inner
            .devices
            .get(device_id)
            .ok_or_else(|| PlatformError::DeviceNotFound(device_id.to_string()))?;
        if !device.handle.has_capability(capability) {
            return Err(PlatformError::MissingCapability(
                device_id.to_string(),
                capability.to_string(),
            ));
        }

        inner.next_subscription += 1;
        let id = SubscriptionId::new(inner.next_subscription);
        inner.subscriptions.insert(
            id,
            Subscription {
                device_id: device_id.to_string(),
                capability: capability.to_string(),
                tx,
            },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscriptions
            .remove(&subscription)
            .map(|_| ())
            .ok_or(PlatformError::UnknownSubscription(subscription))
    }
}
