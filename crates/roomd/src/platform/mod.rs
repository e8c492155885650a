//! Device-platform boundary.
//!
//! roomd never talks to sensor hardware directly; it consumes an injected
//! [`DevicePlatform`] that resolves devices, reads capability values and
//! delivers capability change events over a channel. This keeps the
//! occupancy core testable against an in-memory platform.

mod memory;

pub use memory::MemoryPlatform;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Capability id for door/window contact sensors.
pub const CAPABILITY_CONTACT: &str = "alarm_contact";

/// Capability id for motion sensors.
pub const CAPABILITY_MOTION: &str = "alarm_motion";

/// A resolved device as seen by the platform.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
}

impl DeviceHandle {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// A capability value change delivered to a subscriber.
///
/// The value is kept as raw JSON at this boundary; consumers validate the
/// shape they expect (boolean for alarm capabilities) and drop the rest.
#[derive(Debug, Clone)]
pub struct CapabilityEvent {
    pub device_id: String,
    pub capability: String,
    pub value: Value,
}

/// Opaque handle for tearing down a capability subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

pub type CapabilityEventSender = mpsc::UnboundedSender<CapabilityEvent>;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device {0} does not expose capability {1}")]
    MissingCapability(String, String),

    #[error("unknown subscription: {0:?}")]
    UnknownSubscription(SubscriptionId),
}

/// Trait for device platform operations
///
/// This trait allows the occupancy core to run against any device source.
/// [`MemoryPlatform`] implements it for tests and for hosts that feed
/// values in programmatically.
#[async_trait]
pub trait DevicePlatform: Send + Sync + 'static {
    /// Resolve a device by id.
    async fn resolve(&self, device_id: &str) -> Result<DeviceHandle, PlatformError>;

    /// Read the current value of a capability.
    ///
    /// Returns `None` when the device has never reported this capability.
    async fn current_value(
        &self,
        device_id: &str,
        capability: &str,
    ) -> Result<Option<Value>, PlatformError>;

    /// Subscribe to value changes for one capability of one device.
    ///
    /// Every subsequent change is delivered on `tx` until the subscription
    /// is torn down with [`DevicePlatform::unsubscribe`].
    async fn subscribe(
        &self,
        device_id: &str,
        capability: &str,
        tx: CapabilityEventSender,
    ) -> Result<SubscriptionId, PlatformError>;

    /// Tear down a subscription.
    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), PlatformError>;
}
