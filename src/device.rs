//! `Device`: the hub-owned wrapper around one `Driver`, tracking connection
//! state and translating property-node operations into fully-qualified
//! events (design §3, §4.1 "Connection gating").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::driver::Driver;
use crate::error::{CoreError, CoreResult};
use crate::events::{device_name_middleware, Event};
use crate::path::PropertyPath;
use crate::property::{NodeEvent, PropertyNode};

/// Connection-state enum, in the order the data model specifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    ConnectionLost,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NotConnected => "NotConnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::ConnectionLost => "ConnectionLost",
        }
    }
}

pub struct Device {
    name: String,
    driver: Arc<dyn Driver>,
    state: RwLock<ConnectionState>,
    /// Fully-qualified event bus this device publishes to; `DeviceHub`
    /// subscribes to this, not to the driver's raw feed.
    events: broadcast::Sender<Event>,
    /// Keeps the device-name-stamping bridge (`crate::events::spawn_bridge`)
    /// alive for the device's lifetime.
    _bridge: JoinHandle<()>,
    /// Serializes hub-initiated batch operations on this device (design §5:
    /// "a batched set applied by the hub is a sequence of individual sets
    /// under the same device mutex").
    batch_lock: Mutex<()>,
}

impl Device {
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>) -> Arc<Self> {
        let name = name.into();
        let (events_tx, _rx) = broadcast::channel(256);
        let middleware = device_name_middleware(name.clone());
        let bridge = crate::events::spawn_bridge(driver.raw_events(), middleware, events_tx.clone());

        Arc::new(Device {
            name,
            driver,
            state: RwLock::new(ConnectionState::NotConnected),
            events: events_tx,
            _bridge: bridge,
            batch_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        tracing::info!(device = %self.name, state = state.as_str(), "connection state changed");
        let _ = self.events.send(Event {
            kind: crate::events::EventKind::DeviceConnectionStateChanged,
            device: self.name.clone(),
            path: PropertyPath::empty(),
            value: state.as_str().to_string(),
        });
    }

    pub async fn connect(&self) -> CoreResult<()> {
        self.set_state(ConnectionState::Connecting).await;
        match self.driver.connect().await {
            Ok(()) => {
                for node in self.driver.node_map().values() {
                    node.mark_valid();
                }
                self.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::NotConnected).await;
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self) -> CoreResult<()> {
        self.set_state(ConnectionState::Disconnecting).await;
        match self.driver.disconnect().await {
            Ok(()) => {
                for node in self.driver.node_map().values() {
                    node.mark_invalid();
                }
                self.set_state(ConnectionState::NotConnected).await;
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::ConnectionLost).await;
                Err(err)
            }
        }
    }

    fn node_or_not_found(&self, property: &str) -> CoreResult<Arc<PropertyNode>> {
        self.driver
            .node(property)
            .filter(|n| n.is_valid())
            .ok_or_else(|| {
                CoreError::NotFound(format!("property '{}/{}' not found", self.name, property))
            })
    }

    async fn require_connected(&self) -> CoreResult<()> {
        if *self.state.read().await == ConnectionState::Connected {
            Ok(())
        } else {
            Err(CoreError::FailedPrecondition(format!(
                "device '{}' is not connected",
                self.name
            )))
        }
    }

    fn emit(&self, property: &str, event: NodeEvent) {
        let (kind, value) = match event {
            NodeEvent::ValueUpdated(v) => (crate::events::EventKind::DevicePropertyValueUpdate, v),
            NodeEvent::OperationComplete(v) => {
                (crate::events::EventKind::DeviceOperationComplete, v)
            }
        };
        let _ = self.events.send(Event {
            kind,
            device: self.name.clone(),
            path: PropertyPath::property(self.name.clone(), property),
            value,
        });
    }

    /// Reads through the property graph. Fails fast with `FailedPrecondition`
    /// unless connected (design §4.1 #4).
    pub async fn get_property(&self, property: &str) -> CoreResult<String> {
        self.require_connected().await?;
        let node = self.node_or_not_found(property)?;
        let (value, events) = node.get_value().await?;
        for event in events {
            self.emit(property, event);
        }
        Ok(value)
    }

    pub async fn set_property(&self, property: &str, value: String) -> CoreResult<()> {
        self.require_connected().await?;
        let node = self.node_or_not_found(property)?;
        node.set_value(value).await
    }

    pub async fn wait_property(&self, property: &str, deadline: Duration) -> CoreResult<()> {
        self.require_connected().await?;
        let node = self.node_or_not_found(property)?;
        node.wait_until(deadline).await
    }

    /// `get_snapshot` always succeeds, even when not connected (design §4.1 #4).
    pub async fn get_snapshot(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (name, node) in self.driver.node_map() {
            if node.is_valid() {
                if let Some(value) = node.get_snapshot().await {
                    out.insert(name, value);
                }
            }
        }
        out
    }

    pub fn list_property_names(&self) -> Vec<String> {
        self.driver.node_map().into_keys().collect()
    }

    /// Runs `sets` sequentially under this device's batch mutex (design §5),
    /// stopping at (and returning) the first failure.
    pub async fn set_properties_batch(&self, sets: &[(String, String)]) -> CoreResult<()> {
        let _guard = self.batch_lock.lock().await;
        for (property, value) in sets {
            self.set_property(property, value.clone()).await?;
        }
        Ok(())
    }

    /// Waits on `properties` sequentially under this device's batch mutex,
    /// returning on the first per-device failure.
    pub async fn wait_properties_batch(
        &self,
        properties: &[String],
        deadline: Duration,
    ) -> CoreResult<()> {
        let _guard = self.batch_lock.lock().await;
        for property in properties {
            self.wait_property(property, deadline).await?;
        }
        Ok(())
    }

    /// Injects a raw observation directly (used by the hub's batch workers to
    /// let driver push-updates, e.g. motion-bit fan-out, bypass a full
    /// `get_value` round-trip — exposed for completeness and for tests).
    pub async fn observe(&self, property: &str, value: String) -> CoreResult<()> {
        let node = self.node_or_not_found(property)?;
        for event in node.observe_value(value).await {
            self.emit(property, event);
        }
        Ok(())
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_optics::MockOpticsDriver;

    #[tokio::test]
    async fn operations_fail_precondition_before_connect() {
        let driver = MockOpticsDriver::new();
        let device = Device::new("Optics", driver);
        assert!(matches!(
            device.get_property("Filter/Block").await,
            Err(CoreError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn get_snapshot_succeeds_even_when_not_connected() {
        let driver = MockOpticsDriver::new();
        let device = Device::new("Optics", driver);
        assert!(device.get_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn connect_marks_nodes_valid_and_allows_property_access() {
        let driver = MockOpticsDriver::new();
        let device = Device::new("Optics", driver);
        device.connect().await.unwrap();
        assert_eq!(device.connection_state().await, ConnectionState::Connected);
        assert!(device.get_property("Block").await.is_ok());
    }
}
