//! `DeviceHub`: the single entry point every task, the channel controller,
//! and the image manager go through to reach devices (design §4.3).
//!
//! Grounded on `examples/original_source/src/device/devicehub.h`'s
//! `DeviceHub`, which owns the device map and the list of external event
//! subscribers and fans a device's already-qualified events out to each of
//! them. The C++ version's subscriber queues are bounded blocking queues fed
//! from whichever thread produced the event; this crate keeps the same
//! fire-and-forget character with `mpsc::Sender::try_send` per subscriber
//! (a slow subscriber drops events rather than stalling the publisher), which
//! is also why `publish` is a synchronous method — callers like
//! `crate::image::ImageManager` that already hold other locks must not block
//! on a subscriber's queue to emit a notification. Back-pressure that does
//! matter (a device's own raw-event bridge) lives in `crate::events::spawn_bridge`,
//! which uses a `broadcast` channel instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::device::{ConnectionState, Device};
use crate::driver::Driver;
use crate::error::{merge_device_results, CoreError, CoreResult};
use crate::events::{Event, EventStream};
use crate::path::PropertyPath;

/// Per-subscriber event queue capacity when none is given explicitly to
/// `subscribe`.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

pub struct DeviceHub {
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
    subscriber_capacity: usize,
}

impl DeviceHub {
    pub fn new(subscriber_capacity: usize) -> Arc<Self> {
        Arc::new(DeviceHub {
            devices: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            subscriber_capacity: if subscriber_capacity == 0 {
                DEFAULT_SUBSCRIBER_CAPACITY
            } else {
                subscriber_capacity
            },
        })
    }

    /// Registers a device and starts forwarding its qualified events to every
    /// external subscriber. Replaces any existing device of the same name.
    pub async fn add_device(self: &Arc<Self>, name: impl Into<String>, driver: Arc<dyn Driver>) {
        let name = name.into();
        let device = Device::new(name.clone(), driver);

        let mut device_events = device.subscribe_events();
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match device_events.recv().await {
                    Ok(event) => hub.publish(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.devices.write().await.insert(name, device);
    }

    pub async fn get_device(&self, name: &str) -> CoreResult<Arc<Device>> {
        self.devices
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("device '{name}' not found")))
    }

    pub async fn list_devices(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    pub async fn list_connected(&self) -> Vec<String> {
        let devices = self.devices.read().await;
        let mut connected = Vec::new();
        for (name, device) in devices.iter() {
            if device.connection_state().await == ConnectionState::Connected {
                connected.push(name.clone());
            }
        }
        connected
    }

    /// Connects every registered device concurrently, aggregating failures
    /// per `crate::error::merge_device_results` (design §4.3: "a connect-all
    /// that partially fails neither rolls back nor aborts the devices that
    /// did connect").
    pub async fn connect_all(&self) -> CoreResult<()> {
        let devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let results = futures::future::join_all(
            devices
                .iter()
                .map(|device| async { (device.name().to_string(), device.connect().await) }),
        )
        .await;
        merge_device_results(results)
    }

    pub async fn disconnect_all(&self) -> CoreResult<()> {
        let devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let results = futures::future::join_all(
            devices
                .iter()
                .map(|device| async { (device.name().to_string(), device.disconnect().await) }),
        )
        .await;
        merge_device_results(results)
    }

    fn device_and_property(path: &PropertyPath) -> CoreResult<(String, String)> {
        let device = path
            .device_name()
            .ok_or_else(|| CoreError::InvalidArgument(format!("'{path}' does not name a device")))?
            .to_string();
        let property = path
            .property_name()
            .ok_or_else(|| CoreError::InvalidArgument(format!("'{path}' does not name a property")))?
            .to_string();
        Ok((device, property))
    }

    pub async fn get_property(&self, path: &PropertyPath) -> CoreResult<String> {
        let (device, property) = Self::device_and_property(path)?;
        self.get_device(&device).await?.get_property(&property).await
    }

    pub async fn set_property(&self, path: &PropertyPath, value: String) -> CoreResult<()> {
        let (device, property) = Self::device_and_property(path)?;
        self.get_device(&device).await?.set_property(&property, value).await
    }

    pub async fn wait_property(&self, path: &PropertyPath, deadline: Duration) -> CoreResult<()> {
        let (device, property) = Self::device_and_property(path)?;
        self.get_device(&device)
            .await?
            .wait_property(&property, deadline)
            .await
    }

    /// Aggregates every valid node's snapshot, keyed `"{device}/{property}"`,
    /// across `devices` (or every registered device, if `None`) into a single
    /// flat map (design §4.3).
    pub async fn get_snapshot(&self, devices: Option<&[String]>) -> CoreResult<BTreeMap<String, String>> {
        let names = match devices {
            Some(names) => names.to_vec(),
            None => self.list_devices().await,
        };
        let mut flat = BTreeMap::new();
        for device_name in names {
            let device = self.get_device(&device_name).await?;
            for (property, value) in device.get_snapshot().await {
                flat.insert(format!("{device_name}/{property}"), value);
            }
        }
        Ok(flat)
    }

    /// Returns the children of `path` (design §4.3): root enumerates devices,
    /// a device path enumerates its properties, and a property path (a leaf)
    /// has no children.
    pub async fn list_property(&self, path: &PropertyPath) -> CoreResult<Vec<String>> {
        if path.is_root() {
            return Ok(self.list_devices().await);
        }
        if path.is_property() {
            return Ok(Vec::new());
        }
        let device_name = path
            .device_name()
            .ok_or_else(|| CoreError::InvalidArgument(format!("'{path}' does not name a device")))?;
        Ok(self.get_device(device_name).await?.list_property_names())
    }

    /// Groups `sets` by device and applies each device's slice under its own
    /// batch mutex concurrently, merging per-device failures (design §5).
    pub async fn set_properties(&self, sets: Vec<(PropertyPath, String)>) -> CoreResult<()> {
        let mut by_device: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for (path, value) in sets {
            let (device, property) = Self::device_and_property(&path)?;
            by_device.entry(device).or_default().push((property, value));
        }

        let mut futures = Vec::with_capacity(by_device.len());
        for (device_name, sets) in by_device {
            let device = self.get_device(&device_name).await?;
            futures.push(async move {
                let result = device.set_properties_batch(&sets).await;
                (device_name, result)
            });
        }
        let results = futures::future::join_all(futures).await;
        merge_device_results(results)
    }

    pub async fn wait_properties(
        &self,
        paths: Vec<PropertyPath>,
        deadline: Duration,
    ) -> CoreResult<()> {
        let mut by_device: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            let (device, property) = Self::device_and_property(&path)?;
            by_device.entry(device).or_default().push(property);
        }

        let mut futures = Vec::with_capacity(by_device.len());
        for (device_name, properties) in by_device {
            let device = self.get_device(&device_name).await?;
            futures.push(async move {
                let result = device.wait_properties_batch(&properties, deadline).await;
                (device_name, result)
            });
        }
        let results = futures::future::join_all(futures).await;
        merge_device_results(results)
    }

    /// Registers a new external subscriber and returns its event stream.
    pub async fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        self.subscribers.lock().await.push(tx);
        EventStream::new(rx)
    }

    /// Fans `event` out to every live subscriber. Non-blocking: a full or
    /// closed subscriber queue drops the event for that subscriber rather
    /// than stalling the caller. Closed subscribers are pruned lazily.
    pub fn publish(&self, event: Event) {
        let Ok(mut subscribers) = self.subscribers.try_lock() else {
            // Another publish is mid-prune; drop rather than block a sync caller.
            return;
        };
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_optics::MockOpticsDriver;

    #[tokio::test]
    async fn add_device_and_connect_all_reaches_connected() {
        let hub = DeviceHub::new(16);
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        hub.connect_all().await.unwrap();
        assert_eq!(hub.list_connected().await, vec!["Optics".to_string()]);
    }

    #[tokio::test]
    async fn get_property_round_trips_through_the_hub() {
        let hub = DeviceHub::new(16);
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        hub.connect_all().await.unwrap();
        let path: PropertyPath = "/Optics/Block".parse().unwrap();
        let value = hub.get_property(&path).await.unwrap();
        assert!(!value.is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_device_connection_events() {
        let hub = DeviceHub::new(16);
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        let mut stream = hub.subscribe().await;
        hub.connect_all().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("subscriber should see an event before the timeout")
            .expect("stream should not be closed");
        assert_eq!(event.device, "Optics");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let hub = DeviceHub::new(16);
        let path: PropertyPath = "/Ghost/Block".parse().unwrap();
        assert!(matches!(
            hub.get_property(&path).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_property_enumerates_devices_properties_and_is_empty_for_a_leaf() {
        let hub = DeviceHub::new(16);
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        hub.connect_all().await.unwrap();

        let devices = hub.list_property(&PropertyPath::root()).await.unwrap();
        assert_eq!(devices, vec!["Optics".to_string()]);

        let properties = hub
            .list_property(&PropertyPath::device("Optics"))
            .await
            .unwrap();
        assert!(properties.contains(&"Block".to_string()));

        let leaf = hub
            .list_property(&PropertyPath::property("Optics", "Block"))
            .await
            .unwrap();
        assert!(leaf.is_empty());
    }

    #[tokio::test]
    async fn get_snapshot_aggregates_across_specified_or_all_devices() {
        let hub = DeviceHub::new(16);
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        hub.add_device(
            "Camera",
            crate::drivers::mock_camera::MockCameraDriver::new(),
        )
        .await;
        hub.connect_all().await.unwrap();
        hub.get_property(&"/Optics/Block".parse().unwrap()).await.unwrap();
        hub.get_property(&"/Camera/ExposureTime".parse().unwrap())
            .await
            .unwrap();

        let all = hub.get_snapshot(None).await.unwrap();
        assert!(all.contains_key("Optics/Block"));
        assert!(all.contains_key("Camera/ExposureTime"));

        let scoped = hub
            .get_snapshot(Some(&["Optics".to_string()]))
            .await
            .unwrap();
        assert!(scoped.contains_key("Optics/Block"));
        assert!(!scoped.contains_key("Camera/ExposureTime"));
    }
}
