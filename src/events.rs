//! The event stream: a typed, multi-producer / multi-consumer notification
//! channel with close semantics, unifying connection-state transitions,
//! property updates, task progress, and image-manager notifications.
//!
//! Grounded on `examples/original_source/src/eventstream.h`'s `EventStream` /
//! `EventSender` pair. The C++ version is a mutex + condvar + deque blocking
//! queue with an `EventSender` base class that wraps each device's raw events
//! with a caller-supplied middleware before forwarding. This crate realizes the
//! same split with `tokio` primitives: a device emits unqualified `RawEvent`s on
//! its own `broadcast` channel, and `spawn_bridge` is the concrete instance of
//! "subscribe with middleware" — instantiated once per device by
//! `crate::device::Device::new` with a closure that stamps the device name and
//! prepends it to the path, exactly as `crate::hub::DeviceHub` requires of its
//! drivers in the design (§4.3 / §6).

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::path::PropertyPath;

/// The kinds of event the core ever emits (design §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DeviceConnectionStateChanged,
    DevicePropertyValueUpdate,
    DeviceOperationComplete,
    TaskStateChanged,
    TaskChannelChanged,
    TaskMessage,
    NDImageCreated,
    NDImageChanged,
}

/// A fully-qualified event, ready to hand to a subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub device: String,
    pub path: PropertyPath,
    pub value: String,
}

impl Event {
    pub fn task_state_changed(state: &str) -> Self {
        Event {
            kind: EventKind::TaskStateChanged,
            device: String::new(),
            path: PropertyPath::empty(),
            value: state.to_string(),
        }
    }

    pub fn task_channel_changed(preset_name: &str) -> Self {
        Event {
            kind: EventKind::TaskChannelChanged,
            device: String::new(),
            path: PropertyPath::empty(),
            value: preset_name.to_string(),
        }
    }

    pub fn task_message(message: impl Into<String>) -> Self {
        Event {
            kind: EventKind::TaskMessage,
            device: String::new(),
            path: PropertyPath::empty(),
            value: message.into(),
        }
    }

    pub fn ndimage_created(name: &str) -> Self {
        Event {
            kind: EventKind::NDImageCreated,
            device: String::new(),
            path: PropertyPath::empty(),
            value: name.to_string(),
        }
    }

    pub fn ndimage_changed(name: &str) -> Self {
        Event {
            kind: EventKind::NDImageChanged,
            device: String::new(),
            path: PropertyPath::empty(),
            value: name.to_string(),
        }
    }
}

/// A device-local, unqualified event. Drivers (and `Device` itself) emit these;
/// they carry neither the device name nor a full path, so drivers stay
/// reusable across however many devices of that kind are configured.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: EventKind,
    /// Bare property name, if this event is property-scoped.
    pub property: Option<String>,
    pub value: String,
}

impl RawEvent {
    pub fn connection_state_changed(state: &str) -> Self {
        RawEvent {
            kind: EventKind::DeviceConnectionStateChanged,
            property: None,
            value: state.to_string(),
        }
    }

    pub fn property_value_update(property: impl Into<String>, value: impl Into<String>) -> Self {
        RawEvent {
            kind: EventKind::DevicePropertyValueUpdate,
            property: Some(property.into()),
            value: value.into(),
        }
    }

    pub fn operation_complete(property: impl Into<String>, value: impl Into<String>) -> Self {
        RawEvent {
            kind: EventKind::DeviceOperationComplete,
            property: Some(property.into()),
            value: value.into(),
        }
    }
}

/// A middleware closure mutating/qualifying a device's raw events before they
/// reach the hub's subscribers.
pub type Middleware = Arc<dyn Fn(RawEvent) -> Event + Send + Sync>;

/// The device-name-stamping middleware every `Device` installs over its
/// driver's raw event stream.
pub fn device_name_middleware(device_name: String) -> Middleware {
    Arc::new(move |raw: RawEvent| Event {
        kind: raw.kind,
        device: device_name.clone(),
        path: match raw.property {
            Some(property) => PropertyPath::property(device_name.clone(), property),
            None => PropertyPath::empty(),
        },
        value: raw.value,
    })
}

/// Spawns the forwarding task that applies `middleware` to every event coming
/// off `rx` and republishes it on `out`. Lagging subscribers drop events (the
/// design's "no back-pressure to the emitter side") rather than stall the
/// bridge; a closed upstream channel ends the task.
pub fn spawn_bridge(
    mut rx: broadcast::Receiver<RawEvent>,
    middleware: Middleware,
    out: broadcast::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(raw) => {
                    let _ = out.send(middleware(raw));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// A bounded-capacity FIFO handle for one external subscriber. `recv` blocks
/// until an event arrives or the stream closes; a closed stream yields `None`
/// forever after, satisfying the design's end-of-stream contract.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        EventStream { rx }
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridge_stamps_device_name_and_path() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let (out_tx, mut out_rx) = broadcast::channel(16);
        let middleware = device_name_middleware("Stage".to_string());
        let _bridge = spawn_bridge(raw_rx, middleware, out_tx);

        raw_tx
            .send(RawEvent::property_value_update("X", "1.0"))
            .unwrap();

        let event = out_rx.recv().await.unwrap();
        assert_eq!(event.device, "Stage");
        assert_eq!(event.path.to_string(), "/Stage/X");
        assert_eq!(event.value, "1.0");
    }

    #[tokio::test]
    async fn connection_events_carry_an_empty_path() {
        let (raw_tx, raw_rx) = broadcast::channel(16);
        let (out_tx, mut out_rx) = broadcast::channel(16);
        let middleware = device_name_middleware("Camera".to_string());
        let _bridge = spawn_bridge(raw_rx, middleware, out_tx);

        raw_tx
            .send(RawEvent::connection_state_changed("Connected"))
            .unwrap();

        let event = out_rx.recv().await.unwrap();
        assert_eq!(event.device, "Camera");
        assert!(event.path.is_empty());
    }
}
