//! A mock stage / filter-wheel / shutter driver: the motion-bit fan-out
//! example from the design (§4.1 #2) made concrete, and the default optics
//! device for the bundled configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::driver::Driver;
use crate::error::CoreResult;
use crate::events::RawEvent;
use crate::property::{MemoryBackend, NodeEvent, PropertyNode};

/// How often the background poll coroutine re-reads each backed node while
/// connected (design §9: "ad-hoc polling threads per device" replaced by a
/// `poll(interval)` method started/stopped by `connect`/`disconnect`).
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// `(bit, property name)`: bits 0 and 1 both report the XY stage; bit 3 is
/// `FilterWheel3`, bit 4 is `FilterWheel1`, bit 5 is the shutter.
const BIT_MAP: &[(u8, &str)] = &[
    (0, "XYPosition"),
    (1, "XYPosition"),
    (3, "FilterWheel3"),
    (4, "FilterWheel1"),
    (5, "DiaShutter"),
];

pub struct MockOpticsDriver {
    nodes: BTreeMap<String, Arc<PropertyNode>>,
    motion_status: Mutex<u8>,
    raw_tx: broadcast::Sender<RawEvent>,
    /// The background poll coroutine started by `connect` and aborted by
    /// `disconnect`; `None` while disconnected.
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MockOpticsDriver {
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "Block".to_string(),
            Arc::new(PropertyNode::new(
                "Block",
                "filter block position",
                None,
                true,
                true,
                Some(MemoryBackend::new("1") as Arc<_>),
            )),
        );
        nodes.insert(
            "XYPosition".to_string(),
            Arc::new(PropertyNode::new(
                "XYPosition",
                "stage position, \"x,y\" in microns",
                None,
                true,
                true,
                Some(MemoryBackend::new("0.0,0.0") as Arc<_>),
            )),
        );
        nodes.insert(
            "FilterWheel1".to_string(),
            Arc::new(PropertyNode::new(
                "FilterWheel1",
                "filter wheel 1 position",
                Some((1..=6).map(|n| n.to_string()).collect()),
                true,
                true,
                Some(MemoryBackend::new("1") as Arc<_>),
            )),
        );
        nodes.insert(
            "FilterWheel3".to_string(),
            Arc::new(PropertyNode::new(
                "FilterWheel3",
                "filter wheel 3 position",
                Some((1..=6).map(|n| n.to_string()).collect()),
                true,
                true,
                Some(MemoryBackend::new("1") as Arc<_>),
            )),
        );
        nodes.insert(
            "DiaShutter".to_string(),
            Arc::new(PropertyNode::new(
                "DiaShutter",
                "transmitted-light shutter",
                Some(vec!["Open".to_string(), "Closed".to_string()]),
                true,
                true,
                Some(MemoryBackend::new("Closed") as Arc<_>),
            )),
        );
        nodes.insert(
            "MotionStatus".to_string(),
            Arc::new(PropertyNode::new(
                "MotionStatus",
                "composite motion status word",
                None,
                true,
                false,
                None,
            )),
        );
        nodes.insert(
            "IlluminationIntensity".to_string(),
            Arc::new(PropertyNode::new(
                "IlluminationIntensity",
                "illumination intensity, percent (in-memory pseudo-property; \
                 channel control is responsible for pushing it to hardware \
                 when the shutter opens)",
                None,
                true,
                true,
                Some(MemoryBackend::new("0") as Arc<_>),
            )),
        );

        let (raw_tx, _rx) = broadcast::channel(256);
        Arc::new(MockOpticsDriver {
            nodes,
            motion_status: Mutex::new(0),
            raw_tx,
            poll_handle: Mutex::new(None),
        })
    }

    /// Simulates the controller pushing a new `MotionStatus` word. Any bit
    /// that transitions from set to clear confirms the pending set (if any)
    /// of the node that bit maps to.
    pub async fn feed_motion_status(&self, status: u8) {
        let previous = {
            let mut guard = self.motion_status.lock().await;
            std::mem::replace(&mut *guard, status)
        };

        let motion_node = self.nodes.get("MotionStatus").expect("MotionStatus node always present");
        for event in motion_node.observe_value(format!("{status:#010b}")).await {
            self.publish_node_event("MotionStatus", event);
        }

        for &(bit, property) in BIT_MAP {
            let was_moving = previous & (1 << bit) != 0;
            let now_stopped = status & (1 << bit) == 0;
            if !(was_moving && now_stopped) {
                continue;
            }
            let Some(target) = self.nodes.get(property) else {
                continue;
            };
            if let Some(pending) = target.peek_pending().await {
                for event in target.observe_value(pending).await {
                    self.publish_node_event(property, event);
                }
            }
        }
    }

    fn publish_node_event(&self, property: &str, event: NodeEvent) {
        let raw = match event {
            NodeEvent::ValueUpdated(v) => RawEvent::property_value_update(property, v),
            NodeEvent::OperationComplete(v) => RawEvent::operation_complete(property, v),
        };
        let _ = self.raw_tx.send(raw);
    }
}

#[async_trait]
impl Driver for MockOpticsDriver {
    fn driver_name(&self) -> &str {
        "MockOptics"
    }

    fn node(&self, name: &str) -> Option<Arc<PropertyNode>> {
        self.nodes.get(name).cloned()
    }

    fn node_map(&self) -> BTreeMap<String, Arc<PropertyNode>> {
        self.nodes.clone()
    }

    async fn connect(&self) -> CoreResult<()> {
        let polled: Vec<(String, Arc<PropertyNode>)> = self
            .nodes
            .iter()
            .filter(|(name, node)| name.as_str() != "MotionStatus" && node.readable())
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect();
        let raw_tx = self.raw_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                for (name, node) in &polled {
                    let Ok((_, events)) = node.get_value().await else {
                        continue;
                    };
                    for event in events {
                        let raw = match event {
                            NodeEvent::ValueUpdated(v) => RawEvent::property_value_update(name, v),
                            NodeEvent::OperationComplete(v) => {
                                RawEvent::operation_complete(name, v)
                            }
                        };
                        let _ = raw_tx.send(raw);
                    }
                }
            }
        });
        *self.poll_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    fn raw_events(&self) -> broadcast::Receiver<RawEvent> {
        self.raw_tx.subscribe()
    }
}
