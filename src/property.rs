//! `PropertyNode`: the per-property state machine at the heart of the
//! property-graph abstraction (design §4.1).
//!
//! Grounded primarily on `examples/original_source/src/device/device.h`'s
//! `PropertyNode` abstract class (snapshot / pending-set / wait-until
//! contract), with the reactive-update mechanics borrowed from
//! `Parameter<T>` (`examples/easternanemone-rust-daq/src/parameter.rs`): a
//! `tokio::sync::RwLock` guarding the small bit of mutable state, and a
//! `tokio::sync::Notify` standing in for that type's `watch` channel as the
//! wake-up primitive for `wait_until`.
//!
//! Completion is detected only by *observed equality*: `observe_value` is the
//! single place a newly-read value is compared against the cached snapshot and
//! against any outstanding pending set. `get_value` (reading through the
//! backend) and driver-pushed updates (motion-bit fan-out, vendor callbacks)
//! both funnel through it, so the invariants in design §3 hold regardless of
//! which path produced the new value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::timeout;

use crate::error::{CoreError, CoreResult};

/// The two events a single observation can produce. A node never emits more
/// than one of each per observation (P2, P3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The observed value differs from the previous snapshot.
    ValueUpdated(String),
    /// The observed value matched an outstanding pending set, which is now
    /// cleared.
    OperationComplete(String),
}

/// Read/write access to the physical device backing a node. `None` for
/// pseudo-properties whose value is only ever pushed via `observe_value` by
/// the owning driver (design §4.1 #3).
#[async_trait]
pub trait PropertyBackend: Send + Sync {
    async fn read(&self) -> CoreResult<String>;
    async fn write(&self, value: String) -> CoreResult<()>;
}

#[derive(Debug, Clone)]
struct Snapshot {
    value: String,
    at: Instant,
}

#[derive(Debug, Default)]
struct NodeState {
    snapshot: Option<Snapshot>,
    pending_set: Option<String>,
}

pub struct PropertyNode {
    name: String,
    description: String,
    options: Option<Vec<String>>,
    readable: bool,
    writable: bool,
    valid: AtomicBool,
    backend: Option<Arc<dyn PropertyBackend>>,
    state: RwLock<NodeState>,
    notify: Notify,
}

impl PropertyNode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        options: Option<Vec<String>>,
        readable: bool,
        writable: bool,
        backend: Option<Arc<dyn PropertyBackend>>,
    ) -> Self {
        PropertyNode {
            name: name.into(),
            description: description.into(),
            options,
            readable,
            writable,
            valid: AtomicBool::new(false),
            backend,
            state: RwLock::new(NodeState::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn options(&self) -> Option<&[String]> {
        self.options.as_deref()
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Becomes true only once the owning device has connected and enumerated
    /// this node successfully (design §3 invariant).
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Reads from the device via the backend, updates the cached snapshot, and
    /// returns the events that observation produced (design §4.1: "emits
    /// `PropertyValueUpdate` iff the value differs ... clears [pending_set] and
    /// emits `OperationComplete`").
    pub async fn get_value(&self) -> CoreResult<(String, Vec<NodeEvent>)> {
        let backend = self.backend.clone().ok_or_else(|| {
            CoreError::Internal(format!("property '{}' has no readable backend", self.name))
        })?;
        let value = backend.read().await?;
        let events = self.observe_value(value.clone()).await;
        Ok((value, events))
    }

    /// Dispatches a write and records it as `pending_set`. Fire-and-forget:
    /// returns as soon as the driver accepts the request, without waiting for
    /// completion (design §4.1 key choice #1).
    pub async fn set_value(&self, value: String) -> CoreResult<()> {
        if !self.writable {
            return Err(CoreError::InvalidArgument(format!(
                "property '{}' is not writable",
                self.name
            )));
        }
        let backend = self.backend.clone().ok_or_else(|| {
            CoreError::Internal(format!("property '{}' has no writable backend", self.name))
        })?;
        backend.write(value.clone()).await?;
        self.state.write().await.pending_set = Some(value);
        Ok(())
    }

    /// A pure read of the cached value; never touches the device.
    pub async fn get_snapshot(&self) -> Option<String> {
        self.state.read().await.snapshot.as_ref().map(|s| s.value.clone())
    }

    /// Blocks until `pending_set` clears or `deadline` elapses. Returns `Ok`
    /// immediately if there is no pending set on entry.
    pub async fn wait_until(&self, deadline: Duration) -> CoreResult<()> {
        if self.state.read().await.pending_set.is_none() {
            return Ok(());
        }
        loop {
            let notified = self.notify.notified();
            if self.state.read().await.pending_set.is_none() {
                return Ok(());
            }
            match timeout(deadline, notified).await {
                Ok(()) => {
                    if self.state.read().await.pending_set.is_none() {
                        return Ok(());
                    }
                    // Spurious wake (e.g. a different value observed without
                    // clearing this pending set); loop and re-check/timeout.
                }
                Err(_) => {
                    return Err(CoreError::DeadlineExceeded(format!(
                        "property '{}' did not confirm its pending set in time",
                        self.name
                    )))
                }
            }
        }
    }

    /// Folds a freshly-observed value into the cached state: this is the one
    /// place P1–P3 are enforced, whether the value came from `get_value` or a
    /// driver pushing an update (motion-bit fan-out, vendor callback).
    pub async fn observe_value(&self, value: String) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        let mut state = self.state.write().await;

        let changed = state
            .snapshot
            .as_ref()
            .map(|s| s.value != value)
            .unwrap_or(true);
        state.snapshot = Some(Snapshot {
            value: value.clone(),
            at: Instant::now(),
        });
        if changed {
            events.push(NodeEvent::ValueUpdated(value.clone()));
        }

        if state.pending_set.as_deref() == Some(value.as_str()) {
            state.pending_set = None;
            events.push(NodeEvent::OperationComplete(value));
            drop(state);
            self.notify.notify_waiters();
        }

        events
    }

    pub async fn has_pending_set(&self) -> bool {
        self.state.read().await.pending_set.is_some()
    }

    /// Returns the outstanding pending-set value, if any. Used by drivers
    /// doing motion-bit fan-out (design §4.1 #2): when a status word reports
    /// an axis has stopped, the driver has no independent way to learn the
    /// value that axis settled on other than the request it itself issued.
    pub async fn peek_pending(&self) -> Option<String> {
        self.state.read().await.pending_set.clone()
    }
}

impl std::fmt::Debug for PropertyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyNode")
            .field("name", &self.name)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A static in-memory backend useful for pseudo-properties and tests: reads
/// return whatever was last written, with no device I/O at all.
pub struct MemoryBackend {
    value: RwLock<String>,
}

impl MemoryBackend {
    pub fn new(initial: impl Into<String>) -> Arc<Self> {
        Arc::new(MemoryBackend {
            value: RwLock::new(initial.into()),
        })
    }
}

#[async_trait]
impl PropertyBackend for MemoryBackend {
    async fn read(&self) -> CoreResult<String> {
        Ok(self.value.read().await.clone())
    }

    async fn write(&self, value: String) -> CoreResult<()> {
        *self.value.write().await = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(backend: Arc<dyn PropertyBackend>) -> PropertyNode {
        PropertyNode::new("Block", "filter block", None, true, true, Some(backend))
    }

    #[tokio::test]
    async fn get_value_updates_snapshot_and_emits_on_change() {
        let n = node(MemoryBackend::new("5"));
        let (value, events) = n.get_value().await.unwrap();
        assert_eq!(value, "5");
        assert_eq!(events, vec![NodeEvent::ValueUpdated("5".to_string())]);
        assert_eq!(n.get_snapshot().await, Some("5".to_string()));
    }

    #[tokio::test]
    async fn repeated_equal_observations_emit_at_most_one_update_each() {
        let n = node(MemoryBackend::new("5"));
        let (_, first) = n.get_value().await.unwrap();
        let (_, second) = n.get_value().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "P3: unchanged value must not re-emit");
    }

    #[tokio::test]
    async fn set_then_matching_observation_clears_pending_and_completes() {
        let backend = MemoryBackend::new("5");
        let n = node(backend.clone());
        n.set_value("2".to_string()).await.unwrap();
        assert!(n.has_pending_set().await);

        let (_, events) = n.get_value().await.unwrap();
        assert!(events.contains(&NodeEvent::OperationComplete("2".to_string())));
        assert!(!n.has_pending_set().await);
    }

    #[tokio::test]
    async fn wait_until_returns_immediately_with_no_pending_set() {
        let n = node(MemoryBackend::new("5"));
        n.wait_until(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_until_times_out_if_never_confirmed() {
        let backend = MemoryBackend::new("5");
        let n = node(backend);
        n.set_value("9".to_string()).await.unwrap();
        // Nothing will ever observe "9" back, so this must time out.
        let result = n.wait_until(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(CoreError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn wait_until_unblocks_when_another_task_confirms_the_set() {
        let backend = MemoryBackend::new("5");
        let n = Arc::new(node(backend.clone()));
        n.set_value("9".to_string()).await.unwrap();

        let waiter = {
            let n = n.clone();
            tokio::spawn(async move { n.wait_until(Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        n.observe_value("9".to_string()).await;

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn set_value_on_read_only_property_is_rejected() {
        let n = PropertyNode::new(
            "Block",
            "filter block",
            None,
            true,
            false,
            Some(MemoryBackend::new("5") as Arc<dyn PropertyBackend>),
        );
        assert!(matches!(
            n.set_value("2".to_string()).await,
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
