//! A mock scientific-camera driver: free-runs under `TriggerSource=Internal`
//! or waits for `fire_trigger()` under `TriggerSource=Software` (design §4.2),
//! simulating exposures in wall-clock time scaled down for test speed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::driver::{AcquisitionMode, CameraDriver, Driver, FrameReadiness};
use crate::error::{CoreError, CoreResult};
use crate::events::RawEvent;
use crate::image::Frame;
use crate::property::{MemoryBackend, NodeEvent, PropertyNode};

/// Wall-clock floor for a simulated exposure, so test suites don't stall on a
/// driver that would otherwise run at whatever `ExposureTime` the test set.
const MIN_SIMULATED_EXPOSURE: Duration = Duration::from_millis(5);

struct FrameRing {
    capacity: usize,
    frames: Vec<(Frame, DateTime<Local>)>,
    overflowed_since_last_read: bool,
}

impl FrameRing {
    fn new() -> Self {
        FrameRing {
            capacity: 0,
            frames: Vec::new(),
            overflowed_since_last_read: false,
        }
    }

    fn push(&mut self, frame: Frame, at: DateTime<Local>) {
        self.frames.push((frame, at));
        if self.frames.len() > self.capacity.max(1) {
            self.frames.remove(0);
            self.overflowed_since_last_read = true;
        }
    }

    fn get(&mut self, i: i64) -> CoreResult<(Frame, DateTime<Local>)> {
        let index = if i < 0 {
            self.frames.len().checked_sub(1)
        } else {
            usize::try_from(i).ok().filter(|idx| *idx < self.frames.len())
        };
        let (frame, at) = index
            .and_then(|idx| self.frames.get(idx))
            .ok_or_else(|| CoreError::FailedPrecondition("no frame buffered yet".into()))?
            .clone();
        Ok((frame, at))
    }
}

struct AcquisitionState {
    mode: Option<AcquisitionMode>,
    stopping: bool,
}

pub struct MockCameraDriver {
    nodes: BTreeMap<String, Arc<PropertyNode>>,
    ring: Arc<Mutex<FrameRing>>,
    acquisition: Mutex<AcquisitionState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Background poll coroutine confirming property pending-sets while
    /// connected (design §9's `poll(interval)` convention); `None` while
    /// disconnected.
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    frame_ready: Arc<Notify>,
    exposure_end: Arc<Notify>,
    software_trigger: Arc<Notify>,
    stop_flag: Arc<AtomicBool>,
    frames_produced: Arc<AtomicUsize>,
    last_exposure_end: Arc<RwLock<Option<DateTime<Local>>>>,
    raw_tx: broadcast::Sender<RawEvent>,
    /// Test-only fault injection: the call to `fire_trigger` at this
    /// 0-indexed count fails with `Unavailable` instead of firing.
    fail_trigger_at: Mutex<Option<usize>>,
    trigger_calls: AtomicUsize,
}

impl MockCameraDriver {
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "TriggerSource".to_string(),
            Arc::new(PropertyNode::new(
                "TriggerSource",
                "frame trigger source",
                Some(vec!["Internal".to_string(), "Software".to_string()]),
                true,
                true,
                Some(MemoryBackend::new("Internal") as Arc<_>),
            )),
        );
        nodes.insert(
            "ExposureTime".to_string(),
            Arc::new(PropertyNode::new(
                "ExposureTime",
                "exposure time, seconds",
                None,
                true,
                true,
                Some(MemoryBackend::new("0.01") as Arc<_>),
            )),
        );

        let (raw_tx, _rx) = broadcast::channel(256);
        Arc::new(MockCameraDriver {
            nodes,
            ring: Arc::new(Mutex::new(FrameRing::new())),
            acquisition: Mutex::new(AcquisitionState {
                mode: None,
                stopping: false,
            }),
            loop_handle: Mutex::new(None),
            poll_handle: Mutex::new(None),
            frame_ready: Arc::new(Notify::new()),
            exposure_end: Arc::new(Notify::new()),
            software_trigger: Arc::new(Notify::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            frames_produced: Arc::new(AtomicUsize::new(0)),
            last_exposure_end: Arc::new(RwLock::new(None)),
            raw_tx: raw_tx.clone(),
            fail_trigger_at: Mutex::new(None),
            trigger_calls: AtomicUsize::new(0),
        })
    }

    /// Arranges for the `n`-th (0-indexed) call to `fire_trigger` to fail
    /// with `Unavailable` instead of firing. Used by the mid-task
    /// driver-failure test; not part of the driver's production surface.
    pub async fn fail_trigger_on_call(&self, n: usize) {
        *self.fail_trigger_at.lock().await = Some(n);
    }
}

#[async_trait]
impl Driver for MockCameraDriver {
    fn driver_name(&self) -> &str {
        "MockCamera"
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
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect();
        let raw_tx = self.raw_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
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
        self.stop_acquisition().await
    }

    fn raw_events(&self) -> broadcast::Receiver<RawEvent> {
        self.raw_tx.subscribe()
    }
}

#[async_trait]
impl CameraDriver for MockCameraDriver {
    async fn alloc_buffer(&self, n: usize) -> CoreResult<()> {
        let mut ring = self.ring.lock().await;
        if ring.capacity < n {
            ring.capacity = n;
        }
        Ok(())
    }

    async fn release_buffer(&self) -> CoreResult<()> {
        let mut ring = self.ring.lock().await;
        ring.capacity = 0;
        ring.frames.clear();
        Ok(())
    }

    async fn start_acquisition(&self, mode: AcquisitionMode) -> CoreResult<()> {
        {
            let mut state = self.acquisition.lock().await;
            if state.mode.is_some() {
                return Err(CoreError::FailedPrecondition(
                    "acquisition already running".into(),
                ));
            }
            state.mode = Some(mode);
            state.stopping = false;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.frames_produced.store(0, Ordering::SeqCst);

        let driver = MockCameraLoop {
            nodes: self.nodes.clone(),
            ring: self.ring.clone(),
            frame_ready: self.frame_ready.clone(),
            exposure_end: self.exposure_end.clone(),
            software_trigger: self.software_trigger.clone(),
            stop_flag: self.stop_flag.clone(),
            frames_produced: self.frames_produced.clone(),
            last_exposure_end: self.last_exposure_end.clone(),
            raw_tx: self.raw_tx.clone(),
        };

        let handle = tokio::spawn(async move { driver.run(mode).await });
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop_acquisition(&self) -> CoreResult<()> {
        self.acquisition.lock().await.stopping = true;
        self.stop_flag.store(true, Ordering::SeqCst);
        self.frame_ready.notify_waiters();
        self.exposure_end.notify_waiters();
        self.software_trigger.notify_waiters();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(1), handle).await.is_err() {
                return Err(CoreError::DeadlineExceeded(
                    "acquisition loop did not stop within 1s".into(),
                ));
            }
        }
        self.acquisition.lock().await.mode = None;
        Ok(())
    }

    async fn wait_exposure_end(&self, timeout_duration: Duration) -> CoreResult<DateTime<Local>> {
        loop {
            if let Some(at) = *self.last_exposure_end.read().await {
                *self.last_exposure_end.write().await = None;
                return Ok(at);
            }
            let notified = self.exposure_end.notified();
            match timeout(timeout_duration, notified).await {
                Ok(()) => {
                    if self.stop_flag.load(Ordering::SeqCst) {
                        return Err(CoreError::Cancelled("acquisition stopped".into()));
                    }
                    continue;
                }
                Err(_) => {
                    return Err(CoreError::DeadlineExceeded(
                        "timed out waiting for exposure end".into(),
                    ))
                }
            }
        }
    }

    async fn wait_frame_ready(&self, timeout_duration: Duration) -> CoreResult<FrameReadiness> {
        let notified = self.frame_ready.notified();
        match timeout(timeout_duration, notified).await {
            Ok(()) => {
                if self.stop_flag.load(Ordering::SeqCst) {
                    return Err(CoreError::Cancelled("acquisition stopped".into()));
                }
                let mut ring = self.ring.lock().await;
                if ring.overflowed_since_last_read {
                    ring.overflowed_since_last_read = false;
                    Ok(FrameReadiness::DataLoss)
                } else {
                    Ok(FrameReadiness::Ready)
                }
            }
            Err(_) => Err(CoreError::DeadlineExceeded(
                "timed out waiting for a frame".into(),
            )),
        }
    }

    async fn get_frame(&self, i: i64) -> CoreResult<(Frame, DateTime<Local>)> {
        self.ring.lock().await.get(i)
    }

    async fn fire_trigger(&self) -> CoreResult<()> {
        let snapshot = self
            .nodes
            .get("TriggerSource")
            .expect("TriggerSource node always present")
            .get_snapshot()
            .await;
        if snapshot.as_deref() != Some("Software") {
            return Err(CoreError::FailedPrecondition(
                "fire_trigger requires TriggerSource=Software".into(),
            ));
        }

        let call_index = self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_trigger_at.lock().await == Some(call_index) {
            return Err(CoreError::Unavailable(
                "simulated trigger failure".into(),
            ));
        }

        self.software_trigger.notify_waiters();
        Ok(())
    }
}

/// Wrapper kept out of `MockCameraDriver` itself so the spawned acquisition
/// loop doesn't need to hold a strong reference back to the driver.
struct MockCameraLoop {
    nodes: BTreeMap<String, Arc<PropertyNode>>,
    ring: Arc<Mutex<FrameRing>>,
    frame_ready: Arc<Notify>,
    exposure_end: Arc<Notify>,
    software_trigger: Arc<Notify>,
    stop_flag: Arc<AtomicBool>,
    frames_produced: Arc<AtomicUsize>,
    last_exposure_end: Arc<RwLock<Option<DateTime<Local>>>>,
    raw_tx: broadcast::Sender<RawEvent>,
}

impl MockCameraLoop {
    async fn run(self, mode: AcquisitionMode) {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            let source = self
                .nodes
                .get("TriggerSource")
                .expect("TriggerSource node always present")
                .get_snapshot()
                .await
                .unwrap_or_else(|| "Internal".to_string());

            if source == "Software" {
                self.software_trigger.notified().await;
                if self.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
            }

            let exposure = self
                .nodes
                .get("ExposureTime")
                .expect("ExposureTime node always present")
                .get_snapshot()
                .await
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.01f64);
            tokio::time::sleep(Duration::from_secs_f64(exposure).max(MIN_SIMULATED_EXPOSURE)).await;

            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            let at = Local::now();
            *self.last_exposure_end.write().await = Some(at);
            self.exposure_end.notify_waiters();
            let _ = self.raw_tx.send(RawEvent::operation_complete("ExposureEnd", at.to_rfc3339()));

            self.ring.lock().await.push(
                Frame {
                    width: 4,
                    height: 4,
                    bits_per_pixel: 16,
                    data: vec![0; 32],
                },
                at,
            );
            self.frame_ready.notify_waiters();

            let produced = self.frames_produced.fetch_add(1, Ordering::SeqCst) + 1;
            if let AcquisitionMode::Snap(n) = mode {
                if produced >= n {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snap_mode_stops_after_n_frames_and_frames_are_readable() {
        let camera = MockCameraDriver::new();
        camera.alloc_buffer(4).await.unwrap();
        camera.start_acquisition(AcquisitionMode::Snap(2)).await.unwrap();

        for _ in 0..2 {
            camera
                .wait_frame_ready(Duration::from_secs(1))
                .await
                .unwrap();
        }
        let (frame, _ts) = camera.get_frame(-1).await.unwrap();
        assert_eq!(frame.width, 4);
    }

    #[tokio::test]
    async fn stop_acquisition_cancels_a_pending_wait() {
        let camera = MockCameraDriver::new();
        camera.alloc_buffer(2).await.unwrap();
        camera
            .node("ExposureTime")
            .unwrap()
            .set_value("5".to_string())
            .await
            .unwrap();
        camera.start_acquisition(AcquisitionMode::Continuous).await.unwrap();

        let wait = tokio::time::timeout(
            Duration::from_millis(200),
            camera.wait_frame_ready(Duration::from_secs(10)),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        camera.stop_acquisition().await.unwrap();

        let result = wait.await;
        if let Ok(inner) = result {
            assert!(matches!(inner, Err(CoreError::Cancelled(_))));
        }
    }

    #[tokio::test]
    async fn fire_trigger_rejected_unless_software_trigger_source() {
        let camera = MockCameraDriver::new();
        assert!(matches!(
            camera.fire_trigger().await,
            Err(CoreError::FailedPrecondition(_))
        ));
    }
}
