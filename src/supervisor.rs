//! The experiment supervisor: the at-most-one-active-task slot and the
//! background device-readiness watcher (design §4.8).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::ChannelControl;
use crate::driver::CameraDriver;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventKind};
use crate::hub::DeviceHub;
use crate::image::ImageManager;
use crate::tasks::live_view::LiveViewTask;
use crate::tasks::multi_channel::{MultiChannelArgs, MultiChannelTask};

/// What, if anything, currently occupies the supervisor's one task slot
/// (design §4.8, "at most one of {live view, multi-channel acquisition}").
enum ActiveTask {
    Idle,
    LiveView {
        task: Arc<LiveViewTask>,
        handle: JoinHandle<CoreResult<()>>,
    },
    MultiChannel {
        handle: JoinHandle<CoreResult<()>>,
    },
}

pub struct ExperimentSupervisor {
    hub: Arc<DeviceHub>,
    images: Arc<ImageManager>,
    channel: Arc<ChannelControl>,
    camera: Arc<dyn CameraDriver>,
    camera_name: String,
    active: Mutex<ActiveTask>,
    /// Kept alive for the supervisor's lifetime; aborted on drop via
    /// `JoinHandle`'s own semantics are not relied upon here, since the
    /// supervisor itself is expected to live for the process lifetime.
    _readiness_watcher: JoinHandle<()>,
}

impl ExperimentSupervisor {
    pub fn new(
        hub: Arc<DeviceHub>,
        images: Arc<ImageManager>,
        channel: Arc<ChannelControl>,
        camera: Arc<dyn CameraDriver>,
        camera_name: impl Into<String>,
        required_devices: Vec<String>,
    ) -> Arc<Self> {
        let watcher = spawn_readiness_watcher(hub.clone(), required_devices);
        Arc::new(ExperimentSupervisor {
            hub,
            images,
            channel,
            camera,
            camera_name: camera_name.into(),
            active: Mutex::new(ActiveTask::Idle),
            _readiness_watcher: watcher,
        })
    }

    /// Starts the live-view task. `FailedPrecondition` if another task is
    /// already occupying the slot (design §4.8, P8).
    pub async fn start_live_view(&self) -> CoreResult<()> {
        let mut active = self.active.lock().await;
        if !matches!(*active, ActiveTask::Idle) {
            return Err(CoreError::FailedPrecondition(
                "a task is already running".into(),
            ));
        }

        let task = Arc::new(LiveViewTask::new(
            self.hub.clone(),
            self.images.clone(),
            self.camera.clone(),
            self.camera_name.clone(),
        ));
        let run_task = task.clone();
        let handle = tokio::spawn(async move { run_task.run().await });
        *active = ActiveTask::LiveView { task, handle };
        drop(active);

        self.hub.publish(Event::task_state_changed("Live"));
        Ok(())
    }

    /// Idempotent: a no-op if nothing is running. Requests cancellation and
    /// joins the live-view task before returning (design §4.8, §5
    /// "Destruction of a task's owning thread requires the task to have
    /// exited").
    pub async fn stop_live_view(&self) -> CoreResult<()> {
        let mut active = self.active.lock().await;
        let (task, handle) = match std::mem::replace(&mut *active, ActiveTask::Idle) {
            ActiveTask::LiveView { task, handle } => (task, handle),
            other => {
                *active = other;
                return Ok(());
            }
        };
        drop(active);

        task.stop().await?;
        let result = handle
            .await
            .unwrap_or_else(|_| Err(CoreError::Internal("live view task panicked".into())));
        self.report_task_outcome(&result);
        result
    }

    /// Launches the multi-channel task asynchronously. `FailedPrecondition`
    /// if busy; the caller joins with `wait_multi_channel`.
    pub async fn acquire_multi_channel(&self, args: MultiChannelArgs) -> CoreResult<()> {
        let mut active = self.active.lock().await;
        if !matches!(*active, ActiveTask::Idle) {
            return Err(CoreError::FailedPrecondition(
                "a task is already running".into(),
            ));
        }

        let task = MultiChannelTask::new(
            self.hub.clone(),
            self.images.clone(),
            self.channel.clone(),
            self.camera.clone(),
            self.camera_name.clone(),
        );
        let handle = tokio::spawn(async move { task.run(args).await });
        *active = ActiveTask::MultiChannel { handle };
        drop(active);

        self.hub.publish(Event::task_state_changed("Running"));
        Ok(())
    }

    /// Joins the multi-channel task, translating its outcome into the
    /// appropriate `TaskStateChanged` event before re-raising any error
    /// (design §4.8's "translates any task-thrown error ... before
    /// re-raising").
    pub async fn wait_multi_channel(&self) -> CoreResult<()> {
        let mut active = self.active.lock().await;
        let handle = match std::mem::replace(&mut *active, ActiveTask::Idle) {
            ActiveTask::MultiChannel { handle } => handle,
            other => {
                *active = other;
                return Err(CoreError::FailedPrecondition(
                    "no multi-channel acquisition is running".into(),
                ));
            }
        };
        drop(active);

        let result = handle
            .await
            .unwrap_or_else(|_| Err(CoreError::Internal("multi-channel task panicked".into())));
        self.report_task_outcome(&result);
        result
    }

    fn report_task_outcome(&self, result: &CoreResult<()>) {
        match result {
            Ok(()) => {
                tracing::info!("task finished, state is Ready");
                self.hub.publish(Event::task_state_changed("Ready"));
            }
            Err(err) => {
                tracing::error!(error = %err, "task failed");
                self.hub.publish(Event::task_state_changed("Error"));
                self.hub.publish(Event::task_message(err.to_string()));
            }
        }
    }
}

/// Tracks which of `required` devices are connected via the hub's event
/// stream and emits `TaskStateChanged("Ready")` exactly on the transition
/// from "one or more missing" to "all present" (design §4.8).
fn spawn_readiness_watcher(hub: Arc<DeviceHub>, required: Vec<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let required: HashSet<String> = required.into_iter().collect();
        if required.is_empty() {
            return;
        }
        let mut connected: HashSet<String> = HashSet::new();
        let mut stream = hub.subscribe().await;
        let mut was_ready = false;

        while let Some(event) = stream.recv().await {
            if event.kind != EventKind::DeviceConnectionStateChanged {
                continue;
            }
            if !required.contains(&event.device) {
                continue;
            }
            if event.value == "Connected" {
                connected.insert(event.device.clone());
            } else {
                connected.remove(&event.device);
            }

            let is_ready = required.is_subset(&connected);
            if is_ready && !was_ready {
                hub.publish(Event::task_state_changed("Ready"));
            }
            was_ready = is_ready;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_camera::MockCameraDriver;
    use crate::drivers::mock_optics::MockOpticsDriver;
    use serde_json::Map;
    use std::time::Duration;

    async fn build_supervisor() -> (Arc<DeviceHub>, Arc<ExperimentSupervisor>) {
        let hub = DeviceHub::new(16);
        let camera = MockCameraDriver::new();
        hub.add_device("Camera", camera.clone()).await;
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        hub.connect_all().await.unwrap();

        let images = ImageManager::new(hub.clone());
        let channel = ChannelControl::new(hub.clone(), vec![]);
        let supervisor = ExperimentSupervisor::new(
            hub.clone(),
            images,
            channel,
            camera,
            "Camera",
            vec!["Camera".to_string(), "Optics".to_string()],
        );
        (hub, supervisor)
    }

    #[tokio::test]
    async fn second_task_is_rejected_while_live_view_runs() {
        let (_hub, supervisor) = build_supervisor().await;
        supervisor.start_live_view().await.unwrap();

        let args = MultiChannelArgs {
            ndimage_name: "run1".to_string(),
            channels: vec![],
            i_z: 0,
            i_t: 0,
            metadata: Map::new(),
        };
        assert!(matches!(
            supervisor.acquire_multi_channel(args).await,
            Err(CoreError::FailedPrecondition(_))
        ));

        supervisor.stop_live_view().await.unwrap();
    }

    #[tokio::test]
    async fn stop_live_view_is_a_noop_when_idle() {
        let (_hub, supervisor) = build_supervisor().await;
        supervisor.stop_live_view().await.unwrap();
    }

    #[tokio::test]
    async fn readiness_watcher_emits_ready_once_all_required_devices_connect() {
        let hub = DeviceHub::new(16);
        hub.add_device("Camera", MockCameraDriver::new()).await;
        hub.add_device("Optics", MockOpticsDriver::new()).await;

        let mut stream = hub.subscribe().await;
        let _watcher = spawn_readiness_watcher(
            hub.clone(),
            vec!["Camera".to_string(), "Optics".to_string()],
        );
        hub.connect_all().await.unwrap();

        let saw_ready = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = stream.recv().await.expect("stream should stay open");
                if event.kind == EventKind::TaskStateChanged && event.value == "Ready" {
                    break;
                }
            }
        })
        .await;
        assert!(saw_ready.is_ok(), "expected a TaskStateChanged(\"Ready\") event");
    }
}
