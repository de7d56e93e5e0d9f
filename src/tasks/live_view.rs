//! Live-view task: free-running preview acquisition into the image manager's
//! single-slot live frame (design §4.6).

use std::sync::Arc;
use std::time::Duration;

use crate::driver::{AcquisitionMode, CameraDriver, FrameReadiness};
use crate::error::{CoreError, CoreResult};
use crate::hub::DeviceHub;
use crate::image::ImageManager;
use crate::path::PropertyPath;

/// `wait_frame_ready` poll cadence (design §4.6 step 4).
const FRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// `TriggerSource` confirmation deadline when forcing it to `Internal`.
const TRIGGER_SOURCE_DEADLINE: Duration = Duration::from_secs(5);

/// Runs until `stop()` is called (or a non-cancellation error occurs),
/// publishing the camera's most recent frame into `ImageManager`'s live slot.
pub struct LiveViewTask {
    hub: Arc<DeviceHub>,
    images: Arc<ImageManager>,
    camera: Arc<dyn CameraDriver>,
    camera_name: String,
}

impl LiveViewTask {
    pub fn new(
        hub: Arc<DeviceHub>,
        images: Arc<ImageManager>,
        camera: Arc<dyn CameraDriver>,
        camera_name: impl Into<String>,
    ) -> Self {
        LiveViewTask {
            hub,
            images,
            camera,
            camera_name: camera_name.into(),
        }
    }

    /// Blocks the caller until the task stops, per design §4.6 steps 1-5.
    pub async fn run(&self) -> CoreResult<()> {
        self.camera.alloc_buffer(2).await?;
        self.ensure_internal_trigger().await?;
        self.camera.start_acquisition(AcquisitionMode::Continuous).await?;

        let result = self.loop_frames().await;

        // Stop and clear the live slot regardless of how the loop exited
        // (design §4.6 step 5), but don't let a stop failure mask the loop's
        // own error.
        let stop_result = self.camera.stop_acquisition().await;
        self.images.clear_live_frame().await;
        result.and(stop_result)
    }

    /// Requests that the camera's pending `wait_frame_ready` abort. The loop
    /// detects this via the resulting `Cancelled` error, not a shared flag
    /// (design §4.6 concurrency note).
    pub async fn stop(&self) -> CoreResult<()> {
        self.camera.stop_acquisition().await
    }

    async fn ensure_internal_trigger(&self) -> CoreResult<()> {
        let path = PropertyPath::property(self.camera_name.clone(), "TriggerSource");
        if self.hub.get_property(&path).await.ok().as_deref() == Some("Internal") {
            return Ok(());
        }
        self.hub.set_property(&path, "Internal".to_string()).await?;
        self.hub.wait_property(&path, TRIGGER_SOURCE_DEADLINE).await
    }

    async fn loop_frames(&self) -> CoreResult<()> {
        loop {
            match self.camera.wait_frame_ready(FRAME_WAIT_TIMEOUT).await {
                Ok(FrameReadiness::Ready) => {
                    let (frame, _exposure_end) = self.camera.get_frame(-1).await?;
                    self.images.set_live_frame(frame).await;
                }
                Ok(FrameReadiness::DataLoss) => {
                    tracing::warn!(camera = %self.camera_name, "live view dropped a frame");
                    continue;
                }
                Err(CoreError::Cancelled(_)) => return Ok(()),
                Err(other) => return Err(other),
            }
        }
    }
}
