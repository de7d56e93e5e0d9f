//! The pipelined multi-channel acquisition task (design §4.7): channel
//! switching for the next channel overlaps the camera reading out the
//! current one, so the wall-clock cost of a cycle is `max(switch, readout)`
//! rather than their sum.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde_json::{Map, Value as JsonValue};

use crate::channel::ChannelControl;
use crate::driver::{AcquisitionMode, CameraDriver, FrameReadiness};
use crate::error::CoreResult;
use crate::hub::DeviceHub;
use crate::image::ImageManager;
use crate::path::PropertyPath;

/// `{preset_name, exposure_ms, illumination_intensity}` (design §3, "Channel
/// request").
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub preset_name: String,
    pub exposure_ms: f64,
    pub illumination_intensity: f64,
}

/// `(ndimage_name, channels[N], i_z, i_t, metadata)` (design §4.7 "Input").
#[derive(Debug, Clone)]
pub struct MultiChannelArgs {
    pub ndimage_name: String,
    pub channels: Vec<ChannelRequest>,
    pub i_z: usize,
    pub i_t: usize,
    pub metadata: Map<String, JsonValue>,
}

/// How long `wait_exposure_end` beyond the channel's own exposure time is
/// allowed before the camera is considered stuck (design §4.7 step e).
const EXPOSURE_END_SLACK_MS: u64 = 500;
const SHUTTER_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_READY_TIMEOUT: Duration = Duration::from_secs(1);
const TRIGGER_SOURCE_DEADLINE: Duration = Duration::from_secs(5);

pub struct MultiChannelTask {
    hub: Arc<DeviceHub>,
    images: Arc<ImageManager>,
    channel: Arc<ChannelControl>,
    camera: Arc<dyn CameraDriver>,
    camera_name: String,
}

impl MultiChannelTask {
    pub fn new(
        hub: Arc<DeviceHub>,
        images: Arc<ImageManager>,
        channel: Arc<ChannelControl>,
        camera: Arc<dyn CameraDriver>,
        camera_name: impl Into<String>,
    ) -> Self {
        MultiChannelTask {
            hub,
            images,
            channel,
            camera,
            camera_name: camera_name.into(),
        }
    }

    pub async fn run(&self, args: MultiChannelArgs) -> CoreResult<()> {
        if args.channels.is_empty() {
            return Err(crate::error::CoreError::InvalidArgument(
                "multi-channel acquisition requires at least one channel".into(),
            ));
        }
        let n = args.channels.len();

        self.ensure_trigger_source("Software").await?;

        let first = &args.channels[0];
        self.channel
            .start_switch_channel(first.preset_name.clone(), first.exposure_ms, first.illumination_intensity)
            .await;

        self.camera.alloc_buffer(n).await?;
        self.images.ensure_ndimage(&args.ndimage_name, n).await?;
        self.camera.start_acquisition(AcquisitionMode::Snap(n)).await?;

        let result = self.run_channels(&args).await;

        if result.is_err() {
            if self.channel.close_current_shutter().await.is_ok() {
                self.hub
                    .publish(crate::events::Event::task_message("closed shutter after task error"));
            }
        }
        let stop_result = self.camera.stop_acquisition().await;
        result.and(stop_result)
    }

    async fn run_channels(&self, args: &MultiChannelArgs) -> CoreResult<()> {
        let n = args.channels.len();
        for (i_ch, request) in args.channels.iter().enumerate() {
            self.channel.wait_switch_channel().await?;
            self.channel.open_current_shutter().await?;
            self.channel.wait_shutter(SHUTTER_WAIT_TIMEOUT).await?;

            self.camera.fire_trigger().await?;
            // Ground truth for this frame's metadata: the device state while
            // it is being exposed, before any subsequent switch starts
            // (design §4.7 step d / "Ordering guarantees").
            let snapshot = self.flatten_snapshot().await;

            let exposure_deadline =
                Duration::from_millis(request.exposure_ms.max(0.0) as u64 + EXPOSURE_END_SLACK_MS);
            let exposure_end = self.camera.wait_exposure_end(exposure_deadline).await?;

            self.channel.close_current_shutter().await?;
            self.channel.wait_shutter(SHUTTER_WAIT_TIMEOUT).await?;

            if let Some(next) = args.channels.get(i_ch + 1) {
                self.channel
                    .start_switch_channel(next.preset_name.clone(), next.exposure_ms, next.illumination_intensity)
                    .await;
            }

            if matches!(
                self.camera.wait_frame_ready(FRAME_READY_TIMEOUT).await?,
                FrameReadiness::DataLoss
            ) {
                tracing::warn!(channel = %request.preset_name, "frame ring overflowed before readout");
            }
            let (frame, _readout_timestamp) = self.camera.get_frame(i_ch as i64).await?;

            let metadata = self.build_metadata(request, exposure_end, &snapshot, &args.metadata);
            self.images
                .add_image(&args.ndimage_name, i_ch, args.i_z, args.i_t, frame, metadata)
                .await?;
        }
        Ok(())
    }

    async fn ensure_trigger_source(&self, source: &str) -> CoreResult<()> {
        let path = PropertyPath::property(self.camera_name.clone(), "TriggerSource");
        if self.hub.get_property(&path).await.ok().as_deref() == Some(source) {
            return Ok(());
        }
        self.hub.set_property(&path, source.to_string()).await?;
        self.hub.wait_property(&path, TRIGGER_SOURCE_DEADLINE).await
    }

    /// Every valid node's snapshot across every device, flattened to
    /// `"device/property" -> value` (design §3, `NDImage`'s "flat map of
    /// *all* device property snapshots").
    async fn flatten_snapshot(&self) -> std::collections::BTreeMap<String, String> {
        self.hub.get_snapshot(None).await.unwrap_or_default()
    }

    fn build_metadata(
        &self,
        request: &ChannelRequest,
        exposure_end: chrono::DateTime<Local>,
        snapshot: &std::collections::BTreeMap<String, String>,
        user_metadata: &Map<String, JsonValue>,
    ) -> JsonValue {
        let mut channel = Map::new();
        channel.insert("preset_name".to_string(), JsonValue::String(request.preset_name.clone()));
        channel.insert(
            "exposure_ms".to_string(),
            serde_json::Number::from_f64(request.exposure_ms)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
        );
        if let Some(preset) = self.channel.preset(&request.preset_name) {
            if preset.illumination_property.is_some() {
                channel.insert(
                    "illumination_intensity".to_string(),
                    serde_json::Number::from_f64(request.illumination_intensity)
                        .map(JsonValue::Number)
                        .unwrap_or(JsonValue::Null),
                );
            }
        }

        let mut root = Map::new();
        root.insert("timestamp".to_string(), JsonValue::String(exposure_end.to_rfc3339()));
        root.insert("channel".to_string(), JsonValue::Object(channel));
        root.insert(
            "device_property".to_string(),
            JsonValue::Object(
                snapshot
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                    .collect(),
            ),
        );
        for (key, value) in user_metadata {
            root.insert(key.clone(), value.clone());
        }
        JsonValue::Object(root)
    }
}
