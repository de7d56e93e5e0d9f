//! Channel control: the preset catalog and the diff-based multi-device
//! transition that applies a named preset to the hub (design §4.5).
//!
//! Grounded on `examples/original_source/` channel-switching source: the
//! pattern of snapshotting the current state, diffing against the requested
//! state, and writing only the delta is the same one the hub's own
//! `set_properties`/`wait_properties` batch split implements per device —
//! channel control just applies it across devices before handing the result
//! to the hub.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::events::Event;
use crate::hub::DeviceHub;
use crate::path::PropertyPath;

/// How long `switch_channel` waits for every written property to confirm
/// before giving up (design §4.5 step 6).
const SWITCH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// A named recipe: which properties to set, and which two properties (if
/// any) are driven separately by channel control rather than baked into the
/// recipe itself (design §3, `ChannelPreset`).
#[derive(Debug, Clone)]
pub struct ChannelPreset {
    pub name: String,
    pub properties: BTreeMap<PropertyPath, String>,
    pub shutter_property: Option<PropertyPath>,
    pub illumination_property: Option<PropertyPath>,
    pub default_exposure_ms: f64,
    pub default_illumination_intensity: f64,
}

impl ChannelPreset {
    pub fn new(name: impl Into<String>) -> Self {
        ChannelPreset {
            name: name.into(),
            properties: BTreeMap::new(),
            shutter_property: None,
            illumination_property: None,
            default_exposure_ms: 10.0,
            default_illumination_intensity: 0.0,
        }
    }

    pub fn with_property(mut self, path: PropertyPath, value: impl Into<String>) -> Self {
        self.properties.insert(path, value.into());
        self
    }

    pub fn with_shutter_property(mut self, path: PropertyPath) -> Self {
        self.shutter_property = Some(path);
        self
    }

    pub fn with_illumination_property(mut self, path: PropertyPath) -> Self {
        self.illumination_property = Some(path);
        self
    }

    pub fn with_default_exposure_ms(mut self, ms: f64) -> Self {
        self.default_exposure_ms = ms;
        self
    }

    pub fn with_default_illumination_intensity(mut self, intensity: f64) -> Self {
        self.default_illumination_intensity = intensity;
        self
    }
}

/// The camera's exposure-time property. Channel control always folds this
/// into the effective map regardless of which preset is active (design §4.5
/// step 2).
fn exposure_time_path() -> PropertyPath {
    PropertyPath::property("Camera", "ExposureTime")
}

/// `exposure_ms` (milliseconds) formatted as seconds to six significant
/// digits, e.g. `25 ms -> "0.025"`.
fn format_exposure_seconds(exposure_ms: f64) -> String {
    format_significant(exposure_ms * 1e-3, 6)
}

/// Formats `value` with `digits` significant digits, trimming a trailing
/// decimal point and zeros so `0.025000` reads as `0.025`.
fn format_significant(value: f64, digits: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (digits as i32 - 1 - magnitude).max(0) as usize;
    let formatted = format!("{value:.decimals$}");
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

/// Illumination intensity rounded to the nearest integer percent, per
/// design §4.5 step 2's `round(illumination_intensity)`.
fn round_illumination(intensity: f64) -> String {
    format!("{}", intensity.round() as i64)
}

/// State owned by channel control: the preset catalog, the currently active
/// shutter property, and the handle of the most recently started switch
/// (design §4.5's "an asynchronous `switch_in_flight` handle at most one at
/// a time").
pub struct ChannelControl {
    hub: Arc<DeviceHub>,
    catalog: BTreeMap<String, ChannelPreset>,
    current_shutter: Mutex<Option<PropertyPath>>,
    switch_in_flight: Mutex<Option<JoinHandle<CoreResult<()>>>>,
}

impl ChannelControl {
    pub fn new(hub: Arc<DeviceHub>, presets: Vec<ChannelPreset>) -> Arc<Self> {
        let catalog = presets.into_iter().map(|p| (p.name.clone(), p)).collect();
        Arc::new(ChannelControl {
            hub,
            catalog,
            current_shutter: Mutex::new(None),
            switch_in_flight: Mutex::new(None),
        })
    }

    pub fn preset(&self, name: &str) -> Option<&ChannelPreset> {
        self.catalog.get(name)
    }

    pub fn preset_names(&self) -> Vec<String> {
        self.catalog.keys().cloned().collect()
    }

    /// Joins the most recently started switch, if any, discarding its own
    /// error (the caller that started it already consumed it in
    /// `switch_channel` step 1; this is the supervisor's equivalent for
    /// tasks that only need the fire-and-forget form of §4.7 step g).
    pub async fn wait_switch_channel(&self) -> CoreResult<()> {
        let handle = self.switch_in_flight.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .unwrap_or_else(|_| Err(CoreError::Internal("switch task panicked".into()))),
            None => Ok(()),
        }
    }

    /// Starts `switch_channel` on a background task and stores its handle as
    /// the new switch-in-flight, consuming (and logging) whatever switch was
    /// previously in flight first (design §4.5 step 1).
    pub async fn start_switch_channel(
        self: &Arc<Self>,
        preset_name: impl Into<String>,
        exposure_ms: f64,
        illumination_intensity: f64,
    ) {
        let previous = self.switch_in_flight.lock().await.take();
        if let Some(previous) = previous {
            match previous.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "previous channel switch failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "previous channel switch task panicked");
                }
            }
        }

        let control = Arc::clone(self);
        let preset_name = preset_name.into();
        let handle = tokio::spawn(async move {
            control
                .switch_channel(&preset_name, exposure_ms, illumination_intensity)
                .await
        });
        *self.switch_in_flight.lock().await = Some(handle);
    }

    /// Applies `preset_name` to the hub: computes the effective map, diffs it
    /// against the current snapshot, writes only what changed, and waits for
    /// every written property to confirm (design §4.5 steps 2-7).
    pub async fn switch_channel(
        &self,
        preset_name: &str,
        exposure_ms: f64,
        illumination_intensity: f64,
    ) -> CoreResult<()> {
        let preset = self
            .catalog
            .get(preset_name)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown preset '{preset_name}'")))?;

        let mut effective: BTreeMap<PropertyPath, String> = preset.properties.clone();
        if let Some(illumination_property) = &preset.illumination_property {
            effective.insert(illumination_property.clone(), round_illumination(illumination_intensity));
        }
        effective.insert(exposure_time_path(), format_exposure_seconds(exposure_ms));

        let mut diff = Vec::new();
        for (path, value) in &effective {
            let current = self.hub.get_property(path).await.ok();
            if current.as_deref() != Some(value.as_str()) {
                diff.push((path.clone(), value.clone()));
            }
        }

        *self.current_shutter.lock().await = preset.shutter_property.clone();

        let started = Instant::now();
        if diff.is_empty() {
            self.hub.publish(Event::task_channel_changed(preset_name));
            self.hub
                .publish(Event::task_message(format!("channel '{preset_name}' already active")));
            return Ok(());
        }

        let paths: Vec<PropertyPath> = diff.iter().map(|(path, _)| path.clone()).collect();
        self.hub.set_properties(diff).await?;

        match self.hub.wait_properties(paths, SWITCH_CONFIRM_TIMEOUT).await {
            Ok(()) => {
                self.hub.publish(Event::task_channel_changed(preset_name));
                self.hub.publish(Event::task_message(format!(
                    "switched to '{preset_name}' in {:.0} ms",
                    started.elapsed().as_secs_f64() * 1e3
                )));
                Ok(())
            }
            Err(err) => {
                self.hub.publish(Event::task_message(format!(
                    "channel switch to '{preset_name}' did not confirm: {err}"
                )));
                Err(CoreError::DeadlineExceeded(format!(
                    "channel switch to '{preset_name}' timed out: {err}"
                )))
            }
        }
    }

    /// Opens `current_shutter`, a no-op if no preset with a shutter property
    /// has ever been activated.
    pub async fn open_current_shutter(&self) -> CoreResult<()> {
        self.set_current_shutter("Open").await
    }

    pub async fn close_current_shutter(&self) -> CoreResult<()> {
        self.set_current_shutter("Closed").await
    }

    async fn set_current_shutter(&self, value: &str) -> CoreResult<()> {
        let Some(path) = self.current_shutter.lock().await.clone() else {
            return Ok(());
        };
        self.hub.set_property(&path, value.to_string()).await
    }

    /// Waits for `current_shutter`'s most recent set to confirm, a no-op if
    /// no shutter property is active.
    pub async fn wait_shutter(&self, deadline: Duration) -> CoreResult<()> {
        let Some(path) = self.current_shutter.lock().await.clone() else {
            return Ok(());
        };
        self.hub.wait_property(&path, deadline).await
    }

    pub async fn current_shutter(&self) -> Option<PropertyPath> {
        self.current_shutter.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_optics::MockOpticsDriver;
    use tracing_test::traced_test;

    fn bf_preset() -> ChannelPreset {
        ChannelPreset::new("BF")
            .with_property(PropertyPath::property("Optics", "Block"), "2")
            .with_shutter_property(PropertyPath::property("Optics", "DiaShutter"))
    }

    async fn hub_with_optics() -> Arc<DeviceHub> {
        let hub = DeviceHub::new(16);
        hub.add_device("Optics", MockOpticsDriver::new()).await;
        hub.add_device("Camera", crate::drivers::mock_camera::MockCameraDriver::new())
            .await;
        hub.connect_all().await.unwrap();
        hub
    }

    #[test]
    fn exposure_is_formatted_to_six_significant_digits() {
        assert_eq!(format_exposure_seconds(25.0), "0.025");
        assert_eq!(format_exposure_seconds(10.0), "0.01");
    }

    #[test]
    fn illumination_rounds_to_nearest_integer() {
        assert_eq!(round_illumination(42.6), "43");
        assert_eq!(round_illumination(0.0), "0");
    }

    #[tokio::test]
    async fn basic_channel_switch_writes_only_the_diff() {
        // Initial snapshot Block="1" (driver default), ExposureTime="0.01";
        // switching to BF at 25ms should write both Block and ExposureTime
        // since both differ.
        let hub = hub_with_optics().await;
        let control = ChannelControl::new(hub.clone(), vec![bf_preset()]);

        control.switch_channel("BF", 25.0, 0.0).await.unwrap();

        assert_eq!(
            hub.get_property(&PropertyPath::property("Optics", "Block"))
                .await
                .unwrap(),
            "2"
        );
        assert_eq!(
            hub.get_property(&exposure_time_path()).await.unwrap(),
            "0.025"
        );
        assert_eq!(
            control.current_shutter().await,
            Some(PropertyPath::property("Optics", "DiaShutter"))
        );
    }

    #[tokio::test]
    async fn switching_to_the_same_effective_state_writes_nothing() {
        let hub = hub_with_optics().await;
        let control = ChannelControl::new(hub.clone(), vec![bf_preset()]);
        control.switch_channel("BF", 25.0, 0.0).await.unwrap();
        // Same preset and exposure again: the diff is empty.
        control.switch_channel("BF", 25.0, 0.0).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_preset_is_rejected() {
        let hub = hub_with_optics().await;
        let control = ChannelControl::new(hub, vec![bf_preset()]);
        assert!(matches!(
            control.switch_channel("Nope", 10.0, 0.0).await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn shutter_helpers_are_noops_before_any_switch() {
        let hub = hub_with_optics().await;
        let control = ChannelControl::new(hub, vec![bf_preset()]);
        control.open_current_shutter().await.unwrap();
        control.close_current_shutter().await.unwrap();
        control.wait_shutter(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn starting_a_second_switch_logs_the_first_ones_failure() {
        let hub = hub_with_optics().await;
        let control = ChannelControl::new(hub, vec![bf_preset()]);

        control.start_switch_channel("Nope", 10.0, 0.0).await;
        control.start_switch_channel("BF", 25.0, 0.0).await;
        control.wait_switch_channel().await.unwrap();

        assert!(logs_contain("previous channel switch failed"));
    }
}
