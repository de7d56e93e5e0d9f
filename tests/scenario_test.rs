//! End-to-end coverage: a hub wired with the mock camera/optics drivers,
//! driven through the supervisor and channel control the way a real client
//! would, rather than through any single module's internals.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;

use scope_ctl::channel::{ChannelControl, ChannelPreset};
use scope_ctl::drivers::mock_camera::MockCameraDriver;
use scope_ctl::drivers::mock_optics::MockOpticsDriver;
use scope_ctl::error::CoreError;
use scope_ctl::events::EventKind;
use scope_ctl::hub::DeviceHub;
use scope_ctl::image::ImageManager;
use scope_ctl::path::PropertyPath;
use scope_ctl::supervisor::ExperimentSupervisor;
use scope_ctl::tasks::multi_channel::{ChannelRequest, MultiChannelArgs};

fn three_channel_presets() -> Vec<ChannelPreset> {
    vec![
        ChannelPreset::new("A")
            .with_property(PropertyPath::property("Optics", "Block"), "1")
            .with_shutter_property(PropertyPath::property("Optics", "DiaShutter")),
        ChannelPreset::new("B")
            .with_property(PropertyPath::property("Optics", "Block"), "2")
            .with_shutter_property(PropertyPath::property("Optics", "DiaShutter")),
        ChannelPreset::new("C")
            .with_property(PropertyPath::property("Optics", "Block"), "3")
            .with_shutter_property(PropertyPath::property("Optics", "DiaShutter")),
    ]
}

async fn build_supervisor(
    camera: Arc<MockCameraDriver>,
) -> (Arc<DeviceHub>, Arc<ImageManager>, Arc<ExperimentSupervisor>) {
    let hub = DeviceHub::new(32);
    hub.add_device("Camera", camera.clone()).await;
    hub.add_device("Optics", MockOpticsDriver::new()).await;
    hub.connect_all().await.unwrap();

    let images = ImageManager::new(hub.clone());
    let channel = ChannelControl::new(hub.clone(), three_channel_presets());
    let supervisor = ExperimentSupervisor::new(
        hub.clone(),
        images.clone(),
        channel,
        camera,
        "Camera",
        vec!["Camera".to_string(), "Optics".to_string()],
    );
    (hub, images, supervisor)
}

/// stop_live_view cancels the running task cleanly, leaves the live
/// frame slot empty, and is safe to call once the task has already exited.
#[tokio::test]
async fn live_view_cancellation_clears_the_live_slot() {
    let (_hub, images, supervisor) = build_supervisor(MockCameraDriver::new()).await;

    supervisor.start_live_view().await.unwrap();

    let saw_frames = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if images.live_frame().await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(saw_frames.is_ok(), "live view should deliver at least one frame");

    supervisor.stop_live_view().await.unwrap();
    assert!(images.live_frame().await.is_none());

    // Idempotent: a second stop with nothing running is a no-op, not an error.
    supervisor.stop_live_view().await.unwrap();
}

/// A 3-channel pipelined acquisition populates all three slots, in input
/// order, each tagged with its own preset in the frame metadata.
#[tokio::test]
async fn three_channel_acquisition_populates_ndimage_via_the_supervisor() {
    let (_hub, images, supervisor) = build_supervisor(MockCameraDriver::new()).await;

    let args = MultiChannelArgs {
        ndimage_name: "run1".to_string(),
        channels: vec![
            ChannelRequest {
                preset_name: "A".to_string(),
                exposure_ms: 10.0,
                illumination_intensity: 0.0,
            },
            ChannelRequest {
                preset_name: "B".to_string(),
                exposure_ms: 50.0,
                illumination_intensity: 0.0,
            },
            ChannelRequest {
                preset_name: "C".to_string(),
                exposure_ms: 20.0,
                illumination_intensity: 0.0,
            },
        ],
        i_z: 0,
        i_t: 0,
        metadata: Map::new(),
    };

    supervisor.acquire_multi_channel(args).await.unwrap();
    supervisor.wait_multi_channel().await.unwrap();

    assert_eq!(images.dimensions("run1").await, Some((3, 1, 1)));
    assert_eq!(images.len("run1").await, Some(3));
    for (i_ch, expected) in ["A", "B", "C"].into_iter().enumerate() {
        let metadata = images.cell_metadata("run1", i_ch, 0, 0).await.unwrap();
        assert_eq!(
            metadata["channel"]["preset_name"],
            serde_json::Value::String(expected.to_string())
        );
    }
}

/// A driver error on the second channel's trigger leaves the NDImage
/// partially populated and is translated by the supervisor into
/// `TaskStateChanged("Error")` + `TaskMessage`, the sequence a UI relies on
/// regardless of which component actually failed.
#[tokio::test]
async fn mid_task_failure_surfaces_as_task_error_events() {
    let camera = MockCameraDriver::new();
    camera.fail_trigger_on_call(1).await;
    let (hub, images, supervisor) = build_supervisor(camera).await;

    let mut stream = hub.subscribe().await;

    let args = MultiChannelArgs {
        ndimage_name: "run1".to_string(),
        channels: vec![
            ChannelRequest {
                preset_name: "A".to_string(),
                exposure_ms: 10.0,
                illumination_intensity: 0.0,
            },
            ChannelRequest {
                preset_name: "B".to_string(),
                exposure_ms: 10.0,
                illumination_intensity: 0.0,
            },
            ChannelRequest {
                preset_name: "C".to_string(),
                exposure_ms: 10.0,
                illumination_intensity: 0.0,
            },
        ],
        i_z: 0,
        i_t: 0,
        metadata: Map::new(),
    };

    supervisor.acquire_multi_channel(args).await.unwrap();
    let result = supervisor.wait_multi_channel().await;
    assert!(matches!(result, Err(CoreError::Unavailable(_))));

    assert_eq!(images.len("run1").await, Some(1));
    assert!(images.cell_metadata("run1", 0, 0, 0).await.is_some());
    assert!(images.cell_metadata("run1", 1, 0, 0).await.is_none());
    assert!(images.cell_metadata("run1", 2, 0, 0).await.is_none());

    let saw_error_sequence = tokio::time::timeout(Duration::from_secs(1), async {
        let mut saw_state_error = false;
        loop {
            let event = stream.recv().await.expect("hub stream should stay open");
            match event.kind {
                EventKind::TaskStateChanged if event.value == "Error" => saw_state_error = true,
                EventKind::TaskMessage if saw_state_error => return,
                _ => {}
            }
        }
    })
    .await;
    assert!(
        saw_error_sequence.is_ok(),
        "expected TaskStateChanged(\"Error\") followed by a TaskMessage"
    );

    let shutter = hub
        .get_property(&PropertyPath::property("Optics", "DiaShutter"))
        .await
        .unwrap();
    assert_eq!(shutter, "Closed");
}

/// A batch `set_property` spanning three devices, one of which cannot
/// accept writes, must still apply to the other two and must not retry the
/// failing device.
#[tokio::test]
async fn batch_set_reports_the_disconnected_devices_failure_and_applies_the_rest() {
    let hub = DeviceHub::new(16);
    hub.add_device("A", MockOpticsDriver::new()).await;
    hub.add_device("B", MockOpticsDriver::new()).await;
    hub.add_device("C", MockOpticsDriver::new()).await;
    hub.connect_all().await.unwrap();

    // B goes offline after connecting, so its share of the batch fails
    // precondition while A and C remain healthy.
    hub.get_device("B").await.unwrap().disconnect().await.unwrap();

    let sets = vec![
        (PropertyPath::property("A", "Block"), "2".to_string()),
        (PropertyPath::property("B", "Block"), "2".to_string()),
        (PropertyPath::property("C", "Block"), "2".to_string()),
    ];
    let result = hub.set_properties(sets).await;
    assert!(
        matches!(result, Err(CoreError::FailedPrecondition(_))),
        "a single failing device's cause passes through unwrapped (design §4.3)"
    );

    assert_eq!(
        hub.get_property(&PropertyPath::property("A", "Block")).await.unwrap(),
        "2"
    );
    assert_eq!(
        hub.get_property(&PropertyPath::property("C", "Block")).await.unwrap(),
        "2"
    );
}
