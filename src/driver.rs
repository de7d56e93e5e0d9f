//! The driver interface consumed by the core and implemented by vendor
//! adapters (design §6, "Device driver interface").
//!
//! Every physical device — camera SDK, serial-command controller, microscope
//! control library — is treated as an opaque adapter conforming to this
//! trait; none of those vendor SDKs are part of the core's scope. What the
//! core owns is the shape of the interface and the property graph each driver
//! exposes through it. `src/drivers/` contains the mock drivers used by tests
//! and the default configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::broadcast;

use crate::error::CoreResult;
use crate::events::RawEvent;
use crate::image::Frame;
use crate::property::PropertyNode;

/// Common adapter surface every device driver implements.
#[async_trait]
pub trait Driver: Send + Sync {
    /// A human-readable driver name, used in logs (not the device's
    /// configured instance name — that lives on `crate::device::Device`).
    fn driver_name(&self) -> &str;

    fn node(&self, name: &str) -> Option<Arc<PropertyNode>>;

    fn node_map(&self) -> BTreeMap<String, Arc<PropertyNode>>;

    async fn connect(&self) -> CoreResult<()>;

    async fn disconnect(&self) -> CoreResult<()>;

    /// Optional pre-connect probe used to fail fast before attempting a full
    /// connect. Most mocks don't need to override this.
    async fn detect(&self) -> CoreResult<bool> {
        Ok(true)
    }

    /// Raw, device-name-agnostic event feed. `crate::device::Device` wraps
    /// this with the device-name-stamping middleware (see `crate::events`).
    fn raw_events(&self) -> broadcast::Receiver<RawEvent>;
}

/// `mode` argument to `CameraDriver::start_acquisition` (design §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Camera stops automatically after `n` frames.
    Snap(usize),
    /// Camera overwrites the oldest frame once the ring is full.
    Continuous,
}

/// Outcome of `wait_frame_ready`: ordinary errors (timeout, cancellation) flow
/// through `CoreError`; a successful wait additionally distinguishes an
/// ordinary frame from a buffer data-loss event, since the live-view loop
/// reacts to the two differently (design §4.6 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReadiness {
    Ready,
    DataLoss,
}

/// The camera specialization of `Driver` (design §4.2). Trigger source is
/// itself a property (`TriggerSource`, values `"Internal"` / `"Software"`);
/// tasks read/write it through the ordinary property-graph operations on the
/// owning `Device`, so it is not duplicated here.
#[async_trait]
pub trait CameraDriver: Driver {
    /// Reserves a ring of `n` frames. Idempotent if already allocated with
    /// `n' >= n`; otherwise releases and reallocates.
    async fn alloc_buffer(&self, n: usize) -> CoreResult<()>;

    async fn release_buffer(&self) -> CoreResult<()>;

    async fn start_acquisition(&self, mode: AcquisitionMode) -> CoreResult<()>;

    /// Requests a stop, aborts any pending wait, and blocks until stopped or a
    /// 1 s timeout.
    async fn stop_acquisition(&self) -> CoreResult<()>;

    /// Suspends until the next exposure-end event, returning the timestamp the
    /// camera recorded for it.
    async fn wait_exposure_end(&self, timeout: Duration) -> CoreResult<DateTime<Local>>;

    async fn wait_frame_ready(&self, timeout: Duration) -> CoreResult<FrameReadiness>;

    /// `i >= 0` returns the `i`-th buffered frame; `i == -1` returns the most
    /// recent frame. Also returns the exposure-end timestamp recorded for it.
    async fn get_frame(&self, i: i64) -> CoreResult<(Frame, DateTime<Local>)>;

    /// Valid only when `TriggerSource` is `"Software"`.
    async fn fire_trigger(&self) -> CoreResult<()>;
}
