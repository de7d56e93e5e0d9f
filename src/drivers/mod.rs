//! Concrete `Driver`/`CameraDriver` implementations.
//!
//! Every vendor SDK adapter (camera SDK, serial-command controller,
//! microscope control library) stays out of the core's scope — the mocks
//! here are the default configuration and the fixtures the rest of the
//! crate's tests are built on.

pub mod mock_camera;
pub mod mock_optics;
