//! Core library for the microscope instrument control plane.
//!
//! The crate is organized around the property graph and the components that
//! sit on top of it, in dependency order:
//!
//! - **`path`**: `/device/property` addressing.
//! - **`error`**: the shared `CoreError` taxonomy and the hub's fan-out merge rule.
//! - **`events`**: the typed event stream (`RawEvent` -> `Event`) and its
//!   device-name-stamping bridge.
//! - **`property`**: `PropertyNode`, the fire-and-forget set / observed-equality
//!   completion state machine every device property is built from.
//! - **`driver`** / **`drivers`**: the adapter trait a vendor SDK implements,
//!   plus the mock camera and optics drivers used as the default configuration
//!   and as test fixtures.
//! - **`device`**: the hub-owned wrapper around one driver.
//! - **`hub`**: `DeviceHub`, the single entry point every client and task goes
//!   through to reach devices.
//! - **`image`**: the four-axis `NDImage` container and the live-view frame slot.
//! - **`channel`**: the preset catalog and diff-based channel-switch engine.
//! - **`tasks`**: the live-view and pipelined multi-channel acquisition tasks.
//! - **`supervisor`**: the at-most-one-active-task exclusivity gate.
//! - **`config`**: TOML + environment configuration loading and validation.
//! - **`validation`**: reusable configuration-value validators.

pub mod channel;
pub mod config;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod events;
pub mod hub;
pub mod image;
pub mod path;
pub mod property;
pub mod supervisor;
pub mod tasks;
pub mod validation;
