//! The error taxonomy used across the control plane.
//!
//! `CoreError` consolidates every failure mode the property graph, device hub,
//! channel control and acquisition tasks can produce into the eight kinds
//! described by the design: a caller only ever needs to match on the kind, not on
//! which component raised it.
//!
//! - **`InvalidArgument`**: malformed path, out-of-range enum value, unknown preset.
//! - **`NotFound`**: device or property missing from the graph.
//! - **`FailedPrecondition`**: device not connected, task slot busy.
//! - **`Unavailable`**: driver I/O failure, serial/USB communication loss.
//! - **`DeadlineExceeded`**: a property or camera wait timed out.
//! - **`Cancelled`**: a wait was aborted by a `stop()` request.
//! - **`Aborted`**: aggregate failure across more than one device.
//! - **`Internal`**: invariant violation; should not occur in the field.
//!
//! `Aborted` carries the per-device causes so `TaskMessage` events and logs can
//! report exactly which devices failed, matching the hub's merge rule in
//! `crate::hub`.

use thiserror::Error;

/// Convenience alias for results using the control-plane error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("aborted ({0} device(s) failed): {}", format_causes(.1))]
    Aborted(usize, Vec<(String, CoreError)>),

    #[error("internal error: {0}")]
    Internal(String),
}

fn format_causes(causes: &[(String, CoreError)]) -> String {
    causes
        .iter()
        .map(|(device, err)| format!("{device}({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoreError {
    /// Builds an `Aborted` error from a non-empty list of per-device causes.
    pub fn aborted(causes: Vec<(String, CoreError)>) -> Self {
        CoreError::Aborted(causes.len(), causes)
    }
}

/// Merges the outcomes of a fan-out across multiple devices, per the hub's rule:
/// all succeed → `Ok`; exactly one fails → that error; more than one fails →
/// `Aborted` with every per-device cause attached.
///
/// Grounded on `examples/original_source/src/device/devicehub.h`'s
/// `mergeDeviceTaskStatus`, which the hub's `connect_all`/`disconnect_all`/
/// `set_property`/`wait_property` all delegate to.
pub fn merge_device_results(results: Vec<(String, CoreResult<()>)>) -> CoreResult<()> {
    let mut causes: Vec<(String, CoreError)> = results
        .into_iter()
        .filter_map(|(device, result)| result.err().map(|err| (device, err)))
        .collect();

    match causes.len() {
        0 => Ok(()),
        1 => Err(causes.pop().map(|(_, err)| err).unwrap_or_else(|| {
            CoreError::Internal("merge_device_results: lost the only cause".into())
        })),
        _ => Err(CoreError::aborted(causes)),
    }
}
