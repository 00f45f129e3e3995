//! Error types for device operations

use crate::device::TransferDirection;

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors reported by an accelerator device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Device memory could not satisfy an allocation request
    #[error("device allocation of {requested} bytes failed: {reason}")]
    AllocationFailure { requested: usize, reason: String },

    /// A copy between host and device (or within the device) was rejected
    #[error("{direction} transfer of {bytes} bytes failed: {reason}")]
    TransferFailure {
        direction: TransferDirection,
        bytes: usize,
        reason: String,
    },

    /// A kernel launch was rejected or faulted while executing
    #[error("kernel launch failed: {0}")]
    LaunchFailure(String),

    /// Grid or block dimensions the device cannot execute
    #[error("invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    /// Pointer does not name a live allocation on this device
    #[error("invalid device pointer: {0:#x}")]
    InvalidDevicePointer(u64),

    /// Access outside a device allocation
    #[error("device access out of bounds: offset {offset} + size {size} > allocation size {allocation_size}")]
    OutOfBounds {
        offset: usize,
        size: usize,
        allocation_size: usize,
    },

    /// The device work queue is no longer accepting or executing work
    #[error("device stream closed")]
    StreamClosed,

    /// Device configuration could not be applied
    #[error("device configuration error: {0}")]
    Configuration(String),
}

impl DeviceError {
    pub fn allocation(requested: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            requested,
            reason: reason.into(),
        }
    }

    /// Wrap any failure during a copy as a transfer failure in `direction`.
    pub fn transfer(direction: TransferDirection, bytes: usize, cause: impl std::fmt::Display) -> Self {
        Self::TransferFailure {
            direction,
            bytes,
            reason: cause.to_string(),
        }
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::LaunchFailure(msg.into())
    }
}
