//! Error types for twinbuf-core operations

use twinbuf_device::DeviceError;

/// Result type for twinbuf-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in twinbuf-core operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The accelerator rejected an allocation, transfer or launch
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Host-side access before the host mirror was allocated
    #[error("host mirror not allocated: call download() or host_allocate() first")]
    HostMirrorAbsent,

    /// Element index past the end of the buffer
    #[error("index {index} out of bounds for buffer of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Buffer size mismatch
    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AllocationFailure,
    TransferFailure,
    LaunchFailure,
    /// Caller misuse: absent mirror, bad index, mismatched sizes or an
    /// invalid device configuration
    Precondition,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Device(err) => match err {
                DeviceError::AllocationFailure { .. } => ErrorKind::AllocationFailure,
                DeviceError::TransferFailure { .. }
                | DeviceError::InvalidDevicePointer(_)
                | DeviceError::OutOfBounds { .. } => ErrorKind::TransferFailure,
                DeviceError::LaunchFailure(_) | DeviceError::InvalidLaunchConfig(_) | DeviceError::StreamClosed => {
                    ErrorKind::LaunchFailure
                }
                DeviceError::Configuration(_) => ErrorKind::Precondition,
            },
            Error::HostMirrorAbsent | Error::IndexOutOfBounds { .. } | Error::SizeMismatch { .. } => {
                ErrorKind::Precondition
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbuf_device::TransferDirection;

    #[test]
    fn test_error_kind() {
        assert_eq!(
            Error::from(DeviceError::allocation(64, "full")).kind(),
            ErrorKind::AllocationFailure
        );
        assert_eq!(
            Error::from(DeviceError::transfer(TransferDirection::HostToDevice, 8, "bad")).kind(),
            ErrorKind::TransferFailure
        );
        assert_eq!(Error::from(DeviceError::launch("trap")).kind(), ErrorKind::LaunchFailure);
        assert_eq!(Error::HostMirrorAbsent.kind(), ErrorKind::Precondition);
        assert_eq!(Error::IndexOutOfBounds { index: 3, len: 2 }.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_bad_configuration_is_not_allocation_failure() {
        let err = Error::from(DeviceError::Configuration("TWINBUF_DEVICE_THREADS: not a number".into()));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_device_errors_display_transparently() {
        let err = Error::from(DeviceError::launch("trap"));
        assert_eq!(err.to_string(), "kernel launch failed: trap");
    }
}
