//! Accelerator failure checking
//!
//! Every allocation, transfer and launch result passes through
//! [`check_result`]; every launch is followed by [`check_last_launch`] to pick
//! up faults that happened asynchronously on the device. What a failure does
//! is decided by the process-wide [`FailurePolicy`]:
//!
//! - [`FailurePolicy::Propagate`] (default): the error is returned to the caller.
//! - [`FailurePolicy::Abort`]: the error is logged and the process terminates
//!   without returning. Set `TWINBUF_FAILURE_POLICY=abort` for
//!   stop-at-first-failure behaviour.
//!
//! Either way a failed operation yields no partial result.

use crate::error::{Error, Result};
use std::env;
use std::sync::atomic::{AtomicU8, Ordering};
use twinbuf_device::Device;

/// What to do when the accelerator reports a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log at error level and abort the process
    Abort,
    /// Return the error to the caller
    #[default]
    Propagate,
}

impl FailurePolicy {
    /// Read `TWINBUF_FAILURE_POLICY` (`abort` or `propagate`).
    ///
    /// Unset or unrecognized values fall back to [`FailurePolicy::Propagate`].
    pub fn from_env() -> Self {
        match env::var("TWINBUF_FAILURE_POLICY") {
            Ok(value) => Self::parse(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "unknown TWINBUF_FAILURE_POLICY, using propagate");
                Self::Propagate
            }),
            Err(_) => Self::Propagate,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Some(Self::Abort),
            "propagate" => Some(Self::Propagate),
            _ => None,
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Abort => ABORT,
            Self::Propagate => PROPAGATE,
        }
    }
}

const UNSET: u8 = 0;
const ABORT: u8 = 1;
const PROPAGATE: u8 = 2;

static POLICY: AtomicU8 = AtomicU8::new(UNSET);

/// Current policy, read from the environment on first use.
pub fn failure_policy() -> FailurePolicy {
    match POLICY.load(Ordering::Acquire) {
        ABORT => FailurePolicy::Abort,
        PROPAGATE => FailurePolicy::Propagate,
        _ => {
            let policy = FailurePolicy::from_env();
            // Keep a policy installed concurrently by set_failure_policy.
            match POLICY.compare_exchange(UNSET, policy.to_u8(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => policy,
                Err(ABORT) => FailurePolicy::Abort,
                Err(_) => FailurePolicy::Propagate,
            }
        }
    }
}

pub fn set_failure_policy(policy: FailurePolicy) {
    POLICY.store(policy.to_u8(), Ordering::Release);
}

/// Apply the failure policy to the outcome of a device call.
pub fn check_result<T, E: Into<Error>>(result: std::result::Result<T, E>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => Err(fail(err.into())),
    }
}

/// Report a fault raised asynchronously by a previously launched kernel.
pub fn check_last_launch(device: &dyn Device) -> Result<()> {
    check_result(device.take_last_error())
}

fn fail(err: Error) -> Error {
    match failure_policy() {
        FailurePolicy::Abort => {
            tracing::error!(error = %err, kind = ?err.kind(), "unrecoverable accelerator failure, aborting");
            std::process::abort()
        }
        FailurePolicy::Propagate => {
            tracing::debug!(error = %err, kind = ?err.kind(), "accelerator failure");
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;
    use twinbuf_device::DeviceError;

    #[test]
    fn test_parse() {
        assert_eq!(FailurePolicy::parse("abort"), Some(FailurePolicy::Abort));
        assert_eq!(FailurePolicy::parse(" Propagate "), Some(FailurePolicy::Propagate));
        assert_eq!(FailurePolicy::parse("explode"), None);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Propagate);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        // Pin the process policy so concurrent tests never read these values.
        set_failure_policy(FailurePolicy::Propagate);
        env::set_var("TWINBUF_FAILURE_POLICY", "ABORT");
        assert_eq!(FailurePolicy::from_env(), FailurePolicy::Abort);
        env::set_var("TWINBUF_FAILURE_POLICY", "sometimes");
        assert_eq!(FailurePolicy::from_env(), FailurePolicy::Propagate);
        env::remove_var("TWINBUF_FAILURE_POLICY");
        assert_eq!(FailurePolicy::from_env(), FailurePolicy::Propagate);
    }

    #[test]
    #[serial]
    fn test_set_failure_policy() {
        // Abort is never installed in-process: other tests in this binary
        // rely on failures being returned. tests/failure_abort.rs runs it in
        // a child process.
        set_failure_policy(FailurePolicy::Propagate);
        assert_eq!(failure_policy(), FailurePolicy::Propagate);
        assert_eq!(POLICY.load(Ordering::Acquire), PROPAGATE);
    }

    #[test]
    #[serial]
    fn test_check_result_propagates() {
        set_failure_policy(FailurePolicy::Propagate);

        assert_eq!(check_result::<_, DeviceError>(Ok(7)).unwrap(), 7);

        let err = check_result::<(), _>(Err(DeviceError::launch("trap"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LaunchFailure);
    }
}
