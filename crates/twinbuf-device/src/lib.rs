//! Accelerator device abstraction for twinbuf
//!
//! This crate provides:
//! - **Device trait**: allocation, copies, asynchronous kernel launch and
//!   deferred fault reporting
//! - **Launch geometry**: grids of blocks of threads ([`LaunchConfig`])
//! - **Emulated accelerator**: a host-backed [`Device`] with its own memory
//!   table, in-order stream and compute pool
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              twinbuf-core (ManagedBuffer)                │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  Arc<dyn Device>
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Device trait                          │
//! │   allocate / free / copy_* / launch / synchronize        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!              ┌─────────────────┐
//!              │ EmulatedDevice  │
//!              │ memory + stream │
//!              └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use twinbuf_device::{Device, DeviceConfig, EmulatedDevice, LaunchConfig, ThreadContext};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = EmulatedDevice::new(DeviceConfig::default())?;
//! let ptr = device.allocate(256, 4)?;
//!
//! device.launch(LaunchConfig::linear(64, 64), Arc::new(|_ctx: ThreadContext| {}))?;
//! device.synchronize()?;
//! device.take_last_error()?;
//!
//! device.free(ptr)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod emulated;
pub mod error;
pub mod launch;

pub use config::DeviceConfig;
pub use device::{Device, DeviceInfo, DevicePtr, DeviceStats, Kernel, TransferDirection};
pub use emulated::EmulatedDevice;
pub use error::{DeviceError, Result};
pub use launch::{BlockDim, GridDim, LaunchConfig, ThreadContext, MAX_THREADS_PER_BLOCK};

use std::sync::{Arc, OnceLock};

static DEFAULT_DEVICE: OnceLock<Arc<dyn Device>> = OnceLock::new();

/// Process-wide device used by buffers constructed without an explicit one.
///
/// Created on first use from [`DeviceConfig::from_env`]. A configuration
/// error is returned to the caller and initialization is retried on the next
/// call.
pub fn default_device() -> Result<Arc<dyn Device>> {
    if let Some(device) = DEFAULT_DEVICE.get() {
        return Ok(Arc::clone(device));
    }

    let device: Arc<dyn Device> = Arc::new(EmulatedDevice::new(DeviceConfig::from_env()?)?);
    // A racing thread may have won; its device is kept and ours is dropped.
    Ok(Arc::clone(DEFAULT_DEVICE.get_or_init(|| device)))
}
