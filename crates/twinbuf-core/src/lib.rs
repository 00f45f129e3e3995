//! # twinbuf-core - Dual-Location Managed Buffers
//!
//! Buffers that live on an accelerator and, when host code needs them, in a
//! mirrored host allocation, with explicit transfers between the two.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ManagedBuffer<T>                       │
//! │   shared allocation group: device memory + host mirror    │
//! └───────────┬────────────────────────────┬─────────────────┘
//!             │ to_device_view()           │ host_fill / host_map
//!             ▼                            ▼
//!   ┌───────────────────┐        ┌───────────────────┐
//!   │  DeviceView<T>    │        │  host transforms  │
//!   │  launch (64-wide  │        │  (rayon)          │
//!   │  tiles)           │        └───────────────────┘
//!   └─────────┬─────────┘
//!             ▼
//!      twinbuf-device (Device trait, emulated accelerator)
//! ```
//!
//! ## Key Principles
//!
//! 1. **Explicit coherence**: nothing moves between host and device unless
//!    `download` or `upload` is called.
//! 2. **Lazy mirror**: host memory is only allocated when something needs it.
//! 3. **Shared ownership**: cloned handles share one allocation, released
//!    exactly once by the last handle.
//! 4. **Checked failures**: device errors pass through [`check`] and follow the
//!    process [`FailurePolicy`](check::FailurePolicy).
//!
//! ## Example
//!
//! ```rust
//! use twinbuf_core::ManagedBuffer;
//!
//! # fn main() -> twinbuf_core::Result<()> {
//! let a = ManagedBuffer::<u32>::new(1000)?;
//! a.device_fill(3)?;
//! a.device_map(|x| x * 2)?;
//!
//! let b = a.deep_copy()?;
//! b.device_fill(0)?;
//!
//! assert!(a.download()?.iter().all(|&x| x == 6));
//! assert!(b.download()?.iter().all(|&x| x == 0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`buffer`] - `ManagedBuffer` and its allocation group
//! - [`view`] - `DeviceView`, the kernel-side descriptor
//! - [`launch`] - element-wise tiled launches
//! - [`host`] - parallel host-side transforms
//! - [`check`] - failure policy applied to device results

pub mod buffer;
pub mod check;
pub mod error;
pub mod host;
pub mod launch;
pub mod view;

// Re-export primary types
pub use buffer::{Element, ManagedBuffer};
pub use check::{check_last_launch, check_result, failure_policy, set_failure_policy, FailurePolicy};
pub use error::{Error, ErrorKind, Result};
pub use launch::TILE_WIDTH;
pub use view::DeviceView;

pub use twinbuf_device::{default_device, Device, DeviceConfig, DeviceError, EmulatedDevice};
