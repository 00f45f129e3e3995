//! Device trait and the handle types it traffics in

use crate::error::Result;
use crate::launch::{LaunchConfig, ThreadContext};
use std::fmt;
use std::sync::Arc;

/// Address of a device allocation
///
/// Opaque to host code: only the owning device and kernels running on it
/// may dereference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The pointer of every zero-byte allocation
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn from_addr(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{:#x}", self.0)
    }
}

/// Direction of a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl TransferDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HostToDevice => "H2D",
            Self::DeviceToHost => "D2H",
            Self::DeviceToDevice => "D2D",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-thread body of a kernel
///
/// Invoked once for every thread of the launch grid, concurrently. Like real
/// device code it cannot borrow host stack data, hence `'static`.
pub type Kernel = Arc<dyn Fn(ThreadContext) + Send + Sync + 'static>;

/// Counters a device keeps about its own activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub live_allocations: usize,
    pub bytes_in_use: usize,
    pub peak_bytes_in_use: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub launches: u64,
    pub transfers: u64,
}

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// Device memory available to allocations, in bytes (`None` = unbounded)
    pub memory_limit: Option<usize>,
    /// Worker threads executing kernel blocks
    pub compute_threads: usize,
}

/// An accelerator that owns device memory and executes kernels
///
/// # Execution Model
///
/// ```text
/// host thread ──launch()──▶ stream (in-order queue) ──▶ grid of blocks
///      │                                                  └─ threads run Kernel
///      └──synchronize()── blocks until the stream is empty
/// ```
///
/// `launch` only enqueues: the call returns before the kernel has run. Faults
/// inside a kernel are recorded and reported by the next
/// [`Device::take_last_error`]. Copies are synchronous and ordered after all
/// previously launched work. Freeing memory also waits for pending work.
pub trait Device: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    /// Allocate `bytes` of device memory aligned to `align`
    ///
    /// Zero-byte requests return [`DevicePtr::NULL`] and consume nothing.
    fn allocate(&self, bytes: usize, align: usize) -> Result<DevicePtr>;

    /// Release an allocation; freeing an unknown pointer is an error
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Size in bytes of a live allocation
    fn allocation_size(&self, ptr: DevicePtr) -> Result<usize>;

    /// Copy host bytes to the start of a device allocation
    fn copy_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()>;

    /// Copy the start of a device allocation into host bytes
    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Copy `bytes` between two device allocations
    fn copy_on_device(&self, src: DevicePtr, dst: DevicePtr, bytes: usize) -> Result<()>;

    /// Enqueue `kernel` over the iteration space of `config`
    fn launch(&self, config: LaunchConfig, kernel: Kernel) -> Result<()>;

    /// Block until every launched kernel has finished
    fn synchronize(&self) -> Result<()>;

    /// Return and clear the first fault recorded by a kernel since the last call
    fn take_last_error(&self) -> Result<()>;

    fn stats(&self) -> DeviceStats;
}
