//! Element-wise kernel launches over device views
//!
//! ```text
//! elements: [0 ............ 63][64 .......... 127][128 .. n-1 | idle ]
//! tiles:    └──── tile 0 ─────┘└──── tile 1 ─────┘└──── tile 2 ──────┘
//! ```
//!
//! `n` elements are covered by `ceil(n / 64)` one-dimensional tiles of
//! [`TILE_WIDTH`] threads. Each thread derives its element index from its
//! tile and lane; threads past the end of the view do nothing. Every launch
//! is synchronous from the caller's point of view: it is enqueued, the
//! device is synchronized, and asynchronous faults are collected before
//! returning.

use crate::buffer::Element;
use crate::check::{check_last_launch, check_result};
use crate::error::Result;
use crate::view::DeviceView;
use std::sync::Arc;
use std::time::Instant;
use twinbuf_device::{BlockDim, Device, DeviceError, GridDim, Kernel, LaunchConfig, ThreadContext};
use twinbuf_tracing::{perf_span, performance};

/// Threads per tile
pub const TILE_WIDTH: u32 = 64;

/// Launch geometry covering `len` elements with tiles of [`TILE_WIDTH`].
///
/// Zero elements yield an empty grid, which callers must not launch.
pub fn tile_grid(len: usize) -> Result<LaunchConfig> {
    let tiles = len.div_ceil(TILE_WIDTH as usize);
    let tiles = u32::try_from(tiles).map_err(|_| {
        DeviceError::InvalidLaunchConfig(format!("{len} elements need {tiles} tiles, more than a grid can hold"))
    })?;
    Ok(LaunchConfig::new(GridDim::linear(tiles), BlockDim::linear(TILE_WIDTH)))
}

/// Write `f(i)` to every element `i` of `view`.
///
/// # Safety
///
/// `view` must describe a live allocation of `device` that stays alive, and
/// is not accessed by anything else, until this call returns.
pub unsafe fn launch_indexed<T, F>(device: &dyn Device, view: DeviceView<T>, f: F) -> Result<()>
where
    T: Element,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    launch_per_element(device, view.len(), "indexed", move |i| {
        // SAFETY: i < view.len() and each index belongs to exactly one thread.
        unsafe { view.store(i, f(i)) };
    })
}

/// Write a freshly generated value to every element of `view`.
///
/// # Safety
///
/// Same requirements as [`launch_indexed`].
pub unsafe fn launch_generate<T, F>(device: &dyn Device, view: DeviceView<T>, generator: F) -> Result<()>
where
    T: Element,
    F: Fn() -> T + Send + Sync + 'static,
{
    launch_per_element(device, view.len(), "generate", move |i| {
        // SAFETY: i < view.len() and each index belongs to exactly one thread.
        unsafe { view.store(i, generator()) };
    })
}

/// Replace every element `x` of `view` with `f(x)`.
///
/// # Safety
///
/// Same requirements as [`launch_indexed`].
pub unsafe fn launch_map<T, F>(device: &dyn Device, view: DeviceView<T>, f: F) -> Result<()>
where
    T: Element,
    F: Fn(T) -> T + Send + Sync + 'static,
{
    launch_per_element(device, view.len(), "map", move |i| {
        // SAFETY: i < view.len() and each index belongs to exactly one thread.
        unsafe {
            if let Some(x) = view.load(i) {
                view.store(i, f(x));
            }
        }
    })
}

fn launch_per_element<B>(device: &dyn Device, len: usize, kernel_name: &'static str, body: B) -> Result<()>
where
    B: Fn(usize) + Send + Sync + 'static,
{
    let config = tile_grid(len)?;
    if config.total_blocks() == 0 {
        tracing::trace!(kernel = kernel_name, "no elements, launch skipped");
        return Ok(());
    }

    let _span = perf_span!("element_launch", kernel = kernel_name, elements = len);
    let start = Instant::now();
    let kernel: Kernel = Arc::new(move |ctx: ThreadContext| {
        let index = ctx.global_linear_index() as usize;
        if index < len {
            body(index);
        }
    });

    check_result(device.launch(config, kernel))?;
    check_result(device.synchronize())?;
    check_last_launch(device)?;

    performance::record_launch(kernel_name, len, config.total_blocks(), start.elapsed().as_micros() as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use twinbuf_device::{DeviceConfig, EmulatedDevice};

    fn test_device() -> EmulatedDevice {
        EmulatedDevice::new(DeviceConfig::default().with_compute_threads(2)).unwrap()
    }

    fn read_back(device: &dyn Device, view: DeviceView<u32>) -> Vec<u32> {
        let mut out = vec![0u32; view.len()];
        device.copy_to_host(view.ptr(), bytemuck::cast_slice_mut(&mut out)).unwrap();
        out
    }

    #[test]
    fn test_tile_grid() {
        assert_eq!(tile_grid(0).unwrap().total_blocks(), 0);
        assert_eq!(tile_grid(1).unwrap().total_blocks(), 1);
        assert_eq!(tile_grid(64).unwrap().total_blocks(), 1);
        assert_eq!(tile_grid(65).unwrap().total_blocks(), 2);

        let config = tile_grid(1000).unwrap();
        assert_eq!(config.grid, GridDim::linear(16));
        assert_eq!(config.block, BlockDim::linear(TILE_WIDTH));
    }

    #[test]
    fn test_launch_indexed_covers_partial_tile() {
        let device = test_device();
        let n = 130;
        let ptr = device.allocate(n * 4, 4).unwrap();
        let view = DeviceView::<u32>::new(ptr, n);

        // SAFETY: the allocation outlives the call.
        unsafe { launch_indexed(&device, view, |i| i as u32 + 1).unwrap() };

        let out = read_back(&device, view);
        assert_eq!(out, (1..=n as u32).collect::<Vec<_>>());
        device.free(ptr).unwrap();
    }

    #[test]
    fn test_launch_map_and_generate() {
        let device = test_device();
        let n = 100;
        let ptr = device.allocate(n * 4, 4).unwrap();
        let view = DeviceView::<u32>::new(ptr, n);

        // SAFETY: the allocation outlives both calls.
        unsafe {
            launch_generate(&device, view, || 5u32).unwrap();
            launch_map(&device, view, |x| x * 3).unwrap();
        }

        assert!(read_back(&device, view).iter().all(|&x| x == 15));
        device.free(ptr).unwrap();
    }

    #[test]
    fn test_empty_view_issues_no_launch() {
        let device = test_device();
        let view = DeviceView::<u32>::new(twinbuf_device::DevicePtr::NULL, 0);

        // SAFETY: nothing is accessed.
        unsafe { launch_indexed(&device, view, |_| 1u32).unwrap() };
        assert_eq!(device.stats().launches, 0);
    }

    #[test]
    fn test_kernel_fault_is_reported() {
        let device = test_device();
        let ptr = device.allocate(64 * 4, 4).unwrap();
        let view = DeviceView::<u32>::new(ptr, 64);

        // SAFETY: the allocation outlives the call.
        let err = unsafe {
            launch_indexed(&device, view, |i| {
                if i == 10 {
                    panic!("fault at {i}");
                }
                0u32
            })
        }
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LaunchFailure);
        assert!(device.take_last_error().is_ok(), "fault is consumed by the check");
        device.free(ptr).unwrap();
    }
}
