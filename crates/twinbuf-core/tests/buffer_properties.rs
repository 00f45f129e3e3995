//! Integration tests for managed buffer semantics
//!
//! Exercises the observable contract of `ManagedBuffer`: coherence through
//! explicit transfers, shared ownership, deep copies and the tiled launches
//! underneath device fills.

use proptest::prelude::*;
use std::sync::{Arc, OnceLock};
use twinbuf_core::{Device, DeviceConfig, EmulatedDevice, ErrorKind, ManagedBuffer, Result};

fn fresh_device() -> Arc<dyn Device> {
    Arc::new(EmulatedDevice::new(DeviceConfig::default().with_compute_threads(2)).unwrap())
}

/// One device shared by property cases, which only check buffer contents.
fn shared_device() -> Arc<dyn Device> {
    static DEVICE: OnceLock<Arc<dyn Device>> = OnceLock::new();
    Arc::clone(DEVICE.get_or_init(fresh_device))
}

#[test]
fn test_round_trip_shows_only_device_fill() -> Result<()> {
    let buf = ManagedBuffer::<f32>::new_on(fresh_device(), 300)?;

    buf.host_fill(1.5)?;
    buf.upload()?;
    buf.device_fill(-2.0)?;

    // Host still holds the uploaded data until the next download.
    assert!(buf.host_slice()?.iter().all(|&x| x == 1.5));
    assert!(buf.download()?.iter().all(|&x| x == -2.0));
    Ok(())
}

#[test]
fn test_fill_correctness() -> Result<()> {
    let buf = ManagedBuffer::<i32>::new_on(fresh_device(), 8)?;
    buf.device_fill(42)?;
    assert_eq!(&*buf.download()?, &[42; 8]);
    Ok(())
}

#[test]
fn test_copy_independence() -> Result<()> {
    let original = ManagedBuffer::<u32>::new_on(fresh_device(), 100)?;
    original.device_fill(5)?;

    let copy = original.deep_copy()?;
    copy.device_fill(6)?;
    assert!(original.download()?.iter().all(|&x| x == 5));

    original.device_fill(7)?;
    assert!(copy.download()?.iter().all(|&x| x == 6));
    assert!(original.download()?.iter().all(|&x| x == 7));
    Ok(())
}

#[test]
fn test_copy_independence_on_host() -> Result<()> {
    let original = ManagedBuffer::<u32>::new_on(fresh_device(), 100)?;
    original.host_fill(3)?;

    let copy = original.deep_copy()?;
    copy.host_fill(7)?;
    assert!(original.host_slice()?.iter().all(|&x| x == 3));

    original.host_fill(9)?;
    assert!(copy.host_slice()?.iter().all(|&x| x == 7));
    assert!(original.host_slice()?.iter().all(|&x| x == 9));
    Ok(())
}

#[test]
fn test_zero_size_buffer_issues_no_launch() -> Result<()> {
    let device = fresh_device();
    let buf = ManagedBuffer::<u64>::new_on(Arc::clone(&device), 0)?;

    buf.device_fill(9)?;
    buf.device_map(|x| x + 1)?;
    assert_eq!(device.stats().launches, 0);
    assert!(buf.to_vec()?.is_empty());
    Ok(())
}

#[test]
fn test_fill_launches_once_per_call() -> Result<()> {
    let device = fresh_device();
    let buf = ManagedBuffer::<u8>::new_on(Arc::clone(&device), 1000)?;

    buf.device_fill(1)?;
    buf.device_map(|x| x + 1)?;
    assert_eq!(device.stats().launches, 2);
    assert!(buf.to_vec()?.iter().all(|&x| x == 2));
    Ok(())
}

#[test]
fn test_shared_lifetime() -> Result<()> {
    let device = fresh_device();
    let first = ManagedBuffer::<f64>::new_on(Arc::clone(&device), 64)?;
    first.device_fill(3.25)?;

    let second = first.clone();
    assert_eq!(second.share_count(), 2);
    drop(first);

    // The allocation outlives the dropped handle.
    assert_eq!(device.stats().live_allocations, 1);
    assert!(second.download()?.iter().all(|&x| x == 3.25));

    drop(second);
    let stats = device.stats();
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.total_frees, 1);
    Ok(())
}

#[test]
fn test_moved_handle_keeps_share_count() -> Result<()> {
    let buf = ManagedBuffer::<u32>::new_on(fresh_device(), 4)?;
    let handles = vec![buf];
    assert_eq!(handles[0].share_count(), 1);
    Ok(())
}

#[test]
fn test_assignment_frees_previous_allocation() -> Result<()> {
    let device = fresh_device();
    let mut target = ManagedBuffer::<u32>::new_on(Arc::clone(&device), 16)?;
    let source = ManagedBuffer::<u32>::new_on(Arc::clone(&device), 16)?;
    source.device_fill(11)?;

    target.assign(&source);
    assert_eq!(device.stats().total_frees, 1);
    assert!(target.download()?.iter().all(|&x| x == 11));
    Ok(())
}

#[test]
fn test_kernel_fault_surfaces_as_launch_failure() -> Result<()> {
    let buf = ManagedBuffer::<u32>::new_on(fresh_device(), 256)?;
    let err = buf
        .device_map(|x| if x == 0 { panic!("zero element") } else { x })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailure);

    // The device stays usable after the fault has been reported.
    buf.device_fill(1)?;
    assert!(buf.to_vec()?.iter().all(|&x| x == 1));
    Ok(())
}

#[test]
fn test_allocation_beyond_device_memory() {
    let device: Arc<dyn Device> = Arc::new(
        EmulatedDevice::new(DeviceConfig::default().with_memory_limit(4096).with_compute_threads(1)).unwrap(),
    );
    let held = ManagedBuffer::<u8>::new_on(Arc::clone(&device), 4000).unwrap();

    let err = ManagedBuffer::<u8>::new_on(Arc::clone(&device), 200).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);

    drop(held);
    assert!(ManagedBuffer::<u8>::new_on(device, 200).is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_host_map_identity(data in prop::collection::vec(any::<i32>(), 0..2000)) {
        let buf = ManagedBuffer::<i32>::new_on(shared_device(), data.len()).unwrap();
        buf.upload_from(&data).unwrap();

        buf.host_map(|x| x).unwrap();
        prop_assert_eq!(&*buf.host_slice().unwrap(), data.as_slice());
    }

    #[test]
    fn prop_device_map_identity(data in prop::collection::vec(any::<u16>(), 0..2000)) {
        let buf = ManagedBuffer::<u16>::new_on(shared_device(), data.len()).unwrap();
        buf.upload_from(&data).unwrap();

        buf.device_map(|x| x).unwrap();
        prop_assert_eq!(buf.to_vec().unwrap(), data);
    }

    #[test]
    fn prop_host_allocate_sets_size(initial in 0usize..512, resized in 0usize..512) {
        let buf = ManagedBuffer::<f32>::new_on(shared_device(), initial).unwrap();
        buf.host_allocate(resized).unwrap();

        prop_assert_eq!(buf.len(), resized);
        prop_assert_eq!(buf.host_slice().unwrap().len(), resized);
        prop_assert_eq!(buf.capacity(), initial);
    }

    #[test]
    fn prop_upload_download_round_trip(data in prop::collection::vec(any::<u64>(), 0..700)) {
        let buf = ManagedBuffer::<u64>::new_on(shared_device(), data.len()).unwrap();
        buf.upload_from(&data).unwrap();
        buf.host_fill(0).unwrap();

        prop_assert_eq!(&*buf.download().unwrap(), data.as_slice());
    }

    #[test]
    fn prop_device_fill_covers_every_tile(len in 0usize..1000, value in any::<u32>()) {
        let buf = ManagedBuffer::<u32>::new_on(shared_device(), len).unwrap();
        buf.device_fill(value).unwrap();

        let out = buf.to_vec().unwrap();
        prop_assert_eq!(out.len(), len);
        prop_assert!(out.iter().all(|&x| x == value));
    }
}
