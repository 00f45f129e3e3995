//! Emulated accelerator
//!
//! Implements [`Device`] on the host: device memory is a table of heap blocks
//! ([`memory`]), and kernels execute from an in-order [`stream`] whose worker
//! fans blocks out over a dedicated rayon pool. The observable contract
//! matches a discrete accelerator: launches are asynchronous, faults are
//! deferred to [`Device::take_last_error`], and host code never touches
//! device memory except through explicit copies.

mod memory;
mod stream;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceInfo, DevicePtr, DeviceStats, Kernel, TransferDirection};
use crate::error::{DeviceError, Result};
use crate::launch::LaunchConfig;
use memory::MemoryManager;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use stream::Stream;
use twinbuf_tracing::performance;

/// Host-backed accelerator
pub struct EmulatedDevice {
    // Declared first so pending kernels finish before memory is released.
    stream: Stream,
    memory: Mutex<MemoryManager>,
    info: DeviceInfo,
    launches: AtomicU64,
}

impl EmulatedDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name({
            let name = config.name.clone();
            move |i| format!("{name}-compute-{i}")
        });
        if let Some(threads) = config.compute_threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| DeviceError::Configuration(format!("failed to build compute pool: {e}")))?;

        let info = DeviceInfo {
            name: config.name.clone(),
            memory_limit: config.memory_limit,
            compute_threads: pool.current_num_threads(),
        };
        let stream = Stream::spawn(&config.name, pool)?;

        tracing::info!(
            device = %info.name,
            memory_limit = ?info.memory_limit,
            compute_threads = info.compute_threads,
            "emulated device ready"
        );

        Ok(Self {
            stream,
            memory: Mutex::new(MemoryManager::new(config.memory_limit)),
            info,
            launches: AtomicU64::new(0),
        })
    }

    /// Order a copy after all launched work; a stream failure fails the copy.
    fn await_stream(&self, direction: TransferDirection, bytes: usize) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| DeviceError::transfer(direction, bytes, e))
    }
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("info", &self.info)
            .field("pending", &self.stream.pending())
            .finish()
    }
}

impl Device for EmulatedDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, bytes: usize, align: usize) -> Result<DevicePtr> {
        let start = Instant::now();
        let ptr = self.memory.lock().allocate(bytes, align)?;
        performance::record_allocation(bytes, "device", align, start.elapsed().as_micros() as u64);
        tracing::trace!(%ptr, bytes, "device allocation");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        // In-flight kernels may still reference the block.
        self.stream.synchronize()?;
        self.memory.lock().free(ptr)?;
        tracing::trace!(%ptr, "device free");
        Ok(())
    }

    fn allocation_size(&self, ptr: DevicePtr) -> Result<usize> {
        self.memory.lock().allocation_size(ptr)
    }

    fn copy_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        let direction = TransferDirection::HostToDevice;
        self.await_stream(direction, src.len())?;

        let start = Instant::now();
        self.memory.lock().copy_to_device(src, dst)?;
        performance::record_transfer(src.len(), direction.as_str(), start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let direction = TransferDirection::DeviceToHost;
        self.await_stream(direction, dst.len())?;

        let start = Instant::now();
        self.memory.lock().copy_to_host(src, dst)?;
        performance::record_transfer(dst.len(), direction.as_str(), start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn copy_on_device(&self, src: DevicePtr, dst: DevicePtr, bytes: usize) -> Result<()> {
        let direction = TransferDirection::DeviceToDevice;
        self.await_stream(direction, bytes)?;

        let start = Instant::now();
        self.memory.lock().copy_on_device(src, dst, bytes)?;
        performance::record_transfer(bytes, direction.as_str(), start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn launch(&self, config: LaunchConfig, kernel: Kernel) -> Result<()> {
        config.validate()?;
        let sequence = self.stream.enqueue(config, kernel)?;
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(sequence, %config, "kernel enqueued");
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }

    fn take_last_error(&self) -> Result<()> {
        match self.stream.take_last_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stats(&self) -> DeviceStats {
        let memory = self.memory.lock();
        DeviceStats {
            live_allocations: memory.live_allocations(),
            bytes_in_use: memory.bytes_in_use(),
            peak_bytes_in_use: memory.peak_bytes_in_use(),
            total_allocations: memory.total_allocations(),
            total_frees: memory.total_frees(),
            launches: self.launches.load(Ordering::Relaxed),
            transfers: memory.transfers(),
        }
    }
}
