//! Allocation table for the emulated accelerator
//!
//! Device memory is carved out of the process heap with `alloc_zeroed`, so a
//! [`DevicePtr`] is the real address of the block. Every live block is
//! recorded with its layout; lookups, copies and frees go through the table,
//! which turns stale or foreign pointers into errors instead of memory
//! corruption.

use crate::device::{DevicePtr, TransferDirection};
use crate::error::{DeviceError, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};

struct Block {
    data: NonNull<u8>,
    layout: Layout,
}

/// Memory manager for the emulated accelerator
pub(crate) struct MemoryManager {
    blocks: HashMap<u64, Block>,
    limit: Option<usize>,
    bytes_in_use: usize,
    peak_bytes_in_use: usize,
    total_allocations: u64,
    total_frees: u64,
    transfers: u64,
}

// SAFETY: blocks are plain heap memory only reachable through the table,
// which is always accessed behind the device's lock.
unsafe impl Send for MemoryManager {}

impl MemoryManager {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            blocks: HashMap::new(),
            limit,
            bytes_in_use: 0,
            peak_bytes_in_use: 0,
            total_allocations: 0,
            total_frees: 0,
            transfers: 0,
        }
    }

    pub(crate) fn allocate(&mut self, bytes: usize, align: usize) -> Result<DevicePtr> {
        if bytes == 0 {
            return Ok(DevicePtr::NULL);
        }

        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.bytes_in_use);
            if bytes > available {
                return Err(DeviceError::allocation(
                    bytes,
                    format!("out of device memory ({available} of {limit} bytes free)"),
                ));
            }
        }

        let layout = Layout::from_size_align(bytes, align.max(1))
            .map_err(|e| DeviceError::allocation(bytes, format!("invalid layout: {e}")))?;

        // SAFETY: layout has non-zero size.
        let data = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| DeviceError::allocation(bytes, "host allocator refused the request"))?;

        let addr = data.as_ptr() as u64;
        self.blocks.insert(addr, Block { data, layout });
        self.bytes_in_use += bytes;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
        self.total_allocations += 1;

        Ok(DevicePtr::from_addr(addr))
    }

    pub(crate) fn free(&mut self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }

        let block = self
            .blocks
            .remove(&ptr.addr())
            .ok_or(DeviceError::InvalidDevicePointer(ptr.addr()))?;

        self.bytes_in_use -= block.layout.size();
        self.total_frees += 1;
        // SAFETY: the block was produced by alloc_zeroed with this layout and
        // has just been removed from the table, so it is freed exactly once.
        unsafe { dealloc(block.data.as_ptr(), block.layout) };
        Ok(())
    }

    pub(crate) fn allocation_size(&self, ptr: DevicePtr) -> Result<usize> {
        if ptr.is_null() {
            return Ok(0);
        }
        self.block(ptr).map(|b| b.layout.size())
    }

    fn block(&self, ptr: DevicePtr) -> Result<&Block> {
        self.blocks
            .get(&ptr.addr())
            .ok_or(DeviceError::InvalidDevicePointer(ptr.addr()))
    }

    /// Resolve `ptr` to a raw address that can hold `bytes`.
    fn checked_region(&self, ptr: DevicePtr, bytes: usize) -> Result<*mut u8> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }
        let block = self.block(ptr)?;
        if bytes > block.layout.size() {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                size: bytes,
                allocation_size: block.layout.size(),
            });
        }
        Ok(block.data.as_ptr())
    }

    pub(crate) fn copy_to_device(&mut self, src: &[u8], dst: DevicePtr) -> Result<()> {
        let direction = TransferDirection::HostToDevice;
        let dst_ptr = self
            .checked_region(dst, src.len())
            .map_err(|e| DeviceError::transfer(direction, src.len(), e))?;

        if !src.is_empty() {
            // SAFETY: dst_ptr addresses a live block of at least src.len() bytes
            // that cannot overlap a host slice.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst_ptr, src.len()) };
        }
        self.transfers += 1;
        Ok(())
    }

    pub(crate) fn copy_to_host(&mut self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let direction = TransferDirection::DeviceToHost;
        let src_ptr = self
            .checked_region(src, dst.len())
            .map_err(|e| DeviceError::transfer(direction, dst.len(), e))?;

        if !dst.is_empty() {
            // SAFETY: src_ptr addresses a live block of at least dst.len() bytes.
            unsafe { ptr::copy_nonoverlapping(src_ptr as *const u8, dst.as_mut_ptr(), dst.len()) };
        }
        self.transfers += 1;
        Ok(())
    }

    pub(crate) fn copy_on_device(&mut self, src: DevicePtr, dst: DevicePtr, bytes: usize) -> Result<()> {
        let direction = TransferDirection::DeviceToDevice;
        let src_ptr = self
            .checked_region(src, bytes)
            .map_err(|e| DeviceError::transfer(direction, bytes, e))?;
        let dst_ptr = self
            .checked_region(dst, bytes)
            .map_err(|e| DeviceError::transfer(direction, bytes, e))?;

        if bytes > 0 {
            // SAFETY: both regions are live blocks of at least `bytes` bytes;
            // `copy` tolerates src == dst.
            unsafe { ptr::copy(src_ptr as *const u8, dst_ptr, bytes) };
        }
        self.transfers += 1;
        Ok(())
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    pub(crate) fn peak_bytes_in_use(&self) -> usize {
        self.peak_bytes_in_use
    }

    pub(crate) fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    pub(crate) fn total_frees(&self) -> u64 {
        self.total_frees
    }

    pub(crate) fn transfers(&self) -> u64 {
        self.transfers
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.blocks.is_empty() {
            tracing::warn!(
                leaked_allocations = self.blocks.len(),
                leaked_bytes = self.bytes_in_use,
                "device torn down with live allocations"
            );
        }
        for (_, block) in self.blocks.drain() {
            // SAFETY: every block in the table came from alloc_zeroed with its layout.
            unsafe { dealloc(block.data.as_ptr(), block.layout) };
        }
    }
}
