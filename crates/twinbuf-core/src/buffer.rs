//! Managed buffers: one logical array in device memory and a lazy host mirror
//!
//! A [`ManagedBuffer`] owns a device allocation and, once something needs
//! it, a host-side mirror of the same elements. Data moves between the two
//! only through explicit [`download`](ManagedBuffer::download) and
//! [`upload`](ManagedBuffer::upload) calls.
//!
//! ```text
//!  ManagedBuffer ─┐
//!  ManagedBuffer ─┼──▶ Arc<AllocationGroup> ──▶ device allocation (capacity elements)
//!  ManagedBuffer ─┘          │
//!                            └── RwLock ──▶ host mirror: absent | Vec<T> (len elements)
//! ```
//!
//! Cloning a handle shares the allocation group; the last handle to go away
//! frees the device allocation (exactly once) and the mirror. Every
//! operation takes the group's lock for its own duration only, so sequences
//! of operations on shared handles need external serialization. Holding a
//! guard returned by [`index`](ManagedBuffer::index),
//! [`host_slice`](ManagedBuffer::host_slice) or their mutable forms while
//! calling another operation on the same group deadlocks.

use crate::check::check_result;
use crate::error::{Error, Result};
use crate::host;
use crate::launch;
use crate::view::DeviceView;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use twinbuf_device::{default_device, Device, DeviceError, DevicePtr};
use twinbuf_tracing::perf_event;

/// Element types a [`ManagedBuffer`] can hold
///
/// Plain-old-data only: elements are moved between memory spaces as raw
/// bytes and shared with kernels running on other threads.
pub trait Element: bytemuck::Pod + Send + Sync {}

impl<T: bytemuck::Pod + Send + Sync> Element for T {}

struct MirrorState<T> {
    /// Logical element count
    len: usize,
    host: Option<Vec<T>>,
    /// Device written since the last transfer
    host_dirty: bool,
    /// Host written since the last transfer
    device_dirty: bool,
}

impl<T> MirrorState<T> {
    fn access_error(&self, index: usize) -> Error {
        match &self.host {
            None => Error::HostMirrorAbsent,
            Some(host) => Error::IndexOutOfBounds { index, len: host.len() },
        }
    }
}

struct AllocationGroup<T> {
    device: Arc<dyn Device>,
    device_ptr: DevicePtr,
    /// Elements the device allocation can hold
    capacity: usize,
    state: RwLock<MirrorState<T>>,
}

impl<T> AllocationGroup<T> {
    fn ensure_device_fits(&self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(Error::SizeMismatch {
                expected: self.capacity,
                actual: len,
            });
        }
        Ok(())
    }
}

impl<T> Drop for AllocationGroup<T> {
    fn drop(&mut self) {
        if let Err(err) = check_result(self.device.free(self.device_ptr)) {
            tracing::error!(ptr = %self.device_ptr, error = %err, "failed to release device allocation");
        } else {
            tracing::trace!(ptr = %self.device_ptr, capacity = self.capacity, "allocation group released");
        }
    }
}

/// Host mirror of `len` zeroed elements; the host refusing is an allocation failure.
fn zeroed_mirror<T: Element>(len: usize) -> Result<Vec<T>> {
    let mut host = Vec::new();
    check_result(host.try_reserve_exact(len).map_err(|e| {
        DeviceError::allocation(len.saturating_mul(mem::size_of::<T>()), format!("host mirror: {e}"))
    }))?;
    host.resize(len, bytemuck::Zeroable::zeroed());

    perf_event!("host_mirror_allocated", elements = len, bytes = len * mem::size_of::<T>());
    Ok(host)
}

fn log_transfer(operation: &'static str, direction: &'static str, bytes: usize, start: Instant) {
    let duration_us = start.elapsed().as_micros() as u64;
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        duration_us = duration_us,
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        bandwidth_mbps = bandwidth_mbps,
        direction = direction,
        operation = operation,
        "buffer_transfer"
    );
}

/// Typed handle to a device allocation with a lazily created host mirror
///
/// # Examples
///
/// ```rust
/// use twinbuf_core::ManagedBuffer;
///
/// # fn main() -> twinbuf_core::Result<()> {
/// let buf = ManagedBuffer::<f32>::new(8)?;
/// buf.device_fill(42.0)?;
///
/// assert_eq!(&*buf.download()?, &[42.0; 8]);
/// # Ok(())
/// # }
/// ```
pub struct ManagedBuffer<T: Element> {
    group: Arc<AllocationGroup<T>>,
}

impl<T: Element> ManagedBuffer<T> {
    /// Allocate `len` elements on the process-wide default device.
    pub fn new(len: usize) -> Result<Self> {
        let device = check_result(default_device())?;
        Self::new_on(device, len)
    }

    /// Allocate `len` elements on `device`.
    ///
    /// Device memory starts zeroed; the host mirror starts absent.
    #[tracing::instrument(skip(device), fields(device = %device.info().name, type_name = std::any::type_name::<T>()))]
    pub fn new_on(device: Arc<dyn Device>, len: usize) -> Result<Self> {
        let bytes = check_result(len.checked_mul(mem::size_of::<T>()).ok_or_else(|| {
            DeviceError::allocation(usize::MAX, format!("{len} elements overflow the address space"))
        }))?;
        let device_ptr = check_result(device.allocate(bytes, mem::align_of::<T>()))?;

        tracing::debug!(ptr = %device_ptr, elements = len, bytes, "buffer_allocated");

        Ok(Self {
            group: Arc::new(AllocationGroup {
                device,
                device_ptr,
                capacity: len,
                state: RwLock::new(MirrorState {
                    len,
                    host: None,
                    host_dirty: false,
                    device_dirty: false,
                }),
            }),
        })
    }

    /// Get number of elements
    pub fn len(&self) -> usize {
        self.group.state.read().len
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements the device allocation can hold
    pub fn capacity(&self) -> usize {
        self.group.capacity
    }

    /// Get total size in bytes
    pub fn size_bytes(&self) -> usize {
        self.len() * mem::size_of::<T>()
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.group.device
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.group.device_ptr
    }

    pub fn has_host_mirror(&self) -> bool {
        self.group.state.read().host.is_some()
    }

    /// Number of live handles sharing this buffer's allocation
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.group)
    }

    pub fn shares_allocation_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.group, &other.group)
    }

    /// Device memory was written after the last transfer.
    pub fn host_is_stale(&self) -> bool {
        self.group.state.read().host_dirty
    }

    /// The host mirror was written after the last transfer.
    pub fn device_is_stale(&self) -> bool {
        self.group.state.read().device_dirty
    }

    /// Make this handle share `other`'s allocation.
    ///
    /// The hold on the previous allocation is released first, which frees it
    /// when this was its last handle.
    pub fn assign(&mut self, other: &Self) {
        if self.shares_allocation_with(other) {
            return;
        }
        tracing::trace!(from = %self.group.device_ptr, to = %other.group.device_ptr, "buffer_assign");
        self.group = Arc::clone(&other.group);
    }

    /// Read access to element `index` of the host mirror
    pub fn index(&self, index: usize) -> Result<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.group.state.read(), |s| s.host.as_deref()?.get(index))
            .map_err(|state| state.access_error(index))
    }

    /// Write access to element `index` of the host mirror
    pub fn index_mut(&self, index: usize) -> Result<MappedRwLockWriteGuard<'_, T>> {
        let mut state = self.group.state.write();
        if state.host.as_ref().is_some_and(|h| index < h.len()) {
            state.device_dirty = true;
        }
        RwLockWriteGuard::try_map(state, |s| s.host.as_deref_mut()?.get_mut(index))
            .map_err(|state| state.access_error(index))
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.index(index).map(|value| *value)
    }

    pub fn set(&self, index: usize, value: T) -> Result<()> {
        *self.index_mut(index)? = value;
        Ok(())
    }

    /// Read access to the whole host mirror
    pub fn host_slice(&self) -> Result<MappedRwLockReadGuard<'_, [T]>> {
        RwLockReadGuard::try_map(self.group.state.read(), |s| s.host.as_deref()).map_err(|_| Error::HostMirrorAbsent)
    }

    /// Write access to the whole host mirror
    pub fn host_slice_mut(&self) -> Result<MappedRwLockWriteGuard<'_, [T]>> {
        let mut state = self.group.state.write();
        if state.host.is_some() {
            state.device_dirty = true;
        }
        RwLockWriteGuard::try_map(state, |s| s.host.as_deref_mut()).map_err(|_| Error::HostMirrorAbsent)
    }

    /// Copy device contents into the host mirror (D2H transfer)
    ///
    /// Allocates the mirror first if it is absent. Blocks until the copy,
    /// and all previously launched work, has completed.
    #[tracing::instrument(skip(self), fields(
        ptr = %self.group.device_ptr,
        type_name = std::any::type_name::<T>()
    ))]
    pub fn download(&self) -> Result<MappedRwLockReadGuard<'_, [T]>> {
        let start = Instant::now();
        let mut state = self.group.state.write();
        self.group.ensure_device_fits(state.len)?;

        if state.host.is_none() {
            state.host = Some(zeroed_mirror(state.len)?);
        }
        let host = state.host.as_deref_mut().unwrap_or_default();
        let bytes = mem::size_of_val(host);
        check_result(
            self.group
                .device
                .copy_to_host(self.group.device_ptr, bytemuck::cast_slice_mut(host)),
        )?;
        state.host_dirty = false;
        state.device_dirty = false;

        log_transfer("buffer_download", "D2H", bytes, start);

        let state = RwLockWriteGuard::downgrade(state);
        Ok(RwLockReadGuard::map(state, |s| s.host.as_deref().unwrap_or_default()))
    }

    /// Copy the host mirror to device memory (H2D transfer)
    #[tracing::instrument(skip(self), fields(
        ptr = %self.group.device_ptr,
        type_name = std::any::type_name::<T>()
    ))]
    pub fn upload(&self) -> Result<()> {
        let start = Instant::now();
        let mut state = self.group.state.write();
        self.group.ensure_device_fits(state.len)?;

        let host = state.host.as_deref().ok_or(Error::HostMirrorAbsent)?;
        let bytes = mem::size_of_val(host);
        check_result(
            self.group
                .device
                .copy_to_device(bytemuck::cast_slice(host), self.group.device_ptr),
        )?;
        state.host_dirty = false;
        state.device_dirty = false;

        log_transfer("buffer_upload", "H2D", bytes, start);
        Ok(())
    }

    /// Replace the host mirror with `data` and upload it
    ///
    /// The buffer's length becomes `data.len()`, which must fit the device
    /// allocation.
    #[tracing::instrument(skip(self, data), fields(
        ptr = %self.group.device_ptr,
        elements = data.len(),
        type_name = std::any::type_name::<T>()
    ))]
    pub fn upload_from(&self, data: &[T]) -> Result<()> {
        let start = Instant::now();
        let mut state = self.group.state.write();
        self.group.ensure_device_fits(data.len())?;

        let mut host = zeroed_mirror(data.len())?;
        host.copy_from_slice(data);
        check_result(
            self.group
                .device
                .copy_to_device(bytemuck::cast_slice(&host), self.group.device_ptr),
        )?;
        state.len = data.len();
        state.host = Some(host);
        state.host_dirty = false;
        state.device_dirty = false;

        log_transfer("buffer_upload_from", "H2D", mem::size_of_val(data), start);
        Ok(())
    }

    /// Download and return an owned copy of the contents
    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.download()?.to_vec())
    }

    /// Set every device element to `value`; the host mirror is untouched.
    #[tracing::instrument(skip(self, value), fields(ptr = %self.group.device_ptr))]
    pub fn device_fill(&self, value: T) -> Result<()> {
        self.launch_on_device(|device, view| {
            // SAFETY: the view covers this group's live allocation on `device`.
            unsafe { launch::launch_generate(device, view, move || value) }
        })
    }

    /// Set every device element to a freshly generated value.
    pub fn device_fill_with<F>(&self, generator: F) -> Result<()>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.launch_on_device(|device, view| {
            // SAFETY: the view covers this group's live allocation on `device`.
            unsafe { launch::launch_generate(device, view, generator) }
        })
    }

    /// Replace every device element `x` with `f(x)`.
    pub fn device_map<F>(&self, f: F) -> Result<()>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.launch_on_device(|device, view| {
            // SAFETY: the view covers this group's live allocation on `device`.
            unsafe { launch::launch_map(device, view, f) }
        })
    }

    /// Run one element-wise launch while holding the group exclusively.
    fn launch_on_device<L>(&self, launch: L) -> Result<()>
    where
        L: FnOnce(&dyn Device, DeviceView<T>) -> Result<()>,
    {
        let mut state = self.group.state.write();
        self.group.ensure_device_fits(state.len)?;

        let view = DeviceView::new(self.group.device_ptr, state.len);
        let result = launch(self.group.device.as_ref(), view);
        // A kernel that faults may already have written part of the allocation.
        if view.len() > 0 {
            state.host_dirty = true;
        }
        result
    }

    /// (Re)allocate the host mirror with `len` elements
    ///
    /// The buffer's length becomes `len`. Mirror contents are zeroed and do
    /// not reflect device memory; the device counts as stale until the next
    /// upload.
    #[tracing::instrument(skip(self), fields(ptr = %self.group.device_ptr))]
    pub fn host_allocate(&self, len: usize) -> Result<()> {
        let mut state = self.group.state.write();
        Self::reallocate_mirror(&mut state, len)
    }

    /// (Re)allocate the host mirror at the buffer's current length.
    pub fn host_allocate_default(&self) -> Result<()> {
        let mut state = self.group.state.write();
        let len = state.len;
        Self::reallocate_mirror(&mut state, len)
    }

    fn reallocate_mirror(state: &mut MirrorState<T>, len: usize) -> Result<()> {
        state.host = Some(zeroed_mirror(len)?);
        state.len = len;
        state.host_dirty = false;
        state.device_dirty = true;
        Ok(())
    }

    /// Set every host element to `value`, allocating the mirror if needed.
    pub fn host_fill(&self, value: T) -> Result<()> {
        self.host_fill_with(move || value)
    }

    /// Set every host element to a freshly generated value.
    pub fn host_fill_with<F>(&self, generator: F) -> Result<()>
    where
        F: Fn() -> T + Send + Sync,
    {
        self.with_host_mirror(|mirror| host::generate_in_place(mirror, generator))
    }

    /// Replace every host element `x` with `f(x)`, in no particular order.
    pub fn host_map<F>(&self, f: F) -> Result<()>
    where
        F: Fn(T) -> T + Send + Sync,
    {
        self.with_host_mirror(|mirror| host::transform_in_place(mirror, f))
    }

    fn with_host_mirror(&self, write: impl FnOnce(&mut [T])) -> Result<()> {
        let mut state = self.group.state.write();
        if state.host.is_none() {
            state.host = Some(zeroed_mirror(state.len)?);
        }
        if let Some(mirror) = state.host.as_deref_mut() {
            write(mirror);
        }
        state.device_dirty = true;
        Ok(())
    }

    /// Independent copy with its own allocation group
    ///
    /// Device contents are copied on the device; the host mirror is cloned
    /// when present. The copy starts with a share count of 1.
    #[tracing::instrument(skip(self), fields(
        ptr = %self.group.device_ptr,
        type_name = std::any::type_name::<T>()
    ))]
    pub fn deep_copy(&self) -> Result<Self> {
        let start = Instant::now();
        let state = self.group.state.read();
        let copy = Self::new_on(Arc::clone(&self.group.device), self.group.capacity)?;

        let bytes = self.group.capacity * mem::size_of::<T>();
        check_result(
            self.group
                .device
                .copy_on_device(self.group.device_ptr, copy.group.device_ptr, bytes),
        )?;

        {
            let mut copy_state = copy.group.state.write();
            copy_state.len = state.len;
            copy_state.host = state.host.clone();
            copy_state.host_dirty = state.host_dirty;
            copy_state.device_dirty = state.device_dirty;
        }

        log_transfer("buffer_deep_copy", "D2D", bytes, start);
        Ok(copy)
    }

    /// Snapshot `{device pointer, length}` for use inside kernels
    ///
    /// The view does not keep the allocation alive.
    pub fn to_device_view(&self) -> Result<DeviceView<T>> {
        let state = self.group.state.read();
        self.group.ensure_device_fits(state.len)?;
        Ok(DeviceView::new(self.group.device_ptr, state.len))
    }
}

impl<T: Element> Clone for ManagedBuffer<T> {
    /// Share the allocation; nothing is copied.
    fn clone(&self) -> Self {
        Self {
            group: Arc::clone(&self.group),
        }
    }
}

impl<T: Element> fmt::Debug for ManagedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ManagedBuffer");
        debug
            .field("type_name", &std::any::type_name::<T>())
            .field("ptr", &self.group.device_ptr)
            .field("capacity", &self.group.capacity)
            .field("share_count", &self.share_count());
        // A caller may be holding a guard on this group.
        if let Some(state) = self.group.state.try_read() {
            debug.field("len", &state.len).field("has_host_mirror", &state.host.is_some());
        }
        debug.finish_non_exhaustive()
    }
}
