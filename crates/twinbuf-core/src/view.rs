//! Kernel-side views of device memory

use crate::buffer::Element;
use std::fmt;
use std::marker::PhantomData;
use twinbuf_device::DevicePtr;

/// Non-owning `{pointer, length}` snapshot of a buffer's device allocation
///
/// A view is what a kernel captures: it is `Copy`, carries no ownership and
/// does not keep the allocation alive. It is valid only while the buffer it
/// came from is alive and has not been reallocated.
///
/// Element access is bounds-checked: indices outside `[0, len)` perform no
/// access, so a launch may carry more threads than elements.
pub struct DeviceView<T> {
    ptr: DevicePtr,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for DeviceView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DeviceView<T> {}

impl<T> fmt::Debug for DeviceView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("type_name", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Element> DeviceView<T> {
    pub(crate) fn new(ptr: DevicePtr, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Write `value` to element `index`. Returns `false` (and writes
    /// nothing) when `index >= len`.
    ///
    /// # Safety
    ///
    /// Must run on the device that owns the allocation, while the source
    /// buffer is alive, and no other thread may access element `index`
    /// concurrently.
    #[inline]
    pub unsafe fn store(&self, index: usize, value: T) -> bool {
        if index >= self.len {
            return false;
        }
        (self.ptr.addr() as usize as *mut T).add(index).write(value);
        true
    }

    /// Read element `index`, or `None` when `index >= len`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`DeviceView::store`].
    #[inline]
    pub unsafe fn load(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        Some((self.ptr.addr() as usize as *const T).add(index).read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbuf_device::{Device, DeviceConfig, EmulatedDevice};

    #[test]
    fn test_view_is_a_plain_snapshot() {
        let view = DeviceView::<f32>::new(DevicePtr::from_addr(0x100), 16);
        let copy = view;
        assert_eq!(copy.ptr(), view.ptr());
        assert_eq!(copy.len(), 16);
        assert_eq!(copy.size_bytes(), 64);
        assert!(!copy.is_empty());
    }

    #[test]
    fn test_out_of_range_access_is_ignored() {
        let device = EmulatedDevice::new(DeviceConfig::default().with_compute_threads(1)).unwrap();
        let ptr = device.allocate(4 * std::mem::size_of::<u32>(), std::mem::align_of::<u32>()).unwrap();
        let view = DeviceView::<u32>::new(ptr, 4);

        // SAFETY: the allocation is live and this thread is its only user.
        unsafe {
            assert!(view.store(3, 9));
            assert!(!view.store(4, 1));
            assert_eq!(view.load(3), Some(9));
            assert_eq!(view.load(0), Some(0));
            assert_eq!(view.load(4), None);
        }

        device.free(ptr).unwrap();
    }

    #[test]
    fn test_empty_view_never_dereferences() {
        let view = DeviceView::<u64>::new(DevicePtr::NULL, 0);
        assert!(view.is_empty());
        // SAFETY: every access is out of range.
        unsafe {
            assert!(!view.store(0, 1));
            assert_eq!(view.load(0), None);
        }
    }
}
