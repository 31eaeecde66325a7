use super::{Device, Sample};
use crate::error::Result;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

struct BufferInner<T> {
    data: RwLock<Vec<T>>,
    size_bytes: usize,
    device: Arc<Device>,
}

impl<T> Drop for BufferInner<T> {
    fn drop(&mut self) {
        self.device.release(self.size_bytes as u64);
    }
}

/// Shared handle to a block of device memory.
///
/// Cloning the handle does not copy the memory. The contents are only
/// touched by commands running on a [`CommandQueue`](super::CommandQueue).
pub struct DeviceBuffer<T: Sample> {
    inner: Arc<BufferInner<T>>,
}

impl<T: Sample> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Sample> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("precision", &T::PRECISION)
            .field("size_bytes", &self.inner.size_bytes)
            .finish()
    }
}

impl<T: Sample> DeviceBuffer<T> {
    /// Allocate `size_bytes` of zeroed device memory.
    ///
    /// The element count is `size_bytes / size_of::<T>()`; a trailing partial
    /// element is part of the allocation but not addressable.
    pub fn new(device: &Arc<Device>, size_bytes: usize) -> Result<Self> {
        device.reserve(size_bytes as u64)?;
        let len = size_bytes / std::mem::size_of::<T>();
        Ok(Self {
            inner: Arc::new(BufferInner {
                data: RwLock::new(vec![T::default(); len]),
                size_bytes,
                device: Arc::clone(device),
            }),
        })
    }

    /// Allocate room for `len` elements.
    pub fn with_len(device: &Arc<Device>, len: usize) -> Result<Self> {
        Self::new(device, len * std::mem::size_of::<T>())
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.size_bytes
    }

    /// Number of addressable elements.
    pub fn len(&self) -> usize {
        self.inner.size_bytes / std::mem::size_of::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn storage(&self) -> &RwLock<Vec<T>> {
        &self.inner.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceOptions;

    #[test]
    fn test_allocation_is_returned_on_last_drop() {
        let device = Device::open(0, 0, &HostDeviceOptions::default()).unwrap();
        let buffer = DeviceBuffer::<f32>::new(&device, 4 * 10 + 3).unwrap();
        assert_eq!(buffer.len(), 10);
        assert_eq!(device.allocated_bytes(), 43);

        let alias = buffer.clone();
        assert!(alias.same_buffer(&buffer));
        drop(buffer);
        assert_eq!(device.allocated_bytes(), 43);
        drop(alias);
        assert_eq!(device.allocated_bytes(), 0);
    }
}
