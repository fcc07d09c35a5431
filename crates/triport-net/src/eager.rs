//! Pre-registered buffers for small transfers.

use std::mem::ManuallyDrop;

use crate::chunk::Segment;
use crate::error::Result;
use crate::memory::LocalMemoryRegion;

/// Transfers at or below this size skip registration of the caller's buffer.
pub const DEFAULT_EAGER_THRESHOLD: usize = 512 * 1024;

/// A heap buffer registered once and reused for every small transfer.
pub struct EagerBuffer {
    region: ManuallyDrop<LocalMemoryRegion<'static>>,
    storage: *mut [u8],
}

// The buffer exclusively owns its allocation.
unsafe impl Send for EagerBuffer {}

impl EagerBuffer {
    /// Allocate `size` zeroed bytes and register them with `register`.
    pub fn new<F>(size: usize, register: F) -> Result<Self>
    where
        F: FnOnce(*mut u8, usize) -> Result<LocalMemoryRegion<'static>>,
    {
        let storage = Box::into_raw(vec![0u8; size].into_boxed_slice());
        let ptr = storage as *mut u8;
        match register(ptr, size) {
            Ok(region) => Ok(Self {
                region: ManuallyDrop::new(region),
                storage,
            }),
            Err(e) => {
                // SAFETY: produced by Box::into_raw above and never shared.
                drop(unsafe { Box::from_raw(storage) });
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn region(&self) -> &LocalMemoryRegion<'static> {
        &self.region
    }

    /// The first `len` bytes as a scatter-gather entry.
    pub fn segment(&self, len: usize) -> Segment {
        Segment::new(self.region.addr(), len.min(self.len()), self.region.local_key())
    }

    pub fn bytes(&self, len: usize) -> &[u8] {
        &self.region.as_slice()[..len.min(self.len())]
    }

    pub fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.len());
        &mut self.region.as_mut_slice()[..len]
    }
}

impl Drop for EagerBuffer {
    fn drop(&mut self) {
        // Deregister before the memory goes away.
        // SAFETY: the region is never used again, and `storage` came from
        // Box::into_raw in `new`.
        unsafe {
            ManuallyDrop::drop(&mut self.region);
            drop(Box::from_raw(self.storage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ResourceError};
    use crate::memory::AccessFlags;

    fn plain(ptr: *mut u8, len: usize) -> Result<LocalMemoryRegion<'static>> {
        Ok(unsafe { LocalMemoryRegion::from_raw_parts(ptr, len, 3, 4, AccessFlags::LOCAL_WRITE, None) })
    }

    #[test]
    fn test_eager_buffer_roundtrip() {
        let mut eager = EagerBuffer::new(32, plain).unwrap();
        assert_eq!(eager.len(), 32);
        eager.bytes_mut(5).copy_from_slice(b"hello");
        assert_eq!(eager.bytes(5), b"hello");

        let seg = eager.segment(100);
        assert_eq!(seg.length, 32);
        assert_eq!(seg.key, 3);
        assert_eq!(seg.addr, eager.region().addr());
    }

    #[test]
    fn test_eager_buffer_registration_failure() {
        let result = EagerBuffer::new(16, |_, len| {
            Err(ResourceError::Registration {
                length: len,
                reason: "pinned memory limit".into(),
            }
            .into())
        });
        assert!(matches!(result, Err(Error::Resource(_))));
    }
}
