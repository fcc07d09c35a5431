//! Local and remote memory regions.
//!
//! A [`LocalMemoryRegion`] is a byte range the owning transport has made usable
//! for local access and, when registered with remote access flags, for one-sided
//! access by a peer. Its lifetime parameter ties it to the caller's buffer, and
//! dropping it deregisters the memory.
//!
//! A [`RemoteMemoryRegion`] is the flat descriptor a peer needs to target such a
//! region with Write/Read.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::chunk::Segment;
use crate::error::{Error, Result};

bitflags! {
    /// Permissions requested when registering memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_READ = 1 << 0;
        const LOCAL_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

impl AccessFlags {
    /// Everything a peer needs for both Write and Read.
    pub const REMOTE_ALL: AccessFlags = AccessFlags::LOCAL_READ
        .union(AccessFlags::LOCAL_WRITE)
        .union(AccessFlags::REMOTE_READ)
        .union(AccessFlags::REMOTE_WRITE);

    /// Hardware refuses remote write access without local write access.
    pub fn normalized(self) -> Self {
        if self.contains(AccessFlags::REMOTE_WRITE) {
            self | AccessFlags::LOCAL_WRITE
        } else {
            self
        }
    }
}

/// Opaque state that keeps a registration alive; dropping it deregisters.
pub type RegistrationGuard = Box<dyn Send>;

/// A byte range usable by the transport that registered it.
pub struct LocalMemoryRegion<'a> {
    addr: NonNull<u8>,
    length: usize,
    local_key: u64,
    remote_key: u64,
    access: AccessFlags,
    _registration: Option<RegistrationGuard>,
    _buffer: PhantomData<&'a mut [u8]>,
}

// The region behaves like the `&mut [u8]` it was created from.
unsafe impl Send for LocalMemoryRegion<'_> {}

impl<'a> LocalMemoryRegion<'a> {
    /// Wrap a buffer without registering it. Stream transports need no keys.
    pub fn unregistered(buf: &'a mut [u8]) -> Self {
        let length = buf.len();
        // SAFETY: the pointer comes from a live `&'a mut [u8]`.
        unsafe {
            Self::from_raw_parts(
                buf.as_mut_ptr(),
                length,
                0,
                0,
                AccessFlags::REMOTE_ALL,
                None,
            )
        }
    }

    /// Build a region from a transport registration.
    ///
    /// # Safety
    ///
    /// `addr..addr + length` must stay valid, and must not be accessed other
    /// than through this region, for the whole lifetime `'a`.
    pub unsafe fn from_raw_parts(
        addr: *mut u8,
        length: usize,
        local_key: u64,
        remote_key: u64,
        access: AccessFlags,
        registration: Option<RegistrationGuard>,
    ) -> Self {
        Self {
            addr: NonNull::new(addr).unwrap_or(NonNull::dangling()),
            length,
            local_key,
            remote_key,
            access,
            _registration: registration,
            _buffer: PhantomData,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr.as_ptr() as usize as u64
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn local_key(&self) -> u64 {
        self.local_key
    }

    pub fn remote_key(&self) -> u64 {
        self.remote_key
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed valid for 'a by construction.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.length) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed valid and exclusive for 'a by construction.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.length) }
    }

    /// The descriptor a peer needs to target this region.
    pub fn to_remote(&self) -> RemoteMemoryRegion {
        RemoteMemoryRegion::new(self.addr(), self.remote_key, self.length as u64)
    }

    pub fn segment(&self) -> Segment {
        Segment::new(self.addr(), self.length, self.local_key)
    }
}

impl fmt::Debug for LocalMemoryRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("length", &self.length)
            .field("local_key", &self.local_key)
            .field("remote_key", &self.remote_key)
            .field("access", &self.access)
            .finish()
    }
}

/// Size of one [`RemoteMemoryRegion`] on the wire.
pub const REMOTE_REGION_WIRE_SIZE: usize = 24;

/// A peer's registered region, as seen from this side.
///
/// Only valid while the peer keeps the corresponding local region registered.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteMemoryRegion {
    pub addr: u64,
    pub rkey: u64,
    pub length: u64,
}

impl RemoteMemoryRegion {
    pub fn new(addr: u64, rkey: u64, length: u64) -> Self {
        Self { addr, rkey, length }
    }

    pub fn is_valid(&self) -> bool {
        self.addr != 0
    }

    /// Advance the start by `len` bytes. Returns `false` if `len` exceeds the size.
    pub fn advance(&mut self, len: u64) -> bool {
        if self.length < len {
            return false;
        }
        self.addr += len;
        self.length -= len;
        true
    }

    pub fn subrange(&self, offset: u64, len: u64) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > self.length {
            return None;
        }
        Some(Self::new(self.addr + offset, self.rkey, len))
    }

    /// Native-endian `{addr, rkey, length}`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u64_ne(self.addr);
        buf.put_u64_ne(self.rkey);
        buf.put_u64_ne(self.length);
    }

    pub fn decode_from(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < REMOTE_REGION_WIRE_SIZE {
            return None;
        }
        Some(Self {
            addr: buf.get_u64_ne(),
            rkey: buf.get_u64_ne(),
            length: buf.get_u64_ne(),
        })
    }
}

/// Serialize descriptors as a flat blob with no count prefix.
pub fn encode_regions(regions: &[RemoteMemoryRegion]) -> Bytes {
    let mut buf = BytesMut::with_capacity(regions.len() * REMOTE_REGION_WIRE_SIZE);
    for region in regions {
        region.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Decode exactly `count` descriptors; the count travels out of band.
pub fn decode_regions(mut bytes: &[u8], count: usize) -> Result<Vec<RemoteMemoryRegion>> {
    let expected = count * REMOTE_REGION_WIRE_SIZE;
    if bytes.len() != expected {
        return Err(Error::ShortTransfer {
            expected,
            actual: bytes.len(),
        });
    }
    let mut regions = Vec::with_capacity(count);
    while let Some(region) = RemoteMemoryRegion::decode_from(&mut bytes) {
        regions.push(region);
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_region() {
        let mut buf = vec![7u8; 16];
        let mut region = LocalMemoryRegion::unregistered(&mut buf);
        assert_eq!(region.len(), 16);
        assert_eq!(region.local_key(), 0);
        assert_eq!(region.remote_key(), 0);
        region.as_mut_slice()[0] = 1;
        assert_eq!(region.as_slice()[..2], [1, 7]);
        drop(region);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_registration_guard_dropped_with_region() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicUsize::new(0));
        let mut buf = [0u8; 8];
        let region = unsafe {
            LocalMemoryRegion::from_raw_parts(
                buf.as_mut_ptr(),
                buf.len(),
                11,
                12,
                AccessFlags::LOCAL_READ,
                Some(Box::new(Guard(released.clone()))),
            )
        };
        let remote = region.to_remote();
        assert_eq!(remote.rkey, 12);
        assert_eq!(remote.length, 8);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(region);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_access_normalized() {
        let flags = AccessFlags::REMOTE_WRITE.normalized();
        assert!(flags.contains(AccessFlags::LOCAL_WRITE));
        assert_eq!(AccessFlags::REMOTE_READ.normalized(), AccessFlags::REMOTE_READ);
    }

    #[test]
    fn test_remote_region_advance_subrange() {
        let mut r = RemoteMemoryRegion::new(0x1000, 5, 100);
        assert!(r.advance(40));
        assert_eq!(r.addr, 0x1028);
        assert_eq!(r.length, 60);
        assert!(!r.advance(61));

        let sub = r.subrange(10, 20).unwrap();
        assert_eq!(sub.addr, 0x1028 + 10);
        assert_eq!(sub.length, 20);
        assert!(r.subrange(50, 20).is_none());
    }

    #[test]
    fn test_region_wire_layout() {
        let r = RemoteMemoryRegion::new(1, 2, 3);
        let bytes = encode_regions(&[r]);
        assert_eq!(bytes.len(), REMOTE_REGION_WIRE_SIZE);
        assert_eq!(bytes[..8], 1u64.to_ne_bytes());
        assert_eq!(bytes[8..16], 2u64.to_ne_bytes());
        assert_eq!(bytes[16..], 3u64.to_ne_bytes());
        assert_eq!(std::mem::size_of::<RemoteMemoryRegion>(), REMOTE_REGION_WIRE_SIZE);
    }

    #[test]
    fn test_decode_preserves_order() {
        let regions: Vec<_> = (0..5)
            .map(|i| RemoteMemoryRegion::new(0x1000 * (i + 1), i, 64 + i))
            .collect();
        let bytes = encode_regions(&regions);
        assert_eq!(decode_regions(&bytes, 5).unwrap(), regions);
        assert!(matches!(
            decode_regions(&bytes, 4),
            Err(Error::ShortTransfer { expected: 96, actual: 120 })
        ));
    }
}
