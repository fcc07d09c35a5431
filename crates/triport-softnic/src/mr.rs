//! Memory registration and the key-checked copies that stand in for DMA.

use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::sync::Arc;

use bitflags::bitflags;

use crate::cq::WcStatus;
use crate::net::SoftNet;

bitflags! {
    /// Hardware access bits of a memory registration. Local read is implied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HwAccess: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

/// A scatter-gather element as the hardware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
}

impl Sge {
    pub fn new(addr: u64, length: usize, lkey: u32) -> Self {
        Self { addr, length, lkey }
    }
}

pub(crate) fn total_length(sges: &[Sge]) -> usize {
    sges.iter().map(|s| s.length).sum()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MrEntry {
    pub domain: u64,
    pub addr: u64,
    pub len: usize,
    pub access: HwAccess,
}

impl MrEntry {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.addr && end <= self.addr + self.len as u64
    }
}

pub(crate) type MrTable = HashMap<u32, MrEntry>;

/// A live registration. Dropping it removes the key from the table.
pub struct MemoryRegion {
    net: Arc<SoftNet>,
    key: u32,
    addr: u64,
    len: usize,
    access: HwAccess,
}

impl MemoryRegion {
    pub(crate) fn new(net: Arc<SoftNet>, key: u32, entry: MrEntry) -> Self {
        Self {
            net,
            key,
            addr: entry.addr,
            len: entry.len,
            access: entry.access,
        }
    }

    pub fn lkey(&self) -> u32 {
        self.key
    }

    pub fn rkey(&self) -> u32 {
        self.key
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> HwAccess {
        self.access
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.net.deregister(self.key);
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &self.key)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}

fn local_entry(table: &MrTable, domain: u64, sge: &Sge, need: HwAccess) -> Result<(), WcStatus> {
    let entry = table.get(&sge.lkey).ok_or(WcStatus::LocProtErr)?;
    if entry.domain != domain || !entry.covers(sge.addr, sge.length) || !entry.access.contains(need) {
        return Err(WcStatus::LocProtErr);
    }
    Ok(())
}

fn remote_entry(table: &MrTable, rkey: u32, addr: u64, len: usize, need: HwAccess) -> Result<(), WcStatus> {
    let entry = table.get(&rkey).ok_or(WcStatus::RemAccessErr)?;
    if !entry.covers(addr, len) || !entry.access.contains(need) {
        return Err(WcStatus::RemAccessErr);
    }
    Ok(())
}

/// Copy the bytes behind `sges` after checking every local key.
pub(crate) fn gather(table: &MrTable, domain: u64, sges: &[Sge]) -> Result<Vec<u8>, WcStatus> {
    let mut out = Vec::with_capacity(total_length(sges));
    for sge in sges.iter().filter(|s| s.length > 0) {
        local_entry(table, domain, sge, HwAccess::empty())?;
        // SAFETY: the range lies inside a live registration, whose owner
        // guaranteed validity at registration time.
        out.extend_from_slice(unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.length) });
    }
    Ok(out)
}

/// Copy the bytes behind `sges` without key checks, as inline sends do.
///
/// # Safety
///
/// Every element must describe readable memory.
pub(crate) unsafe fn gather_inline(sges: &[Sge]) -> Vec<u8> {
    let mut out = Vec::with_capacity(total_length(sges));
    for sge in sges.iter().filter(|s| s.length > 0) {
        out.extend_from_slice(std::slice::from_raw_parts(sge.addr as *const u8, sge.length));
    }
    out
}

/// Spread `data` over `sges`. Fails with a length error when it does not fit.
pub(crate) fn scatter(table: &MrTable, domain: u64, sges: &[Sge], data: &[u8]) -> Result<(), WcStatus> {
    if data.len() > total_length(sges) {
        return Err(WcStatus::LocLenErr);
    }
    let mut offset = 0;
    for sge in sges {
        if offset == data.len() {
            break;
        }
        let len = sge.length.min(data.len() - offset);
        if len == 0 {
            continue;
        }
        local_entry(table, domain, sge, HwAccess::LOCAL_WRITE)?;
        // SAFETY: as in `gather`; the registration grants local write.
        unsafe { ptr::copy(data[offset..].as_ptr(), sge.addr as *mut u8, len) };
        offset += len;
    }
    Ok(())
}

pub(crate) fn remote_write(table: &MrTable, rkey: u32, addr: u64, data: &[u8]) -> Result<(), WcStatus> {
    if data.is_empty() {
        return Ok(());
    }
    remote_entry(table, rkey, addr, data.len(), HwAccess::REMOTE_WRITE)?;
    // SAFETY: the target range lies inside a registration granting remote write.
    unsafe { ptr::copy(data.as_ptr(), addr as *mut u8, data.len()) };
    Ok(())
}

pub(crate) fn remote_read(table: &MrTable, rkey: u32, addr: u64, len: usize) -> Result<Vec<u8>, WcStatus> {
    if len == 0 {
        return Ok(Vec::new());
    }
    remote_entry(table, rkey, addr, len, HwAccess::REMOTE_READ)?;
    // SAFETY: the source range lies inside a registration granting remote read.
    Ok(unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec())
}
