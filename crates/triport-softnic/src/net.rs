//! The shared state of the emulated network: registration table, listener
//! and endpoint directories, and ephemeral port allocation.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::cm::Listener;
use crate::fabric::EndpointShared;
use crate::mr::{HwAccess, MemoryRegion, MrEntry, MrTable};
use crate::HwError;

const EPHEMERAL_FIRST: u16 = 49152;

pub struct SoftNet {
    memory: RwLock<MrTable>,
    next_key: AtomicU32,
    registrations: AtomicU64,
    next_id: AtomicU64,
    next_port: Mutex<u16>,
    pub(crate) listeners: DashMap<u16, Listener>,
    pub(crate) endpoints: DashMap<u64, Weak<EndpointShared>>,
}

impl SoftNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            memory: RwLock::new(MrTable::new()),
            next_key: AtomicU32::new(1),
            registrations: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            next_port: Mutex::new(EPHEMERAL_FIRST),
            listeners: DashMap::new(),
            endpoints: DashMap::new(),
        })
    }

    /// The process-wide network every default-constructed transport joins.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<SoftNet>> = OnceLock::new();
        SHARED.get_or_init(SoftNet::new).clone()
    }

    /// Registrations performed so far, including ones already released.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Registrations currently alive.
    pub fn live_registrations(&self) -> usize {
        self.memory.read().len()
    }

    /// Allocate an id unique within this net.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `addr..addr + len` in `domain`.
    ///
    /// # Safety
    ///
    /// The range must stay valid until the returned region is dropped.
    pub(crate) unsafe fn register(
        self: &Arc<Self>,
        domain: u64,
        addr: *mut u8,
        len: usize,
        access: HwAccess,
    ) -> Result<MemoryRegion, HwError> {
        if addr.is_null() || len == 0 {
            return Err(HwError::InvalidArgument(format!(
                "cannot register {len} bytes at {addr:p}"
            )));
        }
        if access.contains(HwAccess::REMOTE_WRITE) && !access.contains(HwAccess::LOCAL_WRITE) {
            return Err(HwError::InvalidArgument(
                "remote write requires local write".into(),
            ));
        }
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        if key == 0 {
            return Err(HwError::NoResources("memory keys exhausted".into()));
        }
        let entry = MrEntry {
            domain,
            addr: addr as u64,
            len,
            access,
        };
        self.memory.write().insert(key, entry);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(key, len, ?access, "registered memory");
        Ok(MemoryRegion::new(self.clone(), key, entry))
    }

    pub(crate) fn deregister(&self, key: u32) {
        if self.memory.write().remove(&key).is_none() {
            tracing::warn!(key, "deregistering unknown memory key");
        }
    }

    /// Hold the registration table for the duration of a transfer.
    pub(crate) fn memory(&self) -> RwLockReadGuard<'_, MrTable> {
        self.memory.read_recursive()
    }

    /// Pick an unused ephemeral port.
    pub(crate) fn allocate_port(&self, in_use: impl Fn(u16) -> bool) -> Result<u16, HwError> {
        let mut next = self.next_port.lock();
        for _ in 0..=(u16::MAX - EPHEMERAL_FIRST) {
            let port = *next;
            *next = if port == u16::MAX { EPHEMERAL_FIRST } else { port + 1 };
            if !in_use(port) {
                return Ok(port);
            }
        }
        Err(HwError::NoResources("ephemeral ports exhausted".into()))
    }
}

impl fmt::Debug for SoftNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftNet")
            .field("live_registrations", &self.live_registrations())
            .field("registrations", &self.registration_count())
            .field("listeners", &self.listeners.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}
