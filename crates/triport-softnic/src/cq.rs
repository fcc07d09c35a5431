//! Completion queues and the wake-up signal shared between them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Work completion status, mirroring the hardware status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocProtErr,
    RemAccessErr,
    RemInvReqErr,
    WrFlushErr,
    RetryExcErr,
}

impl WcStatus {
    pub fn is_success(&self) -> bool {
        *self == WcStatus::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::RemAccessErr => "remote access error",
            WcStatus::RemInvReqErr => "remote invalid request error",
            WcStatus::WrFlushErr => "work request flushed error",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
        }
    }

    /// Vendor syndrome reported next to the status.
    pub fn vendor_err(&self) -> u32 {
        match self {
            WcStatus::Success => 0,
            WcStatus::LocLenErr => 0x01,
            WcStatus::LocProtErr => 0x04,
            WcStatus::RemAccessErr => 0x13,
            WcStatus::RemInvReqErr => 0x12,
            WcStatus::WrFlushErr => 0xf9,
            WcStatus::RetryExcErr => 0x15,
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaWrite,
    RdmaRead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: usize,
    /// Source endpoint name for tagged receives, 0 otherwise.
    pub src_addr: u64,
    pub tag: u64,
}

impl WorkCompletion {
    pub fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: usize) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            src_addr: 0,
            tag: 0,
        }
    }
}

/// A generation counter with a condition variable. Completion queues bump
/// it on every push so a waiter can sleep until something new arrives.
#[derive(Default)]
pub struct Signal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Sleep until the generation moves past `seen`. Returns `false` on timeout.
    pub fn wait_past(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut generation = self.generation.lock();
        while *generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return *generation != seen;
                    }
                }
                None => self.cond.wait(&mut generation),
            }
        }
        true
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("generation", &self.generation()).finish()
    }
}

pub struct CompletionQueue {
    entries: Mutex<VecDeque<WorkCompletion>>,
    capacity: usize,
    signal: Option<Arc<Signal>>,
}

impl CompletionQueue {
    pub fn new(capacity: usize, signal: Option<Arc<Signal>>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            signal,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(crate) fn push(&self, wc: WorkCompletion) {
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                tracing::warn!(capacity = self.capacity, "completion queue overrun");
            }
            entries.push_back(wc);
        }
        if let Some(signal) = &self.signal {
            signal.notify();
        }
    }

    /// Take up to `max` completions in arrival order.
    pub fn poll(&self, max: usize) -> Vec<WorkCompletion> {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    pub fn poll_one(&self) -> Option<WorkCompletion> {
        self.entries.lock().pop_front()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
