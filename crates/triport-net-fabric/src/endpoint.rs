//! The shared reliable-datagram endpoint.
//!
//! The provider's transmit and receive completion queues are endpoint-wide.
//! Every operation is posted with a 64-bit context of
//! `(context_id << 16) | wr_id`; [`FabricEndpoint::progress`] drains both
//! queues and files each completion under its context, where the owning
//! channel, handshake or event loop picks it up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use triport_net::{
    AccessFlags, CompletionError, Deadline, Error, LocalMemoryRegion, QueueLimits, ResourceError,
    Result, WorkCompletion, TAG_CONTROL,
};
use triport_softnic::bridge::{completion_error, hw_access, map_hw_error};
use triport_softnic::{HwError, RdmEndpoint, Signal, SoftNet, WcStatus};
use triport_types::{Address, Provider, RAW_ADDR_LEN};

use crate::config::FabricConfig;

const WR_ID_BITS: u32 = 16;
const WR_ID_MASK: u64 = (1 << WR_ID_BITS) - 1;

/// Completions drained per poll call.
const POLL_BATCH: usize = 64;

pub(crate) fn op_context(context: u64, wr_id: u64) -> u64 {
    (context << WR_ID_BITS) | (wr_id & WR_ID_MASK)
}

fn split_op_context(op: u64) -> (u64, u64) {
    (op >> WR_ID_BITS, op & WR_ID_MASK)
}

/// Whether a failed completion means nobody is bound at the destination.
pub(crate) fn is_unbound_peer(err: &CompletionError) -> bool {
    err.status == WcStatus::RetryExcErr.as_str()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Completions filed under one context, in arrival order per direction.
#[derive(Debug, Default)]
pub struct ContextQueue {
    send: Mutex<VecDeque<WorkCompletion>>,
    recv: Mutex<VecDeque<WorkCompletion>>,
    sends_completed: AtomicU64,
    recvs_completed: AtomicU64,
}

impl ContextQueue {
    fn push(&self, direction: Direction, wc: WorkCompletion) {
        match direction {
            Direction::Send => {
                self.sends_completed.fetch_add(1, Ordering::Relaxed);
                self.send.lock().push_back(wc);
            }
            Direction::Recv => {
                self.recvs_completed.fetch_add(1, Ordering::Relaxed);
                self.recv.lock().push_back(wc);
            }
        }
    }

    pub fn pop_send(&self) -> Option<WorkCompletion> {
        self.send.lock().pop_front()
    }

    pub fn pop_recv(&self) -> Option<WorkCompletion> {
        self.recv.lock().pop_front()
    }

    /// The oldest send completion, else the oldest receive completion.
    pub fn pop_any(&self) -> Option<(Direction, WorkCompletion)> {
        self.pop_send()
            .map(|wc| (Direction::Send, wc))
            .or_else(|| self.pop_recv().map(|wc| (Direction::Recv, wc)))
    }

    /// Completions filed so far as `(send, recv)`, consumed or not.
    pub fn completed(&self) -> (u64, u64) {
        (
            self.sends_completed.load(Ordering::Relaxed),
            self.recvs_completed.load(Ordering::Relaxed),
        )
    }
}

/// One opened reliable-datagram endpoint, shared by every channel on it.
pub struct FabricEndpoint {
    net: Arc<SoftNet>,
    ep: RdmEndpoint,
    config: FabricConfig,
    limits: QueueLimits,
    contexts: DashMap<u64, Arc<ContextQueue>>,
    next_tag: AtomicU64,
    /// Serializes draining so completions of one context stay in order.
    progress_lock: Mutex<()>,
}

impl FabricEndpoint {
    pub fn open(net: Arc<SoftNet>, host: &str, port: u16, config: FabricConfig) -> Result<Arc<Self>> {
        Self::open_with_signal(net, host, port, config, Signal::new())
    }

    /// Open an endpoint whose completions bump `signal`, so one
    /// [`FabricEventLoop`](crate::FabricEventLoop) can serve several endpoints.
    pub fn open_with_signal(
        net: Arc<SoftNet>,
        host: &str,
        port: u16,
        config: FabricConfig,
        signal: Arc<Signal>,
    ) -> Result<Arc<Self>> {
        let addr =
            Address::resolve(host, port, Provider::Fabric).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Self::bind(net, addr, config, signal)
    }

    /// Open an endpoint named by an already resolved address.
    pub fn bind(net: Arc<SoftNet>, addr: Address, config: FabricConfig, signal: Arc<Signal>) -> Result<Arc<Self>> {
        config.validate()?;
        let ep = RdmEndpoint::open_with_signal(&net, addr, config.attr, signal).map_err(|e| map_hw_error(e, "ep"))?;
        let attr = ep.attr();
        let limits = QueueLimits {
            max_send_wr: config.max_send_wr.min(attr.tx_size),
            max_recv_wr: config.max_recv_wr.min(attr.rx_size),
            max_inline_data: attr.inject_size,
            max_msg_iov: config.iov_limit.min(attr.iov_limit),
            max_rma_iov: config.rma_iov_limit.min(attr.rma_iov_limit),
            max_msg_sz: attr.max_msg_size,
        };
        tracing::debug!(address = %ep.address(), ?limits, "opened fabric endpoint");
        Ok(Arc::new(Self {
            net,
            ep,
            config,
            limits,
            contexts: DashMap::new(),
            next_tag: AtomicU64::new(TAG_CONTROL + 1),
            progress_lock: Mutex::new(()),
        }))
    }

    pub fn net(&self) -> &Arc<SoftNet> {
        &self.net
    }

    pub fn address(&self) -> Address {
        self.ep.address()
    }

    pub fn raw_addr(&self) -> [u8; RAW_ADDR_LEN] {
        self.ep.name()
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn signal(&self) -> &Arc<Signal> {
        self.ep.signal()
    }

    /// A fresh correlation tag for a new channel.
    pub fn alloc_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a raw peer name into the address vector.
    pub fn av_insert(&self, raw: &[u8]) -> Result<u64> {
        self.ep.av_insert(raw).map_err(|e| map_hw_error(e, "av"))
    }

    /// Open a completion context. Ids are unique within the net, so loops
    /// serving several endpoints can key handlers by them.
    pub fn register_context(&self) -> (u64, Arc<ContextQueue>) {
        let id = self.net.next_id();
        let queue = Arc::new(ContextQueue::default());
        self.contexts.insert(id, queue.clone());
        (id, queue)
    }

    pub fn deregister_context(&self, id: u64) {
        if let Some((_, queue)) = self.contexts.remove(&id) {
            let (sends, recvs) = queue.completed();
            tracing::trace!(context = id, sends, recvs, "deregistered fabric context");
        }
    }

    pub fn context(&self, id: u64) -> Option<Arc<ContextQueue>> {
        self.contexts.get(&id).map(|q| q.value().clone())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Drain both completion queues into their contexts. Returns the number
    /// of completions filed.
    pub fn progress(&self) -> usize {
        let _guard = self.progress_lock.lock();
        let mut filed = 0;
        for (direction, cq) in [(Direction::Send, self.ep.tx_cq()), (Direction::Recv, self.ep.rx_cq())] {
            loop {
                let batch = cq.poll(POLL_BATCH);
                if batch.is_empty() {
                    break;
                }
                for wc in batch {
                    let (context, wr_id) = split_op_context(wc.wr_id);
                    let converted = WorkCompletion {
                        wr_id,
                        byte_len: wc.byte_len,
                        error: (!wc.status.is_success())
                            .then(|| completion_error(wc.status, format!("context {context} work request {wr_id}"))),
                    };
                    match self.contexts.get(&context) {
                        Some(queue) => {
                            queue.push(direction, converted);
                            filed += 1;
                        }
                        None => tracing::debug!(context, wr_id, ?direction, "completion for closed context"),
                    }
                }
            }
        }
        filed
    }

    /// Post through `post`, progressing completions while the provider
    /// answers `Again`. Gives up with `TimedOut` after the completion timeout.
    pub(crate) fn post_with_retry(
        &self,
        queue: &'static str,
        mut post: impl FnMut(&RdmEndpoint) -> std::result::Result<(), HwError>,
    ) -> Result<()> {
        let deadline = Deadline::after(self.config.completion_timeout());
        loop {
            match post(&self.ep) {
                Err(HwError::Again) => {
                    self.progress();
                    if deadline.expired() {
                        tracing::warn!(queue, "fabric post kept returning again");
                        return Err(Error::TimedOut);
                    }
                    std::thread::yield_now();
                }
                other => return other.map_err(|e| map_hw_error(e, queue)),
            }
        }
    }

    /// Progress completions until `ready` yields, sleeping on the signal
    /// between attempts.
    pub(crate) fn wait_until<T>(&self, deadline: &Deadline, mut ready: impl FnMut() -> Option<T>) -> Result<T> {
        loop {
            let seen = self.signal().generation();
            self.progress();
            if let Some(value) = ready() {
                return Ok(value);
            }
            if deadline.expired() {
                return Err(Error::TimedOut);
            }
            self.signal().wait_past(seen, deadline.remaining());
        }
    }

    /// Register memory with this endpoint's domain.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid until the region is dropped.
    pub unsafe fn register_raw(&self, addr: *mut u8, len: usize, access: AccessFlags) -> Result<LocalMemoryRegion<'static>> {
        let access = access.normalized();
        let mr = self
            .ep
            .mr_reg(addr, len, hw_access(access))
            .map_err(|e| ResourceError::Registration {
                length: len,
                reason: e.to_string(),
            })?;
        tracing::debug!(addr = format_args!("{:#x}", mr.addr()), len, "registered fabric memory");
        let (lkey, rkey) = (u64::from(mr.lkey()), u64::from(mr.rkey()));
        Ok(LocalMemoryRegion::from_raw_parts(addr, len, lkey, rkey, access, Some(Box::new(mr))))
    }
}

impl fmt::Debug for FabricEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricEndpoint")
            .field("address", &self.address())
            .field("limits", &self.limits)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
