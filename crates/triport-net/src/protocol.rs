//! The eager/rendezvous transfer protocol for queue-based substrates.
//!
//! A transfer of `total` bytes is cut into a header, the first
//! `min(total, eager_threshold)` bytes of the logical byte stream, and a body
//! holding the rest. The header always travels through pre-registered eager
//! buffers, so small transfers never register the caller's memory. The body
//! is cut into canonical `chunk_size` pieces along the byte stream, so both
//! peers post work requests with identical boundaries however each side
//! segments its memory. A piece that needs more scatter-gather entries than the
//! hardware allows goes through a pre-registered staging buffer.
//!
//! Receive completions are consumed strictly in posting order. Two receive
//! eager buffers alternate: a fresh eager receive is posted on the idle buffer
//! before the filled one is copied out, so a header is never missed and never
//! overwritten.

use std::collections::VecDeque;
use std::ptr;
use std::time::{Duration, Instant};

use crate::chunk::{slice_segments, split_segments, total_length, Segment};
use crate::channel::check_rma_lengths;
use crate::eager::EagerBuffer;
use crate::error::{CompletionError, Error, ResourceError, Result};
use crate::memory::{AccessFlags, LocalMemoryRegion, RemoteMemoryRegion};

/// Per-queue posting limits derived from the hardware at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_send_wr: usize,
    pub max_recv_wr: usize,
    pub max_inline_data: usize,
    /// Scatter-gather entries per message.
    pub max_msg_iov: usize,
    /// Scatter-gather entries per one-sided operation.
    pub max_rma_iov: usize,
    /// Bytes per work request.
    pub max_msg_sz: usize,
}

/// One polled completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub byte_len: usize,
    /// Set when the hardware reported a non-success status.
    pub error: Option<CompletionError>,
}

impl WorkCompletion {
    pub fn success(wr_id: u64, byte_len: usize) -> Self {
        Self {
            wr_id,
            byte_len,
            error: None,
        }
    }
}

/// The posting and polling primitives a substrate provides for one connection.
pub trait WorkQueue: Send {
    fn limits(&self) -> QueueLimits;

    /// Register memory with this queue's protection domain.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid until the returned region is dropped.
    unsafe fn register_raw(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<LocalMemoryRegion<'static>>;

    fn post_send(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()>;

    fn post_recv(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()>;

    fn post_write(&mut self, wr_id: u64, sges: &[Segment], remote_addr: u64, rkey: u64) -> Result<()>;

    fn post_read(&mut self, wr_id: u64, sges: &[Segment], remote_addr: u64, rkey: u64) -> Result<()>;

    /// Take at most one send-queue completion without blocking.
    fn poll_send(&mut self) -> Result<Option<WorkCompletion>>;

    /// Take at most one receive-queue completion without blocking.
    fn poll_recv(&mut self) -> Result<Option<WorkCompletion>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub eager_threshold: usize,
    pub chunk_size: usize,
    /// Upper bound on one busy-poll wait; `None` polls forever.
    pub completion_timeout: Option<Duration>,
}

const WR_SEND_HEADER: u64 = 1;
const WR_SEND_BODY: u64 = 2;
const WR_SEND_STAGED: u64 = 3;
const WR_RMA: u64 = 4;
const WR_RECV_EAGER: [u64; 2] = [16, 17];
const WR_RECV_BODY: u64 = 18;
const WR_RECV_STAGED: u64 = 19;

#[derive(Debug)]
enum RecvExpect {
    Eager(usize),
    Body(usize),
    Staged { len: usize, targets: Vec<Segment> },
}

impl RecvExpect {
    fn wr_id(&self) -> u64 {
        match self {
            RecvExpect::Eager(slot) => WR_RECV_EAGER[*slot],
            RecvExpect::Body(_) => WR_RECV_BODY,
            RecvExpect::Staged { .. } => WR_RECV_STAGED,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Send,
    Recv,
}

/// One connection's protocol state on top of a [`WorkQueue`].
pub struct Protocol<Q: WorkQueue> {
    send_eager: EagerBuffer,
    recv_eager: [EagerBuffer; 2],
    send_staging: EagerBuffer,
    recv_staging: EagerBuffer,
    /// Eager slot whose receive is currently posted.
    current: usize,
    eager_len: [Option<usize>; 2],
    expected: VecDeque<RecvExpect>,
    num_send_wr: usize,
    num_recv_wr: usize,
    send_staging_busy: bool,
    recv_staging_busy: bool,
    limits: QueueLimits,
    config: ProtocolConfig,
    queue: Q,
}

impl<Q: WorkQueue> Protocol<Q> {
    /// Register the eager and staging buffers and post the first eager receive.
    pub fn new(queue: Q, config: ProtocolConfig) -> Result<Self> {
        let limits = queue.limits();
        if config.eager_threshold == 0 || config.eager_threshold > limits.max_msg_sz {
            return Err(Error::InvalidArgument(format!(
                "eager threshold {} outside 1..={}",
                config.eager_threshold, limits.max_msg_sz
            )));
        }
        if config.chunk_size == 0 || config.chunk_size > limits.max_msg_sz {
            return Err(Error::InvalidArgument(format!(
                "chunk size {} outside 1..={}",
                config.chunk_size, limits.max_msg_sz
            )));
        }
        if limits.max_send_wr == 0 || limits.max_recv_wr < 2 || limits.max_msg_iov == 0 {
            return Err(Error::InvalidArgument(format!(
                "queue limits too small: {limits:?}"
            )));
        }

        let register = |access: AccessFlags| {
            let queue = &queue;
            // SAFETY: eager buffers own their allocation and drop the region first.
            move |addr: *mut u8, len: usize| unsafe { queue.register_raw(addr, len, access) }
        };
        let send_eager = EagerBuffer::new(config.eager_threshold, register(AccessFlags::LOCAL_READ))?;
        let recv_eager = [
            EagerBuffer::new(config.eager_threshold, register(AccessFlags::LOCAL_WRITE))?,
            EagerBuffer::new(config.eager_threshold, register(AccessFlags::LOCAL_WRITE))?,
        ];
        let send_staging = EagerBuffer::new(config.chunk_size, register(AccessFlags::LOCAL_READ))?;
        let recv_staging = EagerBuffer::new(config.chunk_size, register(AccessFlags::LOCAL_WRITE))?;

        let mut protocol = Self {
            send_eager,
            recv_eager,
            send_staging,
            recv_staging,
            current: 0,
            eager_len: [None, None],
            expected: VecDeque::new(),
            num_send_wr: 0,
            num_recv_wr: 0,
            send_staging_busy: false,
            recv_staging_busy: false,
            limits,
            config,
            queue,
        };
        protocol.post_eager_recv(0)?;
        Ok(protocol)
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn eager_threshold(&self) -> usize {
        self.config.eager_threshold
    }

    /// Outstanding `(send, recv)` work requests.
    pub fn outstanding(&self) -> (usize, usize) {
        (self.num_send_wr, self.num_recv_wr)
    }

    pub fn register<'a>(&self, buf: &'a mut [u8], access: AccessFlags) -> Result<LocalMemoryRegion<'a>> {
        if buf.is_empty() {
            return Err(ResourceError::Registration {
                length: 0,
                reason: "empty buffer".into(),
            }
            .into());
        }
        // SAFETY: the region borrows `buf` for 'a.
        unsafe { self.queue.register_raw(buf.as_mut_ptr(), buf.len(), access.normalized()) }
    }

    /// Send a raw buffer, registering it only when it exceeds the eager threshold.
    pub fn send_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() <= self.config.eager_threshold {
            // The eager path copies out of `buf`; the key is never used.
            return self.send_segments(&[Segment::new(buf.as_ptr() as u64, buf.len(), 0)]);
        }
        // SAFETY: `region` is dropped before `buf`'s borrow ends; it is only read.
        let region = unsafe {
            self.queue
                .register_raw(buf.as_ptr() as *mut u8, buf.len(), AccessFlags::LOCAL_READ)?
        };
        tracing::trace!(len = buf.len(), "registered rendezvous send buffer");
        self.send_segments(&[region.segment()])
    }

    pub fn recv_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() <= self.config.eager_threshold {
            return self.recv_segments(&[Segment::new(buf.as_mut_ptr() as u64, buf.len(), 0)]);
        }
        let region = self.register(buf, AccessFlags::LOCAL_WRITE)?;
        tracing::trace!(len = region.len(), "registered rendezvous recv buffer");
        self.recv_segments(&[region.segment()])
    }

    /// Send the logical concatenation of `segments` as one message.
    pub fn send_segments(&mut self, segments: &[Segment]) -> Result<usize> {
        let total = total_length(segments);
        let header_len = total.min(self.config.eager_threshold);

        // SAFETY: segments describe caller memory valid for this call.
        unsafe {
            gather(
                &slice_segments(segments, 0, header_len),
                self.send_eager.bytes_mut(header_len),
            )
        };
        let header = self.send_eager.segment(header_len);
        self.post_send_wr(WR_SEND_HEADER, &[header])?;

        if total > header_len {
            let body = slice_segments(segments, header_len, total - header_len);
            for chunk in split_segments(&body, usize::MAX, self.config.chunk_size) {
                if chunk.segments.len() <= self.limits.max_msg_iov {
                    self.post_send_wr(WR_SEND_BODY, &chunk.segments)?;
                    continue;
                }
                while self.send_staging_busy {
                    self.reap_send()?;
                }
                // SAFETY: as above.
                unsafe { gather(&chunk.segments, self.send_staging.bytes_mut(chunk.length)) };
                let staged = self.send_staging.segment(chunk.length);
                self.post_send_wr(WR_SEND_STAGED, &[staged])?;
                self.send_staging_busy = true;
            }
        }

        self.drain_sends()?;
        Ok(total)
    }

    /// Receive one message scattered across `segments`.
    pub fn recv_segments(&mut self, segments: &[Segment]) -> Result<usize> {
        let total = total_length(segments);
        let header_len = total.min(self.config.eager_threshold);

        if total > header_len {
            let body = slice_segments(segments, header_len, total - header_len);
            for chunk in split_segments(&body, usize::MAX, self.config.chunk_size) {
                if chunk.segments.len() <= self.limits.max_msg_iov {
                    self.post_recv_wr(RecvExpect::Body(chunk.length), &chunk.segments)?;
                    continue;
                }
                while self.recv_staging_busy {
                    self.reap_recv()?;
                }
                let staged = self.recv_staging.segment(chunk.length);
                self.post_recv_wr(
                    RecvExpect::Staged {
                        len: chunk.length,
                        targets: chunk.segments,
                    },
                    &[staged],
                )?;
                self.recv_staging_busy = true;
            }
        }

        let filled = self.current;
        let fresh = 1 - filled;
        self.post_eager_recv(fresh)?;
        while self.num_recv_wr > 1 {
            self.reap_recv()?;
        }
        self.current = fresh;

        let got = self.eager_len[filled].take().ok_or_else(|| {
            Error::from(CompletionError {
                status: "missing header completion".into(),
                vendor_err: 0,
                message: format!("eager slot {filled} drained without completing"),
            })
        })?;
        if got != header_len {
            return Err(Error::ShortTransfer {
                expected: header_len,
                actual: got,
            });
        }
        // SAFETY: segments describe caller memory valid for this call.
        unsafe {
            scatter(
                self.recv_eager[filled].bytes(header_len),
                &slice_segments(segments, 0, header_len),
            )
        };
        Ok(total)
    }

    /// One-sided gather of `segments` into the contiguous `remote` range.
    pub fn write_segments(&mut self, segments: &[Segment], remote: &RemoteMemoryRegion) -> Result<usize> {
        self.rma(segments, remote, true)
    }

    /// One-sided scatter of the contiguous `remote` range into `segments`.
    pub fn read_segments(&mut self, segments: &[Segment], remote: &RemoteMemoryRegion) -> Result<usize> {
        self.rma(segments, remote, false)
    }

    fn rma(&mut self, segments: &[Segment], remote: &RemoteMemoryRegion, write: bool) -> Result<usize> {
        let total = total_length(segments);
        check_rma_lengths(total, remote)?;
        let chunks = split_segments(segments, self.limits.max_rma_iov, self.limits.max_msg_sz);
        tracing::trace!(total, chunks = chunks.len(), write, "posting one-sided transfer");
        for chunk in chunks {
            while self.num_send_wr >= self.limits.max_send_wr {
                self.reap_send()?;
            }
            let remote_addr = remote.addr + chunk.offset;
            if write {
                self.queue.post_write(WR_RMA, &chunk.segments, remote_addr, remote.rkey)?;
            } else {
                self.queue.post_read(WR_RMA, &chunk.segments, remote_addr, remote.rkey)?;
            }
            self.num_send_wr += 1;
        }
        self.drain_sends()?;
        Ok(total)
    }

    fn post_eager_recv(&mut self, slot: usize) -> Result<()> {
        let seg = self.recv_eager[slot].segment(self.config.eager_threshold);
        self.eager_len[slot] = None;
        self.post_recv_wr(RecvExpect::Eager(slot), &[seg])
    }

    fn post_send_wr(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
        while self.num_send_wr >= self.limits.max_send_wr {
            self.reap_send()?;
        }
        self.queue.post_send(wr_id, sges)?;
        self.num_send_wr += 1;
        Ok(())
    }

    fn post_recv_wr(&mut self, expect: RecvExpect, sges: &[Segment]) -> Result<()> {
        while self.num_recv_wr >= self.limits.max_recv_wr {
            self.reap_recv()?;
        }
        self.queue.post_recv(expect.wr_id(), sges)?;
        self.num_recv_wr += 1;
        self.expected.push_back(expect);
        Ok(())
    }

    fn drain_sends(&mut self) -> Result<()> {
        while self.num_send_wr > 0 {
            self.reap_send()?;
        }
        Ok(())
    }

    fn reap_send(&mut self) -> Result<()> {
        let wc = self.wait_completion(Side::Send)?;
        self.num_send_wr -= 1;
        if wc.wr_id == WR_SEND_STAGED {
            self.send_staging_busy = false;
        }
        if let Some(err) = wc.error {
            tracing::error!(wr_id = wc.wr_id, status = %err.status, "send completion failed");
            return Err(err.into());
        }
        Ok(())
    }

    fn reap_recv(&mut self) -> Result<()> {
        let wc = self.wait_completion(Side::Recv)?;
        self.num_recv_wr -= 1;
        let expect = self.expected.pop_front();
        if let Some(err) = wc.error {
            tracing::error!(wr_id = wc.wr_id, status = %err.status, "recv completion failed");
            return Err(err.into());
        }
        let expect = match expect {
            Some(expect) if expect.wr_id() == wc.wr_id => expect,
            other => {
                return Err(CompletionError {
                    status: "out-of-order completion".into(),
                    vendor_err: 0,
                    message: format!("got wr_id {} while expecting {:?}", wc.wr_id, other),
                }
                .into())
            }
        };
        match expect {
            RecvExpect::Eager(slot) => self.eager_len[slot] = Some(wc.byte_len),
            RecvExpect::Body(len) => {
                if wc.byte_len != len {
                    return Err(Error::ShortTransfer {
                        expected: len,
                        actual: wc.byte_len,
                    });
                }
            }
            RecvExpect::Staged { len, targets } => {
                self.recv_staging_busy = false;
                if wc.byte_len != len {
                    return Err(Error::ShortTransfer {
                        expected: len,
                        actual: wc.byte_len,
                    });
                }
                // SAFETY: targets describe caller memory valid for this call.
                unsafe { scatter(self.recv_staging.bytes(len), &targets) };
            }
        }
        Ok(())
    }

    /// Busy-poll one queue until a completion shows up.
    fn wait_completion(&mut self, side: Side) -> Result<WorkCompletion> {
        let deadline = self.config.completion_timeout.map(|t| Instant::now() + t);
        let mut spins = 0u32;
        loop {
            let polled = match side {
                Side::Send => self.queue.poll_send()?,
                Side::Recv => self.queue.poll_recv()?,
            };
            if let Some(wc) = polled {
                return Ok(wc);
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                tracing::warn!(?side, "completion wait timed out");
                return Err(Error::TimedOut);
            }
            spins = spins.wrapping_add(1);
            if spins % 16 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Copy the bytes described by `segments` into `dst`.
///
/// # Safety
///
/// Every segment must describe readable memory.
unsafe fn gather(segments: &[Segment], dst: &mut [u8]) {
    let mut offset = 0;
    for seg in segments {
        let len = seg.length.min(dst.len() - offset);
        ptr::copy(seg.addr as *const u8, dst.as_mut_ptr().add(offset), len);
        offset += len;
    }
}

/// Copy `src` into the memory described by `segments`.
///
/// # Safety
///
/// Every segment must describe writable memory.
unsafe fn scatter(src: &[u8], segments: &[Segment]) {
    let mut offset = 0;
    for seg in segments {
        let len = seg.length.min(src.len() - offset);
        ptr::copy(src.as_ptr().add(offset), seg.addr as *mut u8, len);
        offset += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// A loopback pair of in-memory queues: sends on one side land in the
    /// other side's posted receives, in order.
    #[derive(Default)]
    struct Wire {
        to_a: Mutex<VecDeque<Vec<u8>>>,
        to_b: Mutex<VecDeque<Vec<u8>>>,
        registrations: AtomicU64,
    }

    struct LoopQueue {
        wire: Arc<Wire>,
        is_a: bool,
        limits: QueueLimits,
        posted: VecDeque<(u64, Vec<Segment>)>,
        send_done: VecDeque<WorkCompletion>,
        max_posted_sges: usize,
    }

    impl LoopQueue {
        fn pair(limits: QueueLimits) -> (LoopQueue, LoopQueue, Arc<Wire>) {
            let wire = Arc::new(Wire::default());
            let make = |is_a| LoopQueue {
                wire: wire.clone(),
                is_a,
                limits,
                posted: VecDeque::new(),
                send_done: VecDeque::new(),
                max_posted_sges: 0,
            };
            (make(true), make(false), wire)
        }

        fn outbound(&self) -> &Mutex<VecDeque<Vec<u8>>> {
            if self.is_a {
                &self.wire.to_b
            } else {
                &self.wire.to_a
            }
        }

        fn inbound(&self) -> &Mutex<VecDeque<Vec<u8>>> {
            if self.is_a {
                &self.wire.to_a
            } else {
                &self.wire.to_b
            }
        }
    }

    impl WorkQueue for LoopQueue {
        fn limits(&self) -> QueueLimits {
            self.limits
        }

        unsafe fn register_raw(
            &self,
            addr: *mut u8,
            len: usize,
            access: AccessFlags,
        ) -> Result<LocalMemoryRegion<'static>> {
            let key = self.wire.registrations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(LocalMemoryRegion::from_raw_parts(addr, len, key, key, access, None))
        }

        fn post_send(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
            assert!(sges.len() <= self.limits.max_msg_iov);
            self.max_posted_sges = self.max_posted_sges.max(sges.len());
            let mut data = vec![0u8; total_length(sges)];
            unsafe { gather(sges, &mut data) };
            self.outbound().lock().push_back(data);
            self.send_done.push_back(WorkCompletion::success(wr_id, 0));
            Ok(())
        }

        fn post_recv(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
            assert!(sges.len() <= self.limits.max_msg_iov);
            self.posted.push_back((wr_id, sges.to_vec()));
            Ok(())
        }

        fn post_write(&mut self, _: u64, _: &[Segment], _: u64, _: u64) -> Result<()> {
            Err(Error::Unsupported("loopback write"))
        }

        fn post_read(&mut self, _: u64, _: &[Segment], _: u64, _: u64) -> Result<()> {
            Err(Error::Unsupported("loopback read"))
        }

        fn poll_send(&mut self) -> Result<Option<WorkCompletion>> {
            Ok(self.send_done.pop_front())
        }

        fn poll_recv(&mut self) -> Result<Option<WorkCompletion>> {
            if self.posted.is_empty() {
                return Ok(None);
            }
            let Some(data) = self.inbound().lock().pop_front() else {
                return Ok(None);
            };
            let (wr_id, sges) = self.posted.pop_front().unwrap();
            if data.len() > total_length(&sges) {
                return Ok(Some(WorkCompletion {
                    wr_id,
                    byte_len: data.len(),
                    error: Some(CompletionError {
                        status: "local length error".into(),
                        vendor_err: 0,
                        message: String::new(),
                    }),
                }));
            }
            unsafe { scatter(&data, &sges) };
            Ok(Some(WorkCompletion::success(wr_id, data.len())))
        }
    }

    fn limits() -> QueueLimits {
        QueueLimits {
            max_send_wr: 4,
            max_recv_wr: 4,
            max_inline_data: 0,
            max_msg_iov: 3,
            max_rma_iov: 3,
            max_msg_sz: 1 << 20,
        }
    }

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            eager_threshold: 32,
            chunk_size: 64,
            completion_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn pair() -> (Protocol<LoopQueue>, Protocol<LoopQueue>, Arc<Wire>) {
        let (a, b, wire) = LoopQueue::pair(limits());
        (
            Protocol::new(a, config()).unwrap(),
            Protocol::new(b, config()).unwrap(),
            wire,
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn segments_of(buf: &mut [u8], sizes: &[usize]) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut offset = 0;
        for &size in sizes {
            out.push(Segment::new(buf[offset..].as_mut_ptr() as u64, size, 0));
            offset += size;
        }
        assert_eq!(offset, buf.len());
        out
    }

    // The loopback delivers a message as soon as the peer posts, so both
    // sides of a transfer run on one thread: send first, then receive.

    #[test]
    fn test_eager_roundtrip_without_registration() {
        let (mut a, mut b, wire) = pair();
        let before = wire.registrations.load(Ordering::SeqCst);
        for len in [0, 1, 31, 32] {
            let data = pattern(len);
            assert_eq!(a.send_bytes(&data).unwrap(), len);
            let mut out = vec![0u8; len];
            assert_eq!(b.recv_bytes(&mut out).unwrap(), len);
            assert_eq!(out, data);
        }
        assert_eq!(wire.registrations.load(Ordering::SeqCst), before);
        assert_eq!(a.outstanding(), (0, 1));
        assert_eq!(b.outstanding(), (0, 1));
    }

    #[test]
    fn test_rendezvous_registers_once_per_side() {
        let (mut a, mut b, wire) = pair();
        let before = wire.registrations.load(Ordering::SeqCst);
        let data = pattern(33);
        a.send_bytes(&data).unwrap();
        let mut out = vec![0u8; 33];
        b.recv_bytes(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(wire.registrations.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn test_large_transfer_with_backpressure() {
        let (mut a, mut b, _wire) = pair();
        // 32 header + 10 body chunks; the queues only hold 4.
        let data = pattern(32 + 64 * 10);
        let mut send_buf = data.clone();
        let send_segs = segments_of(&mut send_buf, &[data.len()]);
        // The sender drains as it goes, so the receiver can post afterwards.
        a.send_segments(&send_segs).unwrap();
        let mut out = vec![0u8; data.len()];
        let recv_segs = segments_of(&mut out, &[data.len()]);
        b.recv_segments(&recv_segs).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_scatter_gather_equivalence_beyond_iov_limit() {
        let (mut a, mut b, _wire) = pair();
        let data = pattern(300);

        // Sender: 30 segments of 10 bytes, far beyond max_msg_iov = 3.
        let mut send_buf = data.clone();
        let send_segs = segments_of(&mut send_buf, &[10; 30]);
        a.send_segments(&send_segs).unwrap();
        assert!(a.queue().max_posted_sges <= 3);

        // Receiver: one contiguous buffer.
        let mut out = vec![0u8; 300];
        let recv_segs = segments_of(&mut out, &[300]);
        b.recv_segments(&recv_segs).unwrap();
        assert_eq!(out, data);

        // And the reverse direction with an uneven split.
        let mut send_buf = data.clone();
        let send_segs = segments_of(&mut send_buf, &[300]);
        b.send_segments(&send_segs).unwrap();
        let mut out = vec![0u8; 300];
        let recv_segs = segments_of(&mut out, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 245]);
        a.recv_segments(&recv_segs).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_short_message_reported() {
        let (mut a, mut b, _wire) = pair();
        a.send_bytes(&pattern(8)).unwrap();
        let mut out = vec![0u8; 16];
        let err = b.recv_bytes(&mut out).unwrap_err();
        assert!(matches!(err, Error::ShortTransfer { expected: 16, actual: 8 }));
    }

    #[test]
    fn test_recv_times_out_without_sender() {
        let (_a, b, _wire) = pair();
        let mut b = b;
        b.config.completion_timeout = Some(Duration::from_millis(20));
        let mut out = [0u8; 4];
        assert!(matches!(b.recv_bytes(&mut out), Err(Error::TimedOut)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (a, _, _) = LoopQueue::pair(limits());
        let bad = ProtocolConfig {
            chunk_size: 0,
            ..config()
        };
        assert!(matches!(
            Protocol::new(a, bad),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_registration_rejected() {
        let (a, _, _) = pair();
        let mut empty: [u8; 0] = [];
        assert!(matches!(
            a.register(&mut empty, AccessFlags::LOCAL_READ),
            Err(Error::Resource(_))
        ));
    }
}
