//! A connected stream socket exposed as a [`Channel`].
//!
//! Blocking transfers loop over `write`/`read` until the full length has
//! moved. Non-blocking transfers are queued in a [`PendingIo`] shared with a
//! [`ChannelHandler`], which the [`SocketEventLoop`] drives on readiness.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use triport_net::{
    completion_pair, AccessFlags, Channel, Completer, CompletionToken, ConnectionError, Disposition, Error,
    EventHandler, EventLoop, HandlerId, LocalMemoryRegion, Readiness, RemoteMemoryRegion, Result,
};

use crate::event_loop::SocketEventLoop;

/// Most buffers handed to one `writev`/`readv` call.
const IOV_MAX: usize = 1024;

// ---------------------------------------------------------------------------
// Vectored I/O over a list of buffers
// ---------------------------------------------------------------------------

/// Position within a list of buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    index: usize,
    offset: usize,
}

impl Cursor {
    fn skip_filled(&mut self, lens: &[usize]) {
        while self.index < lens.len() && self.offset == lens[self.index] {
            self.index += 1;
            self.offset = 0;
        }
    }

    fn advance(&mut self, lens: &[usize], mut n: usize) {
        self.skip_filled(lens);
        while n > 0 && self.index < lens.len() {
            let step = (lens[self.index] - self.offset).min(n);
            self.offset += step;
            n -= step;
            self.skip_filled(lens);
        }
    }

    fn is_done(&self, lens: &[usize]) -> bool {
        let mut probe = *self;
        probe.skip_filled(lens);
        probe.index >= lens.len()
    }
}

fn write_some(stream: &TcpStream, bufs: &[&[u8]], cursor: &mut Cursor) -> io::Result<usize> {
    let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
    cursor.skip_filled(&lens);
    let slices: Vec<IoSlice<'_>> = bufs[cursor.index..]
        .iter()
        .take(IOV_MAX)
        .enumerate()
        .map(|(i, b)| IoSlice::new(if i == 0 { &b[cursor.offset..] } else { b }))
        .collect();
    let mut writer = stream;
    let n = writer.write_vectored(&slices)?;
    cursor.advance(&lens, n);
    Ok(n)
}

fn read_some(stream: &TcpStream, bufs: &mut [&mut [u8]], cursor: &mut Cursor) -> io::Result<usize> {
    let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
    cursor.skip_filled(&lens);
    let offset = cursor.offset;
    let mut slices: Vec<IoSliceMut<'_>> = bufs[cursor.index..]
        .iter_mut()
        .take(IOV_MAX)
        .enumerate()
        .map(|(i, b)| IoSliceMut::new(if i == 0 { &mut b[offset..] } else { &mut b[..] }))
        .collect();
    let mut reader = stream;
    let n = reader.read_vectored(&mut slices)?;
    cursor.advance(&lens, n);
    Ok(n)
}

/// Write every byte of `bufs`, blocking as needed.
fn write_all_vectored(stream: &TcpStream, bufs: &[&[u8]]) -> io::Result<()> {
    let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
    let mut cursor = Cursor::default();
    while !cursor.is_done(&lens) {
        match write_some(stream, bufs, &mut cursor) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fill `bufs`, blocking as needed. Returns fewer bytes only at end of stream.
fn read_exact_vectored(stream: &TcpStream, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
    let mut cursor = Cursor::default();
    let mut got = 0;
    while !cursor.is_done(&lens) {
        match read_some(stream, bufs, &mut cursor) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

fn copy_io_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

// ---------------------------------------------------------------------------
// Pending non-blocking transfers
// ---------------------------------------------------------------------------

struct PendingSend {
    bufs: Vec<Bytes>,
    cursor: Cursor,
    total: usize,
    completer: Completer<usize>,
}

enum RecvCompleter {
    Single(Completer<BytesMut>),
    Vector(Completer<Vec<BytesMut>>),
}

struct PendingRecv {
    bufs: Vec<BytesMut>,
    cursor: Cursor,
    completer: RecvCompleter,
}

impl PendingRecv {
    fn finish(mut self) {
        match self.completer {
            RecvCompleter::Single(completer) => completer.complete(Ok(self.bufs.pop().unwrap_or_default())),
            RecvCompleter::Vector(completer) => completer.complete(Ok(self.bufs)),
        }
    }

    fn fail(self, err: Error) {
        match self.completer {
            RecvCompleter::Single(completer) => completer.complete(Err(err)),
            RecvCompleter::Vector(completer) => completer.complete(Err(err)),
        }
    }
}

/// Transfers queued on one channel, in submission order per direction.
#[derive(Default)]
pub(crate) struct PendingIo {
    sends: VecDeque<PendingSend>,
    recvs: VecDeque<PendingRecv>,
    iov_count: usize,
}

impl PendingIo {
    fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.recvs.is_empty()
    }

    fn interest(&self) -> Readiness {
        let mut interest = Readiness::empty();
        if !self.sends.is_empty() {
            interest |= Readiness::WRITABLE;
        }
        if !self.recvs.is_empty() {
            interest |= Readiness::READABLE;
        }
        interest
    }

    fn progress_sends(&mut self, stream: &TcpStream) -> io::Result<()> {
        while let Some(send) = self.sends.front_mut() {
            let views: Vec<&[u8]> = send.bufs.iter().map(|b| b.as_ref()).collect();
            let lens: Vec<usize> = views.iter().map(|b| b.len()).collect();
            if !send.cursor.is_done(&lens) {
                match write_some(stream, &views, &mut send.cursor) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            if let Some(send) = self.sends.pop_front() {
                self.iov_count -= send.bufs.len();
                send.completer.complete(Ok(send.total));
            }
        }
        Ok(())
    }

    fn progress_recvs(&mut self, stream: &TcpStream) -> io::Result<()> {
        while let Some(recv) = self.recvs.front_mut() {
            let lens: Vec<usize> = recv.bufs.iter().map(|b| b.len()).collect();
            if !recv.cursor.is_done(&lens) {
                let mut views: Vec<&mut [u8]> = recv.bufs.iter_mut().map(|b| &mut b[..]).collect();
                match read_some(stream, &mut views, &mut recv.cursor) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            if let Some(recv) = self.recvs.pop_front() {
                self.iov_count -= recv.bufs.len();
                recv.finish();
            }
        }
        Ok(())
    }

    /// Resolve every queued transfer with an error built by `make`.
    fn fail_all(&mut self, make: impl Fn() -> Error) {
        for send in self.sends.drain(..) {
            send.completer.complete(Err(make()));
        }
        for recv in self.recvs.drain(..) {
            recv.fail(make());
        }
        self.iov_count = 0;
    }
}

// ---------------------------------------------------------------------------
// SocketChannel
// ---------------------------------------------------------------------------

pub struct SocketChannel {
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    pending: Arc<Mutex<PendingIo>>,
    max_pending_iov: usize,
}

impl SocketChannel {
    pub(crate) fn new(stream: TcpStream, max_pending_iov: usize) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Arc::new(stream),
            peer,
            pending: Arc::new(Mutex::new(PendingIo::default())),
            max_pending_iov,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Buffers queued for non-blocking transfer.
    pub fn pending_iov(&self) -> usize {
        self.pending.lock().iov_count
    }

    fn handler(&self) -> ChannelHandler {
        ChannelHandler {
            stream: self.stream.clone(),
            peer: self.peer,
            pending: self.pending.clone(),
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        let pending = self.pending_iov();
        if pending > 0 {
            return Err(Error::WouldBlock { pending });
        }
        Ok(())
    }

    fn reserve(&self, count: usize) -> Result<()> {
        if count > self.max_pending_iov {
            return Err(Error::InvalidArgument(format!(
                "{count} buffers exceed max_pending_iov {}",
                self.max_pending_iov
            )));
        }
        let pending = self.pending_iov();
        if pending + count > self.max_pending_iov {
            return Err(Error::WouldBlock { pending });
        }
        Ok(())
    }

    /// Queue `data` for sending; progress happens inside `wait_all`.
    pub fn isend(&mut self, data: Bytes, event_loop: &mut SocketEventLoop) -> Result<CompletionToken<usize>> {
        self.isend_v(vec![data], event_loop)
    }

    /// Queue the concatenation of `bufs` as one transfer.
    pub fn isend_v(&mut self, bufs: Vec<Bytes>, event_loop: &mut SocketEventLoop) -> Result<CompletionToken<usize>> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(CompletionToken::ready(Ok(0)));
        }
        self.reserve(bufs.len())?;
        let (completer, token) = completion_pair();
        {
            let mut pending = self.pending.lock();
            pending.iov_count += bufs.len();
            pending.sends.push_back(PendingSend {
                bufs,
                cursor: Cursor::default(),
                total,
                completer,
            });
        }
        event_loop.add_handler(Box::new(self.handler()));
        tracing::trace!(peer = %self.peer, total, "queued non-blocking send");
        Ok(token)
    }

    /// Queue a receive of exactly `len` bytes.
    pub fn irecv(&mut self, len: usize, event_loop: &mut SocketEventLoop) -> Result<CompletionToken<BytesMut>> {
        if len == 0 {
            return Ok(CompletionToken::ready(Ok(BytesMut::new())));
        }
        self.reserve(1)?;
        let (completer, token) = completion_pair();
        self.queue_recv(vec![BytesMut::zeroed(len)], RecvCompleter::Single(completer));
        event_loop.add_handler(Box::new(self.handler()));
        Ok(token)
    }

    /// Queue a receive scattered into buffers of the given lengths.
    pub fn irecv_v(
        &mut self,
        lens: &[usize],
        event_loop: &mut SocketEventLoop,
    ) -> Result<CompletionToken<Vec<BytesMut>>> {
        if lens.iter().all(|&len| len == 0) {
            return Ok(CompletionToken::ready(Ok(lens.iter().map(|_| BytesMut::new()).collect())));
        }
        self.reserve(lens.len())?;
        let (completer, token) = completion_pair();
        let bufs = lens.iter().map(|&len| BytesMut::zeroed(len)).collect();
        self.queue_recv(bufs, RecvCompleter::Vector(completer));
        event_loop.add_handler(Box::new(self.handler()));
        Ok(token)
    }

    fn queue_recv(&self, bufs: Vec<BytesMut>, completer: RecvCompleter) {
        let mut pending = self.pending.lock();
        pending.iov_count += bufs.len();
        pending.recvs.push_back(PendingRecv {
            bufs,
            cursor: Cursor::default(),
            completer,
        });
    }

    fn send_bufs(&mut self, bufs: &[&[u8]]) -> Result<usize> {
        self.ensure_idle()?;
        write_all_vectored(&self.stream, bufs).map_err(|e| Error::from_stream_io(e, self.peer))?;
        Ok(bufs.iter().map(|b| b.len()).sum())
    }

    fn recv_bufs(&mut self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        self.ensure_idle()?;
        let expected = bufs.iter().map(|b| b.len()).sum();
        let got = read_exact_vectored(&self.stream, bufs).map_err(|e| Error::from_stream_io(e, self.peer))?;
        if got == expected {
            Ok(got)
        } else if got == 0 {
            Err(ConnectionError::HungUp.into())
        } else {
            Err(Error::ShortTransfer { expected, actual: got })
        }
    }
}

impl Channel for SocketChannel {
    fn peer_desc(&self) -> u64 {
        0
    }

    fn register_memory_region<'a>(&self, buf: &'a mut [u8], _access: AccessFlags) -> Result<LocalMemoryRegion<'a>> {
        Ok(LocalMemoryRegion::unregistered(buf))
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.send_bufs(&[buf])
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv_bufs(&mut [buf])
    }

    fn send_v(&mut self, regions: &[LocalMemoryRegion<'_>]) -> Result<usize> {
        let bufs: Vec<&[u8]> = regions.iter().map(|r| r.as_slice()).collect();
        self.send_bufs(&bufs)
    }

    fn recv_v(&mut self, regions: &mut [LocalMemoryRegion<'_>]) -> Result<usize> {
        let mut bufs: Vec<&mut [u8]> = regions.iter_mut().map(|r| r.as_mut_slice()).collect();
        self.recv_bufs(&mut bufs)
    }

    fn write_v(&mut self, _locals: &[LocalMemoryRegion<'_>], _remote: &RemoteMemoryRegion) -> Result<usize> {
        Err(Error::Unsupported("one-sided write on a stream socket"))
    }

    fn read_v(&mut self, _locals: &mut [LocalMemoryRegion<'_>], _remote: &RemoteMemoryRegion) -> Result<usize> {
        Err(Error::Unsupported("one-sided read on a stream socket"))
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.pending.lock().fail_all(|| ConnectionError::Closed.into());
    }
}

impl fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketChannel")
            .field("peer", &self.peer)
            .field("pending_iov", &self.pending_iov())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelHandler
// ---------------------------------------------------------------------------

/// The event-loop side of a channel: moves queued bytes on readiness.
pub(crate) struct ChannelHandler {
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    pending: Arc<Mutex<PendingIo>>,
}

impl ChannelHandler {
    fn progress(&self, pending: &mut PendingIo, readiness: Readiness) -> io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let mut result = Ok(());
        if readiness.contains(Readiness::WRITABLE) {
            result = pending.progress_sends(&self.stream);
        }
        if result.is_ok() && readiness.contains(Readiness::READABLE) {
            result = pending.progress_recvs(&self.stream);
        }
        let restored = self.stream.set_nonblocking(false);
        result.and(restored)
    }
}

impl EventHandler<Readiness> for ChannelHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Socket(self.stream.as_raw_fd())
    }

    fn interest(&self) -> Readiness {
        self.pending.lock().interest()
    }

    fn on_event(&mut self, readiness: Readiness) -> Disposition {
        let mut pending = self.pending.lock();
        if let Err(err) = self.progress(&mut pending, readiness) {
            tracing::debug!(peer = %self.peer, error = %err, "non-blocking transfer failed");
            let peer = self.peer;
            pending.fail_all(|| Error::from_stream_io(copy_io_error(&err), peer));
        }
        if pending.is_empty() {
            Disposition::MayBeRemoved
        } else {
            Disposition::Keep
        }
    }

    fn on_error(&mut self, readiness: Readiness) -> Disposition {
        let mut pending = self.pending.lock();
        // Bytes may still be buffered behind a hangup; drain what we can.
        if readiness.contains(Readiness::READABLE) && !readiness.intersects(Readiness::ERROR | Readiness::INVALID) {
            let _ = self.progress(&mut pending, Readiness::READABLE);
        }
        if !pending.is_empty() {
            tracing::debug!(peer = %self.peer, ?readiness, "socket failed with transfers pending");
            pending.fail_all(|| ConnectionError::HungUp.into());
        }
        Disposition::MayBeRemoved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advances_across_buffers() {
        let lens = [3, 0, 2, 4];
        let mut cursor = Cursor::default();
        cursor.advance(&lens, 4);
        assert_eq!(cursor, Cursor { index: 2, offset: 1 });
        assert!(!cursor.is_done(&lens));
        cursor.advance(&lens, 5);
        assert!(cursor.is_done(&lens));
    }

    #[test]
    fn test_cursor_empty_list_is_done() {
        assert!(Cursor::default().is_done(&[]));
        assert!(Cursor::default().is_done(&[0, 0]));
    }

    #[test]
    fn test_pending_interest() {
        let mut pending = PendingIo::default();
        assert!(pending.interest().is_empty());
        let (completer, _token) = completion_pair();
        pending.recvs.push_back(PendingRecv {
            bufs: vec![BytesMut::zeroed(4)],
            cursor: Cursor::default(),
            completer: RecvCompleter::Single(completer),
        });
        assert_eq!(pending.interest(), Readiness::READABLE);
        pending.fail_all(|| ConnectionError::Closed.into());
        assert!(pending.is_empty());
    }
}
