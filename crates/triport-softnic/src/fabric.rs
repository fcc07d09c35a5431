//! Reliable-datagram endpoints with tag matching and one-sided access.
//!
//! An endpoint is named by its 8-byte raw address. Peers are reached through
//! an address vector that maps small integer handles to names. Tagged
//! receives match on tag and, unless posted with [`ADDR_UNSPEC`], on source.
//! Messages that arrive before a matching receive wait in an unexpected
//! queue, so ordering between one sender and one receiver is preserved.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use triport_types::{Address, RAW_ADDR_LEN};

use crate::cq::{CompletionQueue, Signal, WcOpcode, WcStatus, WorkCompletion};
use crate::mr::{self, HwAccess, MemoryRegion, Sge};
use crate::net::SoftNet;
use crate::HwError;

/// Receive from any source.
pub const ADDR_UNSPEC: u64 = u64::MAX;

const LOOPBACK: u32 = 0x7f00_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricAttr {
    pub max_msg_size: usize,
    /// Scatter-gather entries per message.
    pub iov_limit: usize,
    /// Scatter-gather entries per one-sided operation.
    pub rma_iov_limit: usize,
    pub tx_size: usize,
    pub rx_size: usize,
    pub inject_size: usize,
}

impl Default for FabricAttr {
    fn default() -> Self {
        Self {
            max_msg_size: 1 << 30,
            iov_limit: 4,
            rma_iov_limit: 4,
            tx_size: 1024,
            rx_size: 1024,
            inject_size: 64,
        }
    }
}

struct PostedRecv {
    context: u64,
    sges: Vec<Sge>,
    src: Option<u64>,
    tag: u64,
}

struct Unexpected {
    src: u64,
    tag: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct RxState {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

pub(crate) struct EndpointShared {
    net: Arc<SoftNet>,
    name: u64,
    address: Address,
    domain: u64,
    attr: FabricAttr,
    av: RwLock<Vec<u64>>,
    tx_cq: Arc<CompletionQueue>,
    rx_cq: Arc<CompletionQueue>,
    signal: Arc<Signal>,
    rx: Mutex<RxState>,
}

impl EndpointShared {
    fn deliver(&self, src: u64, tag: u64, data: Vec<u8>) {
        let mut rx = self.rx.lock();
        let matched = rx
            .posted
            .iter()
            .position(|p| p.tag == tag && p.src.map_or(true, |s| s == src));
        match matched.and_then(|pos| rx.posted.remove(pos)) {
            Some(recv) => self.complete_recv(recv, src, tag, data),
            None => rx.unexpected.push_back(Unexpected { src, tag, data }),
        }
    }

    fn complete_recv(&self, recv: PostedRecv, src: u64, tag: u64, data: Vec<u8>) {
        let status = match mr::scatter(&self.net.memory(), self.domain, &recv.sges, &data) {
            Ok(()) => WcStatus::Success,
            Err(status) => status,
        };
        self.rx_cq.push(WorkCompletion {
            wr_id: recv.context,
            status,
            opcode: WcOpcode::Recv,
            byte_len: data.len(),
            src_addr: src,
            tag,
        });
    }
}

pub struct RdmEndpoint {
    shared: Arc<EndpointShared>,
}

impl RdmEndpoint {
    /// Open an endpoint at `addr`. Port 0 picks an ephemeral port; an
    /// unspecified IP is named by the loopback address.
    pub fn open(net: &Arc<SoftNet>, addr: Address, attr: FabricAttr) -> Result<Self, HwError> {
        Self::open_with_signal(net, addr, attr, Signal::new())
    }

    /// Like [`open`](Self::open), with both completion queues bumping
    /// `signal`. Endpoints sharing a signal can be waited on together.
    pub fn open_with_signal(
        net: &Arc<SoftNet>,
        addr: Address,
        attr: FabricAttr,
        signal: Arc<Signal>,
    ) -> Result<Self, HwError> {
        let mut address = addr;
        if address.is_unspecified() {
            address.ip = LOOPBACK;
        }
        if address.port == 0 {
            address.port =
                net.allocate_port(|port| net.endpoints.contains_key(&address.with_port(port).to_u64()))?;
        }
        let shared = Arc::new(EndpointShared {
            net: net.clone(),
            name: address.to_u64(),
            address,
            domain: net.next_id(),
            attr,
            av: RwLock::new(Vec::new()),
            tx_cq: CompletionQueue::new(attr.tx_size, Some(signal.clone())),
            rx_cq: CompletionQueue::new(attr.rx_size, Some(signal.clone())),
            signal,
            rx: Mutex::new(RxState::default()),
        });
        match net.endpoints.entry(shared.name) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    return Err(HwError::AddrInUse(address.to_string()));
                }
                entry.insert(Arc::downgrade(&shared));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(&shared));
            }
        }
        tracing::debug!(%address, ?attr, "opened fabric endpoint");
        Ok(Self { shared })
    }

    pub fn address(&self) -> Address {
        self.shared.address
    }

    /// The raw name peers insert into their address vectors.
    pub fn name(&self) -> [u8; RAW_ADDR_LEN] {
        self.shared.address.to_raw()
    }

    pub fn attr(&self) -> FabricAttr {
        self.shared.attr
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.shared.signal
    }

    pub fn tx_cq(&self) -> &Arc<CompletionQueue> {
        &self.shared.tx_cq
    }

    pub fn rx_cq(&self) -> &Arc<CompletionQueue> {
        &self.shared.rx_cq
    }

    /// Insert a raw peer name; returns its handle. Re-inserting a known name
    /// returns the existing handle.
    pub fn av_insert(&self, raw: &[u8]) -> Result<u64, HwError> {
        let address = Address::from_raw(raw).map_err(|e| HwError::InvalidArgument(e.to_string()))?;
        let name = address.to_u64();
        let mut av = self.shared.av.write();
        if let Some(index) = av.iter().position(|n| *n == name) {
            return Ok(index as u64);
        }
        av.push(name);
        Ok((av.len() - 1) as u64)
    }

    pub fn av_lookup(&self, fi_addr: u64) -> Option<Address> {
        let name = *self.shared.av.read().get(fi_addr as usize)?;
        Address::from_u64(name)
    }

    fn av_name(&self, fi_addr: u64) -> Result<u64, HwError> {
        self.shared
            .av
            .read()
            .get(fi_addr as usize)
            .copied()
            .ok_or_else(|| HwError::InvalidArgument(format!("unknown fabric address {fi_addr}")))
    }

    fn peer(&self, fi_addr: u64) -> Result<Option<Arc<EndpointShared>>, HwError> {
        let name = self.av_name(fi_addr)?;
        Ok(self.shared.net.endpoints.get(&name).and_then(|w| w.upgrade()))
    }

    /// Register memory with this endpoint's domain.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid until the region is dropped.
    pub unsafe fn mr_reg(&self, addr: *mut u8, len: usize, access: HwAccess) -> Result<MemoryRegion, HwError> {
        self.shared.net.register(self.shared.domain, addr, len, access)
    }

    fn check_post(&self, sges: &[Sge], iov_limit: usize) -> Result<usize, HwError> {
        if sges.len() > iov_limit {
            return Err(HwError::TooManySge {
                requested: sges.len(),
                limit: iov_limit,
            });
        }
        let total = mr::total_length(sges);
        if total > self.shared.attr.max_msg_size {
            return Err(HwError::MessageTooLarge {
                len: total,
                limit: self.shared.attr.max_msg_size,
            });
        }
        if self.shared.tx_cq.len() >= self.shared.attr.tx_size {
            return Err(HwError::Again);
        }
        Ok(total)
    }

    fn complete_tx(&self, context: u64, status: WcStatus, opcode: WcOpcode, byte_len: usize, tag: u64) {
        if !status.is_success() {
            tracing::debug!(context, %status, ?opcode, "fabric operation failed");
        }
        self.shared.tx_cq.push(WorkCompletion {
            wr_id: context,
            status,
            opcode,
            byte_len,
            src_addr: 0,
            tag,
        });
    }

    /// Send a tagged message to the peer behind `dest`.
    pub fn tsend(&self, sges: &[Sge], dest: u64, tag: u64, context: u64) -> Result<(), HwError> {
        let total = self.check_post(sges, self.shared.attr.iov_limit)?;
        let status = match self.peer(dest)? {
            None => WcStatus::RetryExcErr,
            Some(peer) => match mr::gather(&self.shared.net.memory(), self.shared.domain, sges) {
                Ok(data) => {
                    peer.deliver(self.shared.name, tag, data);
                    WcStatus::Success
                }
                Err(status) => status,
            },
        };
        self.complete_tx(context, status, WcOpcode::Send, total, tag);
        Ok(())
    }

    /// Post a tagged receive. `src` is a handle or [`ADDR_UNSPEC`].
    pub fn trecv(&self, sges: &[Sge], src: u64, tag: u64, context: u64) -> Result<(), HwError> {
        if sges.len() > self.shared.attr.iov_limit {
            return Err(HwError::TooManySge {
                requested: sges.len(),
                limit: self.shared.attr.iov_limit,
            });
        }
        let src = if src == ADDR_UNSPEC {
            None
        } else {
            Some(self.av_name(src)?)
        };
        let recv = PostedRecv {
            context,
            sges: sges.to_vec(),
            src,
            tag,
        };
        let mut rx = self.shared.rx.lock();
        if rx.posted.len() + self.shared.rx_cq.len() >= self.shared.attr.rx_size {
            return Err(HwError::Again);
        }
        let matched = rx
            .unexpected
            .iter()
            .position(|u| u.tag == tag && src.map_or(true, |s| s == u.src));
        match matched.and_then(|pos| rx.unexpected.remove(pos)) {
            Some(msg) => self.shared.complete_recv(recv, msg.src, msg.tag, msg.data),
            None => rx.posted.push_back(recv),
        }
        Ok(())
    }

    /// One-sided write of `sges` to `remote_addr` at the peer behind `dest`.
    pub fn write(&self, sges: &[Sge], dest: u64, remote_addr: u64, key: u32, context: u64) -> Result<(), HwError> {
        let total = self.check_post(sges, self.shared.attr.rma_iov_limit)?;
        let status = match self.peer(dest)? {
            None => WcStatus::RetryExcErr,
            Some(_) => {
                let table = self.shared.net.memory();
                let outcome = mr::gather(&table, self.shared.domain, sges)
                    .and_then(|data| mr::remote_write(&table, key, remote_addr, &data));
                outcome.err().unwrap_or(WcStatus::Success)
            }
        };
        self.complete_tx(context, status, WcOpcode::RdmaWrite, total, 0);
        Ok(())
    }

    /// One-sided read from `remote_addr` at the peer behind `dest` into `sges`.
    pub fn read(&self, sges: &[Sge], dest: u64, remote_addr: u64, key: u32, context: u64) -> Result<(), HwError> {
        let total = self.check_post(sges, self.shared.attr.rma_iov_limit)?;
        let status = match self.peer(dest)? {
            None => WcStatus::RetryExcErr,
            Some(_) => {
                let table = self.shared.net.memory();
                let outcome = mr::remote_read(&table, key, remote_addr, total)
                    .and_then(|data| mr::scatter(&table, self.shared.domain, sges, &data));
                outcome.err().unwrap_or(WcStatus::Success)
            }
        };
        self.complete_tx(context, status, WcOpcode::RdmaRead, total, 0);
        Ok(())
    }
}

impl Drop for RdmEndpoint {
    fn drop(&mut self) {
        let me = Arc::as_ptr(&self.shared);
        self.shared
            .net
            .endpoints
            .remove_if(&self.shared.name, |_, w| std::ptr::eq(w.as_ptr(), me));
    }
}

impl fmt::Debug for RdmEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmEndpoint")
            .field("address", &self.shared.address)
            .field("attr", &self.shared.attr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triport_types::Provider;

    fn endpoint(net: &Arc<SoftNet>) -> RdmEndpoint {
        RdmEndpoint::open(net, Address::new(0, 0, Provider::Fabric), FabricAttr::default()).unwrap()
    }

    fn reg(ep: &RdmEndpoint, buf: &mut [u8]) -> MemoryRegion {
        unsafe { ep.mr_reg(buf.as_mut_ptr(), buf.len(), HwAccess::all()) }.unwrap()
    }

    #[test]
    fn test_tagged_matching() {
        let net = SoftNet::new();
        let a = endpoint(&net);
        let b = endpoint(&net);
        let b_at_a = a.av_insert(&b.name()).unwrap();
        let a_at_b = b.av_insert(&a.name()).unwrap();
        assert_eq!(a.av_insert(&b.name()).unwrap(), b_at_a);
        assert_eq!(a.av_lookup(b_at_a), Some(b.address()));

        let mut src = *b"tag5tag6";
        let mut dst = [0u8; 8];
        let src_mr = reg(&a, &mut src);
        let dst_mr = reg(&b, &mut dst);

        // Tag 6 arrives first but only the tag 5 receive is posted.
        a.tsend(&[Sge::new(src_mr.addr() + 4, 4, src_mr.lkey())], b_at_a, 6, 1).unwrap();
        b.trecv(&[Sge::new(dst_mr.addr(), 4, dst_mr.lkey())], a_at_b, 5, 10).unwrap();
        assert!(b.rx_cq().is_empty());
        a.tsend(&[Sge::new(src_mr.addr(), 4, src_mr.lkey())], b_at_a, 5, 2).unwrap();
        let wc = b.rx_cq().poll_one().unwrap();
        assert_eq!((wc.wr_id, wc.tag, wc.byte_len), (10, 5, 4));
        assert_eq!(wc.src_addr, a.address().to_u64());

        // A wildcard receive picks up the unexpected tag 6 message.
        b.trecv(&[Sge::new(dst_mr.addr() + 4, 4, dst_mr.lkey())], ADDR_UNSPEC, 6, 11).unwrap();
        assert_eq!(b.rx_cq().poll_one().unwrap().wr_id, 11);
        assert_eq!(a.tx_cq().poll(8).len(), 2);

        drop((src_mr, dst_mr));
        assert_eq!(&dst, b"tag5tag6");
    }

    #[test]
    fn test_rma() {
        let net = SoftNet::new();
        let a = endpoint(&net);
        let b = endpoint(&net);
        let peer = a.av_insert(&b.name()).unwrap();
        let mut local = *b"wxyz";
        let mut remote = [0u8; 4];
        let local_mr = reg(&a, &mut local);
        let remote_mr = reg(&b, &mut remote);
        let sge = Sge::new(local_mr.addr(), 4, local_mr.lkey());
        a.write(&[sge], peer, remote_mr.addr(), remote_mr.rkey(), 1).unwrap();
        a.read(&[sge], peer, remote_mr.addr(), 12345, 2).unwrap();
        let wcs = a.tx_cq().poll(2);
        assert_eq!(wcs[0].status, WcStatus::Success);
        assert_eq!(wcs[1].status, WcStatus::RemAccessErr);
        drop((local_mr, remote_mr));
        assert_eq!(&remote, b"wxyz");
    }

    #[test]
    fn test_queue_full_returns_again() {
        let net = SoftNet::new();
        let attr = FabricAttr {
            rx_size: 1,
            tx_size: 1,
            ..FabricAttr::default()
        };
        let a = RdmEndpoint::open(&net, Address::new(0, 0, Provider::Fabric), attr).unwrap();
        let b = endpoint(&net);
        let peer = a.av_insert(&b.name()).unwrap();
        a.trecv(&[], ADDR_UNSPEC, 1, 1).unwrap();
        assert_eq!(a.trecv(&[], ADDR_UNSPEC, 1, 2), Err(HwError::Again));
        a.tsend(&[], peer, 1, 3).unwrap();
        assert_eq!(a.tsend(&[], peer, 1, 4), Err(HwError::Again));
    }

    #[test]
    fn test_unreachable_peer_completes_with_error() {
        let net = SoftNet::new();
        let a = endpoint(&net);
        let gone = endpoint(&net);
        let peer = a.av_insert(&gone.name()).unwrap();
        drop(gone);
        a.tsend(&[], peer, 1, 7).unwrap();
        assert_eq!(a.tx_cq().poll_one().unwrap().status, WcStatus::RetryExcErr);
        assert!(a.tsend(&[], 99, 1, 8).is_err());
    }

    #[test]
    fn test_shared_signal() {
        let net = SoftNet::new();
        let signal = Signal::new();
        let any = Address::new(0, 0, Provider::Fabric);
        let a = RdmEndpoint::open_with_signal(&net, any, FabricAttr::default(), signal.clone()).unwrap();
        let b = RdmEndpoint::open_with_signal(&net, any, FabricAttr::default(), signal.clone()).unwrap();
        assert!(Arc::ptr_eq(a.signal(), b.signal()));
        let peer = a.av_insert(&b.name()).unwrap();
        let seen = signal.generation();
        a.tsend(&[], peer, 3, 1).unwrap();
        assert!(signal.wait_past(seen, Some(std::time::Duration::ZERO)));
    }

    #[test]
    fn test_names_are_unique() {
        let net = SoftNet::new();
        let addr = Address::new(0, 6000, Provider::Fabric);
        let first = RdmEndpoint::open(&net, addr, FabricAttr::default()).unwrap();
        assert_eq!(first.address().octets(), [127, 0, 0, 1]);
        assert!(matches!(
            RdmEndpoint::open(&net, addr, FabricAttr::default()),
            Err(HwError::AddrInUse(_))
        ));
        drop(first);
        RdmEndpoint::open(&net, addr, FabricAttr::default()).unwrap();
    }
}
