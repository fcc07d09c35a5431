//! Devices, protection domains and reliable-connected queue pairs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cq::{CompletionQueue, WcOpcode, WcStatus, WorkCompletion};
use crate::mr::{self, HwAccess, MemoryRegion, Sge};
use crate::net::SoftNet;
use crate::HwError;

/// Limits a device reports when queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAttr {
    pub max_qp_wr: usize,
    pub max_sge: usize,
    pub max_msg_sz: usize,
    pub max_inline_data: usize,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_qp_wr: 16384,
            max_sge: 30,
            max_msg_sz: 1 << 30,
            max_inline_data: 256,
        }
    }
}

pub struct Device {
    net: Arc<SoftNet>,
    name: String,
    attr: DeviceAttr,
}

impl Device {
    pub fn open(net: Arc<SoftNet>, name: impl Into<String>, attr: DeviceAttr) -> Arc<Self> {
        let name = name.into();
        tracing::debug!(%name, ?attr, "opened device");
        Arc::new(Self { net, name, attr })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> DeviceAttr {
        self.attr
    }

    pub fn net(&self) -> &Arc<SoftNet> {
        &self.net
    }

    pub fn alloc_pd(self: &Arc<Self>) -> Arc<ProtectionDomain> {
        Arc::new(ProtectionDomain {
            id: self.net.next_id(),
            device: self.clone(),
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("attr", &self.attr)
            .finish()
    }
}

#[derive(Debug)]
pub struct ProtectionDomain {
    device: Arc<Device>,
    id: u64,
}

impl ProtectionDomain {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Register memory in this domain.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid until the region is dropped.
    pub unsafe fn reg_mr(&self, addr: *mut u8, len: usize, access: HwAccess) -> Result<MemoryRegion, HwError> {
        self.device.net.register(self.id, addr, len, access)
    }
}

/// Capacities requested when creating a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: usize,
    pub max_recv_wr: usize,
    pub max_send_sge: usize,
    pub max_recv_sge: usize,
    pub max_inline_data: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    Send,
    RdmaWrite { remote_addr: u64, rkey: u32 },
    RdmaRead { remote_addr: u64, rkey: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct SendWr<'a> {
    pub wr_id: u64,
    pub sges: &'a [Sge],
    pub op: SendOp,
    /// Copy the payload at post time instead of checking local keys.
    pub inline: bool,
}

struct RecvWr {
    wr_id: u64,
    sges: Vec<Sge>,
}

#[derive(Default)]
struct RecvState {
    posted: VecDeque<RecvWr>,
    /// Messages that arrived before a receive was posted; delivered in order
    /// once one is, like a receiver-not-ready retry that eventually succeeds.
    inbound: VecDeque<Vec<u8>>,
}

enum Link {
    Idle,
    Connected(Weak<QueuePair>),
    Down,
}

pub struct QueuePair {
    pd: Arc<ProtectionDomain>,
    qp_num: u32,
    caps: QpCaps,
    send_cq: Arc<CompletionQueue>,
    recv_cq: Arc<CompletionQueue>,
    link: RwLock<Link>,
    recv: Mutex<RecvState>,
}

impl QueuePair {
    /// Create a queue pair. Each queue pair must own its completion queues:
    /// send-queue occupancy is derived from its send completion queue.
    pub fn create(
        pd: &Arc<ProtectionDomain>,
        caps: QpCaps,
        send_cq: Arc<CompletionQueue>,
        recv_cq: Arc<CompletionQueue>,
    ) -> Result<Arc<Self>, HwError> {
        let attr = pd.device.attr;
        let check = |name: &str, value: usize, max: usize| {
            if value == 0 || value > max {
                Err(HwError::InvalidArgument(format!("{name} {value} outside 1..={max}")))
            } else {
                Ok(())
            }
        };
        check("max_send_wr", caps.max_send_wr, attr.max_qp_wr)?;
        check("max_recv_wr", caps.max_recv_wr, attr.max_qp_wr)?;
        check("max_send_sge", caps.max_send_sge, attr.max_sge)?;
        check("max_recv_sge", caps.max_recv_sge, attr.max_sge)?;
        if caps.max_inline_data > attr.max_inline_data {
            return Err(HwError::InvalidArgument(format!(
                "max_inline_data {} exceeds {}",
                caps.max_inline_data, attr.max_inline_data
            )));
        }
        let qp = Arc::new(Self {
            pd: pd.clone(),
            qp_num: (pd.device.net.next_id() & 0xff_ffff) as u32,
            caps,
            send_cq,
            recv_cq,
            link: RwLock::new(Link::Idle),
            recv: Mutex::new(RecvState::default()),
        });
        tracing::debug!(qp_num = qp.qp_num, ?caps, "created queue pair");
        Ok(qp)
    }

    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn caps(&self) -> QpCaps {
        self.caps
    }

    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    pub fn send_cq(&self) -> &Arc<CompletionQueue> {
        &self.send_cq
    }

    pub fn recv_cq(&self) -> &Arc<CompletionQueue> {
        &self.recv_cq
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.link.read(), Link::Connected(peer) if peer.strong_count() > 0)
    }

    pub(crate) fn connect(self: &Arc<Self>, peer: &Arc<QueuePair>) {
        *self.link.write() = Link::Connected(Arc::downgrade(peer));
        *peer.link.write() = Link::Connected(Arc::downgrade(self));
    }

    /// Move both ends to the error state and flush posted receives.
    pub(crate) fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.link.write(), Link::Down);
        self.flush_recvs();
        if let Link::Connected(peer) = previous {
            if let Some(peer) = peer.upgrade() {
                *peer.link.write() = Link::Down;
                peer.flush_recvs();
            }
        }
    }

    fn flush_recvs(&self) {
        let mut recv = self.recv.lock();
        for wr in recv.posted.drain(..) {
            self.recv_cq
                .push(WorkCompletion::new(wr.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0));
        }
    }

    /// Post one send-queue work request.
    ///
    /// # Safety
    ///
    /// For inline requests the elements must describe readable memory; they
    /// are not checked against the registration table.
    pub unsafe fn post_send(&self, wr: &SendWr<'_>) -> Result<(), HwError> {
        if wr.sges.len() > self.caps.max_send_sge {
            return Err(HwError::TooManySge {
                requested: wr.sges.len(),
                limit: self.caps.max_send_sge,
            });
        }
        let total = mr::total_length(wr.sges);
        let max_msg_sz = self.pd.device.attr.max_msg_sz;
        if total > max_msg_sz {
            return Err(HwError::MessageTooLarge {
                len: total,
                limit: max_msg_sz,
            });
        }
        if wr.inline && (total > self.caps.max_inline_data || matches!(wr.op, SendOp::RdmaRead { .. })) {
            return Err(HwError::InvalidArgument(format!(
                "cannot inline {total} bytes ({:?})",
                wr.op
            )));
        }
        if self.send_cq.len() >= self.caps.max_send_wr {
            return Err(HwError::QueueFull(self.caps.max_send_wr));
        }
        let peer = match &*self.link.read() {
            Link::Idle => return Err(HwError::NotConnected),
            Link::Connected(peer) => peer.upgrade(),
            Link::Down => None,
        };

        let (opcode, status) = match peer {
            None => (opcode_of(wr.op), WcStatus::WrFlushErr),
            Some(peer) => (opcode_of(wr.op), self.execute(wr, &peer)),
        };
        if !status.is_success() {
            tracing::debug!(wr_id = wr.wr_id, %status, "send work request failed");
        }
        self.send_cq
            .push(WorkCompletion::new(wr.wr_id, status, opcode, total));
        Ok(())
    }

    unsafe fn execute(&self, wr: &SendWr<'_>, peer: &QueuePair) -> WcStatus {
        let net = &self.pd.device.net;
        let domain = self.pd.id;
        let outcome = match wr.op {
            SendOp::Send => {
                let data = if wr.inline {
                    Ok(mr::gather_inline(wr.sges))
                } else {
                    mr::gather(&net.memory(), domain, wr.sges)
                };
                data.map(|data| peer.deliver(data))
            }
            SendOp::RdmaWrite { remote_addr, rkey } => {
                let table = net.memory();
                let data = if wr.inline {
                    Ok(mr::gather_inline(wr.sges))
                } else {
                    mr::gather(&table, domain, wr.sges)
                };
                data.and_then(|data| mr::remote_write(&table, rkey, remote_addr, &data))
            }
            SendOp::RdmaRead { remote_addr, rkey } => {
                let table = net.memory();
                mr::remote_read(&table, rkey, remote_addr, mr::total_length(wr.sges))
                    .and_then(|data| mr::scatter(&table, domain, wr.sges, &data))
            }
        };
        match outcome {
            Ok(()) => WcStatus::Success,
            Err(status) => status,
        }
    }

    fn deliver(&self, data: Vec<u8>) {
        let mut recv = self.recv.lock();
        match recv.posted.pop_front() {
            Some(wr) => self.complete_recv(wr, data),
            None => recv.inbound.push_back(data),
        }
    }

    fn complete_recv(&self, wr: RecvWr, data: Vec<u8>) {
        let status = match mr::scatter(&self.pd.device.net.memory(), self.pd.id, &wr.sges, &data) {
            Ok(()) => WcStatus::Success,
            Err(status) => status,
        };
        self.recv_cq
            .push(WorkCompletion::new(wr.wr_id, status, WcOpcode::Recv, data.len()));
    }

    /// Post one receive-queue work request.
    pub fn post_recv(&self, wr_id: u64, sges: &[Sge]) -> Result<(), HwError> {
        if sges.len() > self.caps.max_recv_sge {
            return Err(HwError::TooManySge {
                requested: sges.len(),
                limit: self.caps.max_recv_sge,
            });
        }
        let mut recv = self.recv.lock();
        if recv.posted.len() + self.recv_cq.len() >= self.caps.max_recv_wr {
            return Err(HwError::QueueFull(self.caps.max_recv_wr));
        }
        let wr = RecvWr {
            wr_id,
            sges: sges.to_vec(),
        };
        // Data that arrived before a disconnect is still delivered.
        if let Some(data) = recv.inbound.pop_front() {
            self.complete_recv(wr, data);
        } else if matches!(&*self.link.read(), Link::Down) {
            self.recv_cq
                .push(WorkCompletion::new(wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0));
        } else {
            recv.posted.push_back(wr);
        }
        Ok(())
    }
}

fn opcode_of(op: SendOp) -> WcOpcode {
    match op {
        SendOp::Send => WcOpcode::Send,
        SendOp::RdmaWrite { .. } => WcOpcode::RdmaWrite,
        SendOp::RdmaRead { .. } => WcOpcode::RdmaRead,
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_num)
            .field("caps", &self.caps)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> QpCaps {
        QpCaps {
            max_send_wr: 4,
            max_recv_wr: 4,
            max_send_sge: 2,
            max_recv_sge: 2,
            max_inline_data: 16,
        }
    }

    fn qp(pd: &Arc<ProtectionDomain>) -> Arc<QueuePair> {
        QueuePair::create(
            pd,
            caps(),
            CompletionQueue::new(8, None),
            CompletionQueue::new(8, None),
        )
        .unwrap()
    }

    fn connected_pair() -> (Arc<ProtectionDomain>, Arc<QueuePair>, Arc<QueuePair>) {
        let device = Device::open(SoftNet::new(), "soft0", DeviceAttr::default());
        let pd = device.alloc_pd();
        let a = qp(&pd);
        let b = qp(&pd);
        a.connect(&b);
        (pd, a, b)
    }

    fn reg(pd: &ProtectionDomain, buf: &mut [u8]) -> MemoryRegion {
        unsafe { pd.reg_mr(buf.as_mut_ptr(), buf.len(), HwAccess::all()) }.unwrap()
    }

    fn send(qp: &QueuePair, wr_id: u64, sges: &[Sge], op: SendOp) -> Result<(), HwError> {
        unsafe {
            qp.post_send(&SendWr {
                wr_id,
                sges,
                op,
                inline: false,
            })
        }
    }

    #[test]
    fn test_send_recv_in_order() {
        let (pd, a, b) = connected_pair();
        let mut src = *b"abcdef";
        let mut dst = [0u8; 6];
        let src_mr = reg(&pd, &mut src);
        let dst_mr = reg(&pd, &mut dst);

        // Send before the receive is posted; delivery waits for it.
        send(&a, 1, &[Sge::new(src_mr.addr(), 3, src_mr.lkey())], SendOp::Send).unwrap();
        send(&a, 2, &[Sge::new(src_mr.addr() + 3, 3, src_mr.lkey())], SendOp::Send).unwrap();
        assert_eq!(a.send_cq().poll(8).len(), 2);
        b.post_recv(10, &[Sge::new(dst_mr.addr(), 3, dst_mr.lkey())]).unwrap();
        b.post_recv(11, &[Sge::new(dst_mr.addr() + 3, 3, dst_mr.lkey())]).unwrap();
        let wcs = b.recv_cq().poll(8);
        assert_eq!(wcs.iter().map(|wc| wc.wr_id).collect::<Vec<_>>(), vec![10, 11]);
        assert!(wcs.iter().all(|wc| wc.status.is_success() && wc.byte_len == 3));
        drop((src_mr, dst_mr));
        assert_eq!(&dst, b"abcdef");
    }

    #[test]
    fn test_queue_limits() {
        let (pd, a, b) = connected_pair();
        let mut buf = [0u8; 8];
        let region = reg(&pd, &mut buf);
        let sge = Sge::new(region.addr(), 1, region.lkey());
        assert!(matches!(
            send(&a, 1, &[sge, sge, sge], SendOp::Send),
            Err(HwError::TooManySge { requested: 3, limit: 2 })
        ));
        for id in 0..4 {
            send(&a, id, &[sge], SendOp::Send).unwrap();
        }
        assert_eq!(send(&a, 9, &[sge], SendOp::Send), Err(HwError::QueueFull(4)));
        a.send_cq().poll(1);
        send(&a, 9, &[sge], SendOp::Send).unwrap();

        for id in 0..4 {
            b.post_recv(id, &[sge]).unwrap();
        }
        assert_eq!(b.post_recv(9, &[sge]), Err(HwError::QueueFull(4)));
    }

    #[test]
    fn test_length_error_on_small_receive() {
        let (pd, a, b) = connected_pair();
        let mut buf = [0u8; 8];
        let region = reg(&pd, &mut buf);
        b.post_recv(1, &[Sge::new(region.addr(), 2, region.lkey())]).unwrap();
        send(&a, 1, &[Sge::new(region.addr(), 4, region.lkey())], SendOp::Send).unwrap();
        let wc = b.recv_cq().poll_one().unwrap();
        assert_eq!(wc.status, WcStatus::LocLenErr);
        assert_eq!(wc.byte_len, 4);
    }

    #[test]
    fn test_rdma_write_and_read() {
        let (pd, a, _b) = connected_pair();
        let mut local = *b"0123";
        let mut remote = [0u8; 4];
        let local_mr = reg(&pd, &mut local);
        let remote_mr = reg(&pd, &mut remote);
        let sge = Sge::new(local_mr.addr(), 4, local_mr.lkey());
        send(
            &a,
            1,
            &[sge],
            SendOp::RdmaWrite {
                remote_addr: remote_mr.addr(),
                rkey: remote_mr.rkey(),
            },
        )
        .unwrap();
        send(
            &a,
            2,
            &[sge],
            SendOp::RdmaWrite {
                remote_addr: remote_mr.addr(),
                rkey: 9999,
            },
        )
        .unwrap();
        let wcs = a.send_cq().poll(8);
        assert_eq!(wcs[0].status, WcStatus::Success);
        assert_eq!(wcs[0].opcode, WcOpcode::RdmaWrite);
        assert_eq!(wcs[1].status, WcStatus::RemAccessErr);

        drop((local_mr, remote_mr));
        assert_eq!(&remote, b"0123");
    }

    #[test]
    fn test_disconnect_flushes() {
        let (pd, a, b) = connected_pair();
        let mut buf = [0u8; 8];
        let region = reg(&pd, &mut buf);
        let sge = Sge::new(region.addr(), 8, region.lkey());
        b.post_recv(5, &[sge]).unwrap();
        a.disconnect();
        assert!(!a.is_connected() && !b.is_connected());
        assert_eq!(b.recv_cq().poll_one().unwrap().status, WcStatus::WrFlushErr);
        send(&a, 6, &[sge], SendOp::Send).unwrap();
        assert_eq!(a.send_cq().poll_one().unwrap().status, WcStatus::WrFlushErr);
    }

    #[test]
    fn test_inbound_survives_disconnect() {
        let (pd, a, b) = connected_pair();
        let mut src = *b"datagram";
        let src_region = reg(&pd, &mut src);
        let sge = Sge::new(src_region.addr(), 8, src_region.lkey());
        send(&a, 1, &[sge], SendOp::Send).unwrap();
        send(&a, 2, &[sge], SendOp::Send).unwrap();
        a.disconnect();

        let mut dst = [0u8; 8];
        let dst_region = reg(&pd, &mut dst);
        let dst_sge = Sge::new(dst_region.addr(), 8, dst_region.lkey());
        for wr_id in [10, 11] {
            b.post_recv(wr_id, &[dst_sge]).unwrap();
            let wc = b.recv_cq().poll_one().unwrap();
            assert_eq!((wc.wr_id, wc.status, wc.byte_len), (wr_id, WcStatus::Success, 8));
        }
        b.post_recv(12, &[dst_sge]).unwrap();
        assert_eq!(b.recv_cq().poll_one().unwrap().status, WcStatus::WrFlushErr);
        drop(dst_region);
        assert_eq!(&dst, b"datagram");
    }

    #[test]
    fn test_unconnected_send_rejected() {
        let device = Device::open(SoftNet::new(), "soft0", DeviceAttr::default());
        let pd = device.alloc_pd();
        let lonely = qp(&pd);
        assert_eq!(send(&lonely, 1, &[], SendOp::Send), Err(HwError::NotConnected));
    }

    #[test]
    fn test_caps_validated_against_device() {
        let device = Device::open(
            SoftNet::new(),
            "soft0",
            DeviceAttr {
                max_sge: 1,
                ..DeviceAttr::default()
            },
        );
        let pd = device.alloc_pd();
        let result = QueuePair::create(&pd, caps(), CompletionQueue::new(1, None), CompletionQueue::new(1, None));
        assert!(matches!(result, Err(HwError::InvalidArgument(_))));
    }
}
