//! [`WorkQueue`] over one reliable-connected queue pair.

use std::sync::Arc;

use triport_net::{
    AccessFlags, Error, LocalMemoryRegion, QueueLimits, ResourceError, Result, Segment, WorkCompletion, WorkQueue,
};
use triport_softnic::bridge::{completion_error, hw_access, map_hw_error};
use triport_softnic::{ProtectionDomain, QueuePair, SendOp, SendWr, Sge};

fn key32(key: u64) -> Result<u32> {
    u32::try_from(key).map_err(|_| Error::InvalidArgument(format!("key {key:#x} does not fit 32 bits")))
}

fn to_sges(segments: &[Segment]) -> Result<Vec<Sge>> {
    segments
        .iter()
        .map(|s| Ok(Sge::new(s.addr, s.length, key32(s.key)?)))
        .collect()
}

/// Register `addr..addr + len` with `pd`.
///
/// # Safety
///
/// The range must stay valid until the returned region is dropped.
pub(crate) unsafe fn register_with(
    pd: &ProtectionDomain,
    addr: *mut u8,
    len: usize,
    access: AccessFlags,
) -> Result<LocalMemoryRegion<'static>> {
    let access = access.normalized();
    let mr = pd
        .reg_mr(addr, len, hw_access(access))
        .map_err(|e| ResourceError::Registration {
            length: len,
            reason: e.to_string(),
        })?;
    tracing::debug!(addr = format_args!("{:#x}", mr.addr()), len, lkey = mr.lkey(), "registered memory");
    let (lkey, rkey) = (u64::from(mr.lkey()), u64::from(mr.rkey()));
    Ok(LocalMemoryRegion::from_raw_parts(addr, len, lkey, rkey, access, Some(Box::new(mr))))
}

pub struct VerbsQueue {
    qp: Arc<QueuePair>,
    limits: QueueLimits,
}

impl VerbsQueue {
    pub(crate) fn new(qp: Arc<QueuePair>, limits: QueueLimits) -> Self {
        Self { qp, limits }
    }

    pub fn qp(&self) -> &Arc<QueuePair> {
        &self.qp
    }

    fn post(&mut self, wr_id: u64, segments: &[Segment], op: SendOp) -> Result<()> {
        let sges = to_sges(segments)?;
        let total: usize = segments.iter().map(|s| s.length).sum();
        let inline = total > 0 && total <= self.limits.max_inline_data && !matches!(op, SendOp::RdmaRead { .. });
        let wr = SendWr {
            wr_id,
            sges: &sges,
            op,
            inline,
        };
        // SAFETY: the protocol only posts its own eager and staging buffers or
        // caller regions it holds for the duration of the transfer.
        unsafe { self.qp.post_send(&wr) }.map_err(|e| map_hw_error(e, "send"))
    }
}

fn convert(wc: triport_softnic::WorkCompletion) -> WorkCompletion {
    WorkCompletion {
        wr_id: wc.wr_id,
        byte_len: wc.byte_len,
        error: (!wc.status.is_success()).then(|| completion_error(wc.status, format!("work request {}", wc.wr_id))),
    }
}

impl WorkQueue for VerbsQueue {
    fn limits(&self) -> QueueLimits {
        self.limits
    }

    unsafe fn register_raw(&self, addr: *mut u8, len: usize, access: AccessFlags) -> Result<LocalMemoryRegion<'static>> {
        register_with(self.qp.pd(), addr, len, access)
    }

    fn post_send(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
        self.post(wr_id, sges, SendOp::Send)
    }

    fn post_recv(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
        let sges = to_sges(sges)?;
        self.qp.post_recv(wr_id, &sges).map_err(|e| map_hw_error(e, "recv"))
    }

    fn post_write(&mut self, wr_id: u64, sges: &[Segment], remote_addr: u64, rkey: u64) -> Result<()> {
        let rkey = key32(rkey)?;
        self.post(wr_id, sges, SendOp::RdmaWrite { remote_addr, rkey })
    }

    fn post_read(&mut self, wr_id: u64, sges: &[Segment], remote_addr: u64, rkey: u64) -> Result<()> {
        let rkey = key32(rkey)?;
        self.post(wr_id, sges, SendOp::RdmaRead { remote_addr, rkey })
    }

    fn poll_send(&mut self) -> Result<Option<WorkCompletion>> {
        Ok(self.qp.send_cq().poll_one().map(convert))
    }

    fn poll_recv(&mut self) -> Result<Option<WorkCompletion>> {
        Ok(self.qp.recv_cq().poll_one().map(convert))
    }
}
