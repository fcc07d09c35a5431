//! [`WorkQueue`] over one (peer, tag) pair of a shared endpoint.

use std::sync::Arc;

use triport_net::{AccessFlags, Error, LocalMemoryRegion, QueueLimits, Result, Segment, WorkCompletion, WorkQueue};
use triport_softnic::Sge;

use crate::endpoint::{op_context, ContextQueue, FabricEndpoint};

fn key32(key: u64) -> Result<u32> {
    u32::try_from(key).map_err(|_| Error::InvalidArgument(format!("key {key:#x} does not fit 32 bits")))
}

fn to_sges(segments: &[Segment]) -> Result<Vec<Sge>> {
    segments
        .iter()
        .map(|s| Ok(Sge::new(s.addr, s.length, key32(s.key)?)))
        .collect()
}

/// Tagged sends and receives to one peer, with completions read from this
/// queue's own context. Dropping it closes the context.
pub struct FabricQueue {
    endpoint: Arc<FabricEndpoint>,
    context: u64,
    completions: Arc<ContextQueue>,
    /// Address-vector handle of the peer.
    peer: u64,
    tag: u64,
}

impl FabricQueue {
    pub(crate) fn new(
        endpoint: Arc<FabricEndpoint>,
        context: u64,
        completions: Arc<ContextQueue>,
        peer: u64,
        tag: u64,
    ) -> Self {
        Self {
            endpoint,
            context,
            completions,
            peer,
            tag,
        }
    }

    pub fn endpoint(&self) -> &Arc<FabricEndpoint> {
        &self.endpoint
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn completions(&self) -> &Arc<ContextQueue> {
        &self.completions
    }

    fn poll(&self, pop: impl Fn(&ContextQueue) -> Option<WorkCompletion>) -> Option<WorkCompletion> {
        pop(&self.completions).or_else(|| {
            self.endpoint.progress();
            pop(&self.completions)
        })
    }
}

impl WorkQueue for FabricQueue {
    fn limits(&self) -> QueueLimits {
        self.endpoint.limits()
    }

    unsafe fn register_raw(&self, addr: *mut u8, len: usize, access: AccessFlags) -> Result<LocalMemoryRegion<'static>> {
        self.endpoint.register_raw(addr, len, access)
    }

    fn post_send(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
        let sges = to_sges(sges)?;
        let op = op_context(self.context, wr_id);
        self.endpoint
            .post_with_retry("send", |ep| ep.tsend(&sges, self.peer, self.tag, op))
    }

    fn post_recv(&mut self, wr_id: u64, sges: &[Segment]) -> Result<()> {
        let sges = to_sges(sges)?;
        let op = op_context(self.context, wr_id);
        self.endpoint
            .post_with_retry("recv", |ep| ep.trecv(&sges, self.peer, self.tag, op))
    }

    fn post_write(&mut self, wr_id: u64, sges: &[Segment], remote_addr: u64, rkey: u64) -> Result<()> {
        let sges = to_sges(sges)?;
        let key = key32(rkey)?;
        let op = op_context(self.context, wr_id);
        self.endpoint
            .post_with_retry("write", |ep| ep.write(&sges, self.peer, remote_addr, key, op))
    }

    fn post_read(&mut self, wr_id: u64, sges: &[Segment], remote_addr: u64, rkey: u64) -> Result<()> {
        let sges = to_sges(sges)?;
        let key = key32(rkey)?;
        let op = op_context(self.context, wr_id);
        self.endpoint
            .post_with_retry("read", |ep| ep.read(&sges, self.peer, remote_addr, key, op))
    }

    fn poll_send(&mut self) -> Result<Option<WorkCompletion>> {
        Ok(self.poll(ContextQueue::pop_send))
    }

    fn poll_recv(&mut self) -> Result<Option<WorkCompletion>> {
        Ok(self.poll(ContextQueue::pop_recv))
    }
}

impl Drop for FabricQueue {
    fn drop(&mut self) {
        self.endpoint.deregister_context(self.context);
    }
}
