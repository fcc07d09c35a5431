use std::fmt;
use std::sync::Arc;

use triport_net::{
    AccessFlags, Channel, LocalMemoryRegion, Protocol, RemoteMemoryRegion, Result, Segment,
};
use triport_softnic::{CmId, EventChannel};
use triport_types::Address;

use crate::queue::VerbsQueue;

/// A connected queue pair driven by the eager/rendezvous protocol.
///
/// Transfers busy-poll the queue pair's completion queues. Dropping the
/// channel disconnects and deregisters its buffers.
pub struct VerbsChannel {
    protocol: Protocol<VerbsQueue>,
    cm_id: CmId,
    /// Receives this connection's disconnect events.
    events: Arc<EventChannel>,
    peer: Address,
    peer_desc: u64,
}

fn segments(regions: &[LocalMemoryRegion<'_>]) -> Vec<Segment> {
    regions.iter().map(|r| r.segment()).collect()
}

impl VerbsChannel {
    pub(crate) fn new(
        protocol: Protocol<VerbsQueue>,
        cm_id: CmId,
        events: Arc<EventChannel>,
        peer: Address,
        peer_desc: u64,
    ) -> Self {
        cm_id.migrate(&events);
        Self {
            protocol,
            cm_id,
            events,
            peer,
            peer_desc,
        }
    }

    pub fn peer_addr(&self) -> Address {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.cm_id.is_connected()
    }

    /// Outstanding `(send, recv)` work requests.
    pub fn outstanding(&self) -> (usize, usize) {
        self.protocol.outstanding()
    }

    pub fn eager_threshold(&self) -> usize {
        self.protocol.eager_threshold()
    }

    /// Connection-manager events seen since the channel was established.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

impl Channel for VerbsChannel {
    fn peer_desc(&self) -> u64 {
        self.peer_desc
    }

    fn register_memory_region<'a>(&self, buf: &'a mut [u8], access: AccessFlags) -> Result<LocalMemoryRegion<'a>> {
        self.protocol.register(buf, access)
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.protocol.send_bytes(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.protocol.recv_bytes(buf)
    }

    fn send_v(&mut self, regions: &[LocalMemoryRegion<'_>]) -> Result<usize> {
        self.protocol.send_segments(&segments(regions))
    }

    fn recv_v(&mut self, regions: &mut [LocalMemoryRegion<'_>]) -> Result<usize> {
        self.protocol.recv_segments(&segments(regions))
    }

    fn write_v(&mut self, locals: &[LocalMemoryRegion<'_>], remote: &RemoteMemoryRegion) -> Result<usize> {
        self.protocol.write_segments(&segments(locals), remote)
    }

    fn read_v(&mut self, locals: &mut [LocalMemoryRegion<'_>], remote: &RemoteMemoryRegion) -> Result<usize> {
        self.protocol.read_segments(&segments(locals), remote)
    }
}

impl Drop for VerbsChannel {
    fn drop(&mut self) {
        if self.cm_id.is_connected() {
            if let Err(e) = self.cm_id.disconnect() {
                tracing::debug!(peer = %self.peer, error = %e, "disconnect failed");
            }
        }
    }
}

impl fmt::Debug for VerbsChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsChannel")
            .field("cm_id", &self.cm_id.id())
            .field("peer", &self.peer)
            .field("peer_desc", &self.peer_desc)
            .field("outstanding", &self.protocol.outstanding())
            .finish()
    }
}
