use std::fmt;
use std::sync::Arc;

use triport_net::{AccessFlags, Channel, LocalMemoryRegion, Protocol, RemoteMemoryRegion, Result, Segment};
use triport_types::Address;

use crate::endpoint::FabricEndpoint;
use crate::queue::FabricQueue;

/// A tagged conversation with one peer on a shared endpoint, driven by the
/// eager/rendezvous protocol.
///
/// Fabric endpoints are connectionless: dropping the channel closes its
/// completion context locally and the peer is not told.
pub struct FabricChannel {
    protocol: Protocol<FabricQueue>,
    peer: Address,
    peer_desc: u64,
}

fn segments(regions: &[LocalMemoryRegion<'_>]) -> Vec<Segment> {
    regions.iter().map(|r| r.segment()).collect()
}

impl FabricChannel {
    pub(crate) fn new(protocol: Protocol<FabricQueue>, peer: Address, peer_desc: u64) -> Self {
        Self {
            protocol,
            peer,
            peer_desc,
        }
    }

    pub fn peer_addr(&self) -> Address {
        self.peer
    }

    pub fn endpoint(&self) -> &Arc<FabricEndpoint> {
        self.protocol.queue().endpoint()
    }

    /// The correlation tag all of this channel's messages carry.
    pub fn tag(&self) -> u64 {
        self.protocol.queue().tag()
    }

    pub fn context(&self) -> u64 {
        self.protocol.queue().context()
    }

    /// Outstanding `(send, recv)` work requests.
    pub fn outstanding(&self) -> (usize, usize) {
        self.protocol.outstanding()
    }

    pub fn eager_threshold(&self) -> usize {
        self.protocol.eager_threshold()
    }

    /// Completions filed for this channel so far as `(send, recv)`.
    pub fn completed(&self) -> (u64, u64) {
        self.protocol.queue().completions().completed()
    }
}

impl Channel for FabricChannel {
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

impl fmt::Debug for FabricChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricChannel")
            .field("peer", &self.peer)
            .field("tag", &self.tag())
            .field("peer_desc", &self.peer_desc)
            .field("outstanding", &self.protocol.outstanding())
            .finish()
    }
}
