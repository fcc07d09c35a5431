//! Buffers and work request ids of the connection handshake.

use triport_net::{AccessFlags, EagerBuffer, Error, HandshakeRecord, Result, Segment, HANDSHAKE_RECORD_SIZE};
use triport_softnic::Sge;

use crate::endpoint::FabricEndpoint;

/// Handshake operations share a context with the channel they set up, so
/// their ids sit above the protocol's.
pub(crate) const WR_HANDSHAKE_SEND: u64 = 0xff00;
pub(crate) const WR_HANDSHAKE_RECV: u64 = 0xff01;

pub(crate) fn to_sge(segment: Segment) -> Result<Sge> {
    let key = u32::try_from(segment.key)
        .map_err(|_| Error::InvalidArgument(format!("key {:#x} does not fit 32 bits", segment.key)))?;
    Ok(Sge::new(segment.addr, segment.length, key))
}

/// One registered record-sized buffer per direction.
pub(crate) struct ControlBuffers {
    outgoing: EagerBuffer,
    incoming: EagerBuffer,
}

impl ControlBuffers {
    pub(crate) fn new(endpoint: &FabricEndpoint) -> Result<Self> {
        // SAFETY: an EagerBuffer keeps its allocation until the region is dropped.
        let register = |ptr: *mut u8, len: usize| unsafe { endpoint.register_raw(ptr, len, AccessFlags::LOCAL_WRITE) };
        Ok(Self {
            outgoing: EagerBuffer::new(HANDSHAKE_RECORD_SIZE, register)?,
            incoming: EagerBuffer::new(HANDSHAKE_RECORD_SIZE, register)?,
        })
    }

    /// Encode `record` into the outgoing buffer.
    pub(crate) fn stage(&mut self, record: &HandshakeRecord) -> Result<Sge> {
        self.outgoing
            .bytes_mut(HANDSHAKE_RECORD_SIZE)
            .copy_from_slice(&record.encode());
        to_sge(self.outgoing.segment(HANDSHAKE_RECORD_SIZE))
    }

    pub(crate) fn incoming(&self) -> Result<Sge> {
        to_sge(self.incoming.segment(HANDSHAKE_RECORD_SIZE))
    }

    /// Decode the `len` bytes a control receive delivered.
    pub(crate) fn received(&self, len: usize) -> Result<HandshakeRecord> {
        HandshakeRecord::decode(self.incoming.bytes(len))
    }
}
