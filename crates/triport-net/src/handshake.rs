//! The fixed-size record peers exchange while establishing a channel.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ConnectionError, Error, Result};

/// Capacity of the raw address field.
pub const HANDSHAKE_ADDR_CAPACITY: usize = 32;

/// Encoded size; fits the 56-byte private data of a CM connect request.
pub const HANDSHAKE_RECORD_SIZE: usize = HANDSHAKE_ADDR_CAPACITY + 3 * 8;

/// Control tag reserved for fabric connection requests and replies.
pub const TAG_CONTROL: u64 = 1;

/// Sender's address, the address length, an opaque descriptor and a
/// correlation tag. Native-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRecord {
    addr: [u8; HANDSHAKE_ADDR_CAPACITY],
    pub addrlen: u64,
    pub desc: u64,
    pub tag: u64,
}

impl HandshakeRecord {
    pub fn new(raw_addr: &[u8], desc: u64, tag: u64) -> Result<Self> {
        if raw_addr.len() > HANDSHAKE_ADDR_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "raw address of {} bytes exceeds {}",
                raw_addr.len(),
                HANDSHAKE_ADDR_CAPACITY
            )));
        }
        let mut addr = [0u8; HANDSHAKE_ADDR_CAPACITY];
        addr[..raw_addr.len()].copy_from_slice(raw_addr);
        Ok(Self {
            addr,
            addrlen: raw_addr.len() as u64,
            desc,
            tag,
        })
    }

    /// A reply: the responder's own address with the address length it
    /// observed in the request.
    pub fn reply_to(request: &HandshakeRecord, raw_addr: &[u8], desc: u64) -> Result<Self> {
        let mut reply = Self::new(raw_addr, desc, request.tag)?;
        reply.addrlen = request.addrlen;
        Ok(reply)
    }

    /// The address bytes, bounded by the field capacity.
    pub fn raw_addr(&self) -> &[u8] {
        let len = (self.addrlen as usize).min(HANDSHAKE_ADDR_CAPACITY);
        &self.addr[..len]
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_RECORD_SIZE] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_RECORD_SIZE);
        buf.put_slice(&self.addr);
        buf.put_u64_ne(self.addrlen);
        buf.put_u64_ne(self.desc);
        buf.put_u64_ne(self.tag);
        let mut out = [0u8; HANDSHAKE_RECORD_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HANDSHAKE_RECORD_SIZE {
            return Err(Error::ShortTransfer {
                expected: HANDSHAKE_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let mut addr = [0u8; HANDSHAKE_ADDR_CAPACITY];
        bytes.copy_to_slice(&mut addr);
        Ok(Self {
            addr,
            addrlen: bytes.get_u64_ne(),
            desc: bytes.get_u64_ne(),
            tag: bytes.get_u64_ne(),
        })
    }

    /// Check a reply against the request this side sent.
    pub fn validate_reply(&self, request: &HandshakeRecord, peer: &str) -> Result<()> {
        if self.addrlen != request.addrlen {
            return Err(ConnectionError::Rejected {
                peer: peer.to_string(),
                reason: format!(
                    "asymmetric addressing: sent {} byte address, peer observed {}",
                    request.addrlen, self.addrlen
                ),
            }
            .into());
        }
        if self.tag != request.tag {
            return Err(ConnectionError::Rejected {
                peer: peer.to_string(),
                reason: format!("tag mismatch: sent {}, got {}", request.tag, self.tag),
            }
            .into());
        }
        Ok(())
    }
}
