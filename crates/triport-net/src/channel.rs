//! The data-plane contract shared by every substrate.

use crate::error::{Error, Result};
use crate::memory::{
    decode_regions, encode_regions, AccessFlags, LocalMemoryRegion, RemoteMemoryRegion,
    REMOTE_REGION_WIRE_SIZE,
};

/// A connected, point-to-point endpoint.
///
/// Every transfer either moves the full requested length and returns it, or
/// fails. Two-sided operations on one channel are delivered in order.
pub trait Channel: Send {
    /// The opaque descriptor the peer announced during the handshake.
    fn peer_desc(&self) -> u64;

    /// Register `buf` for use with this channel.
    fn register_memory_region<'a>(
        &self,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<LocalMemoryRegion<'a>>;

    fn send(&mut self, buf: &[u8]) -> Result<usize>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn send_region(&mut self, region: &LocalMemoryRegion<'_>) -> Result<usize> {
        self.send_v(std::slice::from_ref(region))
    }

    fn recv_region(&mut self, region: &mut LocalMemoryRegion<'_>) -> Result<usize> {
        self.recv_v(std::slice::from_mut(region))
    }

    /// Send the concatenation of `regions` as one message.
    fn send_v(&mut self, regions: &[LocalMemoryRegion<'_>]) -> Result<usize>;

    /// Receive one message scattered across `regions`.
    fn recv_v(&mut self, regions: &mut [LocalMemoryRegion<'_>]) -> Result<usize>;

    /// One-sided write of `local` into the peer's `remote` region.
    fn write(&mut self, local: &LocalMemoryRegion<'_>, remote: &RemoteMemoryRegion) -> Result<usize> {
        self.write_v(std::slice::from_ref(local), remote)
    }

    /// One-sided read of the peer's `remote` region into `local`.
    fn read(&mut self, local: &mut LocalMemoryRegion<'_>, remote: &RemoteMemoryRegion) -> Result<usize> {
        self.read_v(std::slice::from_mut(local), remote)
    }

    /// Gather `locals` into the contiguous `remote` range.
    fn write_v(&mut self, locals: &[LocalMemoryRegion<'_>], remote: &RemoteMemoryRegion) -> Result<usize>;

    /// Scatter the contiguous `remote` range into `locals`.
    fn read_v(&mut self, locals: &mut [LocalMemoryRegion<'_>], remote: &RemoteMemoryRegion) -> Result<usize>;

    /// Announce `regions` to the peer so it can target them with Write/Read.
    fn syn_remote_memory_regions(&mut self, regions: &[LocalMemoryRegion<'_>]) -> Result<usize> {
        let descriptors: Vec<RemoteMemoryRegion> = regions.iter().map(|r| r.to_remote()).collect();
        self.send(&encode_regions(&descriptors))
    }

    /// Receive the `count` descriptors announced by the peer's
    /// [`Channel::syn_remote_memory_regions`].
    fn ack_remote_memory_regions(&mut self, count: usize) -> Result<Vec<RemoteMemoryRegion>> {
        let mut buf = vec![0u8; count * REMOTE_REGION_WIRE_SIZE];
        self.recv(&mut buf)?;
        decode_regions(&buf, count)
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn peer_desc(&self) -> u64 {
        (**self).peer_desc()
    }

    fn register_memory_region<'a>(
        &self,
        buf: &'a mut [u8],
        access: AccessFlags,
    ) -> Result<LocalMemoryRegion<'a>> {
        (**self).register_memory_region(buf, access)
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).send(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).recv(buf)
    }

    fn send_region(&mut self, region: &LocalMemoryRegion<'_>) -> Result<usize> {
        (**self).send_region(region)
    }

    fn recv_region(&mut self, region: &mut LocalMemoryRegion<'_>) -> Result<usize> {
        (**self).recv_region(region)
    }

    fn send_v(&mut self, regions: &[LocalMemoryRegion<'_>]) -> Result<usize> {
        (**self).send_v(regions)
    }

    fn recv_v(&mut self, regions: &mut [LocalMemoryRegion<'_>]) -> Result<usize> {
        (**self).recv_v(regions)
    }

    fn write(&mut self, local: &LocalMemoryRegion<'_>, remote: &RemoteMemoryRegion) -> Result<usize> {
        (**self).write(local, remote)
    }

    fn read(&mut self, local: &mut LocalMemoryRegion<'_>, remote: &RemoteMemoryRegion) -> Result<usize> {
        (**self).read(local, remote)
    }

    fn write_v(&mut self, locals: &[LocalMemoryRegion<'_>], remote: &RemoteMemoryRegion) -> Result<usize> {
        (**self).write_v(locals, remote)
    }

    fn read_v(&mut self, locals: &mut [LocalMemoryRegion<'_>], remote: &RemoteMemoryRegion) -> Result<usize> {
        (**self).read_v(locals, remote)
    }

    fn syn_remote_memory_regions(&mut self, regions: &[LocalMemoryRegion<'_>]) -> Result<usize> {
        (**self).syn_remote_memory_regions(regions)
    }

    fn ack_remote_memory_regions(&mut self, count: usize) -> Result<Vec<RemoteMemoryRegion>> {
        (**self).ack_remote_memory_regions(count)
    }
}

/// The initiating side of a connection.
pub trait Client {
    type Channel: Channel;

    /// Connect to a listening server and return a ready channel.
    fn connect(&mut self, host: &str, port: u16) -> Result<Self::Channel>;
}

/// The listening side of a connection.
pub trait Server {
    type Channel: Channel;

    fn listen(&mut self) -> Result<()>;

    /// Block until one peer connects.
    fn accept(&mut self) -> Result<Self::Channel>;

    /// The bound port, available after [`Server::listen`].
    fn listen_port(&self) -> Option<u16>;

    /// The raw address peers use to reach this server.
    fn raw_addr(&self) -> Option<Vec<u8>>;
}

/// Check the one-sided length rule: the local side must cover the remote range.
pub fn check_rma_lengths(local_total: usize, remote: &RemoteMemoryRegion) -> Result<()> {
    if local_total as u64 != remote.length {
        return Err(Error::InvalidArgument(format!(
            "local length {} does not match remote length {}",
            local_total, remote.length
        )));
    }
    Ok(())
}
