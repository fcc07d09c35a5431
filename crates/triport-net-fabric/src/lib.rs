//! Reliable-datagram fabric substrate for triport.
//!
//! Channels share one [`FabricEndpoint`] per side and are told apart by a
//! correlation tag agreed in a control-tag handshake. Each channel runs the
//! eager/rendezvous protocol over tagged messages to its peer.

mod channel;
mod client;
mod config;
mod control;
mod endpoint;
mod event_loop;
mod queue;
mod server;

pub use channel::FabricChannel;
pub use client::FabricClient;
pub use config::FabricConfig;
pub use endpoint::{ContextQueue, Direction, FabricEndpoint};
pub use event_loop::{FabricEvent, FabricEventLoop};
pub use queue::FabricQueue;
pub use server::FabricServer;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use triport_net::{AccessFlags, Channel, Client, Error, EventLoop, HandshakeState, Server};
    use triport_softnic::{FabricAttr, Signal, SoftNet};

    fn small_config() -> FabricConfig {
        FabricConfig {
            max_send_wr: 4,
            max_recv_wr: 4,
            iov_limit: 2,
            rma_iov_limit: 2,
            eager_threshold: 32,
            chunk_size: 64,
            completion_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            attr: FabricAttr {
                iov_limit: 2,
                rma_iov_limit: 2,
                tx_size: 16,
                rx_size: 64,
                ..FabricAttr::default()
            },
        }
    }

    fn client(net: &Arc<SoftNet>, desc: u64) -> FabricClient {
        let endpoint = FabricEndpoint::open(net.clone(), "127.0.0.1", 0, small_config()).unwrap();
        FabricClient::new(endpoint, desc)
    }

    fn connected(net: &Arc<SoftNet>) -> (FabricChannel, FabricChannel) {
        triport_logging::try_init_test_logging();
        let mut server = FabricServer::new(net.clone(), "127.0.0.1", 0, small_config())
            .unwrap()
            .with_desc(9);
        server.listen().unwrap();
        let port = server.listen_port().unwrap();
        let handle = thread::spawn(move || {
            let channel = server.accept().unwrap();
            (channel, server)
        });
        let a = client(net, 7).connect("127.0.0.1", port).unwrap();
        let (b, _server) = handle.join().unwrap();
        (a, b)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_handshake_agrees_on_tag() {
        let net = SoftNet::new();
        let (a, b) = connected(&net);
        assert_eq!(a.peer_desc(), 9);
        assert_eq!(b.peer_desc(), 7);
        assert_eq!(a.tag(), b.tag());
        assert!(a.tag() > triport_net::TAG_CONTROL);
        assert_eq!(b.peer_addr(), a.endpoint().address());
    }

    #[test]
    fn test_roundtrip_eager_and_rendezvous() {
        let net = SoftNet::new();
        let (mut a, mut b) = connected(&net);
        for (i, len) in [1usize, 32, 33, 500, 10_000].into_iter().enumerate() {
            let data = pattern(len, i as u8);
            let mut out = vec![0u8; len];
            assert_eq!(a.send(&data).unwrap(), len);
            assert_eq!(b.recv(&mut out).unwrap(), len);
            assert_eq!(out, data, "a->b len {len}");

            out.fill(0);
            assert_eq!(b.send(&data).unwrap(), len);
            assert_eq!(a.recv(&mut out).unwrap(), len);
            assert_eq!(out, data, "b->a len {len}");
        }
        assert_eq!(a.outstanding(), (0, 1));
    }

    #[test]
    fn test_eager_boundary_registrations() {
        let net = SoftNet::new();
        let (mut a, mut b) = connected(&net);
        let threshold = a.eager_threshold();
        let before = net.registration_count();

        let small = pattern(threshold, 1);
        let mut out = vec![0u8; threshold];
        for _ in 0..1000 {
            a.send(&small).unwrap();
            b.recv(&mut out).unwrap();
        }
        assert_eq!(net.registration_count(), before);

        let large = pattern(threshold + 1, 2);
        let mut out = vec![0u8; threshold + 1];
        a.send(&large).unwrap();
        b.recv(&mut out).unwrap();
        assert_eq!(net.registration_count(), before + 2);
        assert_eq!(out, large);
    }

    #[test]
    fn test_channels_on_one_endpoint_stay_apart() {
        let net = SoftNet::new();
        let mut server = FabricServer::new(net.clone(), "127.0.0.1", 0, small_config())
            .unwrap()
            .with_desc(1);
        server.listen().unwrap();
        let port = server.listen_port().unwrap();
        let handle = thread::spawn(move || {
            let first = server.accept().unwrap();
            let second = server.accept().unwrap();
            (first, second)
        });
        let mut shared = client(&net, 2);
        let mut a1 = shared.connect("127.0.0.1", port).unwrap();
        let mut a2 = shared.connect("127.0.0.1", port).unwrap();
        let (mut b1, mut b2) = handle.join().unwrap();
        assert_ne!(a1.tag(), a2.tag());

        a2.send(b"second").unwrap();
        a1.send(b"first!").unwrap();
        let mut out = [0u8; 6];
        b1.recv(&mut out).unwrap();
        assert_eq!(&out, b"first!");
        b2.recv(&mut out).unwrap();
        assert_eq!(&out, b"second");
    }

    #[test]
    fn test_scatter_gather_and_rma() {
        let net = SoftNet::new();
        let (mut a, mut b) = connected(&net);

        let sizes = [5usize, 40, 70, 3];
        let total: usize = sizes.iter().sum();
        let data = pattern(total, 3);
        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut offset = 0;
        for size in sizes {
            parts.push(data[offset..offset + size].to_vec());
            offset += size;
        }
        {
            let regions: Vec<_> = parts
                .iter_mut()
                .map(|p| a.register_memory_region(p, AccessFlags::LOCAL_READ).unwrap())
                .collect();
            assert_eq!(a.send_v(&regions).unwrap(), total);
        }
        let mut whole = vec![0u8; total];
        assert_eq!(b.recv(&mut whole).unwrap(), total);
        assert_eq!(whole, data);

        let mut target = vec![0u8; total];
        let region = b
            .register_memory_region(&mut target, AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ)
            .unwrap();
        b.syn_remote_memory_regions(std::slice::from_ref(&region)).unwrap();
        let remote = a.ack_remote_memory_regions(1).unwrap()[0];
        {
            let locals: Vec<_> = parts
                .iter_mut()
                .map(|p| a.register_memory_region(p, AccessFlags::LOCAL_READ).unwrap())
                .collect();
            assert_eq!(a.write_v(&locals, &remote).unwrap(), total);
        }
        let mut back = vec![0u8; total];
        {
            let mut local = a.register_memory_region(&mut back, AccessFlags::LOCAL_WRITE).unwrap();
            assert_eq!(a.read(&mut local, &remote).unwrap(), total);
        }
        assert_eq!(back, data);
        a.send(&[0]).unwrap();
        b.recv(&mut [0u8; 1]).unwrap();
        drop(region);
        assert_eq!(target, data);
    }

    #[test]
    fn test_connect_to_unbound_name_is_refused() {
        triport_logging::try_init_test_logging();
        let net = SoftNet::new();
        let mut server = FabricServer::new(net.clone(), "127.0.0.1", 0, small_config()).unwrap();
        // Not listening yet, so nothing is bound at the server's name.
        assert!(server.listen_port().is_none());
        let err = client(&net, 1).connect("127.0.0.1", 6123).unwrap_err();
        assert!(err.is_retryable(), "{err}");
        server.listen().unwrap();
        assert!(server.raw_addr().is_some());
    }

    #[test]
    fn test_nonblocking_handshake_on_shared_signal() {
        triport_logging::try_init_test_logging();
        let net = SoftNet::new();
        let signal = Signal::new();
        let mut server = FabricServer::new(net.clone(), "127.0.0.1", 0, small_config())
            .unwrap()
            .with_desc(3)
            .with_signal(signal.clone());
        server.listen().unwrap();
        let port = server.listen_port().unwrap();
        let endpoint = FabricEndpoint::open_with_signal(net.clone(), "127.0.0.1", 0, small_config(), signal.clone())
            .unwrap();
        let mut client = FabricClient::new(endpoint, 4);

        let mut event_loop = FabricEventLoop::new(signal);
        let accepting = server.accept_nonblocking(&mut event_loop).unwrap();
        let connecting = client.connect_nonblocking("127.0.0.1", port, &mut event_loop).unwrap();
        assert_eq!(accepting.state(), HandshakeState::Pending);
        event_loop.wait_all(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(accepting.state(), HandshakeState::Connected);
        assert_eq!(connecting.state(), HandshakeState::Connected);
        let mut a = connecting.take().unwrap().unwrap();
        let mut b = accepting.take().unwrap().unwrap();
        assert_eq!((a.peer_desc(), b.peer_desc()), (3, 4));

        let data = pattern(300, 8);
        let mut out = vec![0u8; 300];
        b.send(&data).unwrap();
        a.recv(&mut out).unwrap();
        assert_eq!(out, data);

        // The control receive was re-posted for the next blocking accept.
        let handle = thread::spawn(move || server.accept().map(|c| c.peer_desc()));
        client.connect("127.0.0.1", port).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 4);
    }

    #[test]
    fn test_nonblocking_refused() {
        triport_logging::try_init_test_logging();
        let net = SoftNet::new();
        let mut client = client(&net, 1);
        let mut event_loop = FabricEventLoop::for_endpoint(client.endpoint());
        let pending = client.connect_nonblocking("127.0.0.1", 6124, &mut event_loop).unwrap();
        event_loop.wait_all(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(pending.state(), HandshakeState::Rejected);
        assert!(pending.take().unwrap().unwrap_err().is_retryable());
    }

    #[test]
    fn test_loop_rejects_foreign_endpoint() {
        let net = SoftNet::new();
        let mut client = client(&net, 1);
        let mut event_loop = FabricEventLoop::new(Signal::new());
        let err = client.connect_nonblocking("127.0.0.1", 6125, &mut event_loop).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_dropped_channel_closes_context() {
        let net = SoftNet::new();
        let (a, b) = connected(&net);
        let endpoint = a.endpoint().clone();
        let contexts = endpoint.context_count();
        let (sends, _) = a.completed();
        assert!(sends >= 1);
        drop(a);
        assert_eq!(endpoint.context_count(), contexts - 1);
        drop(b);
    }
}
