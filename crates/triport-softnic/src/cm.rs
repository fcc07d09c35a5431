//! The connection manager: event channels and communication identifiers.
//!
//! A client id connects to a listening id by port. The listener receives a
//! `ConnectRequest` carrying a fresh id for the new connection; accepting it
//! links the two queue pairs and posts `Established` to both sides.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use triport_types::Address;

use crate::cq::CompletionQueue;
use crate::net::SoftNet;
use crate::verbs::{ProtectionDomain, QpCaps, QueuePair};
use crate::HwError;

/// Private data carried by connect, accept and reject.
pub const CM_PRIVATE_DATA_LEN: usize = 56;

const LOOPBACK: u32 = 0x7f00_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    ConnectRequest,
    Established,
    Rejected,
    Unreachable,
    Disconnected,
}

pub struct CmEvent {
    pub kind: CmEventKind,
    /// The id this event concerns. For a connect request, the new id.
    pub id: u64,
    /// The listening id a connect request arrived on.
    pub listen_id: Option<u64>,
    pub private_data: Vec<u8>,
    /// The new connection's id, on connect requests only.
    pub request: Option<CmId>,
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("listen_id", &self.listen_id)
            .field("private_data", &self.private_data.len())
            .finish()
    }
}

#[derive(Default)]
pub struct EventChannel {
    events: Mutex<VecDeque<CmEvent>>,
    cond: Condvar,
}

impl EventChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: CmEvent) {
        tracing::trace!(?event, "cm event");
        self.events.lock().push_back(event);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_get_event(&self) -> Option<CmEvent> {
        self.events.lock().pop_front()
    }

    /// Block until an event arrives. `None` after `timeout` elapses.
    pub fn get_event(&self, timeout: Option<Duration>) -> Option<CmEvent> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut events, deadline).timed_out() {
                        return events.pop_front();
                    }
                }
                None => self.cond.wait(&mut events),
            }
        }
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel").field("pending", &self.len()).finish()
    }
}

#[derive(Default)]
struct CmState {
    local: Option<Address>,
    remote: Option<Address>,
    listening: bool,
    connected: bool,
    qp: Option<Arc<QueuePair>>,
    peer: Option<Weak<CmShared>>,
}

pub(crate) struct CmShared {
    net: Arc<SoftNet>,
    id: u64,
    channel: Mutex<Weak<EventChannel>>,
    state: Mutex<CmState>,
}

impl CmShared {
    fn post(&self, kind: CmEventKind, private_data: Vec<u8>) {
        self.post_event(CmEvent {
            kind,
            id: self.id,
            listen_id: None,
            private_data,
            request: None,
        });
    }

    fn post_event(&self, event: CmEvent) {
        let channel = self.channel.lock().upgrade();
        match channel {
            Some(channel) => channel.push(event),
            None => tracing::debug!(id = self.id, ?event, "event channel gone; dropping event"),
        }
    }
}

/// A listening id registered under its port.
pub(crate) struct Listener {
    pub addr: Address,
    pub id: Weak<CmShared>,
}

/// A connection-manager identifier.
pub struct CmId {
    shared: Arc<CmShared>,
}

impl CmId {
    pub fn create(net: &Arc<SoftNet>, channel: &Arc<EventChannel>) -> CmId {
        CmId {
            shared: Arc::new(CmShared {
                net: net.clone(),
                id: net.next_id(),
                channel: Mutex::new(Arc::downgrade(channel)),
                state: Mutex::new(CmState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.shared.state.lock().local
    }

    pub fn remote_addr(&self) -> Option<Address> {
        self.shared.state.lock().remote
    }

    pub fn qp(&self) -> Option<Arc<QueuePair>> {
        self.shared.state.lock().qp.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Bind to `addr`; port 0 picks an ephemeral port.
    pub fn bind(&self, addr: Address) -> Result<Address, HwError> {
        let net = &self.shared.net;
        let mut addr = addr;
        if addr.port == 0 {
            addr.port = net.allocate_port(|port| net.listeners.contains_key(&port))?;
        }
        self.shared.state.lock().local = Some(addr);
        Ok(addr)
    }

    pub fn listen(&self, backlog: usize) -> Result<(), HwError> {
        let local = self
            .local_addr()
            .ok_or_else(|| HwError::InvalidArgument("bind before listen".into()))?;
        let listener = Listener {
            addr: local,
            id: Arc::downgrade(&self.shared),
        };
        match self.shared.net.listeners.entry(local.port) {
            Entry::Occupied(mut entry) => {
                if entry.get().id.strong_count() > 0 {
                    return Err(HwError::AddrInUse(local.to_string()));
                }
                entry.insert(listener);
            }
            Entry::Vacant(entry) => {
                entry.insert(listener);
            }
        }
        self.shared.state.lock().listening = true;
        tracing::debug!(id = self.id(), %local, backlog, "listening");
        Ok(())
    }

    pub fn create_qp(
        &self,
        pd: &Arc<ProtectionDomain>,
        caps: QpCaps,
        send_cq: Arc<CompletionQueue>,
        recv_cq: Arc<CompletionQueue>,
    ) -> Result<Arc<QueuePair>, HwError> {
        let qp = QueuePair::create(pd, caps, send_cq, recv_cq)?;
        self.shared.state.lock().qp = Some(qp.clone());
        Ok(qp)
    }

    /// Start connecting to `dest`. The outcome arrives on this id's channel.
    pub fn connect(&self, dest: Address, private_data: &[u8]) -> Result<(), HwError> {
        check_private_data(private_data)?;
        if self.qp().is_none() {
            return Err(HwError::InvalidArgument(
                "create a queue pair before connecting".into(),
            ));
        }
        let local = match self.local_addr() {
            Some(local) => local,
            None => self.bind(Address::new(LOOPBACK, 0, dest.provider))?,
        };
        self.shared.state.lock().remote = Some(dest);

        if dest.port == 0 {
            self.shared.post(CmEventKind::Unreachable, Vec::new());
            return Ok(());
        }
        let listener = self
            .shared
            .net
            .listeners
            .get(&dest.port)
            .filter(|l| l.addr.accepts(&dest))
            .and_then(|l| l.id.upgrade());
        let Some(listener) = listener else {
            tracing::debug!(%dest, "no listener; rejecting");
            self.shared.post(CmEventKind::Rejected, Vec::new());
            return Ok(());
        };

        let request = CmId {
            shared: Arc::new(CmShared {
                net: self.shared.net.clone(),
                id: self.shared.net.next_id(),
                channel: Mutex::new(listener.channel.lock().clone()),
                state: Mutex::new(CmState {
                    local: Some(dest),
                    remote: Some(local),
                    peer: Some(Arc::downgrade(&self.shared)),
                    ..CmState::default()
                }),
            }),
        };
        self.shared.state.lock().peer = Some(Arc::downgrade(&request.shared));
        listener.post_event(CmEvent {
            kind: CmEventKind::ConnectRequest,
            id: request.id(),
            listen_id: Some(listener.id),
            private_data: private_data.to_vec(),
            request: Some(request),
        });
        Ok(())
    }

    /// Accept a connect request, linking the queue pairs.
    pub fn accept(&self, private_data: &[u8]) -> Result<(), HwError> {
        check_private_data(private_data)?;
        let (qp, peer) = {
            let state = self.shared.state.lock();
            (state.qp.clone(), state.peer.as_ref().and_then(Weak::upgrade))
        };
        let qp = qp.ok_or_else(|| HwError::InvalidArgument("create a queue pair before accepting".into()))?;
        let peer = peer.ok_or(HwError::NotConnected)?;
        let peer_qp = peer.state.lock().qp.clone().ok_or(HwError::NotConnected)?;

        qp.connect(&peer_qp);
        self.shared.state.lock().connected = true;
        peer.state.lock().connected = true;
        peer.post(CmEventKind::Established, private_data.to_vec());
        self.shared.post(CmEventKind::Established, Vec::new());
        Ok(())
    }

    pub fn reject(&self, private_data: &[u8]) -> Result<(), HwError> {
        check_private_data(private_data)?;
        let peer = self.shared.state.lock().peer.take().and_then(|p| p.upgrade());
        let peer = peer.ok_or(HwError::NotConnected)?;
        peer.state.lock().peer = None;
        peer.post(CmEventKind::Rejected, private_data.to_vec());
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), HwError> {
        let (qp, peer) = {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(HwError::NotConnected);
            }
            state.connected = false;
            (state.qp.clone(), state.peer.take())
        };
        if let Some(qp) = qp {
            qp.disconnect();
        }
        if let Some(peer) = peer.and_then(|p| p.upgrade()) {
            {
                let mut state = peer.state.lock();
                state.connected = false;
                state.peer = None;
            }
            peer.post(CmEventKind::Disconnected, Vec::new());
        }
        tracing::debug!(id = self.id(), "disconnected");
        Ok(())
    }

    /// Deliver future events for this id to `channel`.
    pub fn migrate(&self, channel: &Arc<EventChannel>) {
        *self.shared.channel.lock() = Arc::downgrade(channel);
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        let (listening, connected, port) = {
            let state = self.shared.state.lock();
            (state.listening, state.connected, state.local.map(|a| a.port))
        };
        if listening {
            if let Some(port) = port {
                let me = Arc::as_ptr(&self.shared);
                self.shared
                    .net
                    .listeners
                    .remove_if(&port, |_, l| std::ptr::eq(l.id.as_ptr(), me));
            }
        }
        if connected {
            let _ = self.disconnect();
        }
    }
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CmId")
            .field("id", &self.shared.id)
            .field("local", &state.local)
            .field("remote", &state.remote)
            .field("listening", &state.listening)
            .field("connected", &state.connected)
            .finish()
    }
}

fn check_private_data(data: &[u8]) -> Result<(), HwError> {
    if data.len() > CM_PRIVATE_DATA_LEN {
        return Err(HwError::InvalidArgument(format!(
            "{} bytes of private data exceed {}",
            data.len(),
            CM_PRIVATE_DATA_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{Device, DeviceAttr};
    use triport_types::Provider;

    fn caps() -> QpCaps {
        QpCaps {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }

    fn with_qp(id: &CmId, pd: &Arc<ProtectionDomain>) {
        id.create_qp(pd, caps(), CompletionQueue::new(8, None), CompletionQueue::new(8, None))
            .unwrap();
    }

    fn wait(channel: &EventChannel) -> CmEvent {
        channel.get_event(Some(Duration::from_secs(5))).unwrap()
    }

    #[test]
    fn test_connect_accept_handshake() {
        let net = SoftNet::new();
        let pd = Device::open(net.clone(), "soft0", DeviceAttr::default()).alloc_pd();
        let server_channel = EventChannel::new();
        let client_channel = EventChannel::new();

        let listen = CmId::create(&net, &server_channel);
        let bound = listen
            .bind(Address::new(0, 0, Provider::Verbs))
            .unwrap();
        assert!(bound.port >= 49152);
        listen.listen(16).unwrap();

        let client = CmId::create(&net, &client_channel);
        with_qp(&client, &pd);
        let dest = Address::new(LOOPBACK, bound.port, Provider::Verbs);
        client.connect(dest, b"hello").unwrap();

        let request = wait(&server_channel);
        assert_eq!(request.kind, CmEventKind::ConnectRequest);
        assert_eq!(request.listen_id, Some(listen.id()));
        assert_eq!(request.private_data, b"hello");
        let conn = request.request.unwrap();
        assert_eq!(conn.id(), request.id);
        with_qp(&conn, &pd);
        conn.accept(b"world").unwrap();

        let established = wait(&client_channel);
        assert_eq!(established.kind, CmEventKind::Established);
        assert_eq!(established.private_data, b"world");
        assert_eq!(wait(&server_channel).kind, CmEventKind::Established);
        assert!(client.qp().unwrap().is_connected());

        drop(conn);
        let disconnected = wait(&client_channel);
        assert_eq!(disconnected.kind, CmEventKind::Disconnected);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_connect_without_listener_is_rejected() {
        let net = SoftNet::new();
        let pd = Device::open(net.clone(), "soft0", DeviceAttr::default()).alloc_pd();
        let channel = EventChannel::new();
        let client = CmId::create(&net, &channel);
        with_qp(&client, &pd);
        client
            .connect(Address::new(LOOPBACK, 4000, Provider::Verbs), &[])
            .unwrap();
        let event = wait(&channel);
        assert_eq!(event.kind, CmEventKind::Rejected);
        assert_eq!(event.id, client.id());
    }

    #[test]
    fn test_reject_carries_private_data() {
        let net = SoftNet::new();
        let pd = Device::open(net.clone(), "soft0", DeviceAttr::default()).alloc_pd();
        let channel = EventChannel::new();
        let listen = CmId::create(&net, &channel);
        let bound = listen.bind(Address::new(0, 0, Provider::Verbs)).unwrap();
        listen.listen(1).unwrap();

        let client_channel = EventChannel::new();
        let client = CmId::create(&net, &client_channel);
        with_qp(&client, &pd);
        client
            .connect(Address::new(LOOPBACK, bound.port, Provider::Verbs), &[])
            .unwrap();
        let conn = wait(&channel).request.unwrap();
        conn.reject(b"busy").unwrap();
        let event = wait(&client_channel);
        assert_eq!(event.kind, CmEventKind::Rejected);
        assert_eq!(event.private_data, b"busy");
    }

    #[test]
    fn test_listen_port_conflicts_and_release() {
        let net = SoftNet::new();
        let channel = EventChannel::new();
        let addr = Address::new(0, 7000, Provider::Verbs);
        let first = CmId::create(&net, &channel);
        first.bind(addr).unwrap();
        first.listen(1).unwrap();
        let second = CmId::create(&net, &channel);
        second.bind(addr).unwrap();
        assert!(matches!(second.listen(1), Err(HwError::AddrInUse(_))));
        drop(first);
        second.listen(1).unwrap();
    }

    #[test]
    fn test_migrate_redirects_events() {
        let net = SoftNet::new();
        let pd = Device::open(net.clone(), "soft0", DeviceAttr::default()).alloc_pd();
        let old = EventChannel::new();
        let new = EventChannel::new();
        let client = CmId::create(&net, &old);
        with_qp(&client, &pd);
        client.migrate(&new);
        client
            .connect(Address::new(LOOPBACK, 4001, Provider::Verbs), &[])
            .unwrap();
        assert!(old.is_empty());
        assert_eq!(wait(&new).kind, CmEventKind::Rejected);
    }

    #[test]
    fn test_private_data_limit() {
        let net = SoftNet::new();
        let channel = EventChannel::new();
        let id = CmId::create(&net, &channel);
        assert!(matches!(
            id.connect(Address::new(LOOPBACK, 1, Provider::Verbs), &[0u8; 57]),
            Err(HwError::InvalidArgument(_))
        ));
        assert!(channel.get_event(Some(Duration::from_millis(5))).is_none());
    }
}
