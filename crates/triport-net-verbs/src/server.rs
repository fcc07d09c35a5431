use std::sync::Arc;

use triport_net::{
    completion_pair, Completer, CompletionToken, ConnectionError, Disposition, Error, EventHandler, EventLoop,
    HandlerId, HandshakeRecord, PendingConnection, Readiness, Result, Server,
};
use triport_softnic::bridge::map_hw_error;
use triport_softnic::{CmEvent, CmEventKind, CmId, EventChannel};
use triport_types::{Address, Provider};

use crate::channel::VerbsChannel;
use crate::context::VerbsContext;
use crate::event_loop::VerbsEventLoop;

/// A listening connection-manager id.
#[derive(Debug)]
pub struct VerbsServer {
    ctx: Arc<VerbsContext>,
    bind_addr: Address,
    self_desc: u64,
    events: Arc<EventChannel>,
    listen_id: Option<Arc<CmId>>,
    local: Option<Address>,
}

impl VerbsServer {
    pub fn new(ctx: Arc<VerbsContext>, host: &str, port: u16) -> Result<Self> {
        let bind_addr =
            Address::resolve(host, port, Provider::Verbs).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Ok(Self {
            ctx,
            bind_addr,
            self_desc: 0,
            events: EventChannel::new(),
            listen_id: None,
            local: None,
        })
    }

    /// The descriptor announced to every accepted peer.
    pub fn with_desc(mut self, desc: u64) -> Self {
        self.self_desc = desc;
        self
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.local
    }

    fn listening(&self) -> Result<(Arc<CmId>, Address)> {
        match (&self.listen_id, self.local) {
            (Some(id), Some(local)) => Ok((id.clone(), local)),
            _ => Err(Error::InvalidArgument("server is not listening".into())),
        }
    }

    /// Accept inside `event_loop.wait_all` once a connect request arrives.
    /// A request already queued on the server is answered right away.
    pub fn accept_nonblocking(&mut self, event_loop: &mut VerbsEventLoop) -> Result<PendingConnection<VerbsChannel>> {
        let (listen_id, local) = self.listening()?;
        while let Some(event) = self.events.try_get_event() {
            if event.kind == CmEventKind::ConnectRequest {
                let result = accept_request(&self.ctx, event, local, self.self_desc);
                return Ok(PendingConnection::new(CompletionToken::ready(result)));
            }
            tracing::warn!(?event, "unexpected event on listener");
        }
        let (completer, token) = completion_pair();
        let handler = AcceptHandler {
            ctx: self.ctx.clone(),
            listen_id: listen_id.clone(),
            home: self.events.clone(),
            local,
            self_desc: self.self_desc,
            completer: Some(completer),
        };
        if !event_loop.add_handler(Box::new(handler)) {
            return Ok(PendingConnection::new(CompletionToken::ready(Err(Error::WouldBlock {
                pending: 1,
            }))));
        }
        listen_id.migrate(event_loop.channel());
        Ok(PendingConnection::new(token))
    }
}

/// Refuse a connect request. Returns whether the peer was told.
fn reject(cm_id: &CmId, reason: &[u8]) -> bool {
    match cm_id.reject(reason) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, reason = %String::from_utf8_lossy(reason), "failed to reject connect request");
            false
        }
    }
}

/// Answer one connect request with this side's record and wait for the
/// connection to be established.
fn accept_request(ctx: &VerbsContext, event: CmEvent, local: Address, self_desc: u64) -> Result<VerbsChannel> {
    let cm_id = event
        .request
        .ok_or_else(|| Error::InvalidArgument("connect request without an id".into()))?;
    let request = match HandshakeRecord::decode(&event.private_data) {
        Ok(request) => request,
        Err(e) => {
            reject(&cm_id, b"malformed handshake record");
            return Err(e);
        }
    };
    let peer = match Address::from_raw(request.raw_addr()) {
        Ok(peer) => peer,
        Err(e) => {
            reject(&cm_id, b"unreadable peer address");
            return Err(Error::InvalidArgument(e.to_string()));
        }
    };

    let events = EventChannel::new();
    cm_id.migrate(&events);
    let protocol = match ctx.create_session(&cm_id) {
        Ok(protocol) => protocol,
        Err(e) => {
            reject(&cm_id, b"out of resources");
            return Err(e);
        }
    };
    let reply = HandshakeRecord::reply_to(&request, &local.to_raw(), self_desc)?;
    cm_id.accept(&reply.encode()).map_err(|e| map_hw_error(e, "cm"))?;

    match events.get_event(ctx.config().connect_timeout()) {
        Some(ev) if ev.kind == CmEventKind::Established => {}
        Some(ev) => {
            return Err(ConnectionError::Rejected {
                peer: peer.to_string(),
                reason: format!("{:?} before established", ev.kind),
            }
            .into())
        }
        None => return Err(Error::TimedOut),
    }
    tracing::info!(%peer, cm_id = cm_id.id(), peer_desc = request.desc, "verbs accepted");
    Ok(VerbsChannel::new(protocol, cm_id, events, peer, request.desc))
}

impl Server for VerbsServer {
    type Channel = VerbsChannel;

    fn listen(&mut self) -> Result<()> {
        if self.listen_id.is_some() {
            return Ok(());
        }
        let id = CmId::create(self.ctx.net(), &self.events);
        let local = id.bind(self.bind_addr).map_err(|e| map_hw_error(e, "cm"))?;
        id.listen(self.ctx.config().listen_backlog)
            .map_err(|e| map_hw_error(e, "cm"))?;
        tracing::info!(addr = %local, "verbs server listening");
        self.local = Some(local);
        self.listen_id = Some(Arc::new(id));
        Ok(())
    }

    fn accept(&mut self) -> Result<VerbsChannel> {
        let (_, local) = self.listening()?;
        loop {
            let Some(event) = self.events.get_event(None) else {
                continue;
            };
            if event.kind == CmEventKind::ConnectRequest {
                return accept_request(&self.ctx, event, local, self.self_desc);
            }
            tracing::warn!(?event, "unexpected event on listener");
        }
    }

    fn listen_port(&self) -> Option<u16> {
        self.local.map(|a| a.port)
    }

    fn raw_addr(&self) -> Option<Vec<u8>> {
        self.local.map(|a| a.to_raw().to_vec())
    }
}

struct AcceptHandler {
    ctx: Arc<VerbsContext>,
    listen_id: Arc<CmId>,
    /// The server's own channel, restored once this accept resolves.
    home: Arc<EventChannel>,
    local: Address,
    self_desc: u64,
    completer: Option<Completer<VerbsChannel>>,
}

impl AcceptHandler {
    fn resolve(&mut self, result: Result<VerbsChannel>) -> Disposition {
        self.listen_id.migrate(&self.home);
        if let Some(completer) = self.completer.take() {
            completer.complete(result);
        }
        Disposition::MayBeRemoved
    }
}

impl EventHandler<CmEvent> for AcceptHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Connection(self.listen_id.id())
    }

    fn interest(&self) -> Readiness {
        Readiness::READABLE
    }

    fn on_event(&mut self, event: CmEvent) -> Disposition {
        if event.kind != CmEventKind::ConnectRequest {
            tracing::warn!(?event, "unexpected event on listener");
            return Disposition::Keep;
        }
        let result = accept_request(&self.ctx, event, self.local, self.self_desc);
        self.resolve(result)
    }

    fn on_error(&mut self, event: CmEvent) -> Disposition {
        tracing::warn!(?event, "listener failed");
        self.resolve(Err(ConnectionError::Closed.into()))
    }
}
