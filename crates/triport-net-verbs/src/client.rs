use std::net::Ipv4Addr;
use std::sync::Arc;

use triport_net::{
    completion_pair, Client, Completer, ConnectionError, Disposition, Error, EventHandler, EventLoop, HandlerId,
    HandshakeRecord, PendingConnection, Protocol, Readiness, Result,
};
use triport_softnic::bridge::map_hw_error;
use triport_softnic::{CmEvent, CmEventKind, CmId, EventChannel};
use triport_types::{Address, Provider};

use crate::channel::VerbsChannel;
use crate::context::VerbsContext;
use crate::event_loop::VerbsEventLoop;
use crate::queue::VerbsQueue;

/// Connects to verbs servers through the connection manager.
#[derive(Debug, Clone)]
pub struct VerbsClient {
    ctx: Arc<VerbsContext>,
    self_desc: u64,
}

/// A connect request in flight.
struct Outgoing {
    cm_id: CmId,
    protocol: Protocol<VerbsQueue>,
    request: HandshakeRecord,
    dest: Address,
}

impl Outgoing {
    /// Turn the connection manager's answer into a channel.
    fn finish(self, event: &CmEvent, events: Arc<EventChannel>) -> Result<VerbsChannel> {
        let peer = self.dest.to_string();
        match event.kind {
            CmEventKind::Established => {
                let reply = HandshakeRecord::decode(&event.private_data)?;
                reply.validate_reply(&self.request, &peer)?;
                tracing::info!(%peer, cm_id = self.cm_id.id(), peer_desc = reply.desc, "verbs connected");
                Ok(VerbsChannel::new(self.protocol, self.cm_id, events, self.dest, reply.desc))
            }
            CmEventKind::Rejected if event.private_data.is_empty() => {
                tracing::warn!(%peer, "verbs connect refused");
                Err(ConnectionError::Refused { peer }.into())
            }
            CmEventKind::Rejected => Err(ConnectionError::Rejected {
                peer,
                reason: String::from_utf8_lossy(&event.private_data).into_owned(),
            }
            .into()),
            CmEventKind::Unreachable => Err(ConnectionError::Unreachable {
                peer,
                reason: "no route to port".into(),
            }
            .into()),
            other => Err(ConnectionError::Rejected {
                peer,
                reason: format!("unexpected {other:?} while connecting"),
            }
            .into()),
        }
    }
}

impl VerbsClient {
    pub fn new(ctx: Arc<VerbsContext>, self_desc: u64) -> Self {
        Self { ctx, self_desc }
    }

    pub fn context(&self) -> &Arc<VerbsContext> {
        &self.ctx
    }

    /// Create the id and session, then send the connect request. The answer
    /// arrives on `events`.
    fn start(&self, host: &str, port: u16, events: &Arc<EventChannel>) -> Result<Outgoing> {
        let dest = Address::resolve(host, port, Provider::Verbs).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let cm_id = CmId::create(self.ctx.net(), events);
        let local = cm_id
            .bind(Address::new(u32::from(Ipv4Addr::LOCALHOST), 0, Provider::Verbs))
            .map_err(|e| map_hw_error(e, "cm"))?;
        let protocol = self.ctx.create_session(&cm_id)?;
        let request = HandshakeRecord::new(&local.to_raw(), self.self_desc, 0)?;
        cm_id
            .connect(dest, &request.encode())
            .map_err(|e| map_hw_error(e, "cm"))?;
        tracing::debug!(%dest, %local, cm_id = cm_id.id(), "verbs connect requested");
        Ok(Outgoing {
            cm_id,
            protocol,
            request,
            dest,
        })
    }

    /// Start a connect that completes inside `event_loop.wait_all`.
    pub fn connect_nonblocking(
        &mut self,
        host: &str,
        port: u16,
        event_loop: &mut VerbsEventLoop,
    ) -> Result<PendingConnection<VerbsChannel>> {
        let outgoing = self.start(host, port, event_loop.channel())?;
        let (completer, token) = completion_pair();
        event_loop.add_handler(Box::new(ConnectHandler {
            id: outgoing.cm_id.id(),
            outgoing: Some(outgoing),
            completer: Some(completer),
        }));
        Ok(PendingConnection::new(token))
    }
}

impl Client for VerbsClient {
    type Channel = VerbsChannel;

    fn connect(&mut self, host: &str, port: u16) -> Result<VerbsChannel> {
        let events = EventChannel::new();
        let outgoing = self.start(host, port, &events)?;
        let event = events
            .get_event(self.ctx.config().connect_timeout())
            .ok_or(Error::TimedOut)?;
        outgoing.finish(&event, events)
    }
}

struct ConnectHandler {
    id: u64,
    outgoing: Option<Outgoing>,
    completer: Option<Completer<VerbsChannel>>,
}

impl ConnectHandler {
    fn complete(&mut self, event: CmEvent) -> Disposition {
        if let (Some(outgoing), Some(completer)) = (self.outgoing.take(), self.completer.take()) {
            completer.complete(outgoing.finish(&event, EventChannel::new()));
        }
        Disposition::MayBeRemoved
    }
}

impl EventHandler<CmEvent> for ConnectHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Connection(self.id)
    }

    fn interest(&self) -> Readiness {
        Readiness::READABLE
    }

    fn on_event(&mut self, event: CmEvent) -> Disposition {
        self.complete(event)
    }

    fn on_error(&mut self, event: CmEvent) -> Disposition {
        self.complete(event)
    }
}
