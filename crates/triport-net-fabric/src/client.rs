use std::sync::Arc;

use triport_net::{
    completion_pair, Client, Completer, ConnectionError, Deadline, Disposition, Error, EventHandler, EventLoop,
    HandlerId, HandshakeRecord, PendingConnection, Protocol, Readiness, Result, WorkCompletion, TAG_CONTROL,
};
use triport_types::{Address, Provider};

use crate::channel::FabricChannel;
use crate::control::{ControlBuffers, WR_HANDSHAKE_RECV, WR_HANDSHAKE_SEND};
use crate::endpoint::{is_unbound_peer, op_context, ContextQueue, Direction, FabricEndpoint};
use crate::event_loop::{FabricEvent, FabricEventLoop};
use crate::queue::FabricQueue;

/// Connects to fabric servers from one local endpoint.
#[derive(Debug, Clone)]
pub struct FabricClient {
    endpoint: Arc<FabricEndpoint>,
    self_desc: u64,
}

/// A connection request in flight: the request send and the reply receive
/// must both complete.
struct Outgoing {
    protocol: Protocol<FabricQueue>,
    completions: Arc<ContextQueue>,
    control: ControlBuffers,
    request: HandshakeRecord,
    dest: Address,
    sent: bool,
    reply: Option<HandshakeRecord>,
}

impl Outgoing {
    fn context(&self) -> u64 {
        self.protocol.queue().context()
    }

    /// Account one handshake completion. Returns true once the handshake is
    /// complete.
    fn advance(&mut self, direction: Direction, wc: WorkCompletion) -> Result<bool> {
        let peer = self.dest.to_string();
        if let Some(err) = wc.error {
            if direction == Direction::Send && is_unbound_peer(&err) {
                tracing::warn!(%peer, "fabric connect refused");
                return Err(ConnectionError::Refused { peer }.into());
            }
            return Err(Error::Completion(err));
        }
        match direction {
            Direction::Send if wc.wr_id == WR_HANDSHAKE_SEND => self.sent = true,
            Direction::Recv if wc.wr_id == WR_HANDSHAKE_RECV => {
                let reply = self.control.received(wc.byte_len)?;
                reply.validate_reply(&self.request, &peer)?;
                self.reply = Some(reply);
            }
            _ => {
                return Err(ConnectionError::Rejected {
                    peer,
                    reason: format!("unexpected {direction:?} completion {} during handshake", wc.wr_id),
                }
                .into())
            }
        }
        Ok(self.sent && self.reply.is_some())
    }

    /// Drain this connection's filed completions. Stops as soon as the
    /// handshake completes so later data stays with the protocol.
    fn drain(&mut self) -> Option<Result<()>> {
        while let Some((direction, wc)) = self.completions.pop_any() {
            match self.advance(direction, wc) {
                Ok(true) => return Some(Ok(())),
                Ok(false) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    fn finish(self) -> Result<FabricChannel> {
        let reply = self
            .reply
            .ok_or_else(|| Error::InvalidArgument("handshake finished without a reply".into()))?;
        tracing::info!(
            peer = %self.dest,
            tag = self.request.tag,
            peer_desc = reply.desc,
            "fabric connected"
        );
        Ok(FabricChannel::new(self.protocol, self.dest, reply.desc))
    }
}

impl FabricClient {
    pub fn new(endpoint: Arc<FabricEndpoint>, self_desc: u64) -> Self {
        Self { endpoint, self_desc }
    }

    pub fn endpoint(&self) -> &Arc<FabricEndpoint> {
        &self.endpoint
    }

    pub fn self_desc(&self) -> u64 {
        self.self_desc
    }

    /// Insert the server, post the reply receive on a fresh tag, then send
    /// the request on the control tag.
    fn start(&self, host: &str, port: u16) -> Result<Outgoing> {
        let dest = Address::resolve(host, port, Provider::Fabric).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        if dest.is_unspecified() {
            return Err(Error::InvalidArgument(format!("cannot connect to unspecified {dest}")));
        }
        let endpoint = &self.endpoint;
        let peer = endpoint.av_insert(&dest.to_raw())?;
        let tag = endpoint.alloc_tag();
        let (context, completions) = endpoint.register_context();
        let queue = FabricQueue::new(endpoint.clone(), context, completions.clone(), peer, tag);

        let mut control = ControlBuffers::new(endpoint)?;
        let request = HandshakeRecord::new(&endpoint.raw_addr(), self.self_desc, tag)?;
        let reply_sge = control.incoming()?;
        endpoint.post_with_retry("recv", |ep| {
            ep.trecv(&[reply_sge], peer, tag, op_context(context, WR_HANDSHAKE_RECV))
        })?;
        let request_sge = control.stage(&request)?;
        endpoint.post_with_retry("send", |ep| {
            ep.tsend(&[request_sge], peer, TAG_CONTROL, op_context(context, WR_HANDSHAKE_SEND))
        })?;
        // The protocol's first eager receive lands behind the reply receive.
        let protocol = Protocol::new(queue, endpoint.config().protocol_config())?;
        tracing::debug!(%dest, tag, context, "fabric connect requested");
        Ok(Outgoing {
            protocol,
            completions,
            control,
            request,
            dest,
            sent: false,
            reply: None,
        })
    }

    /// Start a connect that completes inside `event_loop.wait_all`.
    pub fn connect_nonblocking(
        &mut self,
        host: &str,
        port: u16,
        event_loop: &mut FabricEventLoop,
    ) -> Result<PendingConnection<FabricChannel>> {
        event_loop.watch(&self.endpoint)?;
        let outgoing = self.start(host, port)?;
        let (completer, token) = completion_pair();
        event_loop.add_handler(Box::new(ConnectHandler {
            context: outgoing.context(),
            outgoing: Some(outgoing),
            completer: Some(completer),
        }));
        Ok(PendingConnection::new(token))
    }
}

impl Client for FabricClient {
    type Channel = FabricChannel;

    fn connect(&mut self, host: &str, port: u16) -> Result<FabricChannel> {
        let mut outgoing = self.start(host, port)?;
        let deadline = Deadline::after(self.endpoint.config().connect_timeout());
        self.endpoint.wait_until(&deadline, || outgoing.drain())??;
        outgoing.finish()
    }
}

struct ConnectHandler {
    context: u64,
    outgoing: Option<Outgoing>,
    completer: Option<Completer<FabricChannel>>,
}

impl ConnectHandler {
    fn resolve(&mut self, result: Result<FabricChannel>) -> Disposition {
        if let Some(completer) = self.completer.take() {
            completer.complete(result);
        }
        Disposition::MayBeRemoved
    }

    fn handle(&mut self, event: FabricEvent) -> Disposition {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return Disposition::MayBeRemoved;
        };
        match outgoing.advance(event.direction, event.completion) {
            Ok(false) => Disposition::Keep,
            Ok(true) => match self.outgoing.take() {
                Some(outgoing) => {
                    let result = outgoing.finish();
                    self.resolve(result)
                }
                None => Disposition::MayBeRemoved,
            },
            Err(e) => {
                self.outgoing = None;
                self.resolve(Err(e))
            }
        }
    }
}

impl EventHandler<FabricEvent> for ConnectHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Fabric(self.context)
    }

    fn interest(&self) -> Readiness {
        Readiness::READABLE
    }

    fn on_event(&mut self, event: FabricEvent) -> Disposition {
        self.handle(event)
    }

    fn on_error(&mut self, event: FabricEvent) -> Disposition {
        self.handle(event)
    }
}
