use std::sync::Arc;

use parking_lot::Mutex;
use triport_net::{
    completion_pair, Completer, CompletionToken, Deadline, Disposition, Error, EventHandler, EventLoop, HandlerId,
    HandshakeRecord, PendingConnection, Protocol, Readiness, Result, Server, WorkCompletion, TAG_CONTROL,
};
use triport_softnic::{Signal, SoftNet, ADDR_UNSPEC};
use triport_types::{Address, Provider};

use crate::channel::FabricChannel;
use crate::config::FabricConfig;
use crate::control::{ControlBuffers, WR_HANDSHAKE_RECV, WR_HANDSHAKE_SEND};
use crate::endpoint::{op_context, ContextQueue, Direction, FabricEndpoint};
use crate::event_loop::{FabricEvent, FabricEventLoop};
use crate::queue::FabricQueue;

/// Accepts fabric connections on its own endpoint.
///
/// The endpoint is opened by [`listen`](Server::listen); until then the
/// address is unbound and connects to it are refused.
#[derive(Debug)]
pub struct FabricServer {
    net: Arc<SoftNet>,
    bind_addr: Address,
    config: FabricConfig,
    signal: Arc<Signal>,
    self_desc: u64,
    listener: Option<Arc<Mutex<Listener>>>,
}

/// The listening endpoint with its permanently posted control receive.
struct Listener {
    endpoint: Arc<FabricEndpoint>,
    context: u64,
    control: Arc<ContextQueue>,
    buffers: ControlBuffers,
    self_desc: u64,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint)
            .field("context", &self.context)
            .finish()
    }
}

impl Listener {
    fn post_control_recv(&mut self) -> Result<()> {
        let sge = self.buffers.incoming()?;
        let op = op_context(self.context, WR_HANDSHAKE_RECV);
        self.endpoint
            .post_with_retry("recv", |ep| ep.trecv(&[sge], ADDR_UNSPEC, TAG_CONTROL, op))
    }

    /// Answer the request a control receive delivered, then put the control
    /// receive back.
    fn accept_request(&mut self, wc: WorkCompletion) -> Result<FabricChannel> {
        let result = self.answer(wc);
        if let Err(e) = self.post_control_recv() {
            tracing::error!(error = %e, "failed to re-post fabric control receive");
        }
        result
    }

    fn answer(&mut self, wc: WorkCompletion) -> Result<FabricChannel> {
        if let Some(err) = wc.error {
            return Err(Error::Completion(err));
        }
        let request = self.buffers.received(wc.byte_len)?;
        let client = Address::from_raw(request.raw_addr()).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let peer = self.endpoint.av_insert(request.raw_addr())?;

        let (context, completions) = self.endpoint.register_context();
        let queue = FabricQueue::new(self.endpoint.clone(), context, completions, peer, request.tag);
        let protocol = Protocol::new(queue, self.endpoint.config().protocol_config())?;

        let reply = HandshakeRecord::reply_to(&request, &self.endpoint.raw_addr(), self.self_desc)?;
        let sge = self.buffers.stage(&reply)?;
        let op = op_context(self.context, WR_HANDSHAKE_SEND);
        self.endpoint
            .post_with_retry("send", |ep| ep.tsend(&[sge], peer, request.tag, op))?;
        let deadline = Deadline::after(self.endpoint.config().connect_timeout());
        let control = self.control.clone();
        let sent = self.endpoint.wait_until(&deadline, || control.pop_send())?;
        if let Some(err) = sent.error {
            return Err(Error::Completion(err));
        }
        tracing::info!(%client, tag = request.tag, peer_desc = request.desc, "fabric accepted");
        Ok(FabricChannel::new(protocol, client, request.desc))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.endpoint.deregister_context(self.context);
    }
}

impl FabricServer {
    pub fn new(net: Arc<SoftNet>, host: &str, port: u16, config: FabricConfig) -> Result<Self> {
        config.validate()?;
        let bind_addr =
            Address::resolve(host, port, Provider::Fabric).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Ok(Self {
            net,
            bind_addr,
            config,
            signal: Signal::new(),
            self_desc: 0,
            listener: None,
        })
    }

    /// The descriptor announced to every accepted peer.
    pub fn with_desc(mut self, desc: u64) -> Self {
        self.self_desc = desc;
        self
    }

    /// Bump `signal` on completions, so a loop built on it can accept.
    pub fn with_signal(mut self, signal: Arc<Signal>) -> Self {
        self.signal = signal;
        self
    }

    /// The listening endpoint, once [`listen`](Server::listen) succeeded.
    pub fn endpoint(&self) -> Option<Arc<FabricEndpoint>> {
        self.listener.as_ref().map(|l| l.lock().endpoint.clone())
    }

    fn listening(&self) -> Result<Arc<Mutex<Listener>>> {
        self.listener
            .clone()
            .ok_or_else(|| Error::InvalidArgument("server is not listening".into()))
    }

    /// Accept inside `event_loop.wait_all` once a request arrives. A request
    /// already filed is picked up on the loop's first pass.
    pub fn accept_nonblocking(&mut self, event_loop: &mut FabricEventLoop) -> Result<PendingConnection<FabricChannel>> {
        let listener = self.listening()?;
        let (endpoint, context) = {
            let l = listener.lock();
            (l.endpoint.clone(), l.context)
        };
        event_loop.watch(&endpoint)?;
        let (completer, token) = completion_pair();
        let handler = AcceptHandler {
            context,
            listener,
            completer: Some(completer),
        };
        if !event_loop.add_handler(Box::new(handler)) {
            return Ok(PendingConnection::new(CompletionToken::ready(Err(Error::WouldBlock {
                pending: 1,
            }))));
        }
        Ok(PendingConnection::new(token))
    }
}

impl Server for FabricServer {
    type Channel = FabricChannel;

    fn listen(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let endpoint = FabricEndpoint::bind(self.net.clone(), self.bind_addr, self.config.clone(), self.signal.clone())?;
        let (context, control) = endpoint.register_context();
        let buffers = ControlBuffers::new(&endpoint)?;
        let mut listener = Listener {
            endpoint,
            context,
            control,
            buffers,
            self_desc: self.self_desc,
        };
        listener.post_control_recv()?;
        tracing::info!(addr = %listener.endpoint.address(), "fabric server listening");
        self.listener = Some(Arc::new(Mutex::new(listener)));
        Ok(())
    }

    fn accept(&mut self) -> Result<FabricChannel> {
        let listener = self.listening()?;
        let mut listener = listener.lock();
        let control = listener.control.clone();
        let wc = listener
            .endpoint
            .wait_until(&Deadline::after(None), || control.pop_recv())?;
        listener.accept_request(wc)
    }

    fn listen_port(&self) -> Option<u16> {
        self.listener.as_ref().map(|l| l.lock().endpoint.address().port)
    }

    fn raw_addr(&self) -> Option<Vec<u8>> {
        self.listener.as_ref().map(|l| l.lock().endpoint.raw_addr().to_vec())
    }
}

struct AcceptHandler {
    context: u64,
    listener: Arc<Mutex<Listener>>,
    completer: Option<Completer<FabricChannel>>,
}

impl AcceptHandler {
    fn handle(&mut self, event: FabricEvent) -> Disposition {
        if event.direction != Direction::Recv {
            tracing::warn!(wr_id = event.completion.wr_id, "stray send completion on listener");
            return Disposition::Keep;
        }
        let result = self.listener.lock().accept_request(event.completion);
        if let Some(completer) = self.completer.take() {
            completer.complete(result);
        }
        Disposition::MayBeRemoved
    }
}

impl EventHandler<FabricEvent> for AcceptHandler {
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
