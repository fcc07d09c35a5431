//! Provider dispatch: one set of client, server and event loop types over
//! whichever substrate the configuration selects.

use std::sync::Arc;
use std::time::Duration;

use triport_net::{Channel, Client, Error, EventLoop, HandshakeState, PendingConnection, Result, Server};
use triport_net_fabric::{FabricChannel, FabricClient, FabricEndpoint, FabricEventLoop, FabricServer};
use triport_net_tcp::{SocketChannel, SocketClient, SocketEventLoop, SocketServer};
use triport_net_verbs::{VerbsChannel, VerbsClient, VerbsContext, VerbsEventLoop, VerbsServer};
use triport_softnic::{Signal, SoftNet};
use triport_types::Provider;

use crate::config::TransportConfig;

/// Builds clients, servers and event loops for the configured provider.
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    net: Arc<SoftNet>,
    verbs: Option<Arc<VerbsContext>>,
    /// Shared by every fabric endpoint this transport opens.
    fabric_signal: Arc<Signal>,
}

impl Transport {
    pub fn new(config: TransportConfig, net: Arc<SoftNet>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let verbs = match config.provider {
            Provider::Verbs => Some(VerbsContext::open(net.clone(), config.verbs.clone())?),
            _ => None,
        };
        tracing::info!(provider = %config.provider, "transport ready");
        Ok(Self {
            config,
            net,
            verbs,
            fabric_signal: Signal::new(),
        })
    }

    pub fn provider(&self) -> Provider {
        self.config.provider
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn net(&self) -> &Arc<SoftNet> {
        &self.net
    }

    fn verbs_context(&self) -> Result<Arc<VerbsContext>> {
        self.verbs
            .clone()
            .ok_or_else(|| Error::InvalidArgument("verbs context not opened".into()))
    }

    /// A client announcing `self_desc` to every server it connects to.
    pub fn client(&self, self_desc: u64) -> Result<AnyClient> {
        Ok(match self.config.provider {
            Provider::Socket => AnyClient::Socket(SocketClient::new(self.config.socket.clone(), self_desc)?),
            Provider::Verbs => AnyClient::Verbs(VerbsClient::new(self.verbs_context()?, self_desc)),
            Provider::Fabric => {
                let endpoint = FabricEndpoint::open_with_signal(
                    self.net.clone(),
                    "",
                    0,
                    self.config.fabric.clone(),
                    self.fabric_signal.clone(),
                )?;
                AnyClient::Fabric(FabricClient::new(endpoint, self_desc))
            }
        })
    }

    /// A server that will bind `host:port` on [`listen`](Server::listen).
    pub fn server(&self, host: &str, port: u16) -> Result<AnyServer> {
        Ok(match self.config.provider {
            Provider::Socket => AnyServer::Socket(SocketServer::new(self.config.socket.clone(), host, port)?),
            Provider::Verbs => AnyServer::Verbs(VerbsServer::new(self.verbs_context()?, host, port)?),
            Provider::Fabric => AnyServer::Fabric(
                FabricServer::new(self.net.clone(), host, port, self.config.fabric.clone())?
                    .with_signal(self.fabric_signal.clone()),
            ),
        })
    }

    /// A loop that can drive non-blocking connects and accepts of this
    /// transport's clients and servers.
    pub fn event_loop(&self) -> AnyEventLoop {
        match self.config.provider {
            Provider::Socket => AnyEventLoop::Socket(SocketEventLoop::new()),
            Provider::Verbs => AnyEventLoop::Verbs(VerbsEventLoop::new()),
            Provider::Fabric => AnyEventLoop::Fabric(FabricEventLoop::new(self.fabric_signal.clone())),
        }
    }
}

fn mismatch(what: &str, expected: Provider, got: Provider) -> Error {
    Error::InvalidArgument(format!("{what} is {expected} but the event loop is {got}"))
}

#[derive(Debug, Clone)]
pub enum AnyClient {
    Socket(SocketClient),
    Verbs(VerbsClient),
    Fabric(FabricClient),
}

impl AnyClient {
    pub fn provider(&self) -> Provider {
        match self {
            AnyClient::Socket(_) => Provider::Socket,
            AnyClient::Verbs(_) => Provider::Verbs,
            AnyClient::Fabric(_) => Provider::Fabric,
        }
    }

    /// Start a connect that completes inside `event_loop.wait_all`.
    pub fn connect_nonblocking(&mut self, host: &str, port: u16, event_loop: &mut AnyEventLoop) -> Result<AnyPending> {
        let provider = self.provider();
        Ok(match (self, event_loop) {
            (AnyClient::Socket(c), AnyEventLoop::Socket(l)) => AnyPending::Socket(c.connect_nonblocking(host, port, l)?),
            (AnyClient::Verbs(c), AnyEventLoop::Verbs(l)) => AnyPending::Verbs(c.connect_nonblocking(host, port, l)?),
            (AnyClient::Fabric(c), AnyEventLoop::Fabric(l)) => AnyPending::Fabric(c.connect_nonblocking(host, port, l)?),
            (_, l) => return Err(mismatch("client", provider, l.provider())),
        })
    }
}

impl Client for AnyClient {
    type Channel = Box<dyn Channel>;

    fn connect(&mut self, host: &str, port: u16) -> Result<Box<dyn Channel>> {
        let channel: Box<dyn Channel> = match self {
            AnyClient::Socket(c) => Box::new(c.connect(host, port)?),
            AnyClient::Verbs(c) => Box::new(c.connect(host, port)?),
            AnyClient::Fabric(c) => Box::new(c.connect(host, port)?),
        };
        Ok(channel)
    }
}

#[derive(Debug)]
pub enum AnyServer {
    Socket(SocketServer),
    Verbs(VerbsServer),
    Fabric(FabricServer),
}

impl AnyServer {
    pub fn provider(&self) -> Provider {
        match self {
            AnyServer::Socket(_) => Provider::Socket,
            AnyServer::Verbs(_) => Provider::Verbs,
            AnyServer::Fabric(_) => Provider::Fabric,
        }
    }

    /// The descriptor announced to accepted peers. Sockets carry no
    /// handshake record, so their peers always see 0.
    pub fn with_desc(self, desc: u64) -> Self {
        match self {
            AnyServer::Socket(s) => AnyServer::Socket(s),
            AnyServer::Verbs(s) => AnyServer::Verbs(s.with_desc(desc)),
            AnyServer::Fabric(s) => AnyServer::Fabric(s.with_desc(desc)),
        }
    }

    /// Accept inside `event_loop.wait_all` once a peer arrives.
    pub fn accept_nonblocking(&mut self, event_loop: &mut AnyEventLoop) -> Result<AnyPending> {
        let provider = self.provider();
        Ok(match (self, event_loop) {
            (AnyServer::Socket(s), AnyEventLoop::Socket(l)) => AnyPending::Socket(s.accept_nonblocking(l)?),
            (AnyServer::Verbs(s), AnyEventLoop::Verbs(l)) => AnyPending::Verbs(s.accept_nonblocking(l)?),
            (AnyServer::Fabric(s), AnyEventLoop::Fabric(l)) => AnyPending::Fabric(s.accept_nonblocking(l)?),
            (_, l) => return Err(mismatch("server", provider, l.provider())),
        })
    }
}

impl Server for AnyServer {
    type Channel = Box<dyn Channel>;

    fn listen(&mut self) -> Result<()> {
        match self {
            AnyServer::Socket(s) => s.listen(),
            AnyServer::Verbs(s) => s.listen(),
            AnyServer::Fabric(s) => s.listen(),
        }
    }

    fn accept(&mut self) -> Result<Box<dyn Channel>> {
        let channel: Box<dyn Channel> = match self {
            AnyServer::Socket(s) => Box::new(s.accept()?),
            AnyServer::Verbs(s) => Box::new(s.accept()?),
            AnyServer::Fabric(s) => Box::new(s.accept()?),
        };
        Ok(channel)
    }

    fn listen_port(&self) -> Option<u16> {
        match self {
            AnyServer::Socket(s) => s.listen_port(),
            AnyServer::Verbs(s) => s.listen_port(),
            AnyServer::Fabric(s) => s.listen_port(),
        }
    }

    fn raw_addr(&self) -> Option<Vec<u8>> {
        match self {
            AnyServer::Socket(s) => s.raw_addr(),
            AnyServer::Verbs(s) => s.raw_addr(),
            AnyServer::Fabric(s) => s.raw_addr(),
        }
    }
}

pub enum AnyEventLoop {
    Socket(SocketEventLoop),
    Verbs(VerbsEventLoop),
    Fabric(FabricEventLoop),
}

impl AnyEventLoop {
    pub fn provider(&self) -> Provider {
        match self {
            AnyEventLoop::Socket(_) => Provider::Socket,
            AnyEventLoop::Verbs(_) => Provider::Verbs,
            AnyEventLoop::Fabric(_) => Provider::Fabric,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AnyEventLoop::Socket(l) => l.len(),
            AnyEventLoop::Verbs(l) => l.len(),
            AnyEventLoop::Fabric(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See [`EventLoop::wait_all`].
    pub fn wait_all(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self {
            AnyEventLoop::Socket(l) => l.wait_all(timeout),
            AnyEventLoop::Verbs(l) => l.wait_all(timeout),
            AnyEventLoop::Fabric(l) => l.wait_all(timeout),
        }
    }
}

/// A non-blocking connect or accept on any provider.
pub enum AnyPending {
    Socket(PendingConnection<SocketChannel>),
    Verbs(PendingConnection<VerbsChannel>),
    Fabric(PendingConnection<FabricChannel>),
}

fn boxed<C: Channel + 'static>(result: Option<Result<C>>) -> Option<Result<Box<dyn Channel>>> {
    result.map(|r| r.map(|c| Box::new(c) as Box<dyn Channel>))
}

impl AnyPending {
    pub fn state(&self) -> HandshakeState {
        match self {
            AnyPending::Socket(p) => p.state(),
            AnyPending::Verbs(p) => p.state(),
            AnyPending::Fabric(p) => p.state(),
        }
    }

    /// Take the established channel or the failure once resolved.
    pub fn take(&self) -> Option<Result<Box<dyn Channel>>> {
        match self {
            AnyPending::Socket(p) => boxed(p.take()),
            AnyPending::Verbs(p) => boxed(p.take()),
            AnyPending::Fabric(p) => boxed(p.take()),
        }
    }
}
