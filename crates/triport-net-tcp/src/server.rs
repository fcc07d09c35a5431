use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, SockRef, Socket, Type};
use triport_net::{
    completion_pair, Completer, CompletionToken, Disposition, Error, EventHandler, EventLoop, HandlerId,
    PendingConnection, Readiness, Result, Server,
};
use triport_types::{Address, Provider};

use crate::channel::SocketChannel;
use crate::config::SocketConfig;
use crate::event_loop::SocketEventLoop;

/// A listening stream socket.
#[derive(Debug)]
pub struct SocketServer {
    config: SocketConfig,
    bind_addr: SocketAddr,
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
}

impl SocketServer {
    /// Port 0 picks an ephemeral port; an empty host binds every interface.
    pub fn new(config: SocketConfig, host: &str, port: u16) -> Result<Self> {
        config.validate()?;
        let bind_addr = Address::resolve(host, port, Provider::Socket)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?
            .to_socket_addr();
        Ok(Self {
            config,
            bind_addr,
            listener: None,
            local_addr: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn listener(&self) -> Result<&Arc<TcpListener>> {
        self.listener
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("server is not listening".into()))
    }

    /// Accept inside `event_loop.wait_all` once a peer is queued.
    pub fn accept_nonblocking(&mut self, event_loop: &mut SocketEventLoop) -> Result<PendingConnection<SocketChannel>> {
        let listener = self.listener()?.clone();
        let (completer, token) = completion_pair();
        let handler = AcceptHandler {
            listener,
            config: self.config.clone(),
            completer: Some(completer),
        };
        if !event_loop.add_handler(Box::new(handler)) {
            return Ok(PendingConnection::new(CompletionToken::ready(Err(Error::WouldBlock { pending: 1 }))));
        }
        Ok(PendingConnection::new(token))
    }
}

fn accept_one(listener: &TcpListener, config: &SocketConfig) -> Result<SocketChannel> {
    let (stream, peer) = listener.accept()?;
    config
        .apply(SockRef::from(&stream))
        .map_err(|e| Error::from_stream_io(e, peer))?;
    tracing::info!(%peer, "socket accepted");
    SocketChannel::new(stream, config.max_pending_iov)
}

impl Server for SocketServer {
    type Channel = SocketChannel;

    fn listen(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(self.config.reuse_addr)?;
        socket.bind(&self.bind_addr.into())?;
        socket.listen(self.config.listen_backlog)?;
        let listener: TcpListener = socket.into();
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, backlog = self.config.listen_backlog, "socket server listening");
        self.local_addr = Some(local);
        self.listener = Some(Arc::new(listener));
        Ok(())
    }

    fn accept(&mut self) -> Result<SocketChannel> {
        let listener = self.listener()?;
        accept_one(listener, &self.config)
    }

    fn listen_port(&self) -> Option<u16> {
        self.local_addr.map(|a| a.port())
    }

    fn raw_addr(&self) -> Option<Vec<u8>> {
        let local = self.local_addr?;
        Address::from_socket_addr(local, Provider::Socket)
            .ok()
            .map(|a| a.to_raw().to_vec())
    }
}

/// Accepts one peer once the listener polls readable.
struct AcceptHandler {
    listener: Arc<TcpListener>,
    config: SocketConfig,
    completer: Option<Completer<SocketChannel>>,
}

impl EventHandler<Readiness> for AcceptHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Socket(self.listener.as_raw_fd())
    }

    fn interest(&self) -> Readiness {
        Readiness::READABLE
    }

    fn on_event(&mut self, _readiness: Readiness) -> Disposition {
        let result = accept_one(&self.listener, &self.config);
        if let Some(completer) = self.completer.take() {
            completer.complete(result);
        }
        Disposition::MayBeRemoved
    }

    fn on_error(&mut self, readiness: Readiness) -> Disposition {
        tracing::warn!(?readiness, "listener failed");
        if let Some(completer) = self.completer.take() {
            completer.complete(Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("listener reported {readiness:?}"),
            ))));
        }
        Disposition::MayBeRemoved
    }
}
