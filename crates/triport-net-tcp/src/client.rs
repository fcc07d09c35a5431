use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

use socket2::{Domain, SockRef, Socket, Type};
use triport_net::{
    completion_pair, Client, Completer, CompletionToken, Disposition, Error, EventHandler, EventLoop, HandlerId,
    PendingConnection, Readiness, Result,
};
use triport_types::{Address, Provider};

use crate::channel::SocketChannel;
use crate::config::SocketConfig;
use crate::event_loop::SocketEventLoop;

/// Connects stream sockets.
///
/// Stream channels carry no descriptor exchange, so `self_desc` is kept only
/// for parity with the queue-based clients and the peer always sees 0.
#[derive(Debug, Clone, Default)]
pub struct SocketClient {
    config: SocketConfig,
    self_desc: u64,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addr = Address::resolve(host, port, Provider::Socket).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    if addr.is_unspecified() {
        return Err(Error::InvalidArgument(format!("cannot connect to unspecified host {host:?}")));
    }
    Ok(addr.to_socket_addr())
}

fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

impl SocketClient {
    pub fn new(config: SocketConfig, self_desc: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, self_desc })
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn self_desc(&self) -> u64 {
        self.self_desc
    }

    fn finish(&self, stream: TcpStream, peer: SocketAddr) -> Result<SocketChannel> {
        self.config
            .apply(SockRef::from(&stream))
            .map_err(|e| Error::from_stream_io(e, peer))?;
        let channel = SocketChannel::new(stream, self.config.max_pending_iov)?;
        tracing::info!(%peer, local = ?channel.local_addr().ok(), "socket connected");
        Ok(channel)
    }

    /// Start a connect that completes inside `event_loop.wait_all`.
    pub fn connect_nonblocking(
        &mut self,
        host: &str,
        port: u16,
        event_loop: &mut SocketEventLoop,
    ) -> Result<PendingConnection<SocketChannel>> {
        let peer = resolve(host, port)?;
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        match socket.connect(&peer.into()) {
            Ok(()) => {
                socket.set_nonblocking(false)?;
                let channel = self.finish(socket.into(), peer);
                Ok(PendingConnection::new(CompletionToken::ready(channel)))
            }
            Err(e) if is_in_progress(&e) => {
                let (completer, token) = completion_pair();
                let handler = ConnectHandler {
                    socket: Some(socket),
                    peer,
                    client: self.clone(),
                    completer: Some(completer),
                };
                event_loop.add_handler(Box::new(handler));
                tracing::debug!(%peer, "connect in progress");
                Ok(PendingConnection::new(token))
            }
            Err(e) => Ok(PendingConnection::new(CompletionToken::ready(Err(Error::from_stream_io(e, peer))))),
        }
    }
}

impl Client for SocketClient {
    type Channel = SocketChannel;

    fn connect(&mut self, host: &str, port: u16) -> Result<SocketChannel> {
        let peer = resolve(host, port)?;
        let stream = TcpStream::connect(peer).map_err(|e| Error::from_stream_io(e, peer))?;
        self.finish(stream, peer)
    }
}

/// Waits for a non-blocking connect to resolve.
struct ConnectHandler {
    socket: Option<Socket>,
    peer: SocketAddr,
    client: SocketClient,
    completer: Option<Completer<SocketChannel>>,
}

impl ConnectHandler {
    fn resolve(&mut self) -> Result<SocketChannel> {
        let socket = self.socket.take().ok_or(Error::Unsupported("connect already resolved"))?;
        if let Some(err) = socket.take_error()? {
            return Err(Error::from_stream_io(err, self.peer));
        }
        socket.set_nonblocking(false)?;
        self.client.finish(socket.into(), self.peer)
    }

    fn complete(&mut self) -> Disposition {
        let result = self.resolve();
        if let Err(err) = &result {
            tracing::debug!(peer = %self.peer, error = %err, "non-blocking connect failed");
        }
        if let Some(completer) = self.completer.take() {
            completer.complete(result);
        }
        Disposition::MayBeRemoved
    }
}

impl EventHandler<Readiness> for ConnectHandler {
    fn handler_id(&self) -> HandlerId {
        HandlerId::Socket(self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1))
    }

    fn interest(&self) -> Readiness {
        Readiness::WRITABLE
    }

    fn on_event(&mut self, _readiness: Readiness) -> Disposition {
        self.complete()
    }

    fn on_error(&mut self, _readiness: Readiness) -> Disposition {
        self.complete()
    }
}
