//! triport: one channel API over stream sockets, verbs queue pairs and
//! reliable-datagram fabric endpoints.
//!
//! Pick a [`Provider`] in a [`TransportConfig`], build a [`Transport`] on a
//! [`SoftNet`], and use the [`Client`]/[`Server`] it hands out. Channels come
//! back as `Box<dyn Channel>` regardless of the substrate underneath.
//!
//! ```no_run
//! use triport::{Channel, Client, Server, SoftNet, Transport, TransportConfig};
//!
//! # fn main() -> triport::Result<()> {
//! let transport = Transport::new(TransportConfig::default(), SoftNet::new())?;
//! let mut server = transport.server("127.0.0.1", 0)?;
//! server.listen()?;
//! let port = server.listen_port().unwrap_or_default();
//! let mut channel = transport.client(1)?.connect("127.0.0.1", port)?;
//! channel.send(b"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod transport;

pub use config::{ConfigError, TransportConfig};
pub use transport::{AnyClient, AnyEventLoop, AnyPending, AnyServer, Transport};

pub use triport_logging::{init_logging, LogConfig, LogError};
pub use triport_net::{
    AccessFlags, Channel, Client, CompletionError, ConnectionError, Error, HandshakeState, LocalMemoryRegion,
    RemoteMemoryRegion, ResourceError, Result, Server,
};
pub use triport_net_fabric::FabricConfig;
pub use triport_net_tcp::SocketConfig;
pub use triport_net_verbs::VerbsConfig;
pub use triport_softnic::SoftNet;
pub use triport_types::{Address, Provider};
