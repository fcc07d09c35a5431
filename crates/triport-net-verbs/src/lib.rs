//! Reliable-connected verbs substrate for triport.
//!
//! Connections are set up through the connection manager, carrying a
//! [`HandshakeRecord`](triport_net::HandshakeRecord) in the connect and
//! accept private data. Each channel owns a queue pair with its own
//! completion queues and runs the eager/rendezvous protocol on it.

mod channel;
mod client;
mod config;
mod context;
mod event_loop;
mod queue;
mod server;

pub use channel::VerbsChannel;
pub use client::VerbsClient;
pub use config::VerbsConfig;
pub use context::VerbsContext;
pub use event_loop::VerbsEventLoop;
pub use queue::VerbsQueue;
pub use server::VerbsServer;
