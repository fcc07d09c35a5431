//! Stream-socket substrate for triport.
//!
//! Channels are plain connected TCP streams. Memory regions need no
//! registration and one-sided Write/Read is unsupported.

mod channel;
mod client;
mod config;
mod event_loop;
mod server;

pub use channel::SocketChannel;
pub use client::SocketClient;
pub use config::SocketConfig;
pub use event_loop::SocketEventLoop;
pub use server::SocketServer;
