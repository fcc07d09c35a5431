//! Core contracts of the triport transport library.
//!
//! Memory regions, the [`Channel`] data plane, the [`EventLoop`] multiplexer
//! and the eager/rendezvous [`Protocol`] engine shared by the queue-based
//! substrates.

pub mod channel;
pub mod chunk;
pub mod completion;
pub mod eager;
pub mod error;
pub mod event;
pub mod handshake;
pub mod memory;
pub mod protocol;

pub use channel::{check_rma_lengths, Channel, Client, Server};
pub use chunk::{slice_segments, split_segments, total_length, Segment, WorkChunk};
pub use completion::{completion_pair, Completer, CompletionToken, HandshakeState, PendingConnection};
pub use eager::{EagerBuffer, DEFAULT_EAGER_THRESHOLD};
pub use error::{CompletionError, ConnectionError, Error, ResourceError, Result};
pub use event::{Deadline, Disposition, EventHandler, EventLoop, HandlerId, HandlerSet, Readiness};
pub use handshake::{HandshakeRecord, HANDSHAKE_RECORD_SIZE, TAG_CONTROL};
pub use memory::{AccessFlags, LocalMemoryRegion, RemoteMemoryRegion, REMOTE_REGION_WIRE_SIZE};
pub use protocol::{Protocol, ProtocolConfig, QueueLimits, WorkCompletion, WorkQueue};
