use thiserror::Error;

/// Errors returned by every triport transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Registration or posting failed because a hardware limit was reached.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The connection was refused, rejected or lost.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Fewer bytes moved than the caller asked for.
    #[error("short transfer: expected {expected} bytes, moved {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// A completion queue entry reported a non-success status.
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("operation timed out")]
    TimedOut,

    /// A non-blocking queue is full; retry after the event loop drains it.
    #[error("would block: {pending} transfers already queued")]
    WouldBlock { pending: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("cannot register {length} bytes: {reason}")]
    Registration { length: usize, reason: String },

    #[error("{queue} queue full ({capacity} entries)")]
    QueueFull { queue: &'static str, capacity: usize },

    #[error("resource exhausted: {0}")]
    Exhausted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Nobody is listening at the peer address yet.
    #[error("connection refused by {peer}")]
    Refused { peer: String },

    #[error("connection to {peer} rejected: {reason}")]
    Rejected { peer: String, reason: String },

    #[error("{peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("connection hung up")]
    HungUp,

    #[error("connection closed")]
    Closed,
}

/// A failed work completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("completion error: {status} (vendor error {vendor_err:#x}): {message}")]
pub struct CompletionError {
    /// The substrate's native status string.
    pub status: String,
    pub vendor_err: u32,
    pub message: String,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionError::Refused { .. })
    }
}

impl Error {
    /// Whether the caller may retry the same operation later, e.g. a connect
    /// attempt that raced the peer's listen.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_retryable(),
            Error::WouldBlock { .. } => true,
            _ => false,
        }
    }

    /// Map an I/O error from a stream socket into the connection taxonomy.
    pub fn from_stream_io(err: std::io::Error, peer: impl ToString) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => ConnectionError::Refused {
                peer: peer.to_string(),
            }
            .into(),
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
                ConnectionError::HungUp.into()
            }
            ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Io(err),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
