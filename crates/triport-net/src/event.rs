//! The readiness/completion multiplexer contract.
//!
//! Channels mid-transfer, clients mid-connect and servers mid-accept all
//! register as [`EventHandler`]s; a substrate's [`EventLoop`] waits on its
//! native primitive and dispatches until no handler is left.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::Result;

/// Registration key of a handler, one variant per native handle kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerId {
    /// A socket file descriptor.
    Socket(RawFd),
    /// A connection-manager id.
    Connection(u64),
    /// A fabric completion context.
    Fabric(u64),
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerId::Socket(fd) => write!(f, "fd:{fd}"),
            HandlerId::Connection(id) => write!(f, "cm:{id}"),
            HandlerId::Fabric(ctx) => write!(f, "ctx:{ctx}"),
        }
    }
}

bitflags! {
    /// Readiness interest and observed readiness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u16 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const HANGUP = 1 << 2;
        const ERROR = 1 << 3;
        const INVALID = 1 << 4;
    }
}

impl Readiness {
    /// Bits that route a dispatch to [`EventHandler::on_error`].
    pub const FAILURE: Readiness = Readiness::HANGUP
        .union(Readiness::ERROR)
        .union(Readiness::INVALID);

    pub fn is_failure(&self) -> bool {
        self.intersects(Readiness::FAILURE)
    }
}

/// What a handler wants after being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// More work is pending; keep the registration.
    Keep,
    /// Nothing left to do; the loop may drop the handler.
    MayBeRemoved,
}

pub trait EventHandler<E>: Send {
    fn handler_id(&self) -> HandlerId;

    /// The readiness this handler currently waits for.
    fn interest(&self) -> Readiness;

    fn on_event(&mut self, event: E) -> Disposition;

    fn on_error(&mut self, event: E) -> Disposition;
}

pub trait EventLoop {
    type Event;

    /// Register a handler. Re-adding an id that is already present is a
    /// no-op and returns `false`.
    fn add_handler(&mut self, handler: Box<dyn EventHandler<Self::Event>>) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Service handlers until none remain.
    ///
    /// `None` waits forever. When the deadline passes with nothing ready the
    /// call fails with [`Error::TimedOut`](crate::Error::TimedOut) and every
    /// unserviced handler stays registered.
    fn wait_all(&mut self, timeout: Option<Duration>) -> Result<()>;
}

/// The handler table every loop keeps.
pub struct HandlerSet<E> {
    handlers: HashMap<HandlerId, Box<dyn EventHandler<E>>>,
}

impl<E> Default for HandlerSet<E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<E> HandlerSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: Box<dyn EventHandler<E>>) -> bool {
        let id = handler.handler_id();
        if self.handlers.contains_key(&id) {
            tracing::trace!(%id, "handler already registered");
            return false;
        }
        self.handlers.insert(id, handler);
        true
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn contains(&self, id: &HandlerId) -> bool {
        self.handlers.contains_key(id)
    }

    /// Ids and interests of all registered handlers, in a stable order.
    pub fn interests(&self) -> Vec<(HandlerId, Readiness)> {
        let mut out: Vec<_> = self
            .handlers
            .iter()
            .map(|(id, h)| (*id, h.interest()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Route one event to `id`. Returns `false` when no such handler exists.
    ///
    /// A failed event always retires the handler, whatever `on_error`
    /// answers.
    pub fn dispatch(&mut self, id: HandlerId, event: E, failed: bool) -> bool {
        let Some(handler) = self.handlers.get_mut(&id) else {
            return false;
        };
        let disposition = if failed {
            handler.on_error(event);
            Disposition::MayBeRemoved
        } else {
            handler.on_event(event)
        };
        if disposition == Disposition::MayBeRemoved {
            tracing::debug!(%id, failed, "handler removed");
            self.handlers.remove(&id);
        }
        true
    }
}

/// Tracks the overall deadline of one `wait_all` call.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    /// Time left, `None` meaning unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(d) if Instant::now() >= d)
    }

    /// Remaining time in poll(2) milliseconds, -1 meaning forever.
    pub fn as_poll_timeout(&self) -> i32 {
        match self.remaining() {
            None => -1,
            Some(left) => {
                let ms = left.as_millis();
                if ms == 0 && !left.is_zero() {
                    1
                } else {
                    ms.min(i32::MAX as u128) as i32
                }
            }
        }
    }
}
