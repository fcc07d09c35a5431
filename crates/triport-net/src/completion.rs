//! Completion tokens resolved by event-loop dispatch.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ConnectionError, Error, Result};

enum Slot<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

/// The caller's half: poll it after the event loop has run.
pub struct CompletionToken<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

/// The handler's half: resolves the token exactly once.
pub struct Completer<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

pub fn completion_pair<T>() -> (Completer<T>, CompletionToken<T>) {
    let slot = Arc::new(Mutex::new(Slot::Pending));
    (
        Completer { slot: slot.clone() },
        CompletionToken { slot },
    )
}

impl<T> Completer<T> {
    pub fn complete(self, result: Result<T>) {
        *self.slot.lock() = Slot::Ready(result);
    }
}

/// A completer dropped unresolved fails its token with
/// [`ConnectionError::Closed`], so callers never wait on it forever.
impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Ready(Err(ConnectionError::Closed.into()));
        }
    }
}

impl<T> CompletionToken<T> {
    /// A token that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Ready(result))),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Ready(_))
    }

    /// Take the result once it is ready. Returns `None` while pending and
    /// after the result has been taken.
    pub fn take(&self) -> Option<Result<T>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => Some(result),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Inspect the result without taking it.
    pub fn peek<R>(&self, f: impl FnOnce(Option<&Result<T>>) -> R) -> R {
        match &*self.slot.lock() {
            Slot::Ready(result) => f(Some(result)),
            _ => f(None),
        }
    }
}

impl<T> fmt::Debug for CompletionToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.slot.lock() {
            Slot::Pending => "pending",
            Slot::Ready(Ok(_)) => "ok",
            Slot::Ready(Err(_)) => "failed",
            Slot::Taken => "taken",
        };
        f.debug_struct("CompletionToken").field("state", &state).finish()
    }
}

/// Progress of a non-blocking connect or accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Connected,
    /// The peer refused or rejected the connection.
    Rejected,
    Failed,
}

fn classify<C>(result: &Result<C>) -> HandshakeState {
    match result {
        Ok(_) => HandshakeState::Connected,
        Err(Error::Connection(
            ConnectionError::Refused { .. } | ConnectionError::Rejected { .. },
        )) => HandshakeState::Rejected,
        Err(_) => HandshakeState::Failed,
    }
}

/// A connection being established on an event loop.
#[derive(Debug)]
pub struct PendingConnection<C> {
    token: CompletionToken<C>,
    taken: Mutex<Option<HandshakeState>>,
}

impl<C> PendingConnection<C> {
    pub fn new(token: CompletionToken<C>) -> Self {
        Self {
            token,
            taken: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HandshakeState {
        if let Some(state) = *self.taken.lock() {
            return state;
        }
        self.token.peek(|result| match result {
            None => HandshakeState::Pending,
            Some(result) => classify(result),
        })
    }

    /// Take the established channel or the failure.
    pub fn take(&self) -> Option<Result<C>> {
        let result = self.token.take()?;
        *self.taken.lock() = Some(classify(&result));
        Some(result)
    }
}
