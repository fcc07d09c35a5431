use std::sync::Arc;
use std::time::Duration;

use triport_net::{Deadline, Error, EventHandler, EventLoop, HandlerId, HandlerSet, Result};
use triport_softnic::{CmEvent, CmEventKind, EventChannel};

/// Dispatches connection-manager events to pending connects and accepts.
///
/// Handlers register under [`HandlerId::Connection`]. A connect request is
/// routed by its listening id, every other event by its own id.
pub struct VerbsEventLoop {
    events: Arc<EventChannel>,
    handlers: HandlerSet<CmEvent>,
}

impl Default for VerbsEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl VerbsEventLoop {
    pub fn new() -> Self {
        Self {
            events: EventChannel::new(),
            handlers: HandlerSet::new(),
        }
    }

    /// The event channel ids must use to be serviced by this loop.
    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.events
    }

    fn route(&self, event: &CmEvent) -> HandlerId {
        match event.listen_id {
            Some(listen_id) if self.handlers.contains(&HandlerId::Connection(listen_id)) => {
                HandlerId::Connection(listen_id)
            }
            _ => HandlerId::Connection(event.id),
        }
    }
}

impl EventLoop for VerbsEventLoop {
    type Event = CmEvent;

    fn add_handler(&mut self, handler: Box<dyn EventHandler<CmEvent>>) -> bool {
        self.handlers.add(handler)
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }

    fn wait_all(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        while !self.handlers.is_empty() {
            let Some(event) = self.events.get_event(deadline.remaining()) else {
                if deadline.expired() {
                    tracing::debug!(remaining = self.handlers.len(), "verbs loop timed out");
                    return Err(Error::TimedOut);
                }
                continue;
            };
            let id = self.route(&event);
            let kind = event.kind;
            let failed = matches!(
                kind,
                CmEventKind::Rejected | CmEventKind::Unreachable | CmEventKind::Disconnected
            );
            if !self.handlers.dispatch(id, event, failed) {
                tracing::warn!(%id, ?kind, "no handler for cm event");
            }
        }
        Ok(())
    }
}
