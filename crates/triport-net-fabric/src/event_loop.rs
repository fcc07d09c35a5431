use std::sync::Arc;
use std::time::Duration;

use triport_net::{Deadline, Error, EventHandler, EventLoop, HandlerId, HandlerSet, Result, WorkCompletion};
use triport_softnic::Signal;

use crate::endpoint::{Direction, FabricEndpoint};

/// One completion filed under a handler's context.
#[derive(Debug, Clone)]
pub struct FabricEvent {
    pub context: u64,
    pub direction: Direction,
    pub completion: WorkCompletion,
}

/// Waits on a completion signal shared by the watched endpoints and hands
/// each filed completion to the handler registered for its context.
///
/// Handlers register under [`HandlerId::Fabric`]. Failed completions go to
/// `on_error`. A handler that asks to be removed gets no further events, so
/// completions after a finished handshake stay with the channel.
pub struct FabricEventLoop {
    signal: Arc<Signal>,
    endpoints: Vec<Arc<FabricEndpoint>>,
    handlers: HandlerSet<FabricEvent>,
}

impl FabricEventLoop {
    pub fn new(signal: Arc<Signal>) -> Self {
        Self {
            signal,
            endpoints: Vec::new(),
            handlers: HandlerSet::new(),
        }
    }

    /// A loop on `endpoint`'s signal, already watching it.
    pub fn for_endpoint(endpoint: &Arc<FabricEndpoint>) -> Self {
        let mut event_loop = Self::new(endpoint.signal().clone());
        event_loop.endpoints.push(endpoint.clone());
        event_loop
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    /// Progress `endpoint` on every pass. It must signal this loop.
    pub fn watch(&mut self, endpoint: &Arc<FabricEndpoint>) -> Result<()> {
        if !Arc::ptr_eq(endpoint.signal(), &self.signal) {
            return Err(Error::InvalidArgument(format!(
                "endpoint {} does not signal this event loop",
                endpoint.address()
            )));
        }
        if !self.endpoints.iter().any(|e| Arc::ptr_eq(e, endpoint)) {
            self.endpoints.push(endpoint.clone());
        }
        Ok(())
    }

    /// Dispatch every filed completion whose context has a handler.
    fn dispatch_ready(&mut self) -> usize {
        let mut serviced = 0;
        for (id, _) in self.handlers.interests() {
            let HandlerId::Fabric(context) = id else {
                continue;
            };
            let Some(queue) = self.endpoints.iter().find_map(|e| e.context(context)) else {
                continue;
            };
            while self.handlers.contains(&id) {
                let Some((direction, completion)) = queue.pop_any() else {
                    break;
                };
                let failed = completion.error.is_some();
                let event = FabricEvent {
                    context,
                    direction,
                    completion,
                };
                self.handlers.dispatch(id, event, failed);
                serviced += 1;
            }
        }
        serviced
    }
}

impl EventLoop for FabricEventLoop {
    type Event = FabricEvent;

    fn add_handler(&mut self, handler: Box<dyn EventHandler<FabricEvent>>) -> bool {
        self.handlers.add(handler)
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }

    fn wait_all(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        while !self.handlers.is_empty() {
            let seen = self.signal.generation();
            for endpoint in &self.endpoints {
                endpoint.progress();
            }
            if self.dispatch_ready() > 0 {
                continue;
            }
            if deadline.expired() {
                tracing::debug!(remaining = self.handlers.len(), "fabric loop timed out");
                return Err(Error::TimedOut);
            }
            self.signal.wait_past(seen, deadline.remaining());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::endpoint::op_context;
    use triport_net::{Disposition, Readiness};
    use triport_softnic::SoftNet;

    struct Collect {
        context: u64,
        want: usize,
        seen: Vec<(Direction, u64, bool)>,
        done: Arc<parking_lot::Mutex<Vec<(Direction, u64, bool)>>>,
    }

    impl Collect {
        fn record(&mut self, event: FabricEvent, failed: bool) -> Disposition {
            self.seen.push((event.direction, event.completion.wr_id, failed));
            if self.seen.len() == self.want {
                *self.done.lock() = std::mem::take(&mut self.seen);
                Disposition::MayBeRemoved
            } else {
                Disposition::Keep
            }
        }
    }

    impl EventHandler<FabricEvent> for Collect {
        fn handler_id(&self) -> HandlerId {
            HandlerId::Fabric(self.context)
        }

        fn interest(&self) -> Readiness {
            Readiness::READABLE
        }

        fn on_event(&mut self, event: FabricEvent) -> Disposition {
            self.record(event, false)
        }

        fn on_error(&mut self, event: FabricEvent) -> Disposition {
            self.record(event, true)
        }
    }

    #[test]
    fn test_zero_timeout_without_completions() {
        let net = SoftNet::new();
        let endpoint = FabricEndpoint::open(net, "127.0.0.1", 0, FabricConfig::default()).unwrap();
        let mut event_loop = FabricEventLoop::for_endpoint(&endpoint);
        event_loop.wait_all(Some(Duration::ZERO)).unwrap();

        let (context, _queue) = endpoint.register_context();
        let done = Arc::default();
        let handler = |want| Collect {
            context,
            want,
            seen: Vec::new(),
            done: Arc::clone(&done),
        };
        assert!(event_loop.add_handler(Box::new(handler(1))));
        assert!(!event_loop.add_handler(Box::new(handler(1))));
        assert!(matches!(event_loop.wait_all(Some(Duration::ZERO)), Err(Error::TimedOut)));
        assert_eq!(event_loop.len(), 1);
    }

    #[test]
    fn test_dispatch_stops_at_removal() {
        let net = SoftNet::new();
        let signal = Signal::new();
        let a = FabricEndpoint::open_with_signal(net.clone(), "127.0.0.1", 0, FabricConfig::default(), signal.clone())
            .unwrap();
        let gone = FabricEndpoint::open(net.clone(), "127.0.0.1", 0, FabricConfig::default()).unwrap();
        let b = FabricEndpoint::open(net, "127.0.0.1", 0, FabricConfig::default()).unwrap();
        let live = a.av_insert(&b.raw_addr()).unwrap();
        let dead = a.av_insert(&gone.raw_addr()).unwrap();
        drop(gone);

        let mut event_loop = FabricEventLoop::new(signal);
        assert!(event_loop.watch(&b).is_err());
        event_loop.watch(&a).unwrap();

        let (context, queue) = a.register_context();
        for (wr_id, dest) in [(1, live), (2, dead), (3, live)] {
            a.post_with_retry("send", |ep| ep.tsend(&[], dest, 7, op_context(context, wr_id)))
                .unwrap();
        }
        let done = Arc::default();
        event_loop.add_handler(Box::new(Collect {
            context,
            want: 2,
            seen: Vec::new(),
            done: Arc::clone(&done),
        }));
        event_loop.wait_all(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(*done.lock(), vec![(Direction::Send, 1, false), (Direction::Send, 2, true)]);
        assert_eq!(queue.pop_send().unwrap().wr_id, 3);
    }
}
