use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use triport_net::{Deadline, Error, EventHandler, EventLoop, HandlerId, HandlerSet, Readiness, Result};

/// A poll(2) loop over socket handlers.
#[derive(Default)]
pub struct SocketEventLoop {
    handlers: HandlerSet<Readiness>,
}

fn to_poll_events(interest: Readiness) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Readiness::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Readiness::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_events(revents: libc::c_short) -> Readiness {
    let mut readiness = Readiness::empty();
    if revents & libc::POLLIN != 0 {
        readiness |= Readiness::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        readiness |= Readiness::WRITABLE;
    }
    if revents & libc::POLLHUP != 0 {
        readiness |= Readiness::HANGUP;
    }
    if revents & libc::POLLERR != 0 {
        readiness |= Readiness::ERROR;
    }
    if revents & libc::POLLNVAL != 0 {
        readiness |= Readiness::INVALID;
    }
    readiness
}

impl SocketEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// One poll round. Returns the number of handlers serviced.
    fn poll_once(&mut self, deadline: &Deadline) -> Result<usize> {
        let interests = self.handlers.interests();
        let mut ids = Vec::with_capacity(interests.len());
        let mut fds = Vec::with_capacity(interests.len());
        for (id, interest) in interests {
            let HandlerId::Socket(fd) = id else {
                tracing::warn!(%id, "non-socket handler on a socket loop");
                continue;
            };
            ids.push(id);
            fds.push(libc::pollfd {
                fd: fd as RawFd,
                events: to_poll_events(interest),
                revents: 0,
            });
        }

        // SAFETY: `fds` is a live, correctly sized array of pollfd.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, deadline.as_poll_timeout()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }

        let mut serviced = 0;
        for (id, pfd) in ids.into_iter().zip(fds) {
            if pfd.revents == 0 {
                continue;
            }
            let readiness = from_poll_events(pfd.revents);
            self.handlers.dispatch(id, readiness, readiness.is_failure());
            serviced += 1;
        }
        Ok(serviced)
    }
}

impl EventLoop for SocketEventLoop {
    type Event = Readiness;

    fn add_handler(&mut self, handler: Box<dyn EventHandler<Readiness>>) -> bool {
        self.handlers.add(handler)
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }

    fn wait_all(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        while !self.handlers.is_empty() {
            let serviced = self.poll_once(&deadline)?;
            if serviced == 0 && deadline.expired() {
                tracing::debug!(remaining = self.handlers.len(), "socket loop timed out");
                return Err(Error::TimedOut);
            }
        }
        Ok(())
    }
}
