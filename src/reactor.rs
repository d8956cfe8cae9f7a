use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;

use crate::ready::Ready;
use crate::sys;

pub use crate::sys::Events;

/// The readiness multiplexer.
///
/// Wraps the best polling backend the platform offers (epoll, falling
/// back to poll(2)) behind one contract: interest is registered per
/// descriptor, `poll` blocks up to a timeout and reports `(fd, mask)`
/// pairs. Error and hang-up conditions wake a waiter regardless of the
/// mask it subscribed.
///
/// The reactor holds non-owning references to descriptors and never
/// closes them. Deregister a descriptor before closing it.
pub struct Reactor {
    selector: sys::Selector,
    interests: IndexMap<RawFd, Ready>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            selector: sys::Selector::new()?,
            interests: IndexMap::new(),
        })
    }

    /// Adds interest `mask` for `fd`. Fails if `fd` is already
    /// registered; use [`modify`](Reactor::modify) to change an existing
    /// registration.
    pub fn register(&mut self, fd: RawFd, mask: Ready) -> io::Result<()> {
        if self.interests.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }

        self.selector.add(fd, mask)?;
        self.interests.insert(fd, mask);

        Ok(())
    }

    /// Replaces the interest mask of an already-registered `fd`.
    pub fn modify(&mut self, fd: RawFd, mask: Ready) -> io::Result<()> {
        if !self.interests.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            ));
        }

        self.selector.modify(fd, mask)?;
        self.interests.insert(fd, mask);

        Ok(())
    }

    /// Removes all interest for `fd`. Idempotent: unregistering a
    /// descriptor that is not registered is a no-op.
    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.interests.swap_remove(&fd).is_some() {
            self.selector.delete(fd)?;
        }

        Ok(())
    }

    /// Blocks up to `timeout` for readiness. `None` blocks without bound,
    /// `Some(Duration::ZERO)` returns immediately. A bounded wait with no
    /// registrations still honors the timeout; an unbounded wait with no
    /// registrations returns at once with no events.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        if self.interests.is_empty() && timeout.is_none() {
            events.clear();
            return Ok(0);
        }

        self.selector.wait(events, timeout)?;

        Ok(events.len())
    }

    /// Whether `fd` is currently registered.
    pub fn registered(&self, fd: RawFd) -> bool {
        self.interests.contains_key(&fd)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}
