use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, warn};
use slab::Slab;

use crate::error::Error;
use crate::reactor::{Events, Reactor};
use crate::ready::Ready;
use crate::task::{BoxTask, Resume, Step, Suspension, Task, Value};
use crate::timer::TimerQueue;
use crate::token::Token;

/// Drives `root` to completion on a fresh default-configured runtime and
/// returns its terminal value.
///
/// Shorthand for `Runtime::new().run(root)`.
pub fn run(root: impl Task + 'static) -> Result<Option<Value>, Error> {
    Runtime::new().run(root)
}

/// Runtime configuration, builder style.
///
/// ```no_run
/// use corio::{Runtime, Step, Resume};
///
/// let value = Runtime::new()
///     .quiet_failures(true)
///     .run(|_: Resume| Step::value(1i32))
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct Runtime {
    quiet_failures: bool,
    hide_loop_frames: bool,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime {
            quiet_failures: false,
            hide_loop_frames: false,
        }
    }

    /// When set, a failure escaping a detached task is logged through the
    /// `log` facade and swallowed instead of failing the loop. Root-task
    /// failures always fail the loop.
    pub fn quiet_failures(mut self, quiet: bool) -> Runtime {
        self.quiet_failures = quiet;
        self
    }

    /// Requests that frames internal to the loop be elided from
    /// propagated failure traces. Propagated [`Error`] values never carry
    /// loop frames, so the elision always holds and the flag changes
    /// nothing observable.
    pub fn hide_loop_frames(mut self, hide: bool) -> Runtime {
        self.hide_loop_frames = hide;
        self
    }

    /// Drives `root` to completion.
    ///
    /// Returns the root task's terminal value once the ready queue, the
    /// timer heap and the I/O registry have all drained. Fails with the
    /// root task's failure, with the first non-quiet detached failure, or
    /// with a reactor-level I/O error.
    pub fn run(self, root: impl Task + 'static) -> Result<Option<Value>, Error> {
        debug!(
            "runtime starting: quiet_failures={} hide_loop_frames={}",
            self.quiet_failures, self.hide_loop_frames
        );

        let mut scheduler = Scheduler::new(self.quiet_failures)?;

        let root = scheduler.insert(Box::new(root), None);
        scheduler.root = root;
        scheduler.ready.push_back((root, Resume::Empty));

        while !scheduler.idle() {
            scheduler.dispatch()?;
            scheduler.poll_io()?;
            scheduler.expire_timers();
        }

        Ok(scheduler.root_ret.take())
    }
}

impl Default for Runtime {
    fn default() -> Runtime {
        Runtime::new()
    }
}

struct TaskEntry {
    task: BoxTask,
    parent: Option<Token>,
}

/// The loop state: every queue and relation the scheduler owns.
///
/// A live task sits in exactly one place at a time: the ready queue, the
/// I/O registry, the timer heap, or behind a child in the join relation
/// (its `parent` back-reference). The slab holds the task objects
/// themselves, keyed by [`Token`].
struct Scheduler {
    reactor: Reactor,
    events: Events,
    tasks: Slab<TaskEntry>,
    ready: VecDeque<(Token, Resume)>,
    io_waiters: IndexMap<RawFd, (Ready, Token)>,
    timers: TimerQueue,
    root: Token,
    root_ret: Option<Value>,
    quiet_failures: bool,
}

impl Scheduler {
    fn new(quiet_failures: bool) -> Result<Scheduler, Error> {
        Ok(Scheduler {
            reactor: Reactor::new()?,
            events: Events::with_capacity(1024),
            tasks: Slab::new(),
            ready: VecDeque::new(),
            io_waiters: IndexMap::new(),
            timers: TimerQueue::new(),
            root: Token(0),
            root_ret: None,
            quiet_failures,
        })
    }

    fn idle(&self) -> bool {
        self.ready.is_empty() && self.io_waiters.is_empty() && self.timers.is_empty()
    }

    fn insert(&mut self, task: BoxTask, parent: Option<Token>) -> Token {
        Token(self.tasks.insert(TaskEntry { task, parent }))
    }

    /// Resumes the task at the head of the ready queue and interprets its
    /// next step.
    fn dispatch(&mut self) -> Result<(), Error> {
        let Some((current, resume)) = self.ready.pop_front() else {
            return Ok(());
        };

        let step = match self.tasks.get_mut(current.0) {
            Some(entry) => entry.task.resume(resume),
            None => return Ok(()),
        };

        match step {
            Step::Pending(request) => {
                self.suspend(current, request);
                Ok(())
            }
            Step::Done(value) => self.complete(current, Ok(value)),
            Step::Failed(err) => self.complete(current, Err(err)),
        }
    }

    /// Parks or re-enqueues `current` according to its suspension
    /// request.
    fn suspend(&mut self, current: Token, request: Suspension) {
        match request {
            Suspension::Child(task) => {
                let child = self.insert(task, Some(current));
                self.ready.push_back((child, Resume::Empty));
            }
            Suspension::Spawn(task) => {
                let sibling = self.insert(task, None);
                self.ready.push_back((sibling, Resume::Empty));
                self.ready.push_back((current, Resume::Empty));
            }
            Suspension::IoWait(fd, mask) => {
                if let Err(err) = self.io_wait(current, fd, mask) {
                    self.ready.push_back((current, Resume::Err(err)));
                }
            }
            Suspension::IoDrop(fd) => {
                if fd < 0 {
                    let err = Error::MalformedRequest(format!("bad descriptor {}", fd));
                    self.ready.push_back((current, Resume::Err(err)));
                    return;
                }

                self.io_waiters.swap_remove(&fd);
                let _ = self.reactor.unregister(fd);
                self.ready.push_back((current, Resume::Empty));
            }
            Suspension::Sleep(deadline) => {
                self.timers.push(deadline, current);
            }
            Suspension::Yield => {
                self.ready.push_back((current, Resume::Empty));
            }
        }
    }

    /// Registers `current` as the waiter for `fd`. Replacing an existing
    /// waiter is allowed: the mask and the waiter are both swapped out
    /// and the previous waiter is dropped from the registry without being
    /// re-enqueued.
    fn io_wait(&mut self, current: Token, fd: RawFd, mask: Ready) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::MalformedRequest(format!("bad descriptor {}", fd)));
        }

        if mask.is_empty() || !Ready::all().contains(mask) {
            return Err(Error::MalformedRequest(format!(
                "bad interest mask {:?} for descriptor {}",
                mask, fd
            )));
        }

        let registered = if self.io_waiters.contains_key(&fd) {
            self.reactor.modify(fd, mask)
        } else {
            self.reactor.register(fd, mask)
        };

        if let Err(err) = registered {
            return Err(Error::MalformedRequest(format!(
                "cannot watch descriptor {}: {}",
                fd, err
            )));
        }

        self.io_waiters.insert(fd, (mask, current));

        Ok(())
    }

    /// Retires a finished task and routes its terminal value or failure:
    /// to the waiting parent if there is one, into the loop's return slot
    /// if it is the root, and otherwise per the detached-task policy.
    fn complete(&mut self, current: Token, outcome: Result<Option<Value>, Error>) -> Result<(), Error> {
        let entry = self.tasks.remove(current.0);

        if let Some(parent) = entry.parent {
            let resume = match outcome {
                Ok(Some(value)) => Resume::Value(value),
                Ok(None) => Resume::Empty,
                Err(err) => Resume::Err(err),
            };
            self.ready.push_back((parent, resume));
            return Ok(());
        }

        if current == self.root {
            return match outcome {
                Ok(value) => {
                    self.root_ret = value;
                    Ok(())
                }
                Err(err) => Err(err),
            };
        }

        match outcome {
            Ok(_) => Ok(()),
            Err(err) if self.quiet_failures => {
                warn!("detached task {:?} failed: {}", current, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Polls the reactor and wakes I/O waiters. The timeout is zero when
    /// work is already pending or nothing is registered, bounded by the
    /// earliest timer otherwise, and unbounded when only I/O remains.
    fn poll_io(&mut self) -> Result<(), Error> {
        let timeout = if !self.ready.is_empty() || self.io_waiters.is_empty() {
            Some(Duration::ZERO)
        } else if let Some(deadline) = self.timers.earliest() {
            Some(deadline.saturating_duration_since(Instant::now()))
        } else {
            None
        };

        let count = self.reactor.poll(&mut self.events, timeout)?;

        for index in 0..count {
            let (fd, mask) = match self.events.get(index) {
                Some(pair) => pair,
                None => break,
            };

            if let Some((_, waiter)) = self.io_waiters.swap_remove(&fd) {
                self.reactor.unregister(fd)?;
                self.ready.push_back((waiter, Resume::Io(mask)));
            }
        }

        Ok(())
    }

    /// Drains every timer whose deadline has passed, in deadline order.
    fn expire_timers(&mut self) {
        let now = Instant::now();

        while let Some(task) = self.timers.pop_expired(now) {
            self.ready.push_back((task, Resume::Empty));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminates_without_yielding() {
        let value = run(|_: Resume| Step::value(7i32)).unwrap().unwrap();
        assert_eq!(*value.downcast::<i32>().unwrap(), 7);
    }

    #[test]
    fn root_without_value() {
        let ret = run(|_: Resume| Step::done()).unwrap();
        assert!(ret.is_none());
    }

    #[test]
    fn empty_interest_mask_is_malformed() {
        let mut step = 0;
        let err = run(move |resume: Resume| {
            step += 1;
            match step {
                1 => Step::io_wait(0, Ready::empty()),
                _ => match resume {
                    Resume::Err(err) => Step::Failed(err),
                    _ => Step::done(),
                },
            }
        })
        .unwrap_err();

        assert!(matches!(err, Error::MalformedRequest(_)));
    }

    #[test]
    fn negative_descriptor_is_malformed() {
        let mut step = 0;
        let err = run(move |resume: Resume| {
            step += 1;
            match step {
                1 => Step::io_wait(-1, Ready::readable()),
                _ => match resume {
                    Resume::Err(err) => Step::Failed(err),
                    _ => Step::done(),
                },
            }
        })
        .unwrap_err();

        assert!(matches!(err, Error::MalformedRequest(_)));
    }
}
