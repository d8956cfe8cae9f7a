use std::any::Any;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::ready::Ready;

/// A terminal or resume value carried between tasks.
///
/// Tasks are heterogeneous, so values cross the scheduler as `Box<dyn
/// Any>` and the receiving side downcasts to the type it expects.
pub type Value = Box<dyn Any>;

/// A boxed task, as held by the scheduler and by suspension requests.
pub type BoxTask = Box<dyn Task>;

/// A suspendable computation.
///
/// The scheduler drives a task by calling [`resume`](Task::resume)
/// repeatedly. Each call runs the task up to its next suspension point and
/// returns a [`Step`]: a suspension request, a terminal value, or a
/// terminal failure. Between suspension points the task runs to
/// completion of its step; nothing else executes concurrently.
///
/// Closures implement `Task` directly, which is the lightest way to write
/// one:
///
/// ```
/// use corio::{Resume, Step, Task};
///
/// let mut fired = false;
/// let mut task = move |_: Resume| {
///     if !fired {
///         fired = true;
///         Step::yield_now()
///     } else {
///         Step::value("done")
///     }
/// };
///
/// assert!(matches!(task.resume(Resume::Empty), Step::Pending(_)));
/// ```
pub trait Task {
    /// Runs the task to its next suspension point.
    ///
    /// `input` is whatever the previous suspension asked for: the terminal
    /// value of an awaited child, the observed readiness mask of an I/O
    /// wait, a propagated failure, or nothing.
    fn resume(&mut self, input: Resume) -> Step;
}

impl<F> Task for F
where
    F: FnMut(Resume) -> Step,
{
    fn resume(&mut self, input: Resume) -> Step {
        self(input)
    }
}

/// What a task is resumed with.
pub enum Resume {
    /// Nothing: the first resumption, or the continuation after a timer,
    /// a yield, a deregistration, or a child that finished without a
    /// value.
    Empty,
    /// The terminal value of an awaited child task.
    Value(Value),
    /// The readiness observed for the descriptor the task was waiting on.
    Io(Ready),
    /// A failure injected into the task: an awaited child failed, or the
    /// task's own suspension request was malformed.
    Err(Error),
}

/// The outcome of resuming a task once.
pub enum Step {
    /// The task suspended, waiting for the request to be satisfied.
    Pending(Suspension),
    /// The task finished, possibly with a value.
    Done(Option<Value>),
    /// The task failed.
    Failed(Error),
}

impl Step {
    /// Finishes the task without a value.
    pub fn done() -> Step {
        Step::Done(None)
    }

    /// Finishes the task with `value`.
    pub fn value<T: Any>(value: T) -> Step {
        Step::Done(Some(Box::new(value)))
    }

    /// Suspends until `child` terminates; the task is then resumed with
    /// the child's terminal value or failure.
    pub fn child(child: impl Task + 'static) -> Step {
        Step::Pending(Suspension::Child(Box::new(child)))
    }

    /// Starts `task` as a detached sibling and keeps running.
    pub fn spawn(task: impl Task + 'static) -> Step {
        Step::Pending(Suspension::Spawn(Box::new(task)))
    }

    /// Suspends until `fd` reports readiness in `mask`; the task is then
    /// resumed with the observed mask.
    pub fn io_wait(fd: RawFd, mask: Ready) -> Step {
        Step::Pending(Suspension::IoWait(fd, mask))
    }

    /// Drops any registration for `fd` and keeps running.
    pub fn io_drop(fd: RawFd) -> Step {
        Step::Pending(Suspension::IoDrop(fd))
    }

    /// Suspends until `deadline` on the monotonic clock.
    pub fn sleep(deadline: Instant) -> Step {
        Step::Pending(Suspension::Sleep(deadline))
    }

    /// Suspends for at least `duration` from now.
    pub fn sleep_for(duration: Duration) -> Step {
        Step::sleep(Instant::now() + duration)
    }

    /// Gives up the current turn; the task is re-enqueued immediately.
    pub fn yield_now() -> Step {
        Step::Pending(Suspension::Yield)
    }
}

/// A suspension request: what a task wants to wait for.
///
/// This is the whole protocol between tasks and the scheduler. Descriptor
/// payloads are non-owning; the task keeps ownership of its socket and
/// must drop the registration before closing it.
pub enum Suspension {
    /// Run this child task; resume me with its terminal value or failure.
    Child(BoxTask),
    /// Run this task as a detached sibling; re-enqueue me immediately.
    Spawn(BoxTask),
    /// Wake me when the descriptor reports readiness in the mask. The
    /// mask must be a non-empty subset of readable | writable | error.
    IoWait(RawFd, Ready),
    /// Drop any registration for the descriptor; re-enqueue me.
    IoDrop(RawFd),
    /// Wake me once the monotonic clock reaches the deadline.
    Sleep(Instant),
    /// Re-enqueue me immediately.
    Yield,
}
