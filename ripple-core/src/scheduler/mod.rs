//! Scheduling
//!
//! Throttled evaluation and rate limiting defer work to a later turn of the
//! host's scheduling loop. This module defines that loop's interface and two
//! hosts for it.
//!
//! # Overview
//!
//! - [`Scheduler`]: `set_timeout` / `clear_timeout`, nothing more. Deferred
//!   tasks never preserve a call stack; they simply run later on the same
//!   thread.
//! - [`TaskQueue`]: a deterministic virtual clock. Time only moves when the
//!   host calls [`TaskQueue::advance`] (or one of its variants), which makes
//!   it the natural choice for tests and for hosts with their own frame loop.
//! - [`TokioScheduler`]: timers backed by `tokio::time::sleep` on a
//!   `LocalSet`.
//!
//! Each thread has a *current* scheduler, used when a node is not given one
//! explicitly. It starts out as a per-thread [`TaskQueue`].

mod queue;
mod tokio_host;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

pub use queue::TaskQueue;
pub use tokio_host::TokioScheduler;

/// Identifier of a scheduled task, unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Work deferred to a later turn.
pub type Task = Box<dyn FnOnce()>;

/// The host scheduling loop.
pub trait Scheduler {
    /// Run `task` once `delay` has elapsed.
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a task. Unknown or already-run IDs are ignored.
    fn clear_timeout(&self, id: TimerId);
}

thread_local! {
    static DEFAULT_QUEUE: Rc<TaskQueue> = Rc::new(TaskQueue::new());
    static CURRENT: RefCell<Option<Rc<dyn Scheduler>>> = const { RefCell::new(None) };
}

/// The thread's current scheduler.
pub fn current() -> Rc<dyn Scheduler> {
    let installed = CURRENT.with(|current| current.borrow().clone());
    match installed {
        Some(scheduler) => scheduler,
        None => default_queue(),
    }
}

/// Install `scheduler` as the thread's current scheduler, returning the one
/// it replaces (if one had been installed).
pub fn set_current(scheduler: Rc<dyn Scheduler>) -> Option<Rc<dyn Scheduler>> {
    CURRENT.with(|current| current.borrow_mut().replace(scheduler))
}

/// Go back to the thread's default [`TaskQueue`].
pub fn reset_current() {
    CURRENT.with(|current| current.borrow_mut().take());
}

/// The per-thread queue used when nothing else is installed. Hosts drain it
/// from their own loop.
pub fn default_queue() -> Rc<TaskQueue> {
    DEFAULT_QUEUE.with(Rc::clone)
}
