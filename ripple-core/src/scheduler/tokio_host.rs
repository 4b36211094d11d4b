//! Tokio-backed timers.
//!
//! Tasks are spawned with `tokio::task::spawn_local`, so a `TokioScheduler`
//! must be used from inside a `tokio::task::LocalSet`. Reactive nodes are
//! `!Send`; this is the only way to put them on a tokio timer.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{Scheduler, Task, TimerId};

/// Scheduler that runs deferred tasks on the current `LocalSet`.
#[derive(Default)]
pub struct TokioScheduler {
    next_id: Cell<u64>,
    tasks: Rc<RefCell<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers that have not fired or been cleared.
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }
}

impl Scheduler for TokioScheduler {
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let tasks = Rc::clone(&self.tasks);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            tasks.borrow_mut().remove(&id);
            task();
        });
        self.tasks.borrow_mut().insert(id, handle);
        TimerId::new(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        let handle = self.tasks.borrow_mut().remove(&id.raw());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
