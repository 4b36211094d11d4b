//! Virtual-clock task queue.
//!
//! Tasks are ordered by due time, then by the order they were scheduled.
//! Advancing the clock runs every task that falls due, moving `now` to each
//! task's due time before running it, so tasks scheduled from inside a task
//! land relative to the right instant.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::{Scheduler, Task, TimerId};

/// Upper bound on tasks run by one [`TaskQueue::run_until_idle`] call.
const IDLE_RUN_LIMIT: usize = 10_000;

/// A deterministic scheduler driven by explicit clock advances.
pub struct TaskQueue {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    /// Keyed by (due time, timer id).
    timers: RefCell<BTreeMap<(Duration, u64), Task>>,
}

impl TaskQueue {
    /// Create an empty queue at time zero.
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            next_id: Cell::new(0),
            timers: RefCell::new(BTreeMap::new()),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Remove the earliest task due at or before `limit`.
    fn pop_due(&self, limit: Duration) -> Option<(Duration, Task)> {
        let mut timers = self.timers.borrow_mut();
        let key = *timers.keys().next()?;
        if key.0 > limit {
            return None;
        }
        let task = timers.remove(&key)?;
        Some((key.0, task))
    }

    /// Move the clock forward by `by`, running everything that falls due.
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now.get() + by;
        let mut ran = 0;
        while let Some((due, task)) = self.pop_due(target) {
            self.now.set(due.max(self.now.get()));
            task();
            ran += 1;
        }
        self.now.set(target);
        ran
    }

    /// Run tasks that are already due without moving the clock.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Keep jumping to the next due task until the queue is empty.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while ran < IDLE_RUN_LIMIT {
            let Some((due, task)) = self.pop_due(Duration::MAX) else {
                break;
            };
            self.now.set(due.max(self.now.get()));
            task();
            ran += 1;
        }
        if ran == IDLE_RUN_LIMIT {
            tracing::warn!(limit = IDLE_RUN_LIMIT, "task queue still busy after run limit");
        }
        ran
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TaskQueue {
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let due = self.now.get().saturating_add(delay);
        self.timers.borrow_mut().insert((due, id), task);
        TimerId::new(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        self.timers.borrow_mut().retain(|(_, raw), _| *raw != id.raw());
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn push(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Task {
        let log = Rc::clone(log);
        Box::new(move || log.borrow_mut().push(name))
    }

    #[test]
    fn runs_in_due_then_insertion_order() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        queue.set_timeout(Duration::from_millis(20), push(&log, "late"));
        queue.set_timeout(Duration::from_millis(10), push(&log, "first"));
        queue.set_timeout(Duration::from_millis(10), push(&log, "second"));

        assert_eq!(queue.advance(Duration::from_millis(15)), 2);
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert_eq!(queue.now(), Duration::from_millis(15));

        queue.advance(Duration::from_millis(5));
        assert_eq!(*log.borrow(), vec!["first", "second", "late"]);
    }

    #[test]
    fn cleared_tasks_never_run() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let id = queue.set_timeout(Duration::from_millis(1), push(&log, "cleared"));
        queue.set_timeout(Duration::from_millis(1), push(&log, "kept"));
        queue.clear_timeout(id);
        queue.clear_timeout(id);

        queue.run_until_idle();
        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn tasks_scheduled_from_tasks_use_due_time() {
        let queue = Rc::new(TaskQueue::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let inner_queue = Rc::clone(&queue);
            let log = Rc::clone(&log);
            queue.set_timeout(
                Duration::from_millis(10),
                Box::new(move || {
                    log.borrow_mut().push("outer");
                    let log = Rc::clone(&log);
                    inner_queue.set_timeout(
                        Duration::from_millis(10),
                        Box::new(move || log.borrow_mut().push("inner")),
                    );
                }),
            );
        }

        queue.advance(Duration::from_millis(25));
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn run_pending_does_not_move_clock() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.set_timeout(Duration::ZERO, push(&log, "now"));
        queue.set_timeout(Duration::from_millis(1), push(&log, "later"));

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(queue.now(), Duration::ZERO);
        assert_eq!(queue.pending(), 1);
    }
}
