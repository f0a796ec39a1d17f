//! Deferred work scheduled onto an event loop.
//!
//! A [`Task`] is run exactly once, on the owning loop's thread, with a
//! [`TaskStatus`] telling the callback whether it is being dispatched
//! normally or as part of cancellation/teardown. Callbacks must release
//! any owned resources under both statuses.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;

/// Why a task callback is being invoked.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskStatus {
    /// The task's time has arrived and it is running on the loop thread.
    RunReady,
    /// The task was canceled, or its loop is tearing down. The callback
    /// runs so owned resources can be released; it must not start new
    /// work.
    Canceled,
}

/// Identifier for a scheduled task, usable with cancellation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u64);

/// A unit of deferred work.
pub struct Task {
    tag: &'static str,
    f: Box<dyn FnOnce(TaskStatus) + Send>,
}

impl Task {
    /// Creates a task. The `tag` names the task in logs and must be a
    /// short static description such as `"channel-shutdown"`.
    pub fn new<F>(tag: &'static str, f: F) -> Task
    where
        F: FnOnce(TaskStatus) + Send + 'static,
    {
        Task {
            tag,
            f: Box::new(f),
        }
    }

    /// The tag the task was created with.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub(crate) fn run(self, status: TaskStatus) {
        trace!("running task `{}` with status {:?}", self.tag, status);
        (self.f)(status);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("tag", &self.tag).finish()
    }
}

/// Loop-local task queue: an intrusive FIFO for run-now tasks plus a
/// min-heap keyed by `(run_at_ns, insertion order)` for timers.
///
/// Cancellation is lazy on the heap side: the entry's body is removed
/// from the side table and stale keys are skipped when popped.
pub(crate) struct Scheduler {
    next_id: u64,
    ready: VecDeque<TaskId>,
    timed: BinaryHeap<Reverse<(u64, u64)>>,
    tasks: HashMap<TaskId, Task>,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            next_id: 0,
            ready: VecDeque::new(),
            timed: BinaryHeap::new(),
            tasks: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Schedules a task to run on the next turn, before any timer.
    pub(crate) fn schedule_now(&mut self, task: Task) -> TaskId {
        let id = self.next_id();
        self.tasks.insert(id, task);
        self.ready.push_back(id);
        id
    }

    /// Schedules a task to run once `now_ns >= run_at_ns`.
    pub(crate) fn schedule_at(&mut self, task: Task, run_at_ns: u64) -> TaskId {
        let id = self.next_id();
        self.tasks.insert(id, task);
        self.timed.push(Reverse((run_at_ns, id.0)));
        id
    }

    /// Cancels a task, dispatching its callback with
    /// [`TaskStatus::Canceled`] so resources release. Idempotent; returns
    /// true if the task was still pending.
    pub(crate) fn cancel(&mut self, id: TaskId) -> bool {
        match self.tasks.remove(&id) {
            Some(task) => {
                task.run(TaskStatus::Canceled);
                true
            }
            None => false,
        }
    }

    /// The soonest time at which work is due, or `None` when idle.
    /// Run-now tasks make every instant due.
    pub(crate) fn next_due_ns(&mut self) -> Option<u64> {
        if !self.ready.is_empty() {
            return Some(0);
        }
        while let Some(&Reverse((run_at, raw_id))) = self.timed.peek() {
            if self.tasks.contains_key(&TaskId(raw_id)) {
                return Some(run_at);
            }
            // Canceled entry, drop the stale key.
            self.timed.pop();
        }
        None
    }

    /// Removes every task whose time has arrived, in dispatch order:
    /// the run-now FIFO first, then due timers in `(time, insertion)`
    /// order. Tasks scheduled while the returned batch runs land in the
    /// next turn.
    pub(crate) fn take_due(&mut self, now_ns: u64) -> Vec<Task> {
        let mut due = Vec::new();
        for id in self.ready.drain(..) {
            if let Some(task) = self.tasks.remove(&id) {
                due.push(task);
            }
        }
        while let Some(&Reverse((run_at, raw_id))) = self.timed.peek() {
            if run_at > now_ns {
                break;
            }
            self.timed.pop();
            if let Some(task) = self.tasks.remove(&TaskId(raw_id)) {
                due.push(task);
            }
        }
        due
    }

    /// Removes every remaining task, due or not. Used at loop teardown;
    /// the caller dispatches them with [`TaskStatus::Canceled`].
    pub(crate) fn drain_all(&mut self) -> Vec<Task> {
        self.ready.clear();
        self.timed.clear();
        self.tasks.drain().map(|(_, task)| task).collect()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn recording_task(
        tag: &'static str,
        log: &Arc<Mutex<Vec<(&'static str, TaskStatus)>>>,
    ) -> Task {
        let log = Arc::clone(log);
        Task::new(tag, move |status| log.lock().unwrap().push((tag, status)))
    }

    #[test]
    fn run_now_precedes_due_timers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = Scheduler::new();
        sched.schedule_at(recording_task("timer", &log), 0);
        sched.schedule_now(recording_task("now", &log));

        for task in sched.take_due(10) {
            task.run(TaskStatus::RunReady);
        }
        let order: Vec<_> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(order, ["now", "timer"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn equal_deadlines_run_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sched = Scheduler::new();
        sched.schedule_at(recording_task("a", &log), 5);
        sched.schedule_at(recording_task("b", &log), 5);
        sched.schedule_at(recording_task("c", &log), 5);

        for task in sched.take_due(5) {
            task.run(TaskStatus::RunReady);
        }
        let order: Vec<_> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn future_tasks_are_not_due_yet() {
        let mut sched = Scheduler::new();
        sched.schedule_at(Task::new("later", |_| {}), 100);
        assert_eq!(sched.next_due_ns(), Some(100));
        assert!(sched.take_due(99).is_empty());
        assert_eq!(sched.take_due(100).len(), 1);
    }

    #[test]
    fn cancel_dispatches_with_canceled_status() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut sched = Scheduler::new();
        let hits2 = Arc::clone(&hits);
        let id = sched.schedule_at(
            Task::new("cancel-me", move |status| {
                assert_eq!(status, TaskStatus::Canceled);
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            50,
        );
        assert!(sched.cancel(id));
        // Second cancel is a no-op.
        assert!(!sched.cancel(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The stale heap key does not resurrect the task.
        assert!(sched.take_due(1000).is_empty());
        assert_eq!(sched.next_due_ns(), None);
    }

    #[test]
    fn tasks_scheduled_in_the_past_run_next_turn() {
        let mut sched = Scheduler::new();
        sched.schedule_at(Task::new("past", |_| {}), 1);
        // `now` is already well beyond the deadline.
        assert_eq!(sched.take_due(500).len(), 1);
    }
}
