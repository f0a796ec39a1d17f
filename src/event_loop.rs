//! The per-thread reactor at the heart of the runtime.
//!
//! An [`EventLoop`] owns one OS thread while running. Everything that
//! happens on a channel (I/O readiness callbacks, timers, cross-thread
//! submissions) is funneled onto that thread and executed
//! cooperatively, one callback at a time. Each turn of the loop:
//!
//! 1. drains the cross-thread inbox into the local scheduler,
//! 2. computes the poll timeout from the soonest timer,
//! 3. polls the OS selector,
//! 4. dispatches readiness to subscribed callbacks in arrival order,
//! 5. runs due tasks,
//! 6. exits if stopping and no channels remain.
//!
//! External threads interact with a loop only through [`Task`]s: a
//! successful enqueue arms the loop's waker, and the task is processed
//! before the loop blocks again.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::channel::ChannelCore;
use crate::clock::{default_clock, Clock};
use crate::error::{Error, Result};
use crate::interest::{Interest, Readiness};
use crate::sys;
use crate::task::{Scheduler, Task, TaskId, TaskStatus};

/// Token reserved for the loop's own waker.
const WAKER_TOKEN: usize = usize::MAX;

const EVENTS_CAPACITY: usize = 256;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const JOINED: u8 = 3;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

/// Options for constructing an [`EventLoop`].
#[derive(Default)]
pub struct EventLoopOptions {
    /// Clock override, mainly for tests. Defaults to a monotonic clock.
    pub clock: Option<Arc<dyn Clock>>,
}

impl fmt::Debug for EventLoopOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopOptions")
            .field("clock", &self.clock.is_some())
            .finish()
    }
}

/// A task rejected at submission time. The caller keeps ownership of the
/// task so its resources can be released or the submission retried
/// elsewhere.
pub struct ScheduleError {
    /// The rejected task.
    pub task: Task,
    /// Why it was rejected.
    pub error: Error,
}

impl fmt::Debug for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleError")
            .field("task", &self.task)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task `{}` rejected: {}", self.task.tag(), self.error)
    }
}

struct InboxEntry {
    task: Task,
    run_at_ns: Option<u64>,
}

struct Inner {
    id: usize,
    clock: Arc<dyn Clock>,
    selector: sys::Selector,
    waker: sys::Waker,
    state: AtomicU8,
    inbox: Mutex<Vec<InboxEntry>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: OnceLock<thread::ThreadId>,
}

/// Handle to a per-thread reactor.
///
/// The handle is cheap to clone and may be used from any thread; the
/// operations that require the loop's own thread say so and fail with
/// [`Error::OffEventLoopThread`] elsewhere.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<RunState>>> = const { RefCell::new(None) };
}

/// State owned by the loop thread itself. Never crosses threads.
pub(crate) struct RunState {
    handle: EventLoop,
    pub(crate) scheduler: RefCell<Scheduler>,
    subscribers: RefCell<HashMap<usize, Rc<Subscription>>>,
    fd_tokens: RefCell<HashMap<RawFd, usize>>,
    next_token: Cell<usize>,
    pub(crate) channels: RefCell<HashMap<u64, Rc<ChannelCore>>>,
}

struct Subscription {
    fd: RawFd,
    callback: RefCell<Box<dyn FnMut(&EventLoop, Readiness)>>,
    active: Cell<bool>,
}

impl EventLoop {
    /// Creates a loop without starting its thread. The selector and
    /// waker exist from this point on, so tasks may be scheduled before
    /// [`EventLoop::run`]; they dispatch once the loop starts.
    pub fn new(options: EventLoopOptions) -> Result<EventLoop> {
        let selector = sys::Selector::new()?;
        let waker = sys::Waker::new()?;
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        selector.register(waker.as_raw_fd(), WAKER_TOKEN, Interest::READABLE)?;
        Ok(EventLoop {
            inner: Arc::new(Inner {
                id,
                clock: options.clock.unwrap_or_else(default_clock),
                selector,
                waker,
                state: AtomicU8::new(CREATED),
                inbox: Mutex::new(Vec::new()),
                thread: Mutex::new(None),
                thread_id: OnceLock::new(),
            }),
        })
    }

    /// Spawns the owned thread and enters the loop. Fails if the loop
    /// was already started or stopped.
    pub fn run(&self) -> Result<()> {
        self.inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::InvalidLoopState)?;

        let handle = self.clone();
        let thread = thread::Builder::new()
            .name(format!("sluice-el-{}", self.inner.id))
            .spawn(move || handle.thread_main())
            .map_err(|err| {
                self.inner.state.store(JOINED, Ordering::Release);
                Error::from(err)
            })?;
        *self.inner.thread.lock().unwrap() = Some(thread);
        Ok(())
    }

    /// Requests termination. Thread-safe and idempotent. The loop keeps
    /// running tasks and channel work until every channel on it has
    /// completed shutdown, then exits.
    pub fn stop(&self) {
        // A loop that never ran goes straight to joined; its pending
        // tasks are dispatched with `Canceled` here since no loop thread
        // will ever exist to do it.
        if self
            .inner
            .state
            .compare_exchange(CREATED, JOINED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let entries = mem::take(&mut *self.inner.inbox.lock().unwrap());
            for entry in entries {
                entry.task.run(TaskStatus::Canceled);
            }
            return;
        }
        if self
            .inner
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("event loop {} stopping", self.inner.id);
            if let Err(err) = self.inner.waker.wake() {
                warn!("failed to wake event loop {} for stop: {}", self.inner.id, err);
            }
        }
    }

    /// Blocks until the owned thread has exited. Must not be called from
    /// the loop's own thread.
    pub fn join(&self) -> Result<()> {
        if self.is_loop_thread() {
            return Err(Error::OffEventLoopThread);
        }
        let thread = self.inner.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            thread
                .join()
                .map_err(|_| Error::from(io::Error::other("event loop thread panicked")))?;
        }
        Ok(())
    }

    /// Returns true when called from the loop's own thread.
    pub fn is_loop_thread(&self) -> bool {
        self.inner
            .thread_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    /// The clock this loop schedules timers against.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    fn state(&self) -> u8 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// Schedules a task to run on the next turn, before any timer.
    ///
    /// Callable from any thread. On rejection the task is handed back,
    /// undisputedly owned by the caller.
    pub fn schedule_task_now(&self, task: Task) -> Result<(), ScheduleError> {
        self.schedule(task, None, false)
    }

    /// Schedules a task to run `delay` from now.
    pub fn schedule_task_future(&self, task: Task, delay: Duration) -> Result<(), ScheduleError> {
        let run_at = self.inner.clock.now_ns().saturating_add(delay.as_nanos() as u64);
        self.schedule(task, Some(run_at), false)
    }

    /// Like the public entry points but still accepted while the loop is
    /// stopping; channel shutdown cascades rely on this.
    pub(crate) fn schedule_internal(
        &self,
        task: Task,
        delay: Option<Duration>,
    ) -> Result<(), ScheduleError> {
        let run_at =
            delay.map(|d| self.inner.clock.now_ns().saturating_add(d.as_nanos() as u64));
        self.schedule(task, run_at, true)
    }

    fn schedule(
        &self,
        task: Task,
        run_at_ns: Option<u64>,
        internal: bool,
    ) -> Result<(), ScheduleError> {
        let accepts = |state: u8| match state {
            CREATED | RUNNING => true,
            STOPPING => internal,
            _ => false,
        };

        // On the loop thread the local scheduler is reachable directly.
        // During the final teardown drain the run state is already torn
        // down; those submissions are rejected like any other late ones.
        if self.is_loop_thread() && self.run_state_available() {
            if !accepts(self.state()) {
                return Err(ScheduleError {
                    task,
                    error: Error::EventLoopShutdown,
                });
            }
            let _ = self.with_run_state(|rs| {
                let mut scheduler = rs.scheduler.borrow_mut();
                match run_at_ns {
                    None => scheduler.schedule_now(task),
                    Some(at) => scheduler.schedule_at(task, at),
                };
            });
            return Ok(());
        }
        if self.is_loop_thread() {
            return Err(ScheduleError {
                task,
                error: Error::EventLoopShutdown,
            });
        }

        {
            let mut inbox = self.inner.inbox.lock().unwrap();
            // State is re-checked under the inbox lock: the loop's final
            // drain also takes it, so a task either lands before that
            // drain or observes the terminal state.
            if !accepts(self.state()) {
                return Err(ScheduleError {
                    task,
                    error: Error::EventLoopShutdown,
                });
            }
            inbox.push(InboxEntry { task, run_at_ns });
        }
        if let Err(err) = self.inner.waker.wake() {
            warn!("failed to wake event loop {}: {}", self.inner.id, err);
        }
        Ok(())
    }

    /// On-thread scheduling that hands back a cancelable [`TaskId`].
    pub(crate) fn schedule_local(&self, task: Task, delay: Option<Duration>) -> Result<TaskId> {
        let run_at =
            delay.map(|d| self.inner.clock.now_ns().saturating_add(d.as_nanos() as u64));
        self.with_run_state(|rs| {
            let mut scheduler = rs.scheduler.borrow_mut();
            match run_at {
                None => scheduler.schedule_now(task),
                Some(at) => scheduler.schedule_at(task, at),
            }
        })
    }

    /// Cancels a pending task. On-thread only; the task's callback runs
    /// synchronously with [`TaskStatus::Canceled`]. Returns true if the
    /// task had not yet dispatched.
    pub fn cancel_task(&self, id: TaskId) -> Result<bool> {
        self.with_run_state(|rs| rs.scheduler.borrow_mut().cancel(id))
    }

    /// Registers edge-triggered interest in `fd`. On-thread only.
    ///
    /// The callback is invoked on this thread for every readiness event
    /// and never again after [`EventLoop::unsubscribe`] returns.
    pub fn subscribe<F>(&self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: FnMut(&EventLoop, Readiness) + 'static,
    {
        self.with_run_state(|rs| -> Result<()> {
            if rs.fd_tokens.borrow().contains_key(&fd) {
                return Err(Error::AlreadySubscribed);
            }
            let token = rs.next_token.get();
            rs.next_token.set(token + 1);
            self.inner.selector.register(fd, token, interest)?;
            rs.fd_tokens.borrow_mut().insert(fd, token);
            rs.subscribers.borrow_mut().insert(
                token,
                Rc::new(Subscription {
                    fd,
                    callback: RefCell::new(Box::new(callback)),
                    active: Cell::new(true),
                }),
            );
            trace!("loop {}: subscribed fd {} with token {}", self.inner.id, fd, token);
            Ok(())
        })
        .and_then(|res| res)
    }

    /// Removes interest in `fd`. On-thread only, idempotent.
    pub fn unsubscribe(&self, fd: RawFd) -> Result<()> {
        self.with_run_state(|rs| {
            let token = rs.fd_tokens.borrow_mut().remove(&fd);
            if let Some(token) = token {
                if let Some(sub) = rs.subscribers.borrow_mut().remove(&token) {
                    sub.active.set(false);
                }
                if let Err(err) = self.inner.selector.deregister(fd) {
                    trace!("loop {}: deregister of fd {} failed: {}", self.inner.id, fd, err);
                }
            }
        })
    }

    fn run_state_available(&self) -> bool {
        CURRENT.with(|current| {
            matches!(current.borrow().as_deref(), Some(rs) if rs.handle.inner.id == self.inner.id)
        })
    }

    pub(crate) fn with_run_state<R>(&self, f: impl FnOnce(&RunState) -> R) -> Result<R> {
        if !self.is_loop_thread() {
            return Err(Error::OffEventLoopThread);
        }
        CURRENT.with(|current| {
            let current = current.borrow();
            match current.as_deref() {
                Some(rs) if rs.handle.inner.id == self.inner.id => Ok(f(rs)),
                _ => Err(Error::OffEventLoopThread),
            }
        })
    }

    pub(crate) fn register_channel(&self, id: u64, core: Rc<ChannelCore>) -> Result<()> {
        self.with_run_state(|rs| {
            rs.channels.borrow_mut().insert(id, core);
        })
    }

    pub(crate) fn deregister_channel(&self, id: u64) {
        let _ = self.with_run_state(|rs| {
            rs.channels.borrow_mut().remove(&id);
        });
    }

    pub(crate) fn channel_core(&self, id: u64) -> Result<Option<Rc<ChannelCore>>> {
        self.with_run_state(|rs| rs.channels.borrow().get(&id).cloned())
    }

    fn thread_main(self) {
        let _ = self.inner.thread_id.set(thread::current().id());
        let rs = Rc::new(RunState {
            handle: self.clone(),
            scheduler: RefCell::new(Scheduler::new()),
            subscribers: RefCell::new(HashMap::new()),
            fd_tokens: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            channels: RefCell::new(HashMap::new()),
        });
        CURRENT.with(|current| *current.borrow_mut() = Some(Rc::clone(&rs)));
        trace!("event loop {} running", self.inner.id);

        self.turn_loop(&rs);

        // Terminal state first, then the final inbox drain; the ordering
        // pairs with the state re-check under the inbox lock in
        // `schedule`, so no task can slip in after the drain.
        self.inner.state.store(JOINED, Ordering::Release);
        let entries = mem::take(&mut *self.inner.inbox.lock().unwrap());
        for entry in entries {
            entry.task.run(TaskStatus::Canceled);
        }
        let leftovers = rs.scheduler.borrow_mut().drain_all();
        for task in leftovers {
            task.run(TaskStatus::Canceled);
        }
        let fds: Vec<RawFd> = rs.fd_tokens.borrow().keys().copied().collect();
        for fd in fds {
            let _ = self.inner.selector.deregister(fd);
        }
        rs.subscribers.borrow_mut().clear();
        rs.fd_tokens.borrow_mut().clear();
        rs.channels.borrow_mut().clear();
        CURRENT.with(|current| *current.borrow_mut() = None);
        trace!("event loop {} joined", self.inner.id);
    }

    fn turn_loop(&self, rs: &Rc<RunState>) {
        let mut events = sys::Events::with_capacity(EVENTS_CAPACITY);
        loop {
            // 1. Cross-thread inbox into the local scheduler.
            let entries = mem::take(&mut *self.inner.inbox.lock().unwrap());
            for entry in entries {
                let mut scheduler = rs.scheduler.borrow_mut();
                match entry.run_at_ns {
                    None => scheduler.schedule_now(entry.task),
                    Some(at) => scheduler.schedule_at(entry.task, at),
                };
            }

            // 2. Poll timeout from the soonest timer.
            let now = self.inner.clock.now_ns();
            let timeout = rs
                .scheduler
                .borrow_mut()
                .next_due_ns()
                .map(|due| Duration::from_nanos(due.saturating_sub(now)));

            // 3. OS readiness.
            if let Err(err) = self.inner.selector.select(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("event loop {} poll failed: {}", self.inner.id, err);
                break;
            }

            // 4. Dispatch readiness in arrival order.
            for event in events.iter() {
                let token = sys::event::token(event);
                if token == WAKER_TOKEN {
                    self.inner.waker.ack();
                    continue;
                }
                let sub = rs.subscribers.borrow().get(&token).cloned();
                if let Some(sub) = sub {
                    if !sub.active.get() {
                        continue;
                    }
                    let readiness = sys::event::readiness(event);
                    if readiness.is_empty() {
                        continue;
                    }
                    trace!("loop {}: fd {} ready: {:?}", self.inner.id, sub.fd, readiness);
                    (sub.callback.borrow_mut())(self, readiness);
                }
            }

            // 5. Due tasks.
            let now = self.inner.clock.now_ns();
            let due = rs.scheduler.borrow_mut().take_due(now);
            for task in due {
                task.run(TaskStatus::RunReady);
            }

            // 6. Stop once every channel has wound down.
            if self.state() == STOPPING && rs.channels.borrow().is_empty() {
                break;
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("id", &self.inner.id).finish()
    }
}

/// A set of event loops, each on its own thread, with round-robin
/// channel placement.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

/// Options for constructing an [`EventLoopGroup`].
#[derive(Default)]
pub struct EventLoopGroupOptions {
    /// Number of loops; `0` means one per available core.
    pub loop_count: usize,
    /// Clock override shared by every loop in the group.
    pub clock: Option<Arc<dyn Clock>>,
}

impl fmt::Debug for EventLoopGroupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroupOptions")
            .field("loop_count", &self.loop_count)
            .field("clock", &self.clock.is_some())
            .finish()
    }
}

impl EventLoopGroup {
    /// Creates and starts `loop_count` loops.
    pub fn new(options: EventLoopGroupOptions) -> Result<EventLoopGroup> {
        let count = if options.loop_count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            options.loop_count
        };
        let clock = options.clock.unwrap_or_else(default_clock);

        let mut loops: Vec<EventLoop> = Vec::with_capacity(count);
        for _ in 0..count {
            let event_loop = EventLoop::new(EventLoopOptions {
                clock: Some(Arc::clone(&clock)),
            })?;
            if let Err(err) = event_loop.run() {
                for started in &loops {
                    started.stop();
                    let _ = started.join();
                }
                return Err(err);
            }
            loops.push(event_loop);
        }
        Ok(EventLoopGroup {
            inner: Arc::new(GroupInner {
                loops,
                next: AtomicUsize::new(0),
            }),
        })
    }

    /// Picks the next loop, round-robin.
    pub fn next_loop(&self) -> EventLoop {
        let idx = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.loops.len();
        self.inner.loops[idx].clone()
    }

    /// Number of loops in the group.
    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    /// Returns true if the group holds no loops. Groups are never
    /// constructed empty; this exists for API completeness.
    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }

    /// Handles to every loop in the group.
    pub fn loops(&self) -> Vec<EventLoop> {
        self.inner.loops.clone()
    }

    /// Stops every loop and joins their threads. Each loop keeps running
    /// until the channels on it have completed shutdown, so this blocks
    /// until the group's channels are drained.
    ///
    /// Fails with [`Error::OffEventLoopThread`] when called from one of
    /// the group's own loop threads, which would deadlock.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.loops.iter().any(EventLoop::is_loop_thread) {
            return Err(Error::OffEventLoopThread);
        }
        for event_loop in &self.inner.loops {
            event_loop.stop();
        }
        for event_loop in &self.inner.loops {
            event_loop.join()?;
        }
        Ok(())
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.inner.loops.len())
            .finish()
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.stop();
        }
        for event_loop in &self.loops {
            if event_loop.is_loop_thread() {
                warn!("event loop group dropped on its own loop thread; leaking the thread");
                continue;
            }
            let _ = event_loop.join();
        }
    }
}
