//! Bidirectional pipelines of handlers bound to one event loop.
//!
//! A [`Channel`] is an ordered chain of slots. Read messages enter at
//! the terminal (socket) slot and flow toward the user slot; writes flow
//! the other way. Each slot carries a read window (the number of bytes
//! its handler is still willing to accept), which is how backpressure
//! propagates from a slow consumer all the way down to the socket.
//!
//! After construction completes a channel is only ever touched from its
//! event loop's thread. The [`Channel`] handle itself is `Send`; the
//! operations that are legal cross-thread (`shutdown`, window
//! increments via [`SlotHandle`]) marshal themselves onto the loop as
//! tasks.

mod handler;
mod message;
mod slot;
mod socket_handler;
mod stats;

pub use self::handler::{ChannelHandler, Direction};
pub use self::message::{Message, MessageType};
pub use self::slot::{SendError, Slot, SlotHandle};
pub use self::socket_handler::SocketHandler;
pub use self::stats::{ChannelStatistics, TlsNegotiationStatus};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::task::{Task, TaskStatus};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a channel.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChannelState {
    /// Accepting reads and writes.
    Active,
    /// The read-direction shutdown cascade is running.
    ShuttingDownRead,
    /// The write-direction shutdown cascade is running.
    ShuttingDownWrite,
    /// Both directions have drained; the slots are released.
    ShutdownComplete,
}

type SetupCallback = Box<dyn FnOnce(Result<Channel>) + Send>;
type ShutdownCallback = Box<dyn FnOnce(Channel, Result<()>) + Send>;
type StatsObserver = Box<dyn FnMut(&ChannelStatistics)>;

/// Options for [`Channel::new`].
pub struct ChannelOptions {
    on_setup_completed: Option<SetupCallback>,
    on_shutdown_completed: Option<ShutdownCallback>,
    enable_read_back_pressure: bool,
}

impl ChannelOptions {
    /// Returns options with no callbacks and read backpressure off.
    pub fn new() -> ChannelOptions {
        ChannelOptions {
            on_setup_completed: None,
            on_shutdown_completed: None,
            enable_read_back_pressure: false,
        }
    }

    /// Callback fired on the loop thread once the channel is bound to
    /// it, before any handler is installed. Handlers may be appended
    /// synchronously from inside the callback. Fired exactly once; on
    /// setup failure it receives the error and no shutdown callback ever
    /// follows.
    pub fn on_setup_completed<F>(mut self, f: F) -> ChannelOptions
    where
        F: FnOnce(Result<Channel>) + Send + 'static,
    {
        self.on_setup_completed = Some(Box::new(f));
        self
    }

    /// Callback fired at most once, after both shutdown directions have
    /// drained. Receives the channel's sticky error, `Ok(())` for a
    /// clean shutdown.
    pub fn on_shutdown_completed<F>(mut self, f: F) -> ChannelOptions
    where
        F: FnOnce(Channel, Result<()>) + Send + 'static,
    {
        self.on_shutdown_completed = Some(Box::new(f));
        self
    }

    /// Enables per-slot read windows. Without this, windows are
    /// unlimited and increments are no-ops.
    pub fn enable_read_back_pressure(mut self, enable: bool) -> ChannelOptions {
        self.enable_read_back_pressure = enable;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> ChannelOptions {
        ChannelOptions::new()
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("enable_read_back_pressure", &self.enable_read_back_pressure)
            .finish()
    }
}

/// Handle to a channel. Cheap to clone, `Send`, and valid from any
/// thread; operations that need the loop thread marshal themselves.
#[derive(Clone)]
pub struct Channel {
    event_loop: EventLoop,
    id: u64,
}

impl Channel {
    /// Creates a channel bound to `event_loop`.
    ///
    /// Construction is asynchronous: the returned handle is immediately
    /// usable, and `on_setup_completed` fires on the loop thread once
    /// the channel is registered there. If the loop is already gone the
    /// setup callback fires with [`Error::EventLoopShutdown`].
    pub fn new(event_loop: &EventLoop, options: ChannelOptions) -> Channel {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let channel = Channel {
            event_loop: event_loop.clone(),
            id,
        };

        let ChannelOptions {
            on_setup_completed,
            on_shutdown_completed,
            enable_read_back_pressure,
        } = options;

        let setup_channel = channel.clone();
        let task = Task::new("channel-setup", move |status: TaskStatus| {
            if status == TaskStatus::Canceled {
                if let Some(cb) = on_setup_completed {
                    cb(Err(Error::EventLoopShutdown));
                }
                return;
            }
            let core = Rc::new(ChannelCore {
                id,
                event_loop: setup_channel.event_loop.clone(),
                read_backpressure: enable_read_back_pressure,
                state: Cell::new(ChannelState::Active),
                error: RefCell::new(None),
                slots: RefCell::new(Vec::new()),
                queue: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
                window_task_scheduled: Cell::new(false),
                free_scarce: Cell::new(false),
                on_shutdown: RefCell::new(on_shutdown_completed),
                io_started: Cell::new(false),
                bytes_read: Cell::new(0),
                bytes_written: Cell::new(0),
                tls_status: Cell::new(TlsNegotiationStatus::None),
                stats_observer: RefCell::new(None),
                stats_interval: Cell::new(None),
            });
            match setup_channel.event_loop.register_channel(id, core) {
                Ok(()) => {
                    trace!("channel {} bound to its event loop", id);
                    if let Some(cb) = on_setup_completed {
                        cb(Ok(setup_channel.clone()));
                    }
                }
                Err(err) => {
                    if let Some(cb) = on_setup_completed {
                        cb(Err(err));
                    }
                }
            }
        });
        if let Err(rejected) = event_loop.schedule_internal(task, None) {
            // No loop thread will ever run the task; let its Canceled
            // path deliver the setup failure here.
            rejected.task.run(TaskStatus::Canceled);
        }
        channel
    }

    /// The loop this channel is bound to.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Requests a graceful shutdown: buffered writes are flushed, then
    /// both directions drain slot by slot and the shutdown callback
    /// fires. Thread-safe and idempotent; the first non-success error is
    /// sticky.
    pub fn shutdown(&self, error: Option<Error>) {
        self.shutdown_inner(error, false);
    }

    /// Like [`Channel::shutdown`], but abandons buffered data instead of
    /// flushing it. Pending write completions fire with the shutdown
    /// error.
    pub fn force_shutdown(&self, error: Option<Error>) {
        self.shutdown_inner(error, true);
    }

    fn shutdown_inner(&self, error: Option<Error>, free_scarce: bool) {
        let channel = self.clone();
        let task = Task::new("channel-shutdown", move |status: TaskStatus| {
            if status == TaskStatus::RunReady {
                let _ = channel.with_core(|core| core.begin_shutdown(error, free_scarce));
            }
        });
        if let Err(rejected) = self.event_loop.schedule_internal(task, None) {
            trace!("channel {}: shutdown dropped, loop is gone", self.id);
            rejected.task.run(TaskStatus::Canceled);
        }
    }

    /// Appends a handler at the user end of the pipeline. On-thread
    /// only, and only while the channel is active.
    pub fn append_handler(&self, handler: Box<dyn ChannelHandler>) -> Result<SlotHandle> {
        self.with_core(|core| core.append_handler(handler))?
    }

    /// Current lifecycle state. On-thread only.
    pub fn state(&self) -> Result<ChannelState> {
        self.with_core(|core| core.state.get())
    }

    /// Installs the statistics observer and starts periodic flushes
    /// every `interval`. On-thread only, and only before the channel has
    /// performed I/O.
    pub fn set_statistics_observer<F>(&self, interval: Duration, observer: F) -> Result<()>
    where
        F: FnMut(&ChannelStatistics) + 'static,
    {
        self.with_core(|core| core.set_statistics_observer(interval, Box::new(observer)))?
    }

    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&Rc<ChannelCore>) -> R) -> Result<R> {
        match self.event_loop.channel_core(self.id)? {
            Some(core) => Ok(f(&core)),
            None => Err(Error::ChannelShutdown),
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

enum Dispatch {
    Read { target: usize, message: Message },
    Write { target: usize, message: Message },
}

/// Loop-local channel state: the slot arena plus the trampoline queue
/// that serializes handler invocations.
pub(crate) struct ChannelCore {
    id: u64,
    event_loop: EventLoop,
    read_backpressure: bool,
    state: Cell<ChannelState>,
    error: RefCell<Option<Error>>,
    slots: RefCell<Vec<Rc<Slot>>>,
    queue: RefCell<VecDeque<Dispatch>>,
    draining: Cell<bool>,
    window_task_scheduled: Cell<bool>,
    free_scarce: Cell<bool>,
    on_shutdown: RefCell<Option<ShutdownCallback>>,
    io_started: Cell<bool>,
    bytes_read: Cell<u64>,
    bytes_written: Cell<u64>,
    tls_status: Cell<TlsNegotiationStatus>,
    stats_observer: RefCell<Option<StatsObserver>>,
    stats_interval: Cell<Option<Duration>>,
}

impl ChannelCore {
    pub(crate) fn channel(&self) -> Channel {
        Channel {
            event_loop: self.event_loop.clone(),
            id: self.id,
        }
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    fn append_handler(self: &Rc<Self>, handler: Box<dyn ChannelHandler>) -> Result<SlotHandle> {
        if self.state.get() != ChannelState::Active {
            return Err(Error::ChannelShutdown);
        }
        let mut slots = self.slots.borrow_mut();
        let idx = slots.len();
        let window = if self.read_backpressure {
            handler.initial_window_size()
        } else {
            usize::MAX
        };
        slots.push(Rc::new(Slot {
            idx,
            channel: Rc::downgrade(self),
            handler: RefCell::new(Some(handler)),
            window: Cell::new(window),
            pending_window: Cell::new(0),
        }));
        trace!("channel {}: appended handler in slot {}", self.id, idx);
        Ok(SlotHandle::new(self.channel(), idx))
    }

    /// Invokes `f` on the handler in `idx` without draining afterwards.
    /// The handler's cell is borrowed for the duration of the call; a
    /// delivery that would re-enter a handler already on the stack (a
    /// handler canceling its own task gets the `Canceled` dispatch
    /// synchronously) is skipped instead.
    fn invoke_raw<R>(
        self: &Rc<Self>,
        idx: usize,
        f: impl FnOnce(&mut dyn ChannelHandler, &Slot) -> R,
    ) -> Option<R> {
        let slot = self.slots.borrow().get(idx).cloned()?;
        let mut guard = match slot.handler.try_borrow_mut() {
            Ok(guard) => guard,
            Err(_) => {
                trace!("channel {}: skipping re-entrant delivery to slot {}", self.id, idx);
                return None;
            }
        };
        let handler = guard.as_mut()?;
        Some(f(handler.as_mut(), &slot))
    }

    fn invoke<R>(
        self: &Rc<Self>,
        idx: usize,
        f: impl FnOnce(&mut dyn ChannelHandler, &Slot) -> R,
    ) -> Option<R> {
        // Queue mode while the handler runs: messages it sends enqueue
        // and are delivered after it returns, not from inside its own
        // activation.
        let was_draining = self.draining.replace(true);
        let result = self.invoke_raw(idx, f);
        self.draining.set(was_draining);
        self.drain();
        result
    }

    /// Runs queued deliveries until the queue is empty. Re-entrant calls
    /// are no-ops: each handler invocation returns before the next
    /// begins, which is what makes a synchronous echo (write from inside
    /// a read callback) safe.
    fn drain(self: &Rc<Self>) {
        if self.draining.replace(true) {
            return;
        }
        loop {
            let item = self.queue.borrow_mut().pop_front();
            let Some(item) = item else { break };
            let result = match item {
                Dispatch::Read { target, message } => {
                    self.dispatch(target, message, Direction::Read)
                }
                Dispatch::Write { target, message } => {
                    self.dispatch(target, message, Direction::Write)
                }
            };
            if let Some(Err(err)) = result {
                warn!("channel {}: handler failed: {}", self.id, err);
                self.begin_shutdown(Some(err), false);
            }
        }
        self.draining.set(false);
    }

    fn dispatch(
        self: &Rc<Self>,
        target: usize,
        message: Message,
        direction: Direction,
    ) -> Option<Result<()>> {
        let slot = self.slots.borrow().get(target).cloned();
        let Some(slot) = slot else {
            message.complete(Err(Error::ChannelShutdown));
            return None;
        };
        let mut guard = slot.handler.borrow_mut();
        let Some(handler) = guard.as_mut() else {
            message.complete(Err(Error::ChannelShutdown));
            return None;
        };
        Some(match direction {
            Direction::Read => handler.process_read_message(&slot, message),
            Direction::Write => handler.process_write_message(&slot, message),
        })
    }

    pub(crate) fn send_read(
        self: &Rc<Self>,
        from: usize,
        message: Message,
    ) -> std::result::Result<(), SendError> {
        if self.state.get() == ChannelState::ShutdownComplete {
            return Err(SendError {
                error: Error::ChannelShutdown,
                message,
            });
        }
        let target = from + 1;
        {
            let slots = self.slots.borrow();
            let Some(slot) = slots.get(target) else {
                return Err(SendError {
                    error: Error::ChannelShutdown,
                    message,
                });
            };
            if self.read_backpressure {
                let window = slot.window.get();
                if message.len() > window {
                    return Err(SendError {
                        error: Error::ReadWindowExceeded,
                        message,
                    });
                }
                slot.window.set(window - message.len());
            }
        }
        self.queue
            .borrow_mut()
            .push_back(Dispatch::Read { target, message });
        self.drain();
        Ok(())
    }

    pub(crate) fn send_write(
        self: &Rc<Self>,
        from: usize,
        message: Message,
    ) -> std::result::Result<(), SendError> {
        if self.state.get() == ChannelState::ShutdownComplete {
            return Err(SendError {
                error: Error::ChannelShutdown,
                message,
            });
        }
        if from == 0 || self.slots.borrow().len() < from {
            return Err(SendError {
                error: Error::ChannelShutdown,
                message,
            });
        }
        self.queue.borrow_mut().push_back(Dispatch::Write {
            target: from - 1,
            message,
        });
        self.drain();
        Ok(())
    }

    pub(crate) fn upstream_read_window(&self, from: usize) -> usize {
        if !self.read_backpressure {
            return usize::MAX;
        }
        self.slots
            .borrow()
            .get(from + 1)
            .map(|slot| slot.window.get())
            .unwrap_or(0)
    }

    /// Accumulates a window increment and schedules the update task.
    /// The task runs whenever the channel has not fully shut down, so
    /// data cached below a closed window still flushes while a shutdown
    /// cascade is in flight.
    pub(crate) fn slot_increment(self: &Rc<Self>, idx: usize, delta: usize) {
        if !self.read_backpressure || delta == 0 {
            return;
        }
        if self.state.get() == ChannelState::ShutdownComplete {
            return;
        }
        let slot = self.slots.borrow().get(idx).cloned();
        let Some(slot) = slot else { return };
        slot.pending_window
            .set(slot.pending_window.get().saturating_add(delta));
        if self.window_task_scheduled.replace(true) {
            return;
        }
        let channel = self.channel();
        let task = Task::new("channel-window-update", move |status: TaskStatus| {
            if status == TaskStatus::RunReady {
                let _ = channel.with_core(|core| core.run_window_update());
            }
        });
        if let Err(rejected) = self.event_loop.schedule_internal(task, None) {
            rejected.task.run(TaskStatus::Canceled);
        }
    }

    fn run_window_update(self: &Rc<Self>) {
        self.window_task_scheduled.set(false);
        if self.state.get() == ChannelState::ShutdownComplete {
            return;
        }
        let len = self.slots.borrow().len();
        for idx in (0..len).rev() {
            let slot = self.slots.borrow().get(idx).cloned();
            let Some(slot) = slot else { continue };
            let delta = slot.pending_window.replace(0);
            if delta == 0 {
                continue;
            }
            slot.window.set(slot.window.get().saturating_add(delta));
            if idx > 0 {
                self.invoke(idx - 1, |handler, s| handler.increment_read_window(s, delta));
            }
        }
    }

    pub(crate) fn deliver_slot_task(
        self: &Rc<Self>,
        idx: usize,
        tag: &'static str,
        status: TaskStatus,
    ) {
        self.invoke(idx, |handler, slot| handler.on_task(slot, tag, status));
    }

    fn record_error(&self, error: Option<Error>) {
        if let Some(err) = error {
            let mut stored = self.error.borrow_mut();
            if stored.is_none() {
                *stored = Some(err);
            }
        }
    }

    pub(crate) fn begin_shutdown(self: &Rc<Self>, error: Option<Error>, free_scarce: bool) {
        self.record_error(error);
        if free_scarce {
            self.free_scarce.set(true);
        }
        if self.state.get() != ChannelState::Active {
            return;
        }
        trace!("channel {}: shutdown begins (read direction)", self.id);
        self.state.set(ChannelState::ShuttingDownRead);
        if self.slots.borrow().is_empty() {
            self.complete_shutdown();
            return;
        }
        self.shutdown_slot(0, Direction::Read);
    }

    fn shutdown_slot(self: &Rc<Self>, idx: usize, direction: Direction) {
        let error = self.error.borrow().clone();
        let free_scarce = self.free_scarce.get();
        self.invoke(idx, |handler, slot| {
            handler.shutdown(slot, direction, error, free_scarce)
        });
    }

    /// A handler finished one direction; the advance to the next slot is
    /// task-posted so a synchronously-completing handler is never
    /// re-entered, and so pending window updates interleave FIFO with
    /// the cascade.
    pub(crate) fn handler_shutdown_complete(
        self: &Rc<Self>,
        idx: usize,
        direction: Direction,
        error: Option<Error>,
    ) {
        self.record_error(error);
        let channel = self.channel();
        let task = Task::new("channel-shutdown-advance", move |status: TaskStatus| {
            if status == TaskStatus::RunReady {
                let _ = channel.with_core(|core| core.advance_shutdown(idx, direction));
            }
        });
        if let Err(rejected) = self.event_loop.schedule_internal(task, None) {
            rejected.task.run(TaskStatus::Canceled);
        }
    }

    fn advance_shutdown(self: &Rc<Self>, idx: usize, direction: Direction) {
        if self.state.get() == ChannelState::ShutdownComplete {
            return;
        }
        let len = self.slots.borrow().len();
        match direction {
            Direction::Read => {
                if idx + 1 < len {
                    self.shutdown_slot(idx + 1, Direction::Read);
                } else {
                    trace!("channel {}: read direction drained, shutting down writes", self.id);
                    self.state.set(ChannelState::ShuttingDownWrite);
                    self.shutdown_slot(len - 1, Direction::Write);
                }
            }
            Direction::Write => {
                if idx > 0 {
                    self.shutdown_slot(idx - 1, Direction::Write);
                } else {
                    self.complete_shutdown();
                }
            }
        }
    }

    fn complete_shutdown(self: &Rc<Self>) {
        if self.state.get() == ChannelState::ShutdownComplete {
            return;
        }
        self.state.set(ChannelState::ShutdownComplete);
        let error = self.error.borrow().clone();
        trace!(
            "channel {}: shutdown complete (error: {:?})",
            self.id,
            error.as_ref().map(Error::code)
        );

        // Release the arena. Undelivered messages report the sticky
        // error through their completions rather than vanishing.
        let pending: Vec<Dispatch> = self.queue.borrow_mut().drain(..).collect();
        for item in pending {
            let (Dispatch::Read { message, .. } | Dispatch::Write { message, .. }) = item;
            message.complete(Err(error.clone().unwrap_or(Error::ChannelShutdown)));
        }
        let slots: Vec<Rc<Slot>> = self.slots.borrow_mut().drain(..).collect();
        for slot in slots {
            if let Some(mut handler) = slot.handler.borrow_mut().take() {
                handler.destroy();
            }
        }

        self.event_loop.deregister_channel(self.id);
        if let Some(cb) = self.on_shutdown.borrow_mut().take() {
            let result = match error {
                None => Ok(()),
                Some(err) => Err(err),
            };
            cb(self.channel(), result);
        }
    }

    fn set_statistics_observer(
        self: &Rc<Self>,
        interval: Duration,
        observer: StatsObserver,
    ) -> Result<()> {
        if self.io_started.get() {
            return Err(Error::StatisticsObserverTooLate);
        }
        *self.stats_observer.borrow_mut() = Some(observer);
        self.stats_interval.set(Some(interval));
        self.schedule_stats_flush();
        Ok(())
    }

    fn schedule_stats_flush(self: &Rc<Self>) {
        let Some(interval) = self.stats_interval.get() else {
            return;
        };
        let channel = self.channel();
        let task = Task::new("channel-stats-flush", move |status: TaskStatus| {
            if status == TaskStatus::RunReady {
                let _ = channel.with_core(|core| core.flush_stats());
            }
        });
        if self
            .event_loop
            .schedule_internal(task, Some(interval))
            .is_err()
        {
            trace!("channel {}: statistics flush not rescheduled, loop is gone", self.id);
        }
    }

    fn flush_stats(self: &Rc<Self>) {
        if self.state.get() == ChannelState::ShutdownComplete {
            return;
        }
        let snapshot = ChannelStatistics {
            bytes_read: self.bytes_read.get(),
            bytes_written: self.bytes_written.get(),
            tls_status: self.tls_status.get(),
        };
        if let Some(observer) = self.stats_observer.borrow_mut().as_mut() {
            observer(&snapshot);
        }
        self.schedule_stats_flush();
    }

    pub(crate) fn note_bytes_read(&self, n: usize) {
        self.io_started.set(true);
        self.bytes_read.set(self.bytes_read.get() + n as u64);
    }

    pub(crate) fn note_bytes_written(&self, n: usize) {
        self.io_started.set(true);
        self.bytes_written.set(self.bytes_written.get() + n as u64);
    }

    pub(crate) fn set_tls_status(&self, status: TlsNegotiationStatus) {
        self.tls_status.set(status);
    }

    pub(crate) fn recorded_error(&self) -> Option<Error> {
        self.error.borrow().clone()
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("slots", &self.slots.borrow().len())
            .finish()
    }
}
