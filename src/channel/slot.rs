use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel::handler::{ChannelHandler, Direction};
use crate::channel::{Channel, ChannelCore, Message};
use crate::error::{Error, Result};
use crate::task::{Task, TaskId, TaskStatus};

/// A node in the channel's pipeline, holding one handler and its read
/// window.
///
/// Handlers receive their slot in every callback and use it to move
/// messages, adjust windows and report shutdown progress. Slots are
/// loop-local; the [`SlotHandle`] returned by [`Slot::handle`] is the
/// `Send` face used from other threads.
pub struct Slot {
    pub(crate) idx: usize,
    pub(crate) channel: Weak<ChannelCore>,
    pub(crate) handler: RefCell<Option<Box<dyn ChannelHandler>>>,
    /// Bytes this slot's handler is still willing to accept on the read
    /// path. Only decremented by delivery, only incremented through the
    /// window-update task.
    pub(crate) window: Cell<usize>,
    /// Increments accumulated since the last window-update task run.
    pub(crate) pending_window: Cell<usize>,
}

impl Slot {
    fn core(&self) -> Result<Rc<ChannelCore>> {
        self.channel.upgrade().ok_or(Error::ChannelShutdown)
    }

    /// Handle of the channel this slot belongs to.
    pub fn channel(&self) -> Result<Channel> {
        Ok(self.core()?.channel())
    }

    /// Sends a message toward the user end of the channel. Fails with
    /// [`Error::ReadWindowExceeded`] if the receiving slot's window is
    /// smaller than the message; the message is handed back inside the
    /// error.
    pub fn send_read(&self, message: Message) -> std::result::Result<(), SendError> {
        match self.core() {
            Ok(core) => core.send_read(self.idx, message),
            Err(error) => Err(SendError { error, message }),
        }
    }

    /// Sends a message toward the socket end of the channel.
    pub fn send_write(&self, message: Message) -> std::result::Result<(), SendError> {
        match self.core() {
            Ok(core) => core.send_write(self.idx, message),
            Err(error) => Err(SendError { error, message }),
        }
    }

    /// Grows this slot's read window by `size` bytes.
    ///
    /// The increment is applied by a task on the channel's loop, which
    /// also gives the handler below a chance to resume emitting; calling
    /// this from inside a handler callback is always safe.
    pub fn increment_read_window(&self, size: usize) -> Result<()> {
        let core = self.core()?;
        core.slot_increment(self.idx, size);
        Ok(())
    }

    /// Window of the slot above this one: how many bytes may currently
    /// be sent with [`Slot::send_read`]. `usize::MAX` when the channel
    /// runs without read backpressure.
    pub fn upstream_read_window(&self) -> usize {
        match self.core() {
            Ok(core) => core.upstream_read_window(self.idx),
            Err(_) => 0,
        }
    }

    /// Reports that this slot's handler finished shutting down in
    /// `direction`, advancing the channel's cascade to the next slot. A
    /// non-success `error` upgrades the channel's recorded error if none
    /// is stored yet.
    pub fn on_shutdown_complete(&self, direction: Direction, error: Option<Error>) {
        if let Ok(core) = self.core() {
            core.handler_shutdown_complete(self.idx, direction, error);
        }
    }

    /// Schedules a task delivered to this slot's handler through
    /// [`ChannelHandler::on_task`] with the given tag. `None` runs on
    /// the next loop turn.
    pub fn schedule_task(&self, tag: &'static str, delay: Option<Duration>) -> Result<TaskId> {
        let core = self.core()?;
        let channel = core.channel();
        let idx = self.idx;
        let task = Task::new(tag, move |status: TaskStatus| {
            let _ = channel.with_core(|core| core.deliver_slot_task(idx, tag, status));
        });
        core.event_loop().schedule_local(task, delay)
    }

    /// Cancels a task scheduled with [`Slot::schedule_task`]. The
    /// handler sees one final `on_task` with [`TaskStatus::Canceled`].
    pub fn cancel_task(&self, id: TaskId) -> Result<bool> {
        self.core()?.event_loop().cancel_task(id)
    }

    /// A `Send` handle addressing this slot from any thread.
    pub fn handle(&self) -> Result<SlotHandle> {
        Ok(SlotHandle {
            channel: self.core()?.channel(),
            idx: self.idx,
        })
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("idx", &self.idx)
            .field("window", &self.window.get())
            .finish()
    }
}

/// A send failed; the caller keeps the message.
pub struct SendError {
    /// Why the send was rejected.
    pub error: Error,
    /// The rejected message, returned to the caller.
    pub message: Message,
}

impl fmt::Debug for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("error", &self.error)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message rejected: {}", self.error)
    }
}

/// Cross-thread handle to a slot.
///
/// The only operation legal from off-thread is the read-window
/// increment, which is marshalled to the channel's loop as a task.
#[derive(Clone, Debug)]
pub struct SlotHandle {
    channel: Channel,
    idx: usize,
}

impl SlotHandle {
    pub(crate) fn new(channel: Channel, idx: usize) -> SlotHandle {
        SlotHandle { channel, idx }
    }

    pub(crate) fn idx(&self) -> usize {
        self.idx
    }

    /// The channel this slot belongs to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Schedules a task delivered to this slot's handler through
    /// [`ChannelHandler::on_task`], from any thread. This is how code
    /// outside the loop asks a handler to do something on it, e.g.
    /// start writing queued data.
    pub fn schedule_task(&self, tag: &'static str, delay: Option<Duration>) -> Result<()> {
        let channel = self.channel.clone();
        let idx = self.idx;
        let task = Task::new(tag, move |status: TaskStatus| {
            let _ = channel.with_core(|core| core.deliver_slot_task(idx, tag, status));
        });
        self.channel
            .event_loop()
            .schedule_internal(task, delay)
            .map_err(|rejected| rejected.error)
    }

    /// Grows the slot's read window by `size` bytes. On the channel's
    /// loop thread this takes the direct path; elsewhere it is
    /// marshalled as a task, which still performs the increment (and the
    /// resulting flush of buffered data) if it arrives while the channel
    /// is shutting down but not yet complete.
    pub fn increment_read_window(&self, size: usize) -> Result<()> {
        if self.channel.event_loop().is_loop_thread() {
            return self
                .channel
                .with_core(|core| core.slot_increment(self.idx, size));
        }
        let channel = self.channel.clone();
        let idx = self.idx;
        let task = Task::new("slot-window-increment", move |status: TaskStatus| {
            if status == TaskStatus::RunReady {
                let _ = channel.with_core(|core| core.slot_increment(idx, size));
            }
        });
        self.channel
            .event_loop()
            .schedule_internal(task, None)
            .map_err(|rejected| rejected.error)
    }
}
