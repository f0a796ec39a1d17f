use crate::channel::{Message, Slot};
use crate::error::{Error, Result};
use crate::task::TaskStatus;

/// Direction of travel through a channel.
///
/// `Read` flows from the terminal (socket) slot toward the user slot,
/// `Write` the other way.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Direction {
    /// Socket → user.
    Read,
    /// User → socket.
    Write,
}

/// The capability set every pipeline participant implements.
///
/// All methods run on the channel's event loop thread and are strictly
/// serialized: a handler is never re-entered while one of its methods is
/// on the stack. Work a handler wants done later is scheduled through
/// [`Slot::schedule_task`] and delivered via [`ChannelHandler::on_task`].
pub trait ChannelHandler: 'static {
    /// A message arriving in the read direction. The handler owns
    /// `message` and must forward, buffer or drop it.
    fn process_read_message(&mut self, slot: &Slot, message: Message) -> Result<()>;

    /// A message arriving in the write direction.
    fn process_write_message(&mut self, slot: &Slot, message: Message) -> Result<()>;

    /// The slot above this handler opened its read window by `size`
    /// bytes: buffered data may now flow upstream, and terminal handlers
    /// may resume reading.
    fn increment_read_window(&mut self, slot: &Slot, size: usize);

    /// Begin shutting down this handler in `direction`. The handler must
    /// call [`Slot::on_shutdown_complete`] for the same direction once
    /// done, synchronously or from a later callback. With
    /// `free_scarce_resources` set, buffered data is abandoned instead
    /// of flushed.
    fn shutdown(
        &mut self,
        slot: &Slot,
        direction: Direction,
        error: Option<Error>,
        free_scarce_resources: bool,
    );

    /// Bytes this handler is initially willing to accept in the read
    /// direction. Only consulted when the channel has read backpressure
    /// enabled.
    fn initial_window_size(&self) -> usize;

    /// Per-message framing overhead this handler adds in the write
    /// direction, used for window estimates across the chain.
    fn message_overhead(&self) -> usize {
        0
    }

    /// Delivery point for tasks scheduled via [`Slot::schedule_task`].
    fn on_task(&mut self, slot: &Slot, tag: &'static str, status: TaskStatus) {
        let _ = (slot, tag, status);
    }

    /// Called exactly once when the channel releases its slots after
    /// shutdown completes.
    fn destroy(&mut self) {}
}
