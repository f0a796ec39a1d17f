use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::Buf;

use crate::channel::handler::{ChannelHandler, Direction};
use crate::channel::{Channel, ChannelCore, Message, Slot, SlotHandle};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::interest::{Interest, Readiness};
use crate::net::TcpSock;

/// Bytes read from the kernel per `read(2)` call.
const READ_CHUNK: usize = 16 * 1024;

/// Terminal handler adapting an OS socket to channel messages.
///
/// Reads drain the socket into fresh messages, bounded by the upstream
/// read window; a closed window latches readiness so a later window
/// increment resumes reading without waiting for a new edge. Writes
/// queue, flush as far as the kernel accepts, and report completion per
/// message once fully accepted.
pub struct SocketHandler {
    io: Rc<RefCell<SocketIo>>,
    event_loop: EventLoop,
    fd: RawFd,
}

struct SocketIo {
    sock: TcpSock,
    readable: bool,
    writable: bool,
    reading_stopped: bool,
    write_queue: VecDeque<Message>,
    pending_write_shutdown: bool,
    write_shutdown_done: bool,
}

enum ReadOutcome {
    Data(Message),
    Eof,
    Blocked,
    Failed(Error),
}

impl SocketHandler {
    /// Appends a socket handler to `channel` as its terminal slot and
    /// subscribes the socket with the channel's loop. On-thread only;
    /// must be the first handler installed.
    pub(crate) fn install(channel: &Channel, sock: TcpSock) -> Result<SlotHandle> {
        let event_loop = channel.event_loop().clone();
        let fd = sock.as_raw_fd();
        let io = Rc::new(RefCell::new(SocketIo {
            sock,
            readable: false,
            writable: false,
            reading_stopped: false,
            write_queue: VecDeque::new(),
            pending_write_shutdown: false,
            write_shutdown_done: false,
        }));
        let handler = SocketHandler {
            io: Rc::clone(&io),
            event_loop: event_loop.clone(),
            fd,
        };
        let slot_handle = channel.append_handler(Box::new(handler))?;

        let idx = slot_handle.idx();
        let sub_channel = channel.clone();
        event_loop.subscribe(fd, Interest::READABLE | Interest::WRITABLE, move |_, readiness| {
            on_event(&sub_channel, idx, &io, readiness);
        })?;
        Ok(slot_handle)
    }
}

fn on_event(channel: &Channel, idx: usize, io: &Rc<RefCell<SocketIo>>, readiness: Readiness) {
    let _ = channel.with_core(|core| {
        if readiness.is_writable() || readiness.is_write_closed() {
            io.borrow_mut().writable = true;
            flush_writes(core, idx, io);
        }
        if readiness.is_readable() || readiness.is_read_closed() || readiness.is_error() {
            io.borrow_mut().readable = true;
            drain_reads(core, idx, io);
        }
    });
}

/// Reads until the kernel blocks, the upstream window closes, or the
/// peer hangs up. The `io` borrow is released before every delivery so a
/// handler above us can write a synchronous response back through this
/// socket.
fn drain_reads(core: &Rc<ChannelCore>, idx: usize, io: &Rc<RefCell<SocketIo>>) {
    loop {
        let outcome = {
            let mut io_ref = io.borrow_mut();
            if io_ref.reading_stopped || !io_ref.readable {
                return;
            }
            let allowance = core.upstream_read_window(idx);
            if allowance == 0 {
                // Stay latched; a window increment resumes us.
                return;
            }
            let mut buf = [0u8; READ_CHUNK];
            let want = allowance.min(READ_CHUNK);
            match io_ref.sock.read(&mut buf[..want]) {
                Ok(0) => {
                    io_ref.readable = false;
                    io_ref.reading_stopped = true;
                    ReadOutcome::Eof
                }
                Ok(n) => ReadOutcome::Data(Message::application_data(&buf[..n])),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    io_ref.readable = false;
                    ReadOutcome::Blocked
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    io_ref.readable = false;
                    io_ref.reading_stopped = true;
                    ReadOutcome::Failed(Error::from_socket_io(err))
                }
            }
        };
        match outcome {
            ReadOutcome::Data(message) => {
                core.note_bytes_read(message.len());
                if let Err(rejected) = core.send_read(idx, message) {
                    // The allowance was checked above, so this is a
                    // pipeline in teardown rather than a window race.
                    trace!("socket read dropped: {}", rejected.error);
                    rejected.message.complete(Err(rejected.error));
                    return;
                }
            }
            ReadOutcome::Eof => {
                core.begin_shutdown(Some(Error::SocketClosed), false);
                return;
            }
            ReadOutcome::Blocked => return,
            ReadOutcome::Failed(err) => {
                core.begin_shutdown(Some(err), false);
                return;
            }
        }
    }
}

fn flush_writes(core: &Rc<ChannelCore>, idx: usize, io: &Rc<RefCell<SocketIo>>) {
    let mut completions: Vec<(Box<dyn FnOnce(Result<()>)>, Result<()>)> = Vec::new();
    let mut fatal: Option<Error> = None;
    let mut finished_write_shutdown = false;
    {
        let mut io_ref = io.borrow_mut();
        if !io_ref.writable {
            return;
        }
        'flush: loop {
            match io_ref.write_queue.front() {
                None => break 'flush,
                Some(front) if front.data.is_empty() => {
                    let mut message = io_ref.write_queue.pop_front().unwrap();
                    if let Some(cb) = message.take_completion() {
                        completions.push((cb, Ok(())));
                    }
                    continue 'flush;
                }
                Some(_) => {}
            }
            let result = {
                let front = io_ref.write_queue.front().unwrap();
                io_ref.sock.write(&front.data[..])
            };
            match result {
                Ok(n) => {
                    core.note_bytes_written(n);
                    io_ref.write_queue.front_mut().unwrap().data.advance(n);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    io_ref.writable = false;
                    break 'flush;
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    fatal = Some(Error::from_socket_io(err));
                    break 'flush;
                }
            }
        }
        if let Some(err) = fatal.clone() {
            for mut message in io_ref.write_queue.drain(..) {
                if let Some(cb) = message.take_completion() {
                    completions.push((cb, Err(err.clone())));
                }
            }
        }
        if io_ref.write_queue.is_empty()
            && io_ref.pending_write_shutdown
            && !io_ref.write_shutdown_done
        {
            io_ref.write_shutdown_done = true;
            let _ = io_ref.sock.shutdown(Shutdown::Write);
            finished_write_shutdown = true;
        }
    }
    for (cb, result) in completions {
        cb(result);
    }
    if let Some(err) = fatal {
        core.begin_shutdown(Some(err), false);
    }
    if finished_write_shutdown {
        core.handler_shutdown_complete(idx, Direction::Write, None);
    }
}

impl ChannelHandler for SocketHandler {
    fn process_read_message(&mut self, _slot: &Slot, message: Message) -> Result<()> {
        // Terminal slot; nothing below us can accept a read.
        warn!("socket handler received a read message; dropping it");
        message.complete(Err(Error::ChannelShutdown));
        Ok(())
    }

    fn process_write_message(&mut self, slot: &Slot, message: Message) -> Result<()> {
        let Some(core) = slot.channel.upgrade() else {
            message.complete(Err(Error::ChannelShutdown));
            return Ok(());
        };
        let writable = {
            let mut io_ref = self.io.borrow_mut();
            if io_ref.pending_write_shutdown || io_ref.write_shutdown_done {
                drop(io_ref);
                message.complete(Err(core
                    .recorded_error()
                    .unwrap_or(Error::ChannelShutdown)));
                return Ok(());
            }
            io_ref.write_queue.push_back(message);
            io_ref.writable
        };
        if writable {
            flush_writes(&core, slot.idx, &self.io);
        }
        Ok(())
    }

    fn increment_read_window(&mut self, slot: &Slot, _size: usize) {
        let Some(core) = slot.channel.upgrade() else {
            return;
        };
        drain_reads(&core, slot.idx, &self.io);
    }

    fn shutdown(
        &mut self,
        slot: &Slot,
        direction: Direction,
        error: Option<Error>,
        free_scarce_resources: bool,
    ) {
        match direction {
            Direction::Read => {
                {
                    let mut io_ref = self.io.borrow_mut();
                    io_ref.reading_stopped = true;
                    io_ref.readable = false;
                    let _ = io_ref.sock.shutdown(Shutdown::Read);
                }
                slot.on_shutdown_complete(Direction::Read, None);
            }
            Direction::Write => {
                let mut completions: Vec<Box<dyn FnOnce(Result<()>)>> = Vec::new();
                let complete_now = {
                    let mut io_ref = self.io.borrow_mut();
                    if free_scarce_resources {
                        for mut message in io_ref.write_queue.drain(..) {
                            if let Some(cb) = message.take_completion() {
                                completions.push(cb);
                            }
                        }
                    }
                    io_ref.pending_write_shutdown = true;
                    if io_ref.write_queue.is_empty() && !io_ref.write_shutdown_done {
                        io_ref.write_shutdown_done = true;
                        let _ = io_ref.sock.shutdown(Shutdown::Write);
                        true
                    } else {
                        false
                    }
                };
                let err = error.unwrap_or(Error::ChannelShutdown);
                for cb in completions {
                    cb(Err(err.clone()));
                }
                if complete_now {
                    slot.on_shutdown_complete(Direction::Write, None);
                } else {
                    // Outstanding bytes flush first; completion is
                    // reported from `flush_writes`.
                    let writable = self.io.borrow().writable;
                    if writable {
                        if let Some(core) = slot.channel.upgrade() {
                            flush_writes(&core, slot.idx, &self.io);
                        }
                    }
                }
            }
        }
    }

    fn initial_window_size(&self) -> usize {
        // Terminal slot; no handler below ever sends into it.
        0
    }

    fn destroy(&mut self) {
        let _ = self.event_loop.unsubscribe(self.fd);
    }
}

impl fmt::Debug for SocketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandler").field("fd", &self.fd).finish()
    }
}
