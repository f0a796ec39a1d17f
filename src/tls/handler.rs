use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::time::Duration;

use bytes::BytesMut;

use crate::channel::{
    Channel, ChannelHandler, Direction, Message, Slot, TlsNegotiationStatus,
};
use crate::error::{Error, Result};
use crate::task::{TaskId, TaskStatus};
use crate::tls::provider::{TlsSession, TlsState};
use crate::tls::TlsConnectionOptions;

const TASK_KICKOFF: &str = "tls-kickoff";
const TASK_TIMEOUT: &str = "tls-negotiation-timeout";

/// Rough per-record framing cost, used for window estimates.
const EST_RECORD_OVERHEAD: usize = 53;

/// What the handshake produced, delivered through the negotiation
/// callback.
#[derive(Clone, Debug)]
pub struct NegotiatedTls {
    /// The ALPN protocol both sides agreed on, if any.
    pub alpn: Option<String>,
    /// SNI server name: the requested name on the client, the received
    /// name on the server.
    pub server_name: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    NotStarted,
    Negotiating,
    Succeeded,
    Failed,
    ShuttingDown,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Role {
    Client,
    Server,
}

type NegotiationCallback = Box<dyn FnOnce(Result<NegotiatedTls>)>;

/// Middle handler performing a TLS handshake, then transparently
/// encrypting writes and decrypting reads.
///
/// During negotiation user writes buffer and decrypted bytes cache
/// until the handshake completes; afterwards plaintext is delivered
/// upstream under the read window, with any window-blocked remainder
/// cached and flushed on the next window increment, including
/// increments that arrive while the channel is already shutting down.
pub struct TlsHandler {
    session: Box<dyn TlsSession>,
    role: Role,
    phase: Phase,
    timeout: Duration,
    timeout_task: Option<TaskId>,
    pending_writes: VecDeque<Message>,
    cached_plaintext: BytesMut,
    on_negotiated: Option<NegotiationCallback>,
    pending_read_shutdown: bool,
    negotiated: Option<NegotiatedTls>,
}

impl TlsHandler {
    /// Installs a client-side TLS handler on `channel` and starts
    /// negotiating. On-thread only; the socket handler must already be
    /// installed. `on_negotiated` fires exactly once with the handshake
    /// outcome.
    pub fn install_client<F>(
        channel: &Channel,
        options: &TlsConnectionOptions,
        on_negotiated: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<NegotiatedTls>) + 'static,
    {
        let server_name = options.server_name().ok_or_else(|| {
            Error::TlsContextFailure("client TLS requires a server name".into())
        })?;
        let session = options.context().provider().new_client_session(server_name)?;
        Self::install(channel, session, Role::Client, options.timeout(), on_negotiated)
    }

    /// Installs a server-side TLS handler on `channel`; the handshake
    /// starts when the client's hello arrives.
    pub fn install_server<F>(
        channel: &Channel,
        options: &TlsConnectionOptions,
        on_negotiated: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<NegotiatedTls>) + 'static,
    {
        let session = options.context().provider().new_server_session()?;
        Self::install(channel, session, Role::Server, options.timeout(), on_negotiated)
    }

    fn install<F>(
        channel: &Channel,
        session: Box<dyn TlsSession>,
        role: Role,
        timeout: Duration,
        on_negotiated: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<NegotiatedTls>) + 'static,
    {
        let handler = TlsHandler {
            session,
            role,
            phase: Phase::NotStarted,
            timeout,
            timeout_task: None,
            pending_writes: VecDeque::new(),
            cached_plaintext: BytesMut::new(),
            on_negotiated: Some(Box::new(on_negotiated)),
            pending_read_shutdown: false,
            negotiated: None,
        };
        let slot = channel.append_handler(Box::new(handler))?;
        // Drive the kickoff through the slot so the handler starts with
        // a clean stack and its own slot reference.
        channel.with_core(|core| {
            core.deliver_slot_task(slot.idx(), TASK_KICKOFF, TaskStatus::RunReady)
        })?;
        Ok(())
    }

    fn set_stats(&self, slot: &Slot, status: TlsNegotiationStatus) {
        if let Some(core) = slot.channel.upgrade() {
            core.set_tls_status(status);
        }
    }

    fn start(&mut self, slot: &Slot) -> Result<()> {
        if self.phase != Phase::NotStarted {
            return Ok(());
        }
        self.phase = Phase::Negotiating;
        self.set_stats(slot, TlsNegotiationStatus::Negotiating);
        if !self.timeout.is_zero() {
            self.timeout_task = Some(slot.schedule_task(TASK_TIMEOUT, Some(self.timeout))?);
        }
        if self.role == Role::Client {
            // Ask the session for the initial hello.
            self.feed_ciphertext(slot, &[])?;
        }
        Ok(())
    }

    fn cancel_timeout(&mut self, slot: &Slot) {
        if let Some(id) = self.timeout_task.take() {
            let _ = slot.cancel_task(id);
        }
    }

    /// Pushes wire bytes through the session, forwarding produced
    /// records downstream and collecting plaintext into the cache.
    fn feed_ciphertext(&mut self, slot: &Slot, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        loop {
            let progress = match self.session.push_ciphertext(&data[offset..]) {
                Ok(progress) => progress,
                Err(err) => {
                    self.fail(slot, err.clone());
                    return Ok(());
                }
            };
            offset += progress.consumed;
            if !progress.ciphertext.is_empty() {
                let message = Message::handshake(progress.ciphertext);
                if let Err(rejected) = slot.send_write(message) {
                    self.fail(slot, rejected.error.clone());
                    return Ok(());
                }
            }
            if !progress.plaintext.is_empty() {
                let plaintext = progress.plaintext;
                if self.cached_plaintext.is_empty() {
                    self.cached_plaintext = plaintext;
                } else {
                    self.cached_plaintext.unsplit(plaintext);
                }
            }
            if offset >= data.len() {
                break;
            }
            if progress.consumed == 0 {
                self.fail(
                    slot,
                    Error::TlsNegotiationFailure("provider made no progress".into()),
                );
                return Ok(());
            }
        }

        match self.session.state() {
            TlsState::Negotiating => {}
            TlsState::Succeeded => {
                if self.phase == Phase::Negotiating {
                    self.on_negotiation_success(slot)?;
                }
            }
            TlsState::Failed(err) => self.fail(slot, err),
        }
        if self.phase == Phase::Succeeded {
            self.flush_cached(slot);
        }
        Ok(())
    }

    fn on_negotiation_success(&mut self, slot: &Slot) -> Result<()> {
        self.phase = Phase::Succeeded;
        self.cancel_timeout(slot);
        let outcome = NegotiatedTls {
            alpn: self.session.alpn_selected(),
            server_name: self.session.server_name(),
        };
        trace!(
            "tls negotiation succeeded (alpn: {:?}, server_name: {:?})",
            outcome.alpn,
            outcome.server_name
        );
        self.negotiated = Some(outcome.clone());
        self.set_stats(slot, TlsNegotiationStatus::Success);
        if let Some(cb) = self.on_negotiated.take() {
            // The callback may append the user handler synchronously;
            // buffered plaintext flushes only after it returns.
            cb(Ok(outcome));
        }
        let buffered: Vec<Message> = self.pending_writes.drain(..).collect();
        for message in buffered {
            self.encrypt_and_forward(slot, message)?;
        }
        Ok(())
    }

    fn fail(&mut self, slot: &Slot, err: Error) {
        if matches!(self.phase, Phase::Failed | Phase::ShuttingDown) {
            return;
        }
        debug!("tls negotiation failed: {}", err);
        self.phase = Phase::Failed;
        self.cancel_timeout(slot);
        self.set_stats(slot, TlsNegotiationStatus::Failure);
        for message in self.pending_writes.drain(..) {
            message.complete(Err(err.clone()));
        }
        if let Some(cb) = self.on_negotiated.take() {
            cb(Err(err.clone()));
        }
        if let Some(core) = slot.channel.upgrade() {
            core.begin_shutdown(Some(err), false);
        }
    }

    fn encrypt_and_forward(&mut self, slot: &Slot, mut message: Message) -> Result<()> {
        let data = mem::take(&mut message.data);
        let completion = message.take_completion();
        drop(message);
        match self.session.push_plaintext(&data) {
            Ok(ciphertext) => {
                let mut out = Message::application_data(ciphertext);
                if let Some(cb) = completion {
                    out = out.with_completion(cb);
                }
                if let Err(rejected) = slot.send_write(out) {
                    let err = rejected.error.clone();
                    rejected.message.complete(Err(rejected.error));
                    return Err(err);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(cb) = completion {
                    cb(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Delivers cached plaintext upstream as far as the window allows,
    /// and completes a delayed read-direction shutdown once the cache is
    /// empty.
    fn flush_cached(&mut self, slot: &Slot) {
        while !self.cached_plaintext.is_empty() {
            let window = slot.upstream_read_window();
            if window == 0 {
                break;
            }
            let take = window.min(self.cached_plaintext.len());
            let chunk = self.cached_plaintext.split_to(take);
            match slot.send_read(Message::application_data(chunk)) {
                Ok(()) => {}
                Err(mut rejected) => {
                    // Put the bytes back at the front of the cache.
                    let mut head = mem::take(&mut rejected.message.data);
                    head.unsplit(mem::take(&mut self.cached_plaintext));
                    self.cached_plaintext = head;
                    break;
                }
            }
        }
        if self.cached_plaintext.is_empty() && self.pending_read_shutdown {
            self.pending_read_shutdown = false;
            slot.on_shutdown_complete(Direction::Read, None);
        }
    }
}

impl ChannelHandler for TlsHandler {
    fn process_read_message(&mut self, slot: &Slot, mut message: Message) -> Result<()> {
        if matches!(self.phase, Phase::Failed | Phase::ShuttingDown) {
            return Ok(());
        }
        if self.phase == Phase::NotStarted {
            // Data can race the kickoff task on the server side.
            self.start(slot)?;
        }
        let data = mem::take(&mut message.data);
        drop(message);
        self.feed_ciphertext(slot, &data)
    }

    fn process_write_message(&mut self, slot: &Slot, message: Message) -> Result<()> {
        match self.phase {
            Phase::NotStarted | Phase::Negotiating => {
                self.pending_writes.push_back(message);
                Ok(())
            }
            Phase::Succeeded => self.encrypt_and_forward(slot, message),
            Phase::Failed | Phase::ShuttingDown => {
                message.complete(Err(Error::ChannelShutdown));
                Ok(())
            }
        }
    }

    fn increment_read_window(&mut self, slot: &Slot, size: usize) {
        self.flush_cached(slot);
        if matches!(self.phase, Phase::Failed | Phase::ShuttingDown) {
            return;
        }
        // Open our own intake proportionally so the socket resumes
        // reading ciphertext.
        let _ = slot.increment_read_window(size.saturating_add(EST_RECORD_OVERHEAD));
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
                if self.phase == Phase::Negotiating || self.phase == Phase::NotStarted {
                    // The transport went away mid-handshake.
                    let err = error.clone().unwrap_or(Error::SocketClosed);
                    self.cancel_timeout(slot);
                    self.set_stats(slot, TlsNegotiationStatus::Failure);
                    self.phase = Phase::Failed;
                    for message in self.pending_writes.drain(..) {
                        message.complete(Err(err.clone()));
                    }
                    if let Some(cb) = self.on_negotiated.take() {
                        cb(Err(err));
                    }
                    slot.on_shutdown_complete(Direction::Read, None);
                    return;
                }
                self.cancel_timeout(slot);
                if !free_scarce_resources && !self.cached_plaintext.is_empty() {
                    // Decrypted bytes are still blocked on the window; a
                    // window increment must flush them before this
                    // direction completes. Dropping them here would lose
                    // data the peer already sent.
                    self.pending_read_shutdown = true;
                    return;
                }
                self.cached_plaintext.clear();
                slot.on_shutdown_complete(Direction::Read, None);
            }
            Direction::Write => {
                let prior = mem::replace(&mut self.phase, Phase::ShuttingDown);
                let close_records = self.session.shutdown();
                if prior == Phase::Succeeded && !free_scarce_resources && !close_records.is_empty()
                {
                    let _ = slot.send_write(Message::handshake(close_records));
                }
                let err = error.unwrap_or(Error::ChannelShutdown);
                for message in self.pending_writes.drain(..) {
                    message.complete(Err(err.clone()));
                }
                slot.on_shutdown_complete(Direction::Write, None);
            }
        }
    }

    fn initial_window_size(&self) -> usize {
        // Ciphertext intake is not window-limited; backpressure applies
        // to decrypted bytes at the slot above.
        usize::MAX
    }

    fn message_overhead(&self) -> usize {
        EST_RECORD_OVERHEAD
    }

    fn on_task(&mut self, slot: &Slot, tag: &'static str, status: TaskStatus) {
        match (tag, status) {
            (TASK_KICKOFF, TaskStatus::RunReady) => {
                if let Err(err) = self.start(slot) {
                    self.fail(slot, err);
                }
            }
            (TASK_TIMEOUT, TaskStatus::RunReady) => {
                self.timeout_task = None;
                if self.phase == Phase::Negotiating {
                    self.fail(slot, Error::TlsNegotiationTimeout);
                }
            }
            (TASK_TIMEOUT, TaskStatus::Canceled) => {
                self.timeout_task = None;
            }
            _ => {}
        }
    }

    fn destroy(&mut self) {
        if let Some(cb) = self.on_negotiated.take() {
            cb(Err(Error::ChannelShutdown));
        }
    }
}

impl Drop for TlsHandler {
    fn drop(&mut self) {
        // A handler torn down before the handshake resolved still owes
        // its caller the negotiation callback.
        if let Some(cb) = self.on_negotiated.take() {
            cb(Err(Error::ChannelShutdown));
        }
    }
}

impl fmt::Debug for TlsHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandler")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("negotiated", &self.negotiated)
            .field("cached_plaintext", &self.cached_plaintext.len())
            .finish()
    }
}
