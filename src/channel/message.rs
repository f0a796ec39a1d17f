use std::fmt;

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Whether a message carries application payload or handshake framing.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MessageType {
    /// Ordinary payload bytes.
    ApplicationData,
    /// Protocol negotiation bytes, e.g. TLS records emitted during the
    /// handshake.
    Handshake,
}

/// A buffer traveling along a channel.
///
/// Ownership transfers slot to slot: whoever holds a message must either
/// forward it or drop it, and dropping fires the completion callback
/// with an error so writers always learn the fate of their bytes.
pub struct Message {
    /// Payload. Handlers may split, consume or replace it.
    pub data: BytesMut,
    message_type: MessageType,
    on_completion: Option<Box<dyn FnOnce(Result<()>)>>,
}

impl Message {
    /// Creates an application-data message.
    pub fn application_data(data: impl Into<BytesMut>) -> Message {
        Message {
            data: data.into(),
            message_type: MessageType::ApplicationData,
            on_completion: None,
        }
    }

    /// Creates a handshake message.
    pub fn handshake(data: impl Into<BytesMut>) -> Message {
        Message {
            data: data.into(),
            message_type: MessageType::Handshake,
            on_completion: None,
        }
    }

    /// Attaches a completion callback, invoked once the message has been
    /// written to the wire (for writes) or failed.
    pub fn with_completion<F>(mut self, f: F) -> Message
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.on_completion = Some(Box::new(f));
        self
    }

    /// The message's type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Detaches the completion callback, e.g. to move it onto a
    /// transformed message.
    pub fn take_completion(&mut self) -> Option<Box<dyn FnOnce(Result<()>)>> {
        self.on_completion.take()
    }

    /// Consumes the message, firing its completion callback with
    /// `result`. A handler that swallows a message instead of forwarding
    /// it must settle it this way.
    pub fn complete(mut self, result: Result<()>) {
        if let Some(f) = self.on_completion.take() {
            f(result);
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(f) = self.on_completion.take() {
            f(Err(Error::ChannelShutdown));
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.data.len())
            .field("message_type", &self.message_type)
            .finish()
    }
}
