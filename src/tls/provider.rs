use std::fmt;

use bytes::BytesMut;

use crate::error::Result;

/// Where a TLS session stands.
#[derive(Clone, Debug)]
pub enum TlsState {
    /// The handshake has not finished.
    Negotiating,
    /// The handshake completed; the session encrypts and decrypts
    /// application data.
    Succeeded,
    /// The session failed with the given error and is unusable.
    Failed(crate::error::Error),
}

/// Output of feeding ciphertext into a session.
#[derive(Default)]
pub struct TlsProgress {
    /// Bytes of the input the session consumed.
    pub consumed: usize,
    /// Decrypted application data ready for the user.
    pub plaintext: BytesMut,
    /// Records the session wants on the wire (handshake replies,
    /// alerts).
    pub ciphertext: BytesMut,
}

impl fmt::Debug for TlsProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsProgress")
            .field("consumed", &self.consumed)
            .field("plaintext", &self.plaintext.len())
            .field("ciphertext", &self.ciphertext.len())
            .finish()
    }
}

/// One end of a TLS connection, driven byte-wise by the TLS handler.
///
/// The trait is deliberately free of I/O and timers: the handler owns
/// both, the session just transforms bytes and reports state. An empty
/// `push_ciphertext` input is legal and asks the session for any
/// pending output; the client handler uses it to produce the initial
/// hello.
pub trait TlsSession: 'static {
    /// Feeds wire bytes in, returning decrypted plaintext, pending wire
    /// output and how much of the input was consumed.
    fn push_ciphertext(&mut self, data: &[u8]) -> Result<TlsProgress>;

    /// Encrypts application bytes, returning the records to put on the
    /// wire.
    fn push_plaintext(&mut self, data: &[u8]) -> Result<BytesMut>;

    /// Current session state.
    fn state(&self) -> TlsState;

    /// The ALPN protocol the peers agreed on, once negotiated.
    fn alpn_selected(&self) -> Option<String>;

    /// The SNI server name: the configured name on the client side, the
    /// name the peer requested on the server side.
    fn server_name(&self) -> Option<String>;

    /// Begins an orderly TLS close, returning the close-notify records
    /// to flush downstream.
    fn shutdown(&mut self) -> BytesMut;
}

/// Mints sessions for one side of TLS connections. Implemented by the
/// bundled rustls backend and by test stubs.
pub trait TlsProvider: Send + Sync + 'static {
    /// Creates a client session targeting `server_name`.
    fn new_client_session(&self, server_name: &str) -> Result<Box<dyn TlsSession>>;

    /// Creates a server session.
    fn new_server_session(&self) -> Result<Box<dyn TlsSession>>;

    /// Whether the provider can negotiate ALPN at all.
    fn alpn_available(&self) -> bool {
        true
    }
}
