//! Per-channel statistics observation.

/// Where TLS negotiation on a channel currently stands, as reported in
/// statistics flushes.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum TlsNegotiationStatus {
    /// The channel carries no TLS handler.
    #[default]
    None,
    /// The handshake is in progress.
    Negotiating,
    /// The handshake succeeded.
    Success,
    /// The handshake failed or timed out.
    Failure,
}

/// Cumulative counters delivered to a statistics observer on every
/// flush.
#[derive(Copy, Clone, Debug)]
pub struct ChannelStatistics {
    /// Bytes read off the socket since channel creation.
    pub bytes_read: u64,
    /// Bytes written to the socket since channel creation.
    pub bytes_written: u64,
    /// TLS negotiation progress.
    pub tls_status: TlsNegotiationStatus,
}
