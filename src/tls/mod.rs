//! TLS as a channel handler over an opaque provider.
//!
//! The runtime does no cryptography of its own. A [`TlsContext`] wraps a
//! [`TlsProvider`] (the bundled one is rustls-backed, behind the
//! `rustls` feature) and the [`TlsHandler`] layers the negotiation state
//! machine, timeout and flow-control interplay on top of channel
//! message flow.

mod handler;
mod provider;
#[cfg(feature = "rustls")]
mod rustls_backend;

pub use self::handler::{NegotiatedTls, TlsHandler};
pub use self::provider::{TlsProgress, TlsProvider, TlsSession, TlsState};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Whether the runtime's bundled TLS provider can negotiate ALPN.
pub fn alpn_is_available() -> bool {
    cfg!(feature = "rustls")
}

/// Minimum TLS protocol version to negotiate.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum TlsVersion {
    /// TLS 1.0. The bundled provider clamps this to 1.2.
    Tls1_0,
    /// TLS 1.1. The bundled provider clamps this to 1.2.
    Tls1_1,
    /// TLS 1.2.
    #[default]
    Tls1_2,
    /// TLS 1.3.
    Tls1_3,
}

/// A certificate/private-key pair, both PEM files on disk.
#[derive(Clone, Debug)]
pub struct CertKeyPair {
    /// Path to the PEM certificate chain.
    pub cert_path: PathBuf,
    /// Path to the PEM private key.
    pub key_path: PathBuf,
}

/// A PKCS#12 bundle on disk.
#[derive(Clone, Debug)]
pub struct Pkcs12Options {
    /// Path to the `.p12` file.
    pub path: PathBuf,
    /// Password protecting the bundle.
    pub password: String,
}

/// Options for building a [`TlsContext`].
#[derive(Clone, Debug)]
pub struct TlsContextOptions {
    /// ALPN protocols, most preferred first.
    pub alpn_list: Vec<String>,
    /// Default SNI server name for client connections.
    pub server_name: Option<String>,
    /// Verify the peer's certificate chain. Defaults to true. On the
    /// server side this requests and verifies client certificates.
    pub verify_peer: bool,
    /// Minimum protocol version.
    pub minimum_version: TlsVersion,
    /// PEM bundle replacing the default trust store.
    pub trust_store_override: Option<PathBuf>,
    /// Identity: client mTLS pair or server certificate.
    pub certificate: Option<CertKeyPair>,
    /// PKCS#12 identity. Recognized, but the bundled provider reports
    /// [`crate::Error::TlsProviderUnsupported`] for it.
    pub pkcs12: Option<Pkcs12Options>,
    /// Negotiation timeout in milliseconds; 0 disables the timer.
    pub timeout_ms: u64,
}

impl TlsContextOptions {
    /// Defaults: verify the peer, minimum TLS 1.2, 10 s negotiation
    /// timeout, no ALPN.
    pub fn new() -> TlsContextOptions {
        TlsContextOptions {
            alpn_list: Vec::new(),
            server_name: None,
            verify_peer: true,
            minimum_version: TlsVersion::Tls1_2,
            trust_store_override: None,
            certificate: None,
            pkcs12: None,
            timeout_ms: 10_000,
        }
    }

    /// Sets the ALPN list from a `;`-separated string such as
    /// `"h2;http/1.1"`.
    pub fn with_alpn_list(mut self, list: &str) -> TlsContextOptions {
        self.alpn_list = list
            .split(';')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Sets the default SNI server name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> TlsContextOptions {
        self.server_name = Some(name.into());
        self
    }

    /// Enables or disables peer verification.
    pub fn with_verify_peer(mut self, verify: bool) -> TlsContextOptions {
        self.verify_peer = verify;
        self
    }

    /// Sets the minimum protocol version.
    pub fn with_minimum_version(mut self, version: TlsVersion) -> TlsContextOptions {
        self.minimum_version = version;
        self
    }

    /// Replaces the trust store with the PEM bundle at `path`.
    pub fn with_trust_store(mut self, path: impl Into<PathBuf>) -> TlsContextOptions {
        self.trust_store_override = Some(path.into());
        self
    }

    /// Client mutual-TLS identity from PEM files.
    pub fn client_mtls_from_path(
        mut self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> TlsContextOptions {
        self.certificate = Some(CertKeyPair {
            cert_path: cert.into(),
            key_path: key.into(),
        });
        self
    }

    /// Server identity from PEM files.
    pub fn server_from_path(
        self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> TlsContextOptions {
        self.client_mtls_from_path(cert, key)
    }

    /// PKCS#12 identity.
    pub fn with_pkcs12(
        mut self,
        path: impl Into<PathBuf>,
        password: impl Into<String>,
    ) -> TlsContextOptions {
        self.pkcs12 = Some(Pkcs12Options {
            path: path.into(),
            password: password.into(),
        });
        self
    }

    /// Negotiation timeout in milliseconds; 0 disables.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> TlsContextOptions {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl Default for TlsContextOptions {
    fn default() -> TlsContextOptions {
        TlsContextOptions::new()
    }
}

/// A reference-counted, thread-safe TLS configuration.
///
/// Contexts are immutable once built; distinct contexts can be
/// constructed concurrently from different threads.
#[derive(Clone)]
pub struct TlsContext {
    provider: Arc<dyn TlsProvider>,
    default_server_name: Option<String>,
    default_timeout: Duration,
}

impl TlsContext {
    /// Builds a client-side context with the bundled provider.
    #[cfg(feature = "rustls")]
    pub fn new_client(options: &TlsContextOptions) -> Result<TlsContext> {
        let provider = rustls_backend::client_provider(options)?;
        Ok(TlsContext {
            provider,
            default_server_name: options.server_name.clone(),
            default_timeout: Duration::from_millis(options.timeout_ms),
        })
    }

    /// Builds a server-side context with the bundled provider.
    #[cfg(feature = "rustls")]
    pub fn new_server(options: &TlsContextOptions) -> Result<TlsContext> {
        let provider = rustls_backend::server_provider(options)?;
        Ok(TlsContext {
            provider,
            default_server_name: None,
            default_timeout: Duration::from_millis(options.timeout_ms),
        })
    }

    /// Wraps a custom provider.
    pub fn from_provider(provider: Arc<dyn TlsProvider>, options: &TlsContextOptions) -> TlsContext {
        TlsContext {
            provider,
            default_server_name: options.server_name.clone(),
            default_timeout: Duration::from_millis(options.timeout_ms),
        }
    }

    /// The provider behind this context.
    pub fn provider(&self) -> &Arc<dyn TlsProvider> {
        &self.provider
    }

    /// Whether this context's provider can negotiate ALPN.
    pub fn alpn_is_available(&self) -> bool {
        self.provider.alpn_available()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.default_server_name)
            .field("timeout", &self.default_timeout)
            .finish()
    }
}

/// Per-connection TLS options layered over a [`TlsContext`].
#[derive(Clone, Debug)]
pub struct TlsConnectionOptions {
    context: TlsContext,
    server_name: Option<String>,
    timeout: Duration,
}

impl TlsConnectionOptions {
    /// Connection options inheriting the context's server name and
    /// timeout.
    pub fn new(context: &TlsContext) -> TlsConnectionOptions {
        TlsConnectionOptions {
            context: context.clone(),
            server_name: context.default_server_name.clone(),
            timeout: context.default_timeout,
        }
    }

    /// Overrides the SNI server name for this connection.
    pub fn with_server_name(mut self, name: impl Into<String>) -> TlsConnectionOptions {
        self.server_name = Some(name.into());
        self
    }

    /// Overrides the negotiation timeout; `Duration::ZERO` disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> TlsConnectionOptions {
        self.timeout = timeout;
        self
    }

    /// The context this connection will use.
    pub fn context(&self) -> &TlsContext {
        &self.context
    }

    /// The SNI server name for this connection, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// The negotiation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
