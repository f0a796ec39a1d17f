//! The bundled, rustls-backed implementation of the TLS provider seam.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Once};

use bytes::BytesMut;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, RootCertStore,
    ServerConfig, ServerConnection, SignatureScheme, SupportedProtocolVersion,
};

use crate::error::{Error, Result};
use crate::tls::provider::{TlsProgress, TlsProvider, TlsSession, TlsState};
use crate::tls::{TlsContextOptions, TlsVersion};

static VERSIONS_MIN_1_2: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];
static VERSIONS_MIN_1_3: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // A no-op if the process already picked a provider.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

fn ctx_err(msg: impl Into<String>) -> Error {
    Error::TlsContextFailure(Arc::from(msg.into()))
}

fn map_rustls_error(err: &rustls::Error) -> Error {
    match err {
        rustls::Error::AlertReceived(_) => Error::TlsAlertReceived,
        other => Error::TlsNegotiationFailure(Arc::from(other.to_string())),
    }
}

fn protocol_versions(minimum: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match minimum {
        TlsVersion::Tls1_0 | TlsVersion::Tls1_1 => {
            warn!("TLS 1.0/1.1 are below the provider floor; negotiating 1.2+");
            VERSIONS_MIN_1_2
        }
        TlsVersion::Tls1_2 => VERSIONS_MIN_1_2,
        TlsVersion::Tls1_3 => VERSIONS_MIN_1_3,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let iter = CertificateDer::pem_file_iter(path)
        .map_err(|err| ctx_err(format!("failed to open certificate {}: {}", path.display(), err)))?;
    let mut certs = Vec::new();
    for cert in iter {
        certs.push(cert.map_err(|err| {
            ctx_err(format!("invalid certificate in {}: {}", path.display(), err))
        })?);
    }
    if certs.is_empty() {
        return Err(ctx_err(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|err| ctx_err(format!("failed to load key {}: {}", path.display(), err)))
}

fn load_root_store(options: &TlsContextOptions) -> Result<RootCertStore> {
    let Some(path) = options.trust_store_override.as_deref() else {
        return Err(ctx_err(
            "verify_peer requires a trust store; provide trust_store_override or disable verification",
        ));
    };
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|err| ctx_err(format!("rejected trust anchor: {}", err)))?;
    }
    Ok(roots)
}

fn alpn_protocols(options: &TlsContextOptions) -> Vec<Vec<u8>> {
    options
        .alpn_list
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect()
}

fn reject_pkcs12(options: &TlsContextOptions) -> Result<()> {
    if options.pkcs12.is_some() {
        return Err(Error::TlsProviderUnsupported);
    }
    Ok(())
}

/// Accepts any server certificate; used when `verify_peer` is off.
/// Signatures are still checked so a malformed handshake fails.
#[derive(Debug)]
struct NoServerVerify {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoServerVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) fn client_provider(options: &TlsContextOptions) -> Result<Arc<dyn TlsProvider>> {
    ensure_crypto_provider();
    reject_pkcs12(options)?;

    let builder = ClientConfig::builder_with_protocol_versions(protocol_versions(
        options.minimum_version,
    ));
    let builder = if options.verify_peer {
        builder.with_root_certificates(load_root_store(options)?)
    } else {
        let provider = CryptoProvider::get_default()
            .ok_or_else(|| ctx_err("no process-level crypto provider"))?
            .clone();
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerify { provider }))
    };
    let mut config = match options.certificate.as_ref() {
        Some(pair) => builder
            .with_client_auth_cert(load_certs(&pair.cert_path)?, load_key(&pair.key_path)?)
            .map_err(|err| ctx_err(format!("client identity rejected: {}", err)))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn_protocols(options);
    Ok(Arc::new(RustlsClientProvider {
        config: Arc::new(config),
    }))
}

pub(crate) fn server_provider(options: &TlsContextOptions) -> Result<Arc<dyn TlsProvider>> {
    ensure_crypto_provider();
    reject_pkcs12(options)?;

    let pair = options
        .certificate
        .as_ref()
        .ok_or_else(|| ctx_err("server context requires a certificate"))?;
    let certs = load_certs(&pair.cert_path)?;
    let key = load_key(&pair.key_path)?;

    let builder = ServerConfig::builder_with_protocol_versions(protocol_versions(
        options.minimum_version,
    ));
    let builder = if options.verify_peer && options.trust_store_override.is_some() {
        let roots = load_root_store(options)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| ctx_err(format!("client verifier rejected: {}", err)))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };
    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|err| ctx_err(format!("server identity rejected: {}", err)))?;
    config.alpn_protocols = alpn_protocols(options);
    Ok(Arc::new(RustlsServerProvider {
        config: Arc::new(config),
    }))
}

struct RustlsClientProvider {
    config: Arc<ClientConfig>,
}

impl TlsProvider for RustlsClientProvider {
    fn new_client_session(&self, server_name: &str) -> Result<Box<dyn TlsSession>> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|err| ctx_err(format!("invalid server name `{}`: {}", server_name, err)))?;
        let conn = ClientConnection::new(Arc::clone(&self.config), name)
            .map_err(|err| map_rustls_error(&err))?;
        Ok(Box::new(RustlsSession {
            conn: Connection::Client(conn),
            error: None,
            client_sni: Some(server_name.to_string()),
        }))
    }

    fn new_server_session(&self) -> Result<Box<dyn TlsSession>> {
        Err(Error::TlsProviderUnsupported)
    }
}

struct RustlsServerProvider {
    config: Arc<ServerConfig>,
}

impl TlsProvider for RustlsServerProvider {
    fn new_client_session(&self, _server_name: &str) -> Result<Box<dyn TlsSession>> {
        Err(Error::TlsProviderUnsupported)
    }

    fn new_server_session(&self) -> Result<Box<dyn TlsSession>> {
        let conn = ServerConnection::new(Arc::clone(&self.config))
            .map_err(|err| map_rustls_error(&err))?;
        Ok(Box::new(RustlsSession {
            conn: Connection::Server(conn),
            error: None,
            client_sni: None,
        }))
    }
}

struct RustlsSession {
    conn: Connection,
    error: Option<Error>,
    client_sni: Option<String>,
}

impl RustlsSession {
    fn drain_plaintext(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(_) => break,
            }
        }
        out
    }

    fn drain_ciphertext(&mut self) -> Result<BytesMut> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|err| Error::TlsNegotiationFailure(Arc::from(err.to_string())))?;
        }
        Ok(BytesMut::from(&out[..]))
    }
}

impl TlsSession for RustlsSession {
    fn push_ciphertext(&mut self, data: &[u8]) -> Result<TlsProgress> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let mut consumed = 0;
        let mut rd = data;
        while !rd.is_empty() {
            match self.conn.read_tls(&mut rd) {
                Ok(0) => break,
                Ok(n) => consumed += n,
                Err(err) => {
                    let mapped = Error::from_socket_io(err);
                    self.error = Some(mapped.clone());
                    return Err(mapped);
                }
            }
            if let Err(err) = self.conn.process_new_packets() {
                let mapped = map_rustls_error(&err);
                self.error = Some(mapped.clone());
                return Err(mapped);
            }
        }
        // An empty input still asks for pending output (initial hello).
        if data.is_empty() {
            if let Err(err) = self.conn.process_new_packets() {
                let mapped = map_rustls_error(&err);
                self.error = Some(mapped.clone());
                return Err(mapped);
            }
        }
        let plaintext = self.drain_plaintext();
        let ciphertext = self.drain_ciphertext()?;
        Ok(TlsProgress {
            consumed,
            plaintext,
            ciphertext,
        })
    }

    fn push_plaintext(&mut self, data: &[u8]) -> Result<BytesMut> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.conn
            .writer()
            .write_all(data)
            .map_err(|err| Error::TlsNegotiationFailure(Arc::from(err.to_string())))?;
        self.drain_ciphertext()
    }

    fn state(&self) -> TlsState {
        if let Some(err) = &self.error {
            return TlsState::Failed(err.clone());
        }
        if self.conn.is_handshaking() {
            TlsState::Negotiating
        } else {
            TlsState::Succeeded
        }
    }

    fn alpn_selected(&self) -> Option<String> {
        self.conn
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned())
    }

    fn server_name(&self) -> Option<String> {
        match &self.conn {
            Connection::Client(_) => self.client_sni.clone(),
            Connection::Server(conn) => conn.server_name().map(str::to_string),
        }
    }

    fn shutdown(&mut self) -> BytesMut {
        self.conn.send_close_notify();
        self.drain_ciphertext().unwrap_or_default()
    }
}

impl fmt::Debug for RustlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}
