//! QUIC transport on quinn.
//!
//! The server presents a freshly generated self-signed certificate and logs
//! its blake3 fingerprint. The client either pins that fingerprint or, when
//! none is given, accepts any certificate (the channel is still encrypted,
//! but not authenticated).
//!
//! With a shared password both ends instead present certificates issued by a
//! [`PasswordAuthority`] and require the peer to do the same.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::streaming::protocol::ALPN;
use crate::transport::auth::PasswordAuthority;
use crate::transport::{Connection, SendHalf};
use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, IdleTimeout, TransportConfig, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Server name the client asks for; the certificate is issued for it.
pub const SERVER_NAME: &str = "qsync";
const CLIENT_NAME: &str = "qsync-client";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(format!("TLS setup failed: {}", e))
}

/// blake3 of the DER certificate, hex encoded.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(blake3::hash(cert.as_ref()).as_bytes())
}

pub fn parse_fingerprint(s: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(s.trim())
        .map_err(|e| SyncError::Config(format!("invalid fingerprint {:?}: {}", s, e)))?;
    raw.try_into()
        .map_err(|_| SyncError::Config(format!("fingerprint {:?} is not 32 bytes", s)))
}

fn transport_config(config: &Config) -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();
    let idle = IdleTimeout::try_from(Duration::from_millis(config.idle_timeout_ms))
        .map_err(|e| SyncError::Config(format!("idle_timeout_ms: {}", e)))?;
    transport.max_idle_timeout(Some(idle));
    let streams = u32::try_from(config.max_concurrent_pulls).unwrap_or(u32::MAX);
    transport.max_concurrent_bidi_streams(VarInt::from_u32(streams.saturating_add(1)));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    Ok(transport)
}

// =============================================================================
// Server
// =============================================================================

/// A listening endpoint plus the fingerprint clients should pin.
pub struct QuicServer {
    endpoint: Endpoint,
    fingerprint: String,
}

fn self_signed() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let certified =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).map_err(tls_error)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((certified.cert.der().clone(), key))
}

impl QuicServer {
    /// Listen on `addr`. With an `authority` the server's certificate comes
    /// from it and clients must present one from it too.
    pub fn bind(
        addr: SocketAddr,
        authority: Option<&PasswordAuthority>,
        config: &Config,
    ) -> Result<Self> {
        let (cert, key) = match authority {
            Some(authority) => authority.issue(SERVER_NAME)?,
            None => self_signed()?,
        };
        let fingerprint = fingerprint(&cert);

        let builder = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_error)?;
        let builder = match authority {
            Some(authority) => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(authority.roots()?, provider())
                        .build()
                        .map_err(tls_error)?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let mut tls = builder
            .with_single_cert(vec![cert], key)
            .map_err(tls_error)?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let crypto = QuicServerConfig::try_from(tls).map_err(tls_error)?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(config)?));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| SyncError::Transport(format!("bind {}: {}", addr, e)))?;
        Ok(Self {
            endpoint,
            fingerprint,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Next established connection, or `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Result<QuicConnection>> {
        let incoming = self.endpoint.accept().await?;
        let remote = incoming.remote_address();
        Some(match incoming.await {
            Ok(conn) => Ok(QuicConnection::new(conn)),
            Err(e) => Err(SyncError::Transport(format!("handshake with {} failed: {}", remote, e))),
        })
    }

    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutting down");
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<[u8; 32]>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = blake3::hash(end_entity.as_ref());
        match self.expected {
            Some(expected) if actual.as_bytes() != &expected => {
                tracing::error!("Server certificate fingerprint mismatch: got {}", actual.to_hex());
                Err(rustls::Error::General(
                    "server certificate does not match the pinned fingerprint".into(),
                ))
            }
            Some(_) => Ok(ServerCertVerified::assertion()),
            None => {
                tracing::warn!(
                    "Accepting unpinned server certificate {}",
                    actual.to_hex()
                );
                Ok(ServerCertVerified::assertion())
            }
        }
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

/// How the client checks the server, and whether it proves itself.
#[derive(Clone, Copy)]
pub enum ClientAuth<'a> {
    /// Optionally pin the server certificate; present no certificate.
    Fingerprint(Option<[u8; 32]>),
    /// Both certificates must come from the shared authority.
    Password(&'a PasswordAuthority),
}

/// Connect to `server`, authenticating as `auth` says.
pub async fn connect(
    server: SocketAddr,
    auth: ClientAuth<'_>,
    config: &Config,
) -> Result<QuicConnection> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?;
    let mut tls = match auth {
        ClientAuth::Fingerprint(pinned) => {
            let verifier = Arc::new(FingerprintVerifier {
                expected: pinned,
                provider,
            });
            builder
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth()
        }
        ClientAuth::Password(authority) => {
            let verifier = WebPkiServerVerifier::builder_with_provider(authority.roots()?, provider)
                .build()
                .map_err(tls_error)?;
            let (cert, key) = authority.issue(CLIENT_NAME)?;
            builder
                .with_webpki_verifier(verifier)
                .with_client_auth_cert(vec![cert], key)
                .map_err(tls_error)?
        }
    };
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls).map_err(tls_error)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config(config)?));

    let bind: SocketAddr = if server.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(client_config);

    let conn = endpoint
        .connect(server, SERVER_NAME)
        .map_err(|e| SyncError::Transport(format!("connect {}: {}", server, e)))?
        .await
        .map_err(|e| SyncError::Transport(format!("handshake with {} failed: {}", server, e)))?;
    Ok(QuicConnection::with_endpoint(conn, endpoint))
}

// =============================================================================
// Connection
// =============================================================================

pub struct QuicConnection {
    conn: quinn::Connection,
    /// Client side keeps its endpoint alive for the connection's lifetime.
    endpoint: Option<Endpoint>,
}

impl QuicConnection {
    fn new(conn: quinn::Connection) -> Self {
        Self {
            conn,
            endpoint: None,
        }
    }

    fn with_endpoint(conn: quinn::Connection, endpoint: Endpoint) -> Self {
        Self {
            conn,
            endpoint: Some(endpoint),
        }
    }

    /// Wait until close frames have been delivered.
    pub async fn wait_idle(&self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.wait_idle().await;
        }
    }
}

impl SendHalf for quinn::SendStream {
    fn abort(&mut self, code: u32) {
        if let Err(e) = quinn::SendStream::reset(self, VarInt::from_u32(code)) {
            tracing::debug!("Stream reset after close: {}", e);
        }
    }
}

fn transport_error(e: ConnectionError) -> SyncError {
    SyncError::Transport(e.to_string())
}

#[async_trait]
impl Connection for QuicConnection {
    type Send = quinn::SendStream;
    type Recv = quinn::RecvStream;

    async fn open_stream(&self) -> Result<(quinn::SendStream, quinn::RecvStream)> {
        self.conn.open_bi().await.map_err(transport_error)
    }

    async fn accept_stream(&self) -> Result<Option<(quinn::SendStream, quinn::RecvStream)>> {
        match self.conn.accept_bi().await {
            Ok(streams) => Ok(Some(streams)),
            Err(ConnectionError::ApplicationClosed(_)) | Err(ConnectionError::LocallyClosed) => {
                Ok(None)
            }
            Err(e) => Err(transport_error(e)),
        }
    }

    fn close(&self, code: u32, reason: &str) {
        self.conn.close(VarInt::from_u32(code), reason.as_bytes());
    }

    async fn closed(&self) {
        let reason = self.conn.closed().await;
        tracing::debug!("Connection to {} closed: {}", self.peer(), reason);
    }

    fn peer(&self) -> String {
        self.conn.remote_address().to_string()
    }
}
