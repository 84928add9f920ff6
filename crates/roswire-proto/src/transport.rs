// Socket setup shared by every connection.
//
// The API listens in plaintext on 8728 and behind TLS on 8729. Both paths
// produce the same boxed stream type so the connection layer never cares
// which one it got.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::codec::DEFAULT_MAX_SENTENCE;
use crate::error::Error;

/// TLS verification mode for the API-over-TLS port.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Plaintext API (port 8728).
    Disabled,
    /// TLS with the bundled webpki root store.
    System,
    /// TLS accepting any certificate. Routers ship self-signed
    /// certificates out of the box, so this is the practical default
    /// for the TLS port.
    DangerAcceptInvalid,
}

/// Connection tuning shared by every device connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Deadline for TCP connect and the TLS handshake, each.
    pub connect_timeout: Duration,
    /// Default deadline for one-shot commands.
    pub command_timeout: Duration,
    /// Upper bound on a single decoded sentence.
    pub max_sentence: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::Disabled,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            max_sentence: DEFAULT_MAX_SENTENCE,
        }
    }
}

/// Object-safe alias for the socket, plain or TLS.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> Io for T {}

pub(crate) type IoStream = Box<dyn Io>;

impl TransportConfig {
    /// Open a socket to `host:port` per this config.
    pub(crate) async fn connect(&self, host: &str, port: u16) -> Result<IoStream, Error> {
        let timeout_secs = self.connect_timeout.as_secs();
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout { timeout_secs })??;
        let _ = tcp.set_nodelay(true);

        let tls_config = match &self.tls {
            TlsMode::Disabled => return Ok(Box::new(tcp)),
            TlsMode::System => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            TlsMode::DangerAcceptInvalid => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
                .with_no_client_auth(),
        };

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Tls(format!("invalid server name: {host}")))?;

        let stream = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Timeout { timeout_secs })?
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(Box::new(stream))
    }
}

// ── Certificate verification bypass ──────────────────────────────────

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate and signature.
    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TransportConfig::default();
        assert!(matches!(config.tls, TlsMode::Disabled));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.max_sentence, DEFAULT_MAX_SENTENCE);
    }

    #[tokio::test]
    async fn connect_refused_is_an_io_error() {
        let config = TransportConfig::default();
        // bind-then-drop guarantees nothing is listening on the port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = config.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_connectivity());
    }
}
