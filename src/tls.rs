//! TLS session setup with application-controlled certificate decisions.
//!
//! Certificate checks run through the normal WebPKI verifier, but every
//! failed check is reported to an application callback that can choose to
//! continue anyway or abort the handshake. An optional pinned fingerprint
//! (SHA-256 over the end-entity certificate in DER form) is checked after
//! chain verification, and the fingerprint actually observed is retained
//! for inspection whatever the outcome.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::warn;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};

use crate::error::Error;

/// Which certificate check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// The server presented no certificate at all.
    NoCertFound,
    /// The chain does not lead to a trusted root, or the certificate is
    /// revoked or otherwise invalid.
    UntrustedCert,
    /// The certificate expired.
    CertExpired,
    /// The certificate is not valid yet.
    CertNotActivated,
    /// The certificate does not cover the expected hostname.
    HostnameMismatch,
    /// The pinned fingerprint does not match the presented certificate.
    FingerprintMismatch,
    /// Any other verification failure.
    GenericError,
}

impl std::fmt::Display for TlsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TlsStatus::NoCertFound => "no certificate presented",
            TlsStatus::UntrustedCert => "certificate is not trusted",
            TlsStatus::CertExpired => "certificate has expired",
            TlsStatus::CertNotActivated => "certificate is not yet valid",
            TlsStatus::HostnameMismatch => "certificate does not match hostname",
            TlsStatus::FingerprintMismatch => "certificate fingerprint mismatch",
            TlsStatus::GenericError => "certificate verification failed",
        };
        f.write_str(text)
    }
}

impl TlsStatus {
    pub(crate) fn from_error(err: &rustls::Error) -> TlsStatus {
        match err {
            rustls::Error::NoCertificatesPresented => TlsStatus::NoCertFound,
            rustls::Error::InvalidCertificate(cert_err) => match cert_err {
                CertificateError::Expired => TlsStatus::CertExpired,
                CertificateError::NotValidYet => TlsStatus::CertNotActivated,
                CertificateError::NotValidForName => TlsStatus::HostnameMismatch,
                CertificateError::Revoked
                | CertificateError::UnknownIssuer
                | CertificateError::BadSignature
                | CertificateError::InvalidPurpose => TlsStatus::UntrustedCert,
                _ => TlsStatus::GenericError,
            },
            rustls::Error::General(msg) if msg.contains("fingerprint") => {
                TlsStatus::FingerprintMismatch
            }
            _ => TlsStatus::GenericError,
        }
    }
}

/// Application verdict on a failed certificate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsDecision {
    /// Accept the connection despite this check failing.
    Continue,
    /// Abort the handshake.
    Abort,
}

/// Callback consulted for every failed certificate check.
pub type TlsDecider = Arc<dyn Fn(TlsStatus) -> TlsDecision + Send + Sync>;

/// TLS settings for a connection. The default configuration uses the
/// system root store and aborts on any failed check.
#[derive(Clone)]
pub struct TlsConfig {
    decider: TlsDecider,
    expected_fingerprint: Option<Vec<u8>>,
}

impl TlsConfig {
    pub fn new() -> Self {
        TlsConfig {
            decider: Arc::new(|_| TlsDecision::Abort),
            expected_fingerprint: None,
        }
    }

    /// Installs the decision callback for failed certificate checks.
    pub fn on_certificate_issue(
        mut self,
        decider: impl Fn(TlsStatus) -> TlsDecision + Send + Sync + 'static,
    ) -> Self {
        self.decider = Arc::new(decider);
        self
    }

    /// Pins the expected SHA-256 fingerprint of the server certificate.
    pub fn expect_fingerprint(mut self, fingerprint: impl Into<Vec<u8>>) -> Self {
        self.expected_fingerprint = Some(fingerprint.into());
        self
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig::new()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("expected_fingerprint", &self.expected_fingerprint)
            .finish_non_exhaustive()
    }
}

/// Initialize the rustls crypto provider (idempotent).
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn check_fingerprint(
    expected: Option<&[u8]>,
    actual: &[u8],
    decider: &dyn Fn(TlsStatus) -> TlsDecision,
) -> Result<(), rustls::Error> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if expected == actual {
        return Ok(());
    }
    warn!(
        expected = %hex::encode(expected),
        actual = %hex::encode(actual),
        "certificate fingerprint mismatch"
    );
    match decider(TlsStatus::FingerprintMismatch) {
        TlsDecision::Continue => Ok(()),
        TlsDecision::Abort => Err(rustls::Error::General(
            "certificate fingerprint mismatch".to_string(),
        )),
    }
}

/// WebPKI verification with the outcome of each failed check delegated to
/// the application decider.
struct DecidingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    decider: TlsDecider,
    expected_fingerprint: Option<Vec<u8>>,
    seen_fingerprint: Mutex<Option<[u8; 32]>>,
}

impl std::fmt::Debug for DecidingVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecidingVerifier")
            .field("expected_fingerprint", &self.expected_fingerprint)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for DecidingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let fingerprint: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if let Ok(mut seen) = self.seen_fingerprint.lock() {
            *seen = Some(fingerprint);
        }

        if let Err(err) = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            let status = TlsStatus::from_error(&err);
            warn!(%status, error = %err, "certificate check failed");
            if (self.decider)(status) == TlsDecision::Abort {
                return Err(err);
            }
        }

        check_fingerprint(
            self.expected_fingerprint.as_deref(),
            &fingerprint,
            &*self.decider,
        )?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A ready-to-use TLS connector bound to one connection's [`TlsConfig`].
pub(crate) struct TlsEngine {
    connector: TlsConnector,
    verifier: Arc<DecidingVerifier>,
}

impl TlsEngine {
    pub(crate) fn new(config: &TlsConfig) -> Result<Self, Error> {
        init_crypto_provider();

        let mut root_store = RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs();
        if native_certs.certs.is_empty() {
            return Err(Error::Tls(
                "no system root certificates found, ensure CA certificates are installed"
                    .to_string(),
            ));
        }
        for cert in native_certs.certs {
            root_store
                .add(cert)
                .map_err(|e| Error::Tls(format!("failed to add root certificate: {e}")))?;
        }

        let inner = WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| Error::Tls(format!("failed to build certificate verifier: {e}")))?;

        let verifier = Arc::new(DecidingVerifier {
            inner,
            decider: Arc::clone(&config.decider),
            expected_fingerprint: config.expected_fingerprint.clone(),
            seen_fingerprint: Mutex::new(None),
        });

        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(&verifier) as Arc<dyn ServerCertVerifier>)
            .with_no_client_auth();

        Ok(TlsEngine {
            connector: TlsConnector::from(Arc::new(client_config)),
            verifier,
        })
    }

    /// Upgrades the TCP stream, using `host` for SNI and hostname checks.
    pub(crate) async fn handshake(
        &self,
        stream: TcpStream,
        host: &str,
    ) -> Result<TlsStream<TcpStream>, Error> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;

        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|e| {
                match e
                    .get_ref()
                    .and_then(|inner| inner.downcast_ref::<rustls::Error>())
                {
                    Some(
                        tls_err @ (rustls::Error::InvalidCertificate(_)
                        | rustls::Error::NoCertificatesPresented
                        | rustls::Error::General(_)),
                    ) => Error::CertificateRejected(TlsStatus::from_error(tls_err)),
                    _ => Error::Tls(e.to_string()),
                }
            })
    }

    /// SHA-256 of the certificate the server actually presented during the
    /// most recent handshake, even when the handshake was aborted.
    pub(crate) fn peer_fingerprint(&self) -> Option<[u8; 32]> {
        self.verifier.seen_fingerprint.lock().ok().and_then(|g| *g)
    }
}
