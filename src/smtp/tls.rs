//! TLS client setup and certificate inspection.
//!
//! The handshake always completes so the probe can report on servers with
//! broken certificates. Chain validation still runs: the WebPKI verdict is
//! recorded and surfaces as `certificate_valid`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring as ring_provider, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, ProtocolVersion, RootCertStore, SignatureScheme};
use serde::Serialize;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::SmtpConfig;
use crate::error::{ErrorKind, InspectError};

const SYSTEM_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// TLS facts for the probe result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityAnalysis {
    pub tls_version: String,
    pub cipher_suite: String,
    pub certificate_valid: bool,
    pub certificate_issuer: String,
    /// RFC 3339, empty when the certificate could not be parsed.
    pub certificate_expires: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_error: Option<String>,
}

/// Runs WebPKI validation, remembers the verdict and lets the handshake go on.
#[derive(Debug)]
struct RecordingVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    verdict: Mutex<Option<Result<(), String>>>,
}

impl RecordingVerifier {
    fn record(&self, verdict: Result<(), String>) {
        let mut slot = self.verdict.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(verdict);
    }

    fn verdict(&self) -> Option<Result<(), String>> {
        self.verdict.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verdict = match &self.webpki {
            Some(v) => v
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => Err("no trust anchors available".to_string()),
        };
        if let Err(reason) = &verdict {
            debug!(%reason, "peer certificate did not validate");
        }
        self.record(verdict);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn load_bundle(path: &Path, roots: &mut RootCertStore) -> std::io::Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        debug!(path = %path.display(), ignored, "skipped unparsable trust anchors");
    }
    Ok(added)
}

/// Trust anchors from the configured bundle, or the first system bundle found.
fn trust_anchors(config: &SmtpConfig) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match &config.ca_bundle {
        Some(path) => {
            if let Err(e) = load_bundle(path, &mut roots) {
                warn!(path = %path.display(), error = %e, "cannot read CA bundle");
            }
        }
        None => {
            for path in SYSTEM_BUNDLES {
                if matches!(load_bundle(Path::new(path), &mut roots), Ok(n) if n > 0) {
                    debug!(%path, count = roots.len(), "loaded system trust anchors");
                    break;
                }
            }
        }
    }
    roots
}

/// A TLS connector plus the verdict of its one handshake.
pub struct TlsClient {
    pub connector: TlsConnector,
    verifier: Arc<RecordingVerifier>,
}

impl TlsClient {
    pub fn new(config: &SmtpConfig) -> Result<Self, InspectError> {
        let provider = Arc::new(ring_provider::default_provider());
        let roots = trust_anchors(config);
        let webpki = if roots.is_empty() {
            None
        } else {
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| warn!(error = %e, "cannot build certificate verifier"))
                .ok()
        };
        let verifier = Arc::new(RecordingVerifier {
            webpki,
            provider: provider.clone(),
            verdict: Mutex::new(None),
        });
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| InspectError::new(ErrorKind::TlsNegotiationFailed, e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            verifier,
        })
    }

    /// Describe the negotiated session and the peer certificate.
    pub fn analyze(&self, session: &ClientConnection) -> SecurityAnalysis {
        let tls_version = match session.protocol_version() {
            Some(ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
            Some(ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
            Some(other) => format!("{other:?}"),
            None => String::new(),
        };
        let cipher_suite = session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default();

        let mut analysis = SecurityAnalysis {
            tls_version,
            cipher_suite,
            ..Default::default()
        };
        match self.verifier.verdict() {
            Some(Ok(())) => analysis.certificate_valid = true,
            Some(Err(reason)) => analysis.certificate_error = Some(reason),
            None => analysis.certificate_error = Some("certificate was not checked".into()),
        }
        if let Some(cert) = session.peer_certificates().and_then(|c| c.first()) {
            match X509Certificate::from_der(cert.as_ref()) {
                Ok((_, x509)) => {
                    analysis.certificate_issuer = x509.issuer().to_string();
                    analysis.certificate_expires = DateTime::from_timestamp(x509.validity().not_after.timestamp(), 0)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                }
                Err(e) => {
                    analysis.certificate_valid = false;
                    analysis.certificate_error = Some(format!("unparsable certificate: {e}"));
                }
            }
        }
        analysis
    }
}

/// Server name for SNI and certificate matching.
pub fn server_name(host: &str) -> Result<ServerName<'static>, InspectError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| InspectError::new(ErrorKind::TlsNegotiationFailed, format!("invalid server name {host:?}: {e}")))
}
