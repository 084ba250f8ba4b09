//! TLS certificate fingerprinting, pinning and error classification
//!
//! Enclave certificates are trusted because their public key was attested,
//! never because a CA signed them. The fingerprint is SHA-256 over the full
//! SPKI (SubjectPublicKeyInfo) DER encoding, which is what the enclave
//! commits to in its attestation report.

use std::error::Error as StdError;
use std::sync::Arc;

use der::{Decode, Encode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::error::{Error, Result};

/// Compute the SHA-256 fingerprint of a certificate's SPKI
pub fn cert_fingerprint(cert_der: &CertificateDer<'_>) -> Result<[u8; 32]> {
    let cert = Certificate::from_der(cert_der.as_ref())
        .map_err(|e| Error::Tls(format!("Failed to parse certificate: {}", e)))?;

    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::Tls(format!("Failed to encode SPKI: {}", e)))?;

    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&Sha256::digest(&spki_der));
    Ok(fingerprint)
}

/// The crypto provider used for every pinned connection
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Install the process-wide rustls provider if nobody has yet.
///
/// Plain (non-pinned) clients built by reqwest rely on it.
pub fn install_default_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Raised by [`PinnedCertVerifier`] when the presented key is not the attested one
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
pub struct FingerprintMismatch {
    pub expected: String,
    pub actual: String,
}

/// Certificate verifier that accepts exactly one SPKI fingerprint.
///
/// CA chain, validity period and server name are not consulted: the attested
/// fingerprint is the only authority. Handshake signatures are still checked
/// so the peer must hold the private key.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(expected: Vec<u8>, provider: Arc<CryptoProvider>) -> Self {
        Self { expected, provider }
    }

    pub fn expected(&self) -> &[u8] {
        &self.expected
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = cert_fingerprint(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        if actual[..] != self.expected[..] {
            let mismatch = FingerprintMismatch {
                expected: hex::encode(&self.expected),
                actual: hex::encode(actual),
            };
            return Err(rustls::Error::InvalidCertificate(CertificateError::Other(
                rustls::OtherError(Arc::new(mismatch)),
            )));
        }

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

/// Build a rustls client config that only accepts the given fingerprint
pub fn pinned_client_config(expected: &[u8]) -> Result<rustls::ClientConfig> {
    let provider = crypto_provider();
    let verifier = PinnedCertVerifier::new(expected.to_vec(), provider.clone());

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Failed to select protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(config)
}

/// Coarse classification of a failed request, used to decide on rotation recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertErrorKind {
    /// Presented certificate is not the attested one (or none was presented)
    Mismatch,
    /// Certificate chain does not lead to a known issuer
    UnknownAuthority,
    /// Certificate not valid for the requested name
    HostnameMismatch,
    /// Any other TLS-level failure
    ProtocolTlsFailure,
    /// Not a TLS failure
    Other,
}

impl CertErrorKind {
    pub fn triggers_rotation(self) -> bool {
        matches!(
            self,
            CertErrorKind::Mismatch
                | CertErrorKind::UnknownAuthority
                | CertErrorKind::HostnameMismatch
        )
    }
}

/// Classify an error by looking for a rustls error anywhere in its source chain
pub fn classify(err: &(dyn StdError + 'static)) -> CertErrorKind {
    match find_tls_error(err) {
        Some(tls) => classify_tls(tls),
        None => CertErrorKind::Other,
    }
}

fn classify_tls(err: &rustls::Error) -> CertErrorKind {
    match err {
        rustls::Error::NoCertificatesPresented => CertErrorKind::Mismatch,
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::Other(other)
                if other.0.downcast_ref::<FingerprintMismatch>().is_some() =>
            {
                CertErrorKind::Mismatch
            }
            CertificateError::UnknownIssuer | CertificateError::BadSignature => {
                CertErrorKind::UnknownAuthority
            }
            CertificateError::NotValidForName => CertErrorKind::HostnameMismatch,
            _ => CertErrorKind::ProtocolTlsFailure,
        },
        _ => CertErrorKind::ProtocolTlsFailure,
    }
}

/// Hex fingerprint the peer presented, if the failure was a pin mismatch
pub fn presented_fingerprint(err: &(dyn StdError + 'static)) -> Option<String> {
    match find_tls_error(err)? {
        rustls::Error::InvalidCertificate(CertificateError::Other(other)) => other
            .0
            .downcast_ref::<FingerprintMismatch>()
            .map(|m| m.actual.clone()),
        _ => None,
    }
}

// io::Error::source() skips the wrapped error, so its payload is inspected
// explicitly; tokio-rustls surfaces handshake failures that way.
fn find_tls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(tls) = err.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if let Some(inner) = io.get_ref() {
                if let Some(tls) = find_tls_error(inner) {
                    return Some(tls);
                }
            }
        }
        current = err.source();
    }
    None
}
