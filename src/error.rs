//! Error types for the Tinfoil client

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::tls::{self, CertErrorKind};

/// Step of the attestation protocol at which a trust-oracle round trip failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationStage {
    /// Looking up the latest release and its image digest
    ReleaseLookup,
    /// Fetching the Sigstore bundle for the release digest
    AttestationBundleFetch,
    /// Fetching the Sigstore trusted root
    TrustRootFetch,
    /// Verifying the bundle and extracting the code measurement
    MeasurementVerify,
    /// Fetching the attestation document from the enclave
    EnclaveAttestationFetch,
    /// Verifying the enclave's hardware report
    EnclaveAttestationVerify,
    /// Code and enclave measurements differ
    MeasurementMismatch,
}

impl VerificationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReleaseLookup => "release-lookup",
            Self::AttestationBundleFetch => "attestation-bundle-fetch",
            Self::TrustRootFetch => "trust-root-fetch",
            Self::MeasurementVerify => "measurement-verify",
            Self::EnclaveAttestationFetch => "enclave-attestation-fetch",
            Self::EnclaveAttestationVerify => "enclave-attestation-verify",
            Self::MeasurementMismatch => "measurement-mismatch",
        }
    }
}

impl fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a trust-oracle round trip, tagged with the failing stage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification failed at {stage}: {message}")]
pub struct VerificationError {
    pub stage: VerificationStage,
    pub message: String,
}

impl VerificationError {
    pub fn new(stage: VerificationStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    VerificationFailed(#[from] VerificationError),

    #[error("TLS certificate fingerprint mismatch: expected {expected}, got {actual}")]
    CertificateMismatch { expected: String, actual: String },

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("No embedding in response")]
    NoEmbedding,

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Pending request {0} not found")]
    RequestNotFound(i64),
}

impl Error {
    /// Classify this error for rotation recovery.
    ///
    /// Only the certificate-level kinds (see [`CertErrorKind::triggers_rotation`])
    /// cause a re-verification.
    pub fn cert_error_kind(&self) -> CertErrorKind {
        match self {
            Error::CertificateMismatch { .. } => CertErrorKind::Mismatch,
            Error::Transport(err) => tls::classify(err),
            _ => CertErrorKind::Other,
        }
    }

    /// The failing stage, if this is a verification error
    pub fn verification_stage(&self) -> Option<VerificationStage> {
        match self {
            Error::VerificationFailed(err) => Some(err.stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
