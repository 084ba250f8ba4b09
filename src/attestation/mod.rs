//! Enclave attestation: fetch the hardware report and verify it
//!
//! The enclave serves its attestation document at
//! `/.well-known/tinfoil-attestation`. The report binds:
//! - the enclave measurement (what code is running), and
//! - the SPKI fingerprint of the TLS key the enclave terminates with.
//!
//! Only SEV-SNP reports are verified cryptographically. TDX-only documents
//! are refused rather than trusted unverified.

pub mod sev;
pub mod types;

pub use types::{
    AttestationDocument, GroundTruth, Measurement, MeasurementError, PredicateType, Verification,
};

use crate::error::{VerificationError, VerificationStage};

/// Path of the attestation document on every enclave
pub const ATTESTATION_PATH: &str = "/.well-known/tinfoil-attestation";

/// Fetch the attestation document from an enclave
pub async fn fetch(
    http: &reqwest::Client,
    host: &str,
) -> Result<AttestationDocument, VerificationError> {
    let fail = |message: String| VerificationError::new(VerificationStage::EnclaveAttestationFetch, message);
    let url = format!("https://{}{}", host, ATTESTATION_PATH);

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| fail(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(fail(format!(
            "HTTP {}: {}",
            response.status(),
            response.status().canonical_reason().unwrap_or("Unknown error")
        )));
    }

    response
        .json()
        .await
        .map_err(|e| fail(format!("JSON parse failed: {}", e)))
}

/// Verify an attestation document's hardware report
pub async fn verify(
    http: &reqwest::Client,
    kds_proxy: &str,
    doc: &AttestationDocument,
) -> Result<Verification, VerificationError> {
    match doc.format {
        PredicateType::SevGuestV2 | PredicateType::SnpTdxMultiPlatformV1 => {
            sev::verify(http, kds_proxy, &doc.body).await
        }
        PredicateType::TdxGuestV2 => Err(VerificationError::new(
            VerificationStage::EnclaveAttestationVerify,
            "TDX quote verification is not supported",
        )),
        PredicateType::Unknown => Err(VerificationError::new(
            VerificationStage::EnclaveAttestationVerify,
            "Unknown attestation format",
        )),
    }
}
