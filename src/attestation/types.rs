//! Core types for attestation verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Predicate types for different attestation formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateType {
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v2")]
    SevGuestV2,

    #[serde(rename = "https://tinfoil.sh/predicate/tdx-guest/v2")]
    TdxGuestV2,

    #[serde(rename = "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1")]
    SnpTdxMultiPlatformV1,

    #[serde(other)]
    Unknown,
}

impl PredicateType {
    /// Parse the predicate URI used in in-toto statements
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            "https://tinfoil.sh/predicate/sev-snp-guest/v2" => Self::SevGuestV2,
            "https://tinfoil.sh/predicate/tdx-guest/v2" => Self::TdxGuestV2,
            "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1" => Self::SnpTdxMultiPlatformV1,
            _ => Self::Unknown,
        }
    }
}

/// Raw attestation document served by the enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub format: PredicateType,
    /// Base64-encoded, gzipped report
    pub body: String,
}

/// Measurement registers, either from source provenance or from hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub type_: PredicateType,
    pub registers: Vec<String>,
}

/// Multi-platform predicates carry `[snp, rtmr1, rtmr2]`; a TDX enclave
/// reports `[mrtd, rtmr0, rtmr1, rtmr2, rtmr3]` with RTMR3 left zeroed.
const RTMR3_ZERO_HEX_LEN: usize = 96;

impl Measurement {
    /// Compare measurements, handling multi-platform predicates on either side
    pub fn equals(&self, other: &Measurement) -> Result<(), MeasurementError> {
        match (self.type_, other.type_) {
            (PredicateType::SnpTdxMultiPlatformV1, _) => self.covers(other),
            (_, PredicateType::SnpTdxMultiPlatformV1) => other.covers(self),
            (a, b) if a != b => Err(MeasurementError::FormatMismatch),
            _ if self.registers != other.registers => Err(MeasurementError::RegisterMismatch),
            _ => Ok(()),
        }
    }

    fn covers(&self, platform: &Measurement) -> Result<(), MeasurementError> {
        let [snp, rtmr1, rtmr2] = match self.registers.as_slice() {
            [snp, rtmr1, rtmr2, ..] => [snp, rtmr1, rtmr2],
            _ => return Err(MeasurementError::TooFewRegisters),
        };

        match platform.type_ {
            PredicateType::SevGuestV2 => {
                let actual = platform
                    .registers
                    .first()
                    .ok_or(MeasurementError::TooFewRegisters)?;
                if snp != actual {
                    return Err(MeasurementError::SnpMismatch);
                }
                Ok(())
            }
            PredicateType::TdxGuestV2 => {
                let regs = &platform.registers;
                if regs.len() < 5 {
                    return Err(MeasurementError::TooFewRegisters);
                }
                if *rtmr1 != regs[2] {
                    return Err(MeasurementError::Rtmr1Mismatch);
                }
                if *rtmr2 != regs[3] {
                    return Err(MeasurementError::Rtmr2Mismatch);
                }
                if regs[4] != "0".repeat(RTMR3_ZERO_HEX_LEN) {
                    return Err(MeasurementError::Rtmr3Mismatch);
                }
                Ok(())
            }
            _ => Err(MeasurementError::FormatMismatch),
        }
    }

    /// SHA-256 over the `|`-joined registers, hex encoded
    pub fn fingerprint(&self) -> String {
        let joined = self.registers.join("|");
        hex::encode(Sha256::digest(joined.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementError {
    #[error("Attestation format mismatch")]
    FormatMismatch,

    #[error("Register values don't match")]
    RegisterMismatch,

    #[error("Too few registers in measurement")]
    TooFewRegisters,

    #[error("SNP measurement mismatch")]
    SnpMismatch,

    #[error("RTMR1 mismatch")]
    Rtmr1Mismatch,

    #[error("RTMR2 mismatch")]
    Rtmr2Mismatch,

    #[error("RTMR3 mismatch (expected zeros)")]
    Rtmr3Mismatch,
}

/// Result of verifying an enclave's hardware report
#[derive(Debug, Clone)]
pub struct Verification {
    /// Enclave measurement registers
    pub measurement: Measurement,

    /// SHA-256 of the enclave's TLS SPKI, as committed in the report
    pub tls_public_key_fp: Vec<u8>,

    /// HPKE public key (hex-encoded)
    pub hpke_public_key: Option<String>,
}

/// The trust anchor for one enclave at one point in time.
///
/// Produced only by a successful trust-oracle round trip. Never mutated:
/// holders share it behind an `Arc` and a re-verification replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundTruth {
    cert_fingerprint: Vec<u8>,
    digest: String,
    measurement: String,
    hpke_public_key: Option<String>,
    code_measurement: Option<Measurement>,
    enclave_measurement: Option<Measurement>,
}

impl GroundTruth {
    pub fn new(
        cert_fingerprint: impl Into<Vec<u8>>,
        digest: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        Self {
            cert_fingerprint: cert_fingerprint.into(),
            digest: digest.into(),
            measurement: measurement.into(),
            hpke_public_key: None,
            code_measurement: None,
            enclave_measurement: None,
        }
    }

    pub fn with_hpke_public_key(mut self, key: Option<String>) -> Self {
        self.hpke_public_key = key;
        self
    }

    pub fn with_measurements(mut self, code: Measurement, enclave: Measurement) -> Self {
        self.code_measurement = Some(code);
        self.enclave_measurement = Some(enclave);
        self
    }

    /// Expected SPKI fingerprint of the enclave's TLS certificate
    pub fn cert_fingerprint(&self) -> &[u8] {
        &self.cert_fingerprint
    }

    pub fn cert_fingerprint_hex(&self) -> String {
        hex::encode(&self.cert_fingerprint)
    }

    /// Digest of the verified code release
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Fingerprint of the verified code measurement
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn hpke_public_key(&self) -> Option<&str> {
        self.hpke_public_key.as_deref()
    }

    pub fn code_measurement(&self) -> Option<&Measurement> {
        self.code_measurement.as_ref()
    }

    pub fn enclave_measurement(&self) -> Option<&Measurement> {
        self.enclave_measurement.as_ref()
    }
}
