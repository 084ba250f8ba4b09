//! Trust oracle: turns an (enclave, repo) pair into a [`GroundTruth`]
//!
//! The production oracle runs the full attestation protocol:
//! 1. Code provenance via Sigstore (what the enclave should measure)
//! 2. Hardware attestation from the enclave (what it does measure)
//! 3. Measurement comparison
//!
//! Every failure carries the [`VerificationStage`] it happened in.

use async_trait::async_trait;
use tracing::debug;

use crate::attestation::{self, GroundTruth};
use crate::config::{Config, Endpoints};
use crate::error::{Result, VerificationError, VerificationStage};
use crate::sigstore;
use crate::tls;

/// Source of trust anchors.
///
/// Implementations perform a complete verification round trip on every
/// call; caching is the caller's concern.
#[async_trait]
pub trait TrustOracle: Send + Sync {
    async fn verify(
        &self,
        enclave: &str,
        repo: &str,
    ) -> std::result::Result<GroundTruth, VerificationError>;
}

/// Verifies enclaves against Sigstore provenance and SEV-SNP attestation
pub struct AttestationOracle {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl AttestationOracle {
    pub fn new(config: &Config) -> Result<Self> {
        tls::install_default_provider();

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.verify_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

#[async_trait]
impl TrustOracle for AttestationOracle {
    async fn verify(
        &self,
        enclave: &str,
        repo: &str,
    ) -> std::result::Result<GroundTruth, VerificationError> {
        let endpoints = &self.endpoints;

        let digest =
            sigstore::fetch_latest_digest(&self.http, &endpoints.github_proxy, repo).await?;
        debug!(repo, digest = %digest, "resolved latest release");

        let bundle = sigstore::fetch_attestation_bundle(
            &self.http,
            &endpoints.attestation_proxy,
            repo,
            &digest,
        )
        .await?;
        let trust_root = sigstore::fetch_trust_root(&self.http, &endpoints.trust_root_url).await?;
        let code = sigstore::verify_attestation(&trust_root, &bundle, &digest, repo)?;
        debug!(repo, measurement = %code.fingerprint(), "verified code provenance");

        let doc = attestation::fetch(&self.http, enclave).await?;
        let verification = attestation::verify(&self.http, &endpoints.kds_proxy, &doc).await?;
        debug!(enclave, "verified hardware attestation");

        code.equals(&verification.measurement).map_err(|e| {
            VerificationError::new(
                VerificationStage::MeasurementMismatch,
                format!(
                    "{}: code {} vs enclave {}",
                    e,
                    code.fingerprint(),
                    verification.measurement.fingerprint()
                ),
            )
        })?;

        let measurement = code.fingerprint();
        Ok(GroundTruth::new(verification.tls_public_key_fp, digest, measurement)
            .with_hpke_public_key(verification.hpke_public_key)
            .with_measurements(code, verification.measurement))
    }
}
