//! Request transports bound to an attested certificate
//!
//! [`PinnedRoundTripper`] refuses any server whose key is not the attested
//! one. [`RotatingTransport`] sits on top and survives legitimate
//! certificate rotation: on a certificate failure it re-verifies the
//! enclave once, swaps in a transport pinned to the fresh fingerprint and
//! retries the request once. Without a fresh attestation the original
//! failure is returned.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::attestation::GroundTruth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::secure_client::{Pinned, SecureClient};
use crate::tls::{self, CertErrorKind};

/// Something that can carry one HTTP request to the enclave
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, request: reqwest::Request) -> Result<reqwest::Response>;
}

/// Connection settings shared by every pinned transport of a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl TransportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

/// HTTPS transport that only completes handshakes with one SPKI fingerprint.
///
/// Immutable once built; a new fingerprint means a new transport.
pub struct PinnedRoundTripper {
    client: reqwest::Client,
    expected: Vec<u8>,
}

impl PinnedRoundTripper {
    pub fn new(expected: &[u8], options: &TransportOptions) -> Result<Self> {
        let tls_config = tls::pinned_client_config(expected)?;

        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .https_only(true)
            .connect_timeout(options.connect_timeout);
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            expected: expected.to_vec(),
        })
    }

    pub fn expected_fingerprint(&self) -> &[u8] {
        &self.expected
    }

    fn map_error(&self, err: reqwest::Error) -> Error {
        if tls::classify(&err) != CertErrorKind::Mismatch {
            return Error::Transport(err);
        }
        Error::CertificateMismatch {
            expected: hex::encode(&self.expected),
            actual: tls::presented_fingerprint(&err).unwrap_or_else(|| "none".to_string()),
        }
    }
}

#[async_trait]
impl RoundTrip for PinnedRoundTripper {
    async fn round_trip(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        self.client
            .execute(request)
            .await
            .map_err(|e| self.map_error(e))
    }
}

/// Builds the transport for a freshly verified ground truth
pub trait TransportFactory: Send + Sync {
    fn build(&self, ground_truth: &GroundTruth) -> Result<Arc<dyn RoundTrip>>;
}

pub struct PinnedTransportFactory {
    options: TransportOptions,
}

impl PinnedTransportFactory {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for PinnedTransportFactory {
    fn build(&self, ground_truth: &GroundTruth) -> Result<Arc<dyn RoundTrip>> {
        let transport = PinnedRoundTripper::new(ground_truth.cert_fingerprint(), &self.options)?;
        Ok(Arc::new(transport))
    }
}

/// Rotation-aware transport over a [`SecureClient`].
///
/// The active (ground truth, transport) pair is one immutable snapshot
/// replaced wholesale. Requests capture the snapshot when they start.
/// Rotations serialize on a mutex that ordinary requests never take, so a
/// slow re-verification does not hold up traffic on the current transport.
pub struct RotatingTransport {
    secure_client: Arc<SecureClient>,
    active: RwLock<Arc<Pinned>>,
    rotation: tokio::sync::Mutex<()>,
}

impl RotatingTransport {
    /// Wrap `secure_client`, verifying first if it holds no ground truth yet
    pub async fn new(secure_client: Arc<SecureClient>) -> Result<Self> {
        let pinned = secure_client.pinned().await?;
        Ok(Self {
            secure_client,
            active: RwLock::new(Arc::new(pinned)),
            rotation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn secure_client(&self) -> &Arc<SecureClient> {
        &self.secure_client
    }

    /// Ground truth the active transport is pinned to
    pub fn ground_truth(&self) -> Arc<GroundTruth> {
        self.snapshot().ground_truth.clone()
    }

    /// Re-verify now and pin to the result
    pub async fn refresh(&self) -> Result<Arc<GroundTruth>> {
        let _guard = self.rotation.lock().await;
        let next = self.install_fresh().await?;
        Ok(next.ground_truth.clone())
    }

    fn snapshot(&self) -> Arc<Pinned> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn install_fresh(&self) -> Result<Arc<Pinned>> {
        let next = Arc::new(self.secure_client.verify_pinned().await?);
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        Ok(next)
    }

    /// Replace `stale` unless a concurrent request already did
    async fn rotate(&self, stale: &Arc<Pinned>) -> Result<Arc<Pinned>> {
        let _guard = self.rotation.lock().await;

        let current = self.snapshot();
        if !Arc::ptr_eq(&current, stale) {
            debug!(
                enclave = %self.secure_client.enclave(),
                "certificate already rotated by a concurrent request"
            );
            return Ok(current);
        }

        let next = self.install_fresh().await?;
        info!(
            enclave = %self.secure_client.enclave(),
            previous = %stale.ground_truth.cert_fingerprint_hex(),
            current = %next.ground_truth.cert_fingerprint_hex(),
            "certificate rotated, re-pinned to freshly attested key"
        );
        Ok(next)
    }
}

#[async_trait]
impl RoundTrip for RotatingTransport {
    async fn round_trip(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let active = self.snapshot();
        let retry = request.try_clone();

        let err = match active.transport.round_trip(request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        let kind = err.cert_error_kind();
        if !kind.triggers_rotation() {
            return Err(err);
        }

        let Some(retry) = retry else {
            warn!(
                enclave = %self.secure_client.enclave(),
                error = %err,
                "certificate error on a request whose body cannot be replayed"
            );
            return Err(err);
        };

        let next = match self.rotate(&active).await {
            Ok(next) => next,
            Err(verify_err) => {
                warn!(
                    enclave = %self.secure_client.enclave(),
                    kind = ?kind,
                    error = %err,
                    verification = %verify_err,
                    "re-verification after certificate error failed"
                );
                return Err(err);
            }
        };

        next.transport.round_trip(retry).await
    }
}
