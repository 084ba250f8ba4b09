//! Verified, certificate-pinned access to one enclave
//!
//! A [`SecureClient`] owns the trust anchor for its enclave. It asks the
//! [`TrustOracle`] for a [`GroundTruth`], caches it, and hands out
//! transports pinned to the attested certificate. A failed re-verification
//! never discards a cached anchor.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::attestation::GroundTruth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::oracle::{AttestationOracle, TrustOracle};
use crate::pending::{PendingRequest, PendingRequests};
use crate::transport::{PinnedTransportFactory, RoundTrip, TransportFactory, TransportOptions};

/// A ground truth together with the transport pinned to it
#[derive(Clone)]
pub(crate) struct Pinned {
    pub ground_truth: Arc<GroundTruth>,
    pub transport: Arc<dyn RoundTrip>,
}

/// Fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub(crate) async fn read(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Resolve a request target against the enclave.
///
/// Targets that name a host pass through with their host kept, including
/// network-path references (`//host/path`, which take `https`). Anything
/// else is a path on `https://{host}/`.
pub fn resolve_url(host: &str, path_or_url: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(path_or_url) {
        if url.has_host() {
            return Ok(url);
        }
    }

    let base = Url::parse(&format!("https://{}/", host))
        .map_err(|e| Error::InvalidRequest(format!("invalid enclave host {:?}: {}", host, e)))?;
    let url = base
        .join(path_or_url)
        .map_err(|e| Error::InvalidRequest(format!("invalid path {:?}: {}", path_or_url, e)))?;
    if !url.has_host() {
        return Err(Error::InvalidRequest(format!(
            "{:?} does not resolve to a host",
            path_or_url
        )));
    }
    Ok(url)
}

pub(crate) fn build_request(
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
) -> reqwest::Request {
    let mut request = reqwest::Request::new(method, url);
    *request.headers_mut() = headers;
    if let Some(body) = body {
        *request.body_mut() = Some(body.into());
    }
    request
}

pub struct SecureClient {
    config: Config,
    oracle: Arc<dyn TrustOracle>,
    factory: Arc<dyn TransportFactory>,
    verified: RwLock<Option<Pinned>>,
    pending: PendingRequests,
}

impl SecureClient {
    /// Client verified by the production [`AttestationOracle`]
    pub fn new(config: Config) -> Result<Self> {
        let oracle = Arc::new(AttestationOracle::new(&config)?);
        Self::with_oracle(config, oracle)
    }

    pub fn with_oracle(config: Config, oracle: Arc<dyn TrustOracle>) -> Result<Self> {
        let factory = Arc::new(PinnedTransportFactory::new(TransportOptions::from_config(
            &config,
        )));
        Self::with_parts(config, oracle, factory)
    }

    pub fn with_parts(
        config: Config,
        oracle: Arc<dyn TrustOracle>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            oracle,
            factory,
            verified: RwLock::new(None),
            pending: PendingRequests::default(),
        })
    }

    pub fn enclave(&self) -> &str {
        &self.config.enclave
    }

    pub fn repo(&self) -> &str {
        &self.config.repo
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cached ground truth from the last successful verification
    pub fn ground_truth(&self) -> Option<Arc<GroundTruth>> {
        self.cached().map(|pinned| pinned.ground_truth)
    }

    /// Run a full verification round trip and cache the result.
    ///
    /// On failure, timeout or cancellation the previous ground truth stays.
    pub async fn verify(&self) -> Result<Arc<GroundTruth>> {
        Ok(self.verify_pinned().await?.ground_truth)
    }

    /// Transport pinned to the cached ground truth, verifying first if needed
    pub async fn http_client(&self) -> Result<Arc<dyn RoundTrip>> {
        Ok(self.pinned().await?.transport)
    }

    /// Send a request through the pinned transport and buffer the response
    pub async fn request(
        &self,
        method: Method,
        path_or_url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let url = resolve_url(self.enclave(), path_or_url)?;
        self.send(method, url, headers, body).await
    }

    pub async fn get(&self, path_or_url: &str, headers: HeaderMap) -> Result<Response> {
        self.request(Method::GET, path_or_url, headers, None).await
    }

    pub async fn post(
        &self,
        path_or_url: &str,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<Response> {
        self.request(Method::POST, path_or_url, headers, Some(body.into()))
            .await
    }

    /// Start a POST request; returns its id
    pub fn init_post_request(&self, path_or_url: &str, body: impl Into<Bytes>) -> Result<i64> {
        let url = resolve_url(self.enclave(), path_or_url)?;
        Ok(self
            .pending
            .insert(PendingRequest::new(Method::POST, url, Some(body.into()))))
    }

    /// Start a GET request; returns its id
    pub fn init_get_request(&self, path_or_url: &str) -> Result<i64> {
        let url = resolve_url(self.enclave(), path_or_url)?;
        Ok(self.pending.insert(PendingRequest::new(Method::GET, url, None)))
    }

    pub fn add_header(&self, request_id: i64, key: &str, value: &str) -> Result<()> {
        self.pending.set_header(request_id, key, value)
    }

    /// Send a pending request. The id is consumed whatever the outcome.
    pub async fn execute_request(&self, request_id: i64) -> Result<Response> {
        let pending = self.pending.take(request_id)?;
        self.send(pending.method, pending.url, pending.headers, pending.body)
            .await
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let transport = self.http_client().await?;
        let response = transport
            .round_trip(build_request(method, url, headers, body))
            .await?;
        Response::read(response).await
    }

    fn cached(&self) -> Option<Pinned> {
        self.verified
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) async fn pinned(&self) -> Result<Pinned> {
        match self.cached() {
            Some(pinned) => Ok(pinned),
            None => self.verify_pinned().await,
        }
    }

    pub(crate) async fn verify_pinned(&self) -> Result<Pinned> {
        let (enclave, repo) = (self.enclave(), self.repo());
        debug!(enclave, repo, "verifying enclave");

        let timeout = self.config.verify_timeout;
        let ground_truth = match tokio::time::timeout(timeout, self.oracle.verify(enclave, repo))
            .await
        {
            Ok(Ok(ground_truth)) => Arc::new(ground_truth),
            Ok(Err(err)) => {
                warn!(enclave, repo, stage = %err.stage, error = %err.message, "verification failed");
                return Err(err.into());
            }
            Err(_) => {
                warn!(enclave, repo, ?timeout, "verification timed out");
                return Err(Error::Timeout {
                    operation: "attestation verification",
                    after: timeout,
                });
            }
        };

        let pinned = Pinned {
            transport: self.factory.build(&ground_truth)?,
            ground_truth,
        };
        *self.verified.write().unwrap_or_else(PoisonError::into_inner) = Some(pinned.clone());

        debug!(
            enclave,
            digest = pinned.ground_truth.digest(),
            fingerprint = %pinned.ground_truth.cert_fingerprint_hex(),
            "enclave verified"
        );
        Ok(pinned)
    }
}
