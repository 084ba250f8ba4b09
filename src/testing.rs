//! In-memory trust oracle and enclave for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::attestation::GroundTruth;
use crate::config::Config;
use crate::error::{Error, Result, VerificationError, VerificationStage};
use crate::oracle::TrustOracle;
use crate::secure_client::SecureClient;
use crate::transport::{RoundTrip, TransportFactory};

pub const ENCLAVE_HOST: &str = "enclave.test";
pub const ENCLAVE_REPO: &str = "acme/enclave";

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Attest([u8; 32]),
    Fail(VerificationStage),
}

/// Oracle that vouches for whatever fingerprint the test tells it to
pub struct ScriptedOracle {
    calls: AtomicUsize,
    outcome: Mutex<Outcome>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedOracle {
    fn with_outcome(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome: Mutex::new(outcome),
            delay: Mutex::new(None),
        })
    }

    pub fn attesting(fingerprint: [u8; 32]) -> Arc<Self> {
        Self::with_outcome(Outcome::Attest(fingerprint))
    }

    pub fn failing(stage: VerificationStage) -> Arc<Self> {
        Self::with_outcome(Outcome::Fail(stage))
    }

    pub fn attest(&self, fingerprint: [u8; 32]) {
        *self.outcome.lock().unwrap() = Outcome::Attest(fingerprint);
    }

    pub fn fail_at(&self, stage: VerificationStage) {
        *self.outcome.lock().unwrap() = Outcome::Fail(stage);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrustOracle for ScriptedOracle {
    async fn verify(
        &self,
        _enclave: &str,
        _repo: &str,
    ) -> std::result::Result<GroundTruth, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = *self.outcome.lock().unwrap();
        match outcome {
            Outcome::Attest(fingerprint) => Ok(GroundTruth::new(
                fingerprint.to_vec(),
                "sha256-digest",
                hex::encode(fingerprint),
            )),
            Outcome::Fail(stage) => Err(VerificationError::new(stage, "scripted failure")),
        }
    }
}

struct EnclaveState {
    presented: Mutex<[u8; 32]>,
    online: AtomicBool,
    requests: AtomicUsize,
    reply: Mutex<(u16, String)>,
    broken_body: AtomicBool,
    last_request: Mutex<Option<Recorded>>,
}

/// What the enclave saw of a delivered request
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: reqwest::header::HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// Enclave whose TLS key the test can rotate
#[derive(Clone)]
pub struct MockEnclave {
    state: Arc<EnclaveState>,
}

impl MockEnclave {
    pub fn new(fingerprint: [u8; 32]) -> Self {
        Self {
            state: Arc::new(EnclaveState {
                presented: Mutex::new(fingerprint),
                online: AtomicBool::new(true),
                requests: AtomicUsize::new(0),
                reply: Mutex::new((200, "ok".to_string())),
                broken_body: AtomicBool::new(false),
                last_request: Mutex::new(None),
            }),
        }
    }

    pub fn rotate(&self, fingerprint: [u8; 32]) {
        *self.state.presented.lock().unwrap() = fingerprint;
    }

    pub fn go_offline(&self) {
        self.state.online.store(false, Ordering::SeqCst);
    }

    pub fn reply_with(&self, status: u16, body: impl Into<String>) {
        *self.state.reply.lock().unwrap() = (status, body.into());
        self.state.broken_body.store(false, Ordering::SeqCst);
    }

    /// Reply with `status` and a body whose read fails midway
    pub fn reply_with_broken_body(&self, status: u16) {
        *self.state.reply.lock().unwrap() = (status, String::new());
        self.state.broken_body.store(true, Ordering::SeqCst);
    }

    pub fn last_request(&self) -> Option<Recorded> {
        self.state.last_request.lock().unwrap().clone()
    }

    /// Connection attempts seen so far
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn factory(&self) -> Arc<MockFactory> {
        Arc::new(MockFactory {
            state: self.state.clone(),
        })
    }

    pub fn secure_client(&self, oracle: Arc<ScriptedOracle>) -> SecureClient {
        self.secure_client_for(Config::new(ENCLAVE_HOST, ENCLAVE_REPO), oracle)
    }

    pub fn secure_client_for(&self, config: Config, oracle: Arc<ScriptedOracle>) -> SecureClient {
        SecureClient::with_parts(config, oracle, self.factory()).unwrap()
    }
}

pub struct MockFactory {
    state: Arc<EnclaveState>,
}

impl TransportFactory for MockFactory {
    fn build(&self, ground_truth: &GroundTruth) -> Result<Arc<dyn RoundTrip>> {
        Ok(Arc::new(MockTransport {
            expected: ground_truth.cert_fingerprint().to_vec(),
            state: self.state.clone(),
        }))
    }
}

/// Pins like the real transport: succeeds only if the enclave presents `expected`
struct MockTransport {
    expected: Vec<u8>,
    state: Arc<EnclaveState>,
}

#[async_trait]
impl RoundTrip for MockTransport {
    async fn round_trip(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);

        if !self.state.online.load(Ordering::SeqCst) {
            return Err(Error::Timeout {
                operation: "request",
                after: Duration::from_secs(1),
            });
        }

        let presented = *self.state.presented.lock().unwrap();
        if presented[..] != self.expected[..] {
            return Err(Error::CertificateMismatch {
                expected: hex::encode(&self.expected),
                actual: hex::encode(presented),
            });
        }

        *self.state.last_request.lock().unwrap() = Some(Recorded {
            method: request.method().clone(),
            url: request.url().to_string(),
            headers: request.headers().clone(),
            body: request.body().and_then(|b| b.as_bytes()).map(<[u8]>::to_vec),
        });

        let (status, body) = self.state.reply.lock().unwrap().clone();
        let body = if self.state.broken_body.load(Ordering::SeqCst) {
            let reset: Vec<std::result::Result<bytes::Bytes, std::io::Error>> =
                vec![Err(std::io::Error::other("connection reset"))];
            reqwest::Body::wrap_stream(futures::stream::iter(reset))
        } else {
            reqwest::Body::from(body)
        };
        let response = http::Response::builder().status(status).body(body).unwrap();
        Ok(reqwest::Response::from(response))
    }
}
