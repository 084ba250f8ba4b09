//! Certificate pinning and rotation against a real TLS server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use tinfoil_client::{
    tls, Client, Config, Error, GroundTruth, PinnedRoundTripper, RoundTrip, SecureClient,
    TransportOptions, TrustOracle, VerificationError, VerificationStage,
};

struct Identity {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
    fingerprint: [u8; 32],
}

impl Identity {
    /// Self-signed, so no CA anywhere vouches for it
    fn generate(name: &str) -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert = certified.cert.der().clone();
        let fingerprint = tls::cert_fingerprint(&cert).unwrap();
        Self {
            cert,
            key: certified.key_pair.serialize_der(),
            fingerprint,
        }
    }

    fn server_config(&self) -> Arc<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()));
        let config = ServerConfig::builder_with_provider(tls::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], key)
            .unwrap();
        Arc::new(config)
    }
}

/// HTTPS server answering every request with `200 ok`
struct TestServer {
    addr: SocketAddr,
    config: Arc<RwLock<Arc<ServerConfig>>>,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start(identity: &Identity) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(RwLock::new(identity.server_config()));
        let connections = Arc::new(AtomicUsize::new(0));

        let (shared, counter) = (config.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let acceptor = TlsAcceptor::from(shared.read().unwrap().clone());
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            addr,
            config,
            connections,
        }
    }

    fn host(&self) -> String {
        self.addr.to_string()
    }

    fn url(&self) -> String {
        format!("https://{}/", self.addr)
    }

    /// Present a different certificate from the next handshake on
    fn rotate_to(&self, identity: &Identity) {
        *self.config.write().unwrap() = identity.server_config();
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Attests whichever key it was last told about, or nothing
struct LocalOracle {
    attested: Mutex<Option<[u8; 32]>>,
    calls: AtomicUsize,
}

impl LocalOracle {
    fn new(fingerprint: [u8; 32]) -> Arc<Self> {
        Arc::new(Self {
            attested: Mutex::new(Some(fingerprint)),
            calls: AtomicUsize::new(0),
        })
    }

    fn attest(&self, fingerprint: Option<[u8; 32]>) {
        *self.attested.lock().unwrap() = fingerprint;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrustOracle for LocalOracle {
    async fn verify(&self, _enclave: &str, _repo: &str) -> Result<GroundTruth, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attested = *self.attested.lock().unwrap();
        match attested {
            Some(fingerprint) => Ok(GroundTruth::new(fingerprint.to_vec(), "digest", "measurement")),
            None => Err(VerificationError::new(
                VerificationStage::EnclaveAttestationVerify,
                "no valid attestation for the presented key",
            )),
        }
    }
}

fn options() -> TransportOptions {
    TransportOptions {
        connect_timeout: Duration::from_secs(5),
        request_timeout: Some(Duration::from_secs(10)),
    }
}

fn get(url: &str) -> reqwest::Request {
    reqwest::Request::new(Method::GET, reqwest::Url::parse(url).unwrap())
}

async fn client_for(server: &TestServer, oracle: Arc<LocalOracle>) -> Client {
    let config = Config::new(server.host(), "acme/enclave");
    let secure_client = Arc::new(SecureClient::with_oracle(config, oracle).unwrap());
    Client::from_secure_client(secure_client).await.unwrap()
}

#[tokio::test]
async fn pinned_transport_accepts_attested_key() {
    tls::install_default_provider();
    // Name does not match 127.0.0.1: only the key matters
    let identity = Identity::generate("not-this-host.example");
    let server = TestServer::start(&identity).await;

    let transport = PinnedRoundTripper::new(&identity.fingerprint, &options()).unwrap();
    let response = transport.round_trip(get(&server.url())).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn pinned_transport_rejects_other_key() {
    tls::install_default_provider();
    let presented = Identity::generate("enclave.test");
    let attested = Identity::generate("enclave.test");
    let server = TestServer::start(&presented).await;

    let transport = PinnedRoundTripper::new(&attested.fingerprint, &options()).unwrap();
    let err = transport.round_trip(get(&server.url())).await.unwrap_err();

    assert!(err.cert_error_kind().triggers_rotation());
    match err {
        Error::CertificateMismatch { expected, actual } => {
            assert_eq!(expected, hex::encode(attested.fingerprint));
            assert_eq!(actual, hex::encode(presented.fingerprint));
        }
        other => panic!("expected certificate mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn rotation_with_fresh_attestation_recovers() {
    tls::install_default_provider();
    let first = Identity::generate("enclave.test");
    let second = Identity::generate("enclave.test");
    let server = TestServer::start(&first).await;
    let oracle = LocalOracle::new(first.fingerprint);
    let client = client_for(&server, oracle.clone()).await;

    let response = client.execute(Method::GET, "/", HeaderMap::new(), None).await.unwrap();
    assert!(response.is_success());
    assert_eq!(oracle.calls(), 1);

    server.rotate_to(&second);
    oracle.attest(Some(second.fingerprint));

    let response = client.execute(Method::GET, "/", HeaderMap::new(), None).await.unwrap();
    assert!(response.is_success());
    assert_eq!(oracle.calls(), 2);
    assert_eq!(client.ground_truth().cert_fingerprint(), &second.fingerprint[..]);

    let response = client.execute(Method::GET, "/", HeaderMap::new(), None).await.unwrap();
    assert!(response.is_success());
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn rotation_without_attestation_fails_closed() {
    tls::install_default_provider();
    let first = Identity::generate("enclave.test");
    let second = Identity::generate("enclave.test");
    let server = TestServer::start(&first).await;
    let oracle = LocalOracle::new(first.fingerprint);
    let client = client_for(&server, oracle.clone()).await;

    server.rotate_to(&second);
    oracle.attest(None);

    let err = client
        .execute(Method::POST, "/v1/chat/completions", HeaderMap::new(), Some("{}".into()))
        .await
        .unwrap_err();

    match err {
        Error::CertificateMismatch { expected, actual } => {
            assert_eq!(expected, hex::encode(first.fingerprint));
            assert_eq!(actual, hex::encode(second.fingerprint));
        }
        other => panic!("expected the original certificate mismatch, got {other:?}"),
    }
    // One failed handshake, one re-verification, no retry
    assert_eq!(server.connections(), 1);
    assert_eq!(oracle.calls(), 2);
    assert_eq!(client.ground_truth().cert_fingerprint(), &first.fingerprint[..]);
}
