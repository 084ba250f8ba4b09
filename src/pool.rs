//! Round-robin pool of independently verified enclaves

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::info;

use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::oracle::{AttestationOracle, TrustOracle};
use crate::secure_client::SecureClient;
use crate::transport::TransportFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclave {
    pub host: String,
    pub repo: String,
}

impl Enclave {
    pub fn new(host: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            repo: repo.into(),
        }
    }
}

/// Fixed set of clients served in rotation.
///
/// Construction verifies every member and fails as a whole if any one fails.
/// Selection is positional only: a failing member stays in rotation.
pub struct ClientPool {
    clients: Vec<Client>,
    counter: AtomicUsize,
}

impl ClientPool {
    /// Verify each enclave with the production oracle; `base` supplies
    /// everything but the identity
    pub async fn new(enclaves: &[Enclave], base: &Config) -> Result<Self> {
        let oracle = Arc::new(AttestationOracle::new(base)?);
        Self::build(enclaves, base, |config| {
            SecureClient::with_oracle(config, oracle.clone())
        })
        .await
    }

    pub async fn with_oracle(
        enclaves: &[Enclave],
        base: &Config,
        oracle: Arc<dyn TrustOracle>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        Self::build(enclaves, base, |config| {
            SecureClient::with_parts(config, oracle.clone(), factory.clone())
        })
        .await
    }

    async fn build(
        enclaves: &[Enclave],
        base: &Config,
        secure_client: impl Fn(Config) -> Result<SecureClient>,
    ) -> Result<Self> {
        if enclaves.is_empty() {
            return Err(Error::Config("client pool needs at least one enclave".into()));
        }

        let secure_clients = enclaves
            .iter()
            .map(|e| secure_client(base.for_enclave(&e.host, &e.repo)).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let clients = try_join_all(secure_clients.into_iter().map(Client::from_secure_client)).await?;
        info!(members = clients.len(), "client pool verified");

        Ok(Self {
            clients,
            counter: AtomicUsize::new(0),
        })
    }

    /// Next client in rotation
    pub fn select(&self) -> &Client {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[index]
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }
}
