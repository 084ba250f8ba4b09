//! # Tinfoil client
//!
//! Client for services running in attested secure enclaves. A connection is
//! trusted because the enclave proved which code it runs and which TLS key
//! it holds, never because a CA signed its certificate.
//!
//! ## Verification
//!
//! A [`TrustOracle`] turns an `(enclave, repo)` pair into a [`GroundTruth`].
//! The production [`AttestationOracle`]:
//! - looks up the repo's latest release digest and its Sigstore bundle
//! - checks the bundle was signed by GitHub Actions for that repo, under a
//!   Fulcio CA from the Sigstore trusted root
//! - fetches and verifies the enclave's SEV-SNP report (VCEK → ASK → ARK)
//! - compares the code measurement with the enclave measurement
//!
//! The report commits to the SHA-256 of the enclave's TLS public key; that
//! fingerprint becomes the pin.
//!
//! ## Transports
//!
//! - [`PinnedRoundTripper`] completes handshakes only with the attested key.
//! - [`RotatingTransport`] re-verifies once when the certificate changes and
//!   retries once on success. Without a fresh attestation the original
//!   certificate error is returned.
//! - [`ClientPool`] spreads calls over several verified enclaves.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinfoil_client::{ChatMessage, Client, Config};
//!
//! # async fn run() -> tinfoil_client::Result<()> {
//! let client = Client::new(Config::from_env()?).await?;
//! println!("pinned to {}", client.ground_truth().cert_fingerprint_hex());
//!
//! let response = client.chat(vec![ChatMessage::user("Hello")]).await?;
//! println!("{}", response.content().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod attestation;
pub mod client;
pub mod config;
pub mod error;
pub mod oracle;
mod pending;
pub mod pool;
pub mod secure_client;
pub mod sigstore;
pub mod tls;
pub mod transport;
pub mod websearch;

#[cfg(test)]
mod testing;

pub use api::{ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Tool};
pub use attestation::{GroundTruth, Measurement};
pub use client::Client;
pub use config::{Config, Endpoints};
pub use error::{Error, Result, VerificationError, VerificationStage};
pub use oracle::{AttestationOracle, TrustOracle};
pub use pool::{ClientPool, Enclave};
pub use secure_client::{Response, SecureClient};
pub use tls::CertErrorKind;
pub use transport::{
    PinnedRoundTripper, PinnedTransportFactory, RotatingTransport, RoundTrip, TransportFactory,
    TransportOptions,
};
pub use websearch::{StreamEvent, WebSearchStream};
