//! Client configuration
//!
//! Values come from code or from the environment:
//! - `TINFOIL_ENCLAVE`: enclave hostname
//! - `TINFOIL_REPO`: source repository (`owner/name`) the enclave must run
//! - `TINFOIL_API_KEY`: bearer token for the inference API

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_ENCLAVE: &str = "inference.tinfoil.sh";
pub const DEFAULT_REPO: &str = "tinfoilsh/confidential-inference-proxy";

pub const ENV_ENCLAVE: &str = "TINFOIL_ENCLAVE";
pub const ENV_REPO: &str = "TINFOIL_REPO";
pub const ENV_API_KEY: &str = "TINFOIL_API_KEY";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the attestation oracle fetches its evidence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// GitHub API proxy for release metadata
    pub github_proxy: String,
    /// GitHub attestation proxy for Sigstore bundles
    pub attestation_proxy: String,
    /// AMD KDS proxy for VCEK certificates
    pub kds_proxy: String,
    /// Sigstore trusted root (Fulcio CAs)
    pub trust_root_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            github_proxy: "https://api-github-proxy.tinfoil.sh".into(),
            attestation_proxy: "https://gh-attestation-proxy.tinfoil.sh".into(),
            kds_proxy: "https://kds-proxy.tinfoil.sh".into(),
            trust_root_url:
                "https://raw.githubusercontent.com/sigstore/root-signing/main/targets/trusted_root.json"
                    .into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Enclave hostname
    pub enclave: String,
    /// Repository the enclave's code is published from
    pub repo: String,
    /// API key sent as a bearer token
    pub api_key: Option<String>,
    /// Overall per-request timeout; `None` leaves streaming responses unbounded
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Upper bound for one trust-oracle round trip
    pub verify_timeout: Duration,
    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_ENCLAVE, DEFAULT_REPO)
    }
}

impl Config {
    pub fn new(enclave: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            enclave: enclave.into(),
            repo: repo.into(),
            api_key: None,
            request_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            endpoints: Endpoints::default(),
        }
    }

    /// Load from `TINFOIL_*` variables, falling back to the default enclave
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let enclave = lookup(ENV_ENCLAVE).unwrap_or_else(|| DEFAULT_ENCLAVE.to_string());
        let repo = lookup(ENV_REPO).unwrap_or_else(|| DEFAULT_REPO.to_string());

        let mut config = Self::new(enclave, repo);
        config.api_key = lookup(ENV_API_KEY).filter(|key| !key.is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Same settings, different enclave identity
    pub fn for_enclave(&self, enclave: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            enclave: enclave.into(),
            repo: repo.into(),
            ..self.clone()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.enclave.trim().is_empty() {
            return Err(Error::Config("enclave host must be specified".into()));
        }
        if self.repo.trim().is_empty() {
            return Err(Error::Config("repo must be specified".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_falls_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.enclave, DEFAULT_ENCLAVE);
        assert_eq!(config.repo, DEFAULT_REPO);
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn env_overrides_identity_and_key() {
        let config = Config::from_lookup(lookup(&[
            (ENV_ENCLAVE, "models.example.sh"),
            (ENV_REPO, "acme/models"),
            (ENV_API_KEY, "secret"),
        ]))
        .unwrap();
        assert_eq!(config.enclave, "models.example.sh");
        assert_eq!(config.repo, "acme/models");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn empty_identity_is_rejected() {
        let err = Config::from_lookup(lookup(&[(ENV_ENCLAVE, "")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(Config::new("host", " ").validate().is_err());
    }

    #[test]
    fn for_enclave_keeps_settings() {
        let base = Config::default()
            .with_api_key("k")
            .with_verify_timeout(Duration::from_secs(5));
        let other = base.for_enclave("b.example", "acme/b");

        assert_eq!(other.enclave, "b.example");
        assert_eq!(other.repo, "acme/b");
        assert_eq!(other.api_key.as_deref(), Some("k"));
        assert_eq!(other.verify_timeout, Duration::from_secs(5));
        assert_eq!(other.endpoints, base.endpoints);
    }
}
