//! OpenAI-compatible client for an attested enclave
//!
//! Every request goes through a [`RotatingTransport`]: connections only
//! complete with the attested certificate, and a rotated certificate is
//! accepted only after the enclave re-attests.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;

use crate::api::{
    ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Tool,
};
use crate::attestation::GroundTruth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::secure_client::{build_request, resolve_url, Response, SecureClient};
use crate::transport::{RotatingTransport, RoundTrip};
use crate::websearch::WebSearchStream;

pub const DEFAULT_CHAT_MODEL: &str = "qwen3-coder-480b";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";

#[derive(Clone)]
pub struct Client {
    secure_client: Arc<SecureClient>,
    transport: Arc<RotatingTransport>,
}

impl Client {
    /// Verify the enclave and connect; fails if verification fails
    pub async fn new(config: Config) -> Result<Self> {
        Self::from_secure_client(Arc::new(SecureClient::new(config)?)).await
    }

    /// [`Client::new`] with configuration from `TINFOIL_*` variables
    pub async fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?).await
    }

    /// Wrap an existing secure client, verifying it if it has not been yet
    pub async fn from_secure_client(secure_client: Arc<SecureClient>) -> Result<Self> {
        let transport = Arc::new(RotatingTransport::new(secure_client.clone()).await?);
        Ok(Self {
            secure_client,
            transport,
        })
    }

    pub fn enclave(&self) -> &str {
        self.secure_client.enclave()
    }

    pub fn repo(&self) -> &str {
        self.secure_client.repo()
    }

    /// `https://{enclave}/v1/`
    pub fn base_url(&self) -> String {
        format!("https://{}/v1/", self.enclave())
    }

    /// Ground truth the live transport is pinned to
    pub fn ground_truth(&self) -> Arc<GroundTruth> {
        self.transport.ground_truth()
    }

    /// Re-verify the enclave and pin to the result
    pub async fn verify(&self) -> Result<Arc<GroundTruth>> {
        self.transport.refresh().await
    }

    pub fn secure_client(&self) -> &Arc<SecureClient> {
        &self.secure_client
    }

    pub fn transport(&self) -> Arc<RotatingTransport> {
        self.transport.clone()
    }

    /// Send a request through the rotation-aware transport
    pub async fn execute(
        &self,
        method: Method,
        path_or_url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let url = resolve_url(self.enclave(), path_or_url)?;
        let response = self
            .transport
            .round_trip(build_request(method, url, headers, body))
            .await?;
        Response::read(response).await
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        self.chat_with_model(DEFAULT_CHAT_MODEL, messages, None).await
    }

    pub async fn chat_with_tools(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Tool>,
    ) -> Result<ChatResponse> {
        self.chat_with_model(DEFAULT_CHAT_MODEL, messages, Some(tools))
            .await
    }

    pub async fn chat_with_model(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Tool>>,
    ) -> Result<ChatResponse> {
        let mut request = ChatRequest::new(model, messages);
        if let Some(tools) = tools {
            request = request.with_tools(tools);
        }
        self.create_chat_completion(&request).await
    }

    pub async fn create_chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self.post_json("chat/completions", request).await?;
        Ok(response.json().await?)
    }

    /// Streaming completion; web-search progress arrives as separate events
    pub async fn chat_stream(&self, request: &ChatRequest) -> Result<WebSearchStream> {
        let response = self
            .post_json("chat/completions", &request.streaming())
            .await?;
        Ok(WebSearchStream::new(response))
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest::new(DEFAULT_EMBED_MODEL, text);
        let response: EmbeddingResponse = self.post_json("embeddings", &request).await?.json().await?;

        response
            .embedding()
            .map(|e| e.to_vec())
            .ok_or(Error::NoEmbedding)
    }

    async fn post_json<T: Serialize>(&self, endpoint: &str, payload: &T) -> Result<reqwest::Response> {
        let url = resolve_url(self.enclave(), &format!("/v1/{}", endpoint))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.secure_client.config().api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| Error::Config("API key is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let body = Bytes::from(serde_json::to_vec(payload)?);
        let response = self
            .transport
            .round_trip(build_request(Method::POST, url, headers, Some(body)))
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("failed to read error body: {}", e),
            };
            return Err(Error::Api { status, message });
        }
        Ok(response)
    }
}
