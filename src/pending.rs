//! Requests assembled one primitive at a time
//!
//! Foreign callers that cannot pass header maps build a request in steps:
//! create it, add headers, execute it. Each [`SecureClient`] owns its store.
//!
//! [`SecureClient`]: crate::SecureClient

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl PendingRequest {
    pub fn new(method: Method, url: Url, body: Option<Bytes>) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    next_id: AtomicI64,
    requests: Mutex<HashMap<i64, PendingRequest>>,
}

impl PendingRequests {
    pub fn insert(&self, request: PendingRequest) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, request);
        id
    }

    /// Set a header, replacing any previous value under the same name
    pub fn set_header(&self, id: i64, key: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("invalid header name {:?}: {}", key, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("invalid value for header {}: {}", key, e)))?;

        let mut requests = self.lock();
        let request = requests.get_mut(&id).ok_or(Error::RequestNotFound(id))?;
        request.headers.insert(name, value);
        Ok(())
    }

    /// Remove and return a request
    pub fn take(&self, id: i64) -> Result<PendingRequest> {
        self.lock().remove(&id).ok_or(Error::RequestNotFound(id))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
