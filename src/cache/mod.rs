//! Response cache for GET requests.
//!
//! Entries are written after a successful response has been fully streamed
//! and replayed verbatim on later identical requests. The backing store owns
//! expiry; the gateway never deletes entries itself. Every store failure is
//! treated as a miss on read and a no-op on write.

mod capture;
mod store;

pub use capture::ResponseCapture;
pub use store::{MemoryStore, RedisStore};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_WRITE_FAILURES};

/// Upper bound on a single cache write. Writes run detached from the request.
pub const STORE_TIMEOUT: Duration = Duration::from_millis(100);

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Operation timed out")]
    Timeout,
}

/// Key/value store holding serialized cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;
}

/// Cache key for a request: method plus the URL exactly as received.
///
/// The query string is part of the key and is not normalized, so
/// `?a=1&b=2` and `?b=2&a=1` are distinct entries.
pub fn cache_key(method: &Method, uri: &Uri) -> String {
    format!("{} {}", method, uri)
}

/// A captured response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

// Wire format of an entry in the backing store
#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        // values may carry obs-text, so they are stored as raw bytes
        let headers = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), STANDARD.encode(value.as_bytes())))
            .collect();

        let stored = StoredResponse {
            status: self.status.as_u16(),
            headers,
            body: STANDARD.encode(&self.body),
        };
        serde_json::to_vec(&stored).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        let stored: StoredResponse =
            serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let status = StatusCode::from_u16(stored.status)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(stored.headers.len());
        for (name, value) in stored.headers {
            let name = HeaderName::try_from(name).map_err(|e| CacheError::Serialization(e.to_string()))?;
            let value = STANDARD
                .decode(value)
                .map_err(|e| CacheError::Serialization(e.to_string()))?;
            let value = HeaderValue::from_bytes(&value).map_err(|e| CacheError::Serialization(e.to_string()))?;
            headers.append(name, value);
        }

        let body = STANDARD
            .decode(stored.body)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        Ok(Self {
            status,
            headers,
            body: Bytes::from(body),
        })
    }
}

impl IntoResponse for CacheEntry {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Shared handle to the backing store.
///
/// Cheap to clone. A cache without a store, or with a zero TTL, is disabled
/// and every operation on it is a no-op.
#[derive(Clone)]
pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
    settings: CacheSettings,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Self {
        Self {
            store: Some(store),
            settings,
        }
    }

    pub fn disabled() -> Self {
        Self {
            store: None,
            settings: CacheSettings {
                ttl: Duration::ZERO,
                lookup_timeout: Duration::ZERO,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some() && self.settings.is_enabled()
    }

    pub fn ttl(&self) -> Duration {
        self.settings.ttl
    }

    fn active_store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref().filter(|_| self.settings.is_enabled())
    }

    /// Fetch the entry for `key`. Errors, timeouts and undecodable records are misses.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let store = self.active_store()?;

        let found = match timeout(self.settings.lookup_timeout, store.get(key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                debug!(key = key, error = %err, "Cache lookup failed, treating as miss");
                None
            }
            Err(_) => {
                debug!(key = key, "Cache lookup timed out, treating as miss");
                None
            }
        };

        let entry = found.and_then(|bytes| match CacheEntry::decode(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(key = key, error = %err, "Discarding malformed cache entry");
                None
            }
        });

        match entry {
            Some(entry) => {
                CACHE_HITS.inc();
                debug!(key = key, "Cache hit");
                Some(entry)
            }
            None => {
                CACHE_MISSES.inc();
                debug!(key = key, "Cache miss");
                None
            }
        }
    }

    /// Best-effort write bounded by [`STORE_TIMEOUT`]. Failures are logged and dropped.
    pub async fn store(&self, key: &str, entry: &CacheEntry) {
        let Some(store) = self.active_store() else {
            return;
        };

        let result = match entry.encode() {
            Ok(value) => match timeout(STORE_TIMEOUT, store.set_ex(key, value, self.settings.ttl)).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => debug!(key = key, ttl_secs = self.settings.ttl.as_secs(), "Cached response"),
            Err(err) => {
                CACHE_WRITE_FAILURES.inc();
                warn!(key = key, error = %err, "Failed to write cache entry");
            }
        }
    }
}
