//! Backing stores for the response cache.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info};

use super::{CacheError, CacheResult, CacheStore};

const KEY_PREFIX: &str = "gateway:cache";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis-backed store. Expiry is delegated to Redis via `SET .. EX`.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;

        let mut conn = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        info!(url = %redact_url(url), "Connected to Redis cache");

        Ok(Self {
            conn,
            prefix: KEY_PREFIX.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(self.key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.key(key), value, expiry_secs(ttl))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }
}

// `SET .. EX` rejects 0, so sub-second TTLs round up to one second
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

// Strip credentials before logging a redis URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process store for single-node deployments and tests.
///
/// Expired values are invisible to `get` and removed lazily; a purge task
/// can be started to reclaim memory for keys that are never read again.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live (unexpired) value exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Drop every expired value, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn start_purger(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(purge_loop(store, period))
    }
}

async fn purge_loop(store: Weak<MemoryStore>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            return;
        };
        let purged = store.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
