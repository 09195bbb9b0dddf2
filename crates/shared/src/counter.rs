//! Counter store
//!
//! Per-user usage counters and the yearly reset ledger live in a
//! Redis-compatible key/value store. All values are signed 64-bit integers
//! and a missing key reads as zero.
//!
//! Three implementations:
//! - [`RedisCounterStore`]: production store over a `ConnectionManager`
//! - [`MemoryCounterStore`]: in-process store for tests and local development
//! - [`DegradedCounterStore`]: stand-in used when the real store is unreachable

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::config::CounterStoreConfig;

/// Prefix of the per-user usage counter key
pub const USAGE_KEY_PREFIX: &str = "usage";

/// Prefix of yearly reset ledger keys
pub const YEARLY_RESET_KEY_PREFIX: &str = "yearly_reset";

/// `usage:{user_id}`
pub fn usage_key(user_id: Uuid) -> String {
    format!("{}:{}", USAGE_KEY_PREFIX, user_id)
}

/// `yearly_reset:{user_id}:{period}`
pub fn yearly_reset_key(user_id: Uuid, period: u32) -> String {
    format!("{}:{}:{}", YEARLY_RESET_KEY_PREFIX, user_id, period)
}

/// Pattern matching every ledger key
pub fn yearly_reset_pattern() -> String {
    format!("{}:*", YEARLY_RESET_KEY_PREFIX)
}

/// Counter store errors
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    #[error("Counter store command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            CounterError::Unavailable(err.to_string())
        } else {
            CounterError::Command(err.to_string())
        }
    }
}

pub type CounterResult<T> = Result<T, CounterError>;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires in this many seconds
    Expires(u64),
}

impl KeyTtl {
    /// Interpret a Redis `TTL` reply (-2 missing, -1 no expiry)
    pub fn from_redis(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            r => KeyTtl::Expires(r as u64),
        }
    }
}

/// Atomic integer counters keyed by string
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` and return the new value
    async fn incr(&self, key: &str, delta: i64) -> CounterResult<i64>;

    async fn get(&self, key: &str) -> CounterResult<Option<i64>>;

    async fn set(&self, key: &str, value: i64) -> CounterResult<()>;

    /// Returns false if the key does not exist
    async fn expire(&self, key: &str, seconds: u64) -> CounterResult<bool>;

    async fn ttl(&self, key: &str) -> CounterResult<KeyTtl>;

    /// Keys matching a glob pattern (only `*` is interpreted)
    async fn keys(&self, pattern: &str) -> CounterResult<Vec<String>>;

    /// SET NX EX: write only if absent. Returns true if this call wrote the key.
    async fn set_if_absent(&self, key: &str, value: i64, ttl_seconds: u64)
        -> CounterResult<bool>;

    /// Whether writes are actually recorded
    fn is_durable(&self) -> bool {
        true
    }

    /// Short name for logs
    fn backend(&self) -> &'static str;
}

// ============================================================================
// Redis
// ============================================================================

/// Counter store backed by Redis
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// Open a managed connection. The manager reconnects on its own after
    /// the first connection succeeds.
    pub async fn connect(url: &str) -> CounterResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Connect with exponential backoff (100ms, 200ms, 400ms)
    pub async fn connect_with_retry(url: &str) -> CounterResult<Self> {
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        Retry::spawn(strategy, move || async move {
            Self::connect(url).await.inspect_err(|e| {
                tracing::warn!(error = %e, "Counter store connection attempt failed");
            })
        })
        .await
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str, delta: i64) -> CounterResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> CounterResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> CounterResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> CounterResult<bool> {
        let mut conn = self.conn.clone();
        let applied: bool = conn.expire(key, seconds as i64).await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> CounterResult<KeyTtl> {
        let mut conn = self.conn.clone();
        let reply: i64 = conn.ttl(key).await?;
        Ok(KeyTtl::from_redis(reply))
    }

    async fn keys(&self, pattern: &str) -> CounterResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl_seconds: u64,
    ) -> CounterResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process counter store.
///
/// Honours TTLs lazily on access. `set_available(false)` makes every
/// operation fail with [`CounterError::Unavailable`] to simulate an outage.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    unavailable: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> CounterResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Override the expiry of a key (test helper for TTL sweeps)
    pub async fn persist(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = None;
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, delta: i64) -> CounterResult<i64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = MemoryEntry {
                value: 0,
                expires_at: None,
            };
        }
        entry.value = entry.value.saturating_add(delta);
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> CounterResult<Option<i64>> {
        self.ensure_available()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64) -> CounterResult<()> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;
        // Plain SET clears any previous expiry, same as Redis
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> CounterResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> CounterResult<KeyTtl> {
        self.ensure_available()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(match entries.get(key).filter(|e| e.is_live(now)) {
            None => KeyTtl::Missing,
            Some(MemoryEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(MemoryEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now).as_secs()),
        })
    }

    async fn keys(&self, pattern: &str) -> CounterResult<Vec<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl_seconds: u64,
    ) -> CounterResult<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Some(now + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(true)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Minimal glob: `*` matches any run of characters, everything else is literal
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

// ============================================================================
// Degraded
// ============================================================================

/// Used when the counter store cannot be reached at startup.
///
/// Reads return nothing and writes are discarded. Because `is_durable()` is
/// false, the debit gate refuses every write path against this store.
#[derive(Debug, Default, Clone, Copy)]
pub struct DegradedCounterStore;

#[async_trait]
impl CounterStore for DegradedCounterStore {
    async fn incr(&self, _key: &str, _delta: i64) -> CounterResult<i64> {
        Ok(0)
    }

    async fn get(&self, _key: &str) -> CounterResult<Option<i64>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: i64) -> CounterResult<()> {
        Ok(())
    }

    async fn expire(&self, _key: &str, _seconds: u64) -> CounterResult<bool> {
        Ok(false)
    }

    async fn ttl(&self, _key: &str) -> CounterResult<KeyTtl> {
        Ok(KeyTtl::Missing)
    }

    async fn keys(&self, _pattern: &str) -> CounterResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: i64,
        _ttl_seconds: u64,
    ) -> CounterResult<bool> {
        Ok(false)
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend(&self) -> &'static str {
        "degraded"
    }
}

/// Connect to the configured counter store.
///
/// Falls back to [`DegradedCounterStore`] when the store is unreachable and
/// degraded operation is allowed.
pub async fn connect_counter_store(
    config: &CounterStoreConfig,
) -> CounterResult<Arc<dyn CounterStore>> {
    let url = config.connection_url();
    match RedisCounterStore::connect_with_retry(&url).await {
        Ok(store) => {
            tracing::info!(tls = config.tls, "Counter store connected");
            Ok(Arc::new(store))
        }
        Err(e) if config.allow_degraded => {
            tracing::error!(
                error = %e,
                "Counter store unreachable - running degraded (reads fail open, writes fail closed)"
            );
            Ok(Arc::new(DegradedCounterStore))
        }
        Err(e) => Err(e),
    }
}
