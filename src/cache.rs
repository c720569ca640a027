//! Typed key-value cache with per-object TTL
//!
//! [`TypedCache<T>`] stores [`Cacheable`] objects in a pluggable
//! [`CacheBackend`]. Keys are namespaced as `{key}:{suffix}`, objects may
//! register additional lookup keys, and payloads are optionally encrypted at
//! rest with [`Encryption`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::encryption::Encryption;
use crate::{Error, ErrorKind, Result};

/// Storage backend for cache payloads.
///
/// Backends need not enforce TTLs on the server side; consumers that care
/// about exact expiry double-check timestamps stored in their payloads.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Read a payload. Returns `None` when missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a payload with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Remaining TTL. Returns `None` when missing or expired.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically read and delete a key.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// An object that can live in a [`TypedCache`].
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync {
    /// Primary key
    fn cache_key(&self) -> String;

    /// Mirror keys under which the same payload is stored
    fn additional_cache_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// TTL overriding the cache default
    fn ttl(&self) -> Option<Duration> {
        None
    }
}

/// Typed view over a [`CacheBackend`].
pub struct TypedCache<T> {
    backend: Arc<dyn CacheBackend>,
    suffix: String,
    default_ttl: Duration,
    encryption: Option<Encryption>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedCache<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            suffix: self.suffix.clone(),
            default_ttl: self.default_ttl,
            encryption: self.encryption.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Cacheable> TypedCache<T> {
    /// Create a cache namespaced by `suffix`
    pub fn new(backend: Arc<dyn CacheBackend>, suffix: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            backend,
            suffix: suffix.into(),
            default_ttl,
            encryption: None,
            _marker: PhantomData,
        }
    }

    /// Encrypt payloads at rest
    #[must_use]
    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    fn wrap(&self, key: &str) -> String {
        format!("{key}:{}", self.suffix)
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        match &self.encryption {
            Some(enc) => Ok(enc.encrypt(&json)?.into_bytes()),
            None => Ok(json),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        match &self.encryption {
            Some(enc) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| Error::Internal(format!("cache payload is not utf-8: {e}")))?;
                let json = enc.decrypt(text)?;
                Ok(serde_json::from_slice(&json)?)
            }
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Look up an object by primary or additional key
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(&self.wrap(key)).await? {
            Some(bytes) => self.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Store an object under its primary and additional keys
    pub async fn store(&self, value: &T) -> Result<()> {
        let ttl = value.ttl().unwrap_or(self.default_ttl);
        self.write(value, ttl).await
    }

    /// Replace an object while keeping its remaining TTL
    pub async fn update(&self, value: &T) -> Result<()> {
        let key = value.cache_key();
        let remaining = self.backend.ttl(&self.wrap(&key)).await?;
        match remaining {
            Some(ttl) if !ttl.is_zero() => self.write(value, ttl).await,
            _ => Err(Error::new(
                ErrorKind::NotFound,
                format!("cache entry has no ttl remaining: {key}"),
            )),
        }
    }

    async fn write(&self, value: &T, ttl: Duration) -> Result<()> {
        let payload = self.encode(value)?;
        for extra in value.additional_cache_keys() {
            self.backend.set(&self.wrap(&extra), payload.clone(), ttl).await?;
        }
        self.backend.set(&self.wrap(&value.cache_key()), payload, ttl).await
    }

    /// Remove an object's primary and additional keys
    pub async fn delete(&self, value: &T) -> Result<()> {
        self.backend.delete(&self.wrap(&value.cache_key())).await?;
        for extra in value.additional_cache_keys() {
            self.backend.delete(&self.wrap(&extra)).await?;
        }
        Ok(())
    }

    /// Remove an object and return it, so that only one caller wins
    pub async fn take(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.backend.take(&self.wrap(key)).await? else {
            return Ok(None);
        };
        let value = self.decode(&bytes)?;
        for extra in value.additional_cache_keys() {
            self.backend.delete(&self.wrap(&extra)).await?;
        }
        Ok(Some(value))
    }
}

/// A stored payload with expiry metadata
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads that found a live entry
    pub hits: AtomicU64,
    /// Reads that found nothing
    pub misses: AtomicU64,
    /// Expired entries removed
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Current hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Current miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// In-process backend. Expired entries are evicted lazily on access and by
/// [`InMemoryCache::reap_expired`].
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Entry>,
    stats: CacheStats,
}

impl InMemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of stored entries, including not yet evicted expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns the number evicted.
    pub fn reap_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Reaped expired cache entries");
        }
        evicted
    }

    /// Spawn a background task that reaps expired entries on an interval
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.reap_expired();
            }
        })
    }

    fn live(&self, key: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Entry>> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired() {
                return Some(entry);
            }
        }
        self.evict_expired(key);
        None
    }

    /// Remove `key` only while it is still expired; a concurrent `set` wins.
    fn evict_expired(&self, key: &str) -> bool {
        let evicted = self.entries.remove_if(key, |_, entry| entry.is_expired()).is_some();
        if evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.live(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Ok(Some(entry.value.clone()))
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .live(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now())))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.remove(key) {
            Some((_, entry)) if !entry.is_expired() => Ok(Some(entry.value)),
            Some(_) => {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Redis backend shared by every gateway instance. TTLs are enforced by
/// the server.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("Connected to redis cache");
        Ok(Self { conn })
    }
}

/// Map a `PTTL` reply: -2 is a missing key, -1 a key without expiry.
fn pttl_to_duration(millis: i64) -> Option<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[async_trait::async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            conn.del::<_, i64>(key).await?;
            return Ok(());
        }
        conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        Ok(pttl_to_duration(conn.pttl::<_, i64>(key).await?))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.del::<_, i64>(key).await? > 0)
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get_del::<_, Option<Vec<u8>>>(key).await?)
    }
}
