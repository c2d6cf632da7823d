//! Read-through cache for computed responses, keyed by canonical request shape

use crate::error::{degrade, FailureMode, Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on any response TTL
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// String cache with per-key TTL and pattern deletion
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Delete every key matching a glob pattern, returning how many were removed
    async fn delete_by_pattern(&self, pattern: &str) -> Result<usize>;
}

#[derive(Clone)]
struct TtlValue {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, TtlValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &TtlValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TtlValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process backend on a moka cache
pub struct MokaBackend {
    cache: Cache<String, TtlValue>,
}

impl MokaBackend {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|v| v.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.cache.insert(key.to_string(), TtlValue { value, ttl }).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| SyncError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
        let matching: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| pattern.matches(key.as_str()))
            .map(|(key, _)| key)
            .collect();
        for key in &matching {
            self.cache.invalidate(key.as_str()).await;
        }
        Ok(matching.len())
    }
}

/// Logical identity of a cacheable request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    method: String,
    path: String,
    params: Vec<(String, String)>,
}

impl RequestKey {
    /// Canonicalize a request: method upper-cased, trailing slash trimmed,
    /// parameter names lower-cased, parameters sorted
    pub fn new(method: &str, path: &str, query: Option<&str>) -> Self {
        let path = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        let mut params: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        params.sort();

        Self {
            method: method.to_uppercase(),
            path,
            params,
        }
    }

    pub fn from_params<'a>(
        method: &str,
        path: &str,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        Self::new(method, path, Some(&query))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn canonical(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish();
        format!("{} {}?{}", self.method, self.path, query)
    }

    /// `response:{path}:{sha256 of canonical form}`
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        format!("response:{}:{}", self.path, hex::encode(hasher.finalize()))
    }
}

/// One memoized response as stored in the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCacheEntry {
    pub value: String,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl ResponseCacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        now - self.stored_at < ttl
    }
}

/// Where a response came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served<T> {
    Cached(T),
    Fresh(T),
}

impl<T> Served<T> {
    pub fn from_cache(&self) -> bool {
        matches!(self, Served::Cached(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Served::Cached(v) | Served::Fresh(v) => v,
        }
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(String),
    Miss,
    /// Cache disabled or backend failing
    Bypass,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hit_count: u64,
    pub miss_count: u64,
    pub backend_errors: u64,
}

pub struct ResponseCache {
    backend: Option<Arc<dyn CacheBackend>>,
    default_ttl: Duration,
    prefixes: Vec<String>,
    hits: AtomicU64,
    misses: AtomicU64,
    backend_errors: AtomicU64,
}

impl ResponseCache {
    /// A cache over `backend`; with `None` every request passes straight through.
    /// TTLs above one year are clamped.
    pub fn new(
        backend: Option<Arc<dyn CacheBackend>>,
        default_ttl: Duration,
        prefixes: Vec<String>,
    ) -> Self {
        Self {
            backend,
            default_ttl: default_ttl.min(MAX_TTL),
            prefixes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO, Vec::new())
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Only idempotent reads under an allowed prefix are cached
    pub fn is_eligible(&self, key: &RequestKey) -> bool {
        matches!(key.method(), "GET" | "HEAD")
            && self.prefixes.iter().any(|p| key.path().starts_with(p.as_str()))
    }

    fn record_backend_error<T>(&self, operation: &str, result: Result<T>) -> Option<T> {
        let value = degrade(FailureMode::CacheBackend, operation, result);
        if value.is_none() {
            self.backend_errors.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub async fn lookup(&self, key: &RequestKey) -> Lookup {
        self.lookup_at(key, Utc::now()).await
    }

    pub async fn lookup_at(&self, key: &RequestKey, now: DateTime<Utc>) -> Lookup {
        let Some(backend) = &self.backend else {
            return Lookup::Bypass;
        };
        let cache_key = key.cache_key();
        let Some(raw) = self.record_backend_error("get", backend.get(&cache_key).await) else {
            return Lookup::Bypass;
        };

        let entry = raw.and_then(|raw| match serde_json::from_str::<ResponseCacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(key = %cache_key, error = %e, "Undecodable cache entry, treating as miss");
                None
            }
        });

        match entry {
            Some(entry) if entry.is_live(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %cache_key, "Cache hit");
                Lookup::Hit(entry.value)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %cache_key, "Cache miss");
                Lookup::Miss
            }
        }
    }

    /// Best-effort write; backend failures are logged and counted only
    pub async fn store_at(&self, key: &RequestKey, value: String, now: DateTime<Utc>) {
        let Some(backend) = &self.backend else {
            return;
        };
        let entry = ResponseCacheEntry {
            value,
            stored_at: now,
            ttl_secs: self.default_ttl.as_secs(),
        };
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_backend_error::<()>("encode", Err(e.into()));
                return;
            }
        };
        self.record_backend_error(
            "set",
            backend.set(&key.cache_key(), encoded, self.default_ttl).await,
        );
    }

    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &RequestKey,
        producer: F,
    ) -> std::result::Result<Served<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<String, E>>,
    {
        self.get_or_compute_at(key, Utc::now(), producer).await
    }

    /// Serve from cache when live, otherwise run `producer` and store its output.
    ///
    /// Backend failures never fail the request: the producer runs and the
    /// result is returned as fresh.
    pub async fn get_or_compute_at<F, Fut, E>(
        &self,
        key: &RequestKey,
        now: DateTime<Utc>,
        producer: F,
    ) -> std::result::Result<Served<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<String, E>>,
    {
        if !self.is_eligible(key) {
            return producer().await.map(Served::Fresh);
        }

        match self.lookup_at(key, now).await {
            Lookup::Hit(value) => Ok(Served::Cached(value)),
            Lookup::Bypass => producer().await.map(Served::Fresh),
            Lookup::Miss => {
                let value = producer().await?;
                self.store_at(key, value.clone(), now).await;
                Ok(Served::Fresh(value))
            }
        }
    }

    /// Invalidate by glob pattern over cache keys; 0 when disabled or failing
    pub async fn delete_by_pattern(&self, pattern: &str) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };
        let deleted = self
            .record_backend_error("delete_by_pattern", backend.delete_by_pattern(pattern).await)
            .unwrap_or(0);
        debug!(pattern, deleted, "Invalidated cached responses");
        deleted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.backend.is_some(),
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}
