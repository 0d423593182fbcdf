//! In-memory TTL cache for rendered pages.
//!
//! Sits in front of the HTTP layer's handlers: a fresh entry answers the
//! request without running the handler, anything else runs the handler and
//! stores a successful result. A background sweep drops expired entries so the
//! map does not grow with every URL ever requested.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// How long a stored page stays servable. 0 disables the cache.
    pub cache_duration_secs: u64,
    /// How often expired pages are swept. 0 disables the cache.
    pub cache_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_duration_secs: 600,
            cache_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn is_enabled(&self) -> bool {
        self.cache_duration_secs > 0 && self.cache_interval_secs > 0
    }
}

/// Canonical request identity: `"GET /path?a=1&b=2"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &str, path: &str, query: Option<&str>) -> Self {
        let method = method.trim().to_ascii_uppercase();

        let trimmed = path.trim().trim_end_matches('/');
        let path = if trimmed.is_empty() { "/" } else { trimmed };

        let mut pairs: Vec<&str> = query
            .unwrap_or_default()
            .trim_start_matches('?')
            .split('&')
            .filter(|pair| !pair.is_empty())
            .collect();
        pairs.sort_unstable();

        if pairs.is_empty() {
            Self(format!("{method} {path}"))
        } else {
            Self(format!("{method} {path}?{}", pairs.join("&")))
        }
    }

    pub fn is_get(&self) -> bool {
        self.0.starts_with("GET ")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    stored_at_ms: i64,
}

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Cache disabled or request not cacheable.
    Bypass,
}

#[derive(Debug, Clone)]
pub struct Served {
    pub response: CachedResponse,
    pub status: CacheStatus,
}

/// Milliseconds since the epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Cloning shares the underlying map.
#[derive(Clone)]
pub struct PageCache {
    entries: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
    duration_ms: i64,
    sweep_interval: Duration,
    enabled: bool,
    clock: Clock,
}

fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl PageCache {
    pub fn new(config: &CacheConfig) -> Self {
        let duration_ms = i64::try_from(config.cache_duration_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            duration_ms,
            sweep_interval: Duration::from_secs(config.cache_interval_secs),
            enabled: config.is_enabled(),
            clock: Arc::new(wall_clock_ms),
        }
    }

    /// Replace the wall clock used by [`serve`](Self::serve) and the sweeper.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self, entry: &CacheEntry, now_ms: i64) -> bool {
        now_ms.saturating_sub(entry.stored_at_ms) < self.duration_ms
    }

    pub async fn serve<F, Fut>(&self, key: &CacheKey, handler: F) -> Result<Served>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse>>,
    {
        self.serve_at(key, self.now_ms(), handler).await
    }

    /// [`serve`](Self::serve) with an explicit clock.
    pub async fn serve_at<F, Fut>(&self, key: &CacheKey, now_ms: i64, handler: F) -> Result<Served>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse>>,
    {
        if !self.enabled || !key.is_get() {
            return Ok(Served {
                response: handler().await?,
                status: CacheStatus::Bypass,
            });
        }

        if let Some(response) = self.lookup_at(key, now_ms) {
            log_debug!("cache hit {key}");
            return Ok(Served {
                response,
                status: CacheStatus::Hit,
            });
        }

        let response = handler().await?;
        if response.is_success() {
            self.store_at(key.clone(), response.clone(), now_ms);
        }
        Ok(Served {
            response,
            status: CacheStatus::Miss,
        })
    }

    /// Fresh response for `key`, if any. Stale entries are left for the sweep.
    pub fn lookup_at(&self, key: &CacheKey, now_ms: i64) -> Option<CachedResponse> {
        let entries = self.entries();
        let response = entries
            .get(key)
            .filter(|entry| self.is_fresh(entry, now_ms))
            .map(|entry| entry.response.clone());
        response
    }

    pub fn store_at(&self, key: CacheKey, response: CachedResponse, now_ms: i64) {
        self.entries().insert(
            key,
            CacheEntry {
                response,
                stored_at_ms: now_ms,
            },
        );
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        match self.entries().remove(key) {
            Some(_) => {
                log_info!("invalidated cached page {key}");
                Ok(())
            }
            None => Err(CacheError::NotCached(key.to_string())),
        }
    }

    /// Drop every entry, returning how many there were.
    pub fn purge_all(&self) -> usize {
        let mut entries = self.entries();
        let purged = entries.len();
        entries.clear();
        log_info!("purged {purged} cached pages");
        purged
    }

    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(entry, now_ms));
        before - entries.len()
    }

    /// Sweep on the configured interval until `cancel_token` fires. `None`
    /// when the cache is disabled.
    pub fn spawn_sweeper(&self, cancel_token: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.enabled {
            log_info!("page cache disabled");
            return None;
        }

        let cache = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; nothing to sweep yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_at(cache.now_ms());
                        if removed > 0 {
                            log_debug!("swept {removed} expired pages");
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
        }))
    }
}
