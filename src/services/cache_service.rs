//! Shared in-process cache with TTL expiry and LRU eviction.
//!
//! One instance is created at startup and handed to every component that
//! caches (tool answers, gateway reads). Nothing here survives a restart.
//!
//! Expiry is enforced lazily on every read and proactively by a background
//! sweep, so no caller ever observes an entry past its `expires_at`.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::models::CacheConfig;

/// The process-wide cache stores JSON values.
pub type JsonCache = CacheService<Value>;

/// A cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub hit_count: u64,
    pub last_access_at: Instant,
    /// Logical clock of the last access; orders entries whose timestamps tie.
    access_tick: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Value returned by [`CacheService::get_or_set`].
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<T> {
    pub value: T,
    pub cache_hit: bool,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    tick: u64,
}

impl<T> CacheState<T> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.expirations += removed as u64;
        removed
    }

    fn evict_least_recently_used(&mut self) -> Option<String> {
        let victim = self
            .entries
            .values()
            .min_by_key(|entry| (entry.last_access_at, entry.access_tick))
            .map(|entry| entry.key.clone())?;
        self.entries.remove(&victim);
        self.evictions += 1;
        Some(victim)
    }
}

/// Bounded key/value cache. Never fails: a miss is a miss.
pub struct CacheService<T> {
    state: Mutex<CacheState<T>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<T: Clone> CacheService<T> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                tick: 0,
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.default_ttl())
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a value. `ttl` falls back to the configured default.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.capacity {
            state.purge_expired(now);
            while state.entries.len() >= self.capacity {
                match state.evict_least_recently_used() {
                    Some(victim) => debug!(key = %victim, "evicted least recently used cache entry"),
                    None => break,
                }
            }
        }

        let tick = state.next_tick();
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                data: value,
                created_at: now,
                expires_at: now + ttl,
                hit_count: 0,
                last_access_at: now,
                access_tick: tick,
            },
        );
    }

    /// Read a live value. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.entries.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let tick = state.next_tick();
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.hit_count += 1;
        entry.last_access_at = now;
        entry.access_tick = tick;
        Some(entry.data.clone())
    }

    /// Return the live value for `key`, or run `factory`, cache its output and return it.
    ///
    /// A failing factory caches nothing and its error is returned unchanged.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Lookup<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(Lookup {
                value,
                cache_hit: true,
            });
        }

        let value = factory().await?;
        self.set(key, value.clone(), ttl);
        Ok(Lookup {
            value,
            cache_hit: false,
        })
    }

    /// Remove one key, or every key matching a `*`/`?` wildcard pattern.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut state = self.state.lock();

        if !is_wildcard(pattern) {
            return usize::from(state.entries.remove(pattern).is_some());
        }

        let matcher = match wildcard_regex(pattern) {
            Ok(matcher) => matcher,
            Err(err) => {
                warn!(pattern, error = %err, "ignoring unusable invalidation pattern");
                return 0;
            }
        };

        let before = state.entries.len();
        state.entries.retain(|key, _| !matcher.is_match(key));
        before - state.entries.len()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Drop every expired entry now. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inspect an entry without touching counters or recency.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64
        };

        CacheStats {
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            size: state.entries.len(),
            capacity: self.capacity,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }
}

impl<T: Clone + Send + 'static> CacheService<T> {
    /// Start the periodic expiry sweep.
    ///
    /// The sweep holds only a weak reference, so it ends on its own once the
    /// cache is dropped; the returned handle stops it earlier.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "cache sweep removed expired entries");
                }
            }
        });

        SweeperHandle { handle }
    }
}

/// Handle to the background sweep. Dropping it stops the sweep.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn shutdown(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source)
}

/// Wrap `compute` in cache-aside logic under a fixed key.
///
/// Each call of the returned function reads `key` from `cache` and only runs
/// `compute` on a miss, caching its successful output for `ttl`.
pub fn cache_aside<F, Fut, E>(
    cache: Arc<JsonCache>,
    key: String,
    ttl: Duration,
    compute: F,
) -> impl Fn() -> BoxFuture<'static, Result<Lookup<Value>, E>> + Send + Sync
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Send + 'static,
{
    move || {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        let compute = compute.clone();
        Box::pin(async move { cache.get_or_set(&key, Some(ttl), compute).await })
    }
}
