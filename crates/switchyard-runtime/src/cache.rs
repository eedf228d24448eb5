//! Caching layer for switchyard-runtime.
//!
//! Provides an in-memory LRU cache of completion responses, keyed by a
//! fingerprint of everything that determines a response, so repeated
//! identical requests do not hit a backend again.
//!
//! Capacity eviction is strict LRU: both [`ResponseCache::get`] hits and
//! [`ResponseCache::put`] updates move an entry to most-recently-used.
//! TTL expiry is lazy and independent of LRU position: a stale entry is
//! removed by the read that finds it.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::Duration;
use switchyard_core::{ChatMessage, CompletionResponse};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{duration_secs, ConfigError};

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false the fallback chain neither reads nor writes the cache
    pub enabled: bool,

    /// Maximum live entries
    pub max_size: usize,

    /// Age at which an entry is no longer served
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 256,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("max_size", "must be at least 1"));
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::invalid("ttl", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Cache counters at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    /// Percentage of lookups that hit, 0 when there were none
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheEntry {
    response: CompletionResponse,
    stored_at: Instant,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn count(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}

/// Thread-safe LRU + TTL response cache.
pub struct ResponseCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
}

impl ResponseCache {
    /// Create a cache holding at most `max_size` entries for `ttl` each.
    pub fn new(max_size: usize, ttl: Duration) -> Result<Self, ConfigError> {
        Self::from_config(&CacheConfig {
            enabled: true,
            max_size,
            ttl,
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_size)
            .ok_or_else(|| ConfigError::invalid("max_size", "must be at least 1"))?;

        Ok(Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
            max_size: config.max_size,
            ttl: config.ttl,
        })
    }

    /// Deterministic key for a (backend, model, messages, temperature) tuple.
    ///
    /// SHA-256 over the JSON encoding of the tuple; message order matters.
    /// `-0.0` and `0.0` temperatures produce the same key.
    pub fn make_fingerprint(
        backend: &str,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> String {
        let temperature = if temperature == 0.0 { 0.0 } else { temperature };
        let mut hasher = Sha256::new();
        match serde_json::to_vec(&(backend, model, messages, temperature)) {
            Ok(bytes) => hasher.update(&bytes),
            // Not reachable for these types; hash the parts directly.
            Err(_) => {
                hasher.update(backend.as_bytes());
                hasher.update(model.as_bytes());
                for message in messages {
                    hasher.update(message.role.to_string().as_bytes());
                    hasher.update(message.content.as_bytes());
                }
                hasher.update(temperature.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Look up a live entry, promoting it to most-recently-used.
    pub fn get(&self, key: &str) -> Option<CompletionResponse> {
        let mut state = self.state.lock();
        let found = self.lookup(&mut state, key);
        state.count(found.is_some());
        found
    }

    /// Return the first live entry among `keys`, with its position.
    ///
    /// The whole search counts as one lookup: a single hit or a single miss.
    pub fn get_first<'a, I>(&self, keys: I) -> Option<(usize, CompletionResponse)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.state.lock();
        let found = keys
            .into_iter()
            .enumerate()
            .find_map(|(index, key)| self.lookup(&mut state, key).map(|r| (index, r)));
        state.count(found.is_some());
        found
    }

    /// Uncounted lookup; drops the entry if it has expired.
    fn lookup(&self, state: &mut CacheState, key: &str) -> Option<CompletionResponse> {
        let live = state
            .entries
            .get(key)
            .map(|entry| (entry.stored_at.elapsed() < self.ttl).then(|| entry.response.clone()));

        match live {
            Some(Some(response)) => {
                debug!(key = %short(key), "cache hit");
                Some(response)
            }
            Some(None) => {
                state.entries.pop(key);
                debug!(key = %short(key), "cache entry expired");
                None
            }
            None => {
                debug!(key = %short(key), "cache miss");
                None
            }
        }
    }

    /// Insert or refresh an entry. Refreshing an existing key never evicts.
    pub fn put(&self, key: impl Into<String>, response: CompletionResponse) {
        let key = key.into();
        let entry = CacheEntry {
            response,
            stored_at: Instant::now(),
        };
        let mut state = self.state.lock();
        if let Some((old_key, _)) = state.entries.push(key.clone(), entry) {
            if old_key != key {
                debug!(evicted = %short(&old_key), "cache eviction");
            }
        }
    }

    /// Remove an entry, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().entries.pop(key).is_some()
    }

    /// Drop all entries and reset the hit/miss counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
    }

    /// Entries physically present, including stale ones not yet read.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64 * 100.0
        };
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            size: state.entries.len(),
            max_size: self.max_size,
            hit_rate,
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}

fn short(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::TokenUsage;

    fn response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            usage: TokenUsage::new(1, 1),
            cost: 0.0,
            latency: Duration::from_millis(5),
            backend: "mock".to_string(),
            model: "mock-model".to_string(),
            stop_reason: None,
        }
    }

    fn cache(max_size: usize) -> ResponseCache {
        ResponseCache::new(max_size, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_get_promotes_entry() {
        let cache = cache(2);
        cache.put("a", response("a"));
        cache.put("b", response("b"));
        assert!(cache.get("a").is_some());
        cache.put("c", response("c"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().text, "a");
        assert_eq!(cache.get("c").unwrap().text, "c");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = cache(3);
        for key in ["k1", "k2", "k3", "k4"] {
            cache.put(key, response(key));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
    }

    #[test]
    fn test_put_promotes_and_update_keeps_size() {
        let cache = cache(2);
        cache.put("a", response("a1"));
        cache.put("b", response("b"));
        cache.put("a", response("a2"));
        assert_eq!(cache.len(), 2);

        cache.put("c", response("c"));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().text, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_removes_on_read() {
        let cache = ResponseCache::new(4, Duration::from_secs(10)).unwrap();
        cache.put("a", response("a"));
        cache.put("b", response("b"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("a").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_refreshes_timestamp() {
        let cache = ResponseCache::new(4, Duration::from_secs(10)).unwrap();
        cache.put("a", response("old"));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put("a", response("new"));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("a").unwrap().text, "new");
    }

    #[test]
    fn test_stats_and_clear() {
        let cache = cache(4);
        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.put("a", response("a"));
        cache.get("a");
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 4);
        assert_eq!(stats.hit_rate, 75.0);

        cache.clear();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (0, 0, 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_first_counts_one_lookup() {
        let cache = cache(4);
        cache.put("b", response("b"));
        cache.put("c", response("c"));

        let (index, hit) = cache.get_first(["a", "b", "c"]).unwrap();
        assert_eq!(index, 1);
        assert_eq!(hit.text, "b");
        assert!(cache.get_first(["x", "y", "z"]).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_first_skips_and_drops_expired() {
        let cache = ResponseCache::new(4, Duration::from_secs(10)).unwrap();
        cache.put("old", response("old"));
        tokio::time::advance(Duration::from_secs(10)).await;
        cache.put("new", response("new"));

        let (index, hit) = cache.get_first(["old", "new"]).unwrap();
        assert_eq!((index, hit.text.as_str()), (1, "new"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = cache(4);
        cache.put("a", response("a"));
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(matches!(
            ResponseCache::new(0, Duration::from_secs(1)),
            Err(ConfigError::Invalid { field: "max_size", .. })
        ));
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("hi")];
        let base = ResponseCache::make_fingerprint("a", "m", &messages, 0.0);

        assert_eq!(base, ResponseCache::make_fingerprint("a", "m", &messages, 0.0));
        assert_eq!(base, ResponseCache::make_fingerprint("a", "m", &messages, -0.0));
        assert_eq!(base.len(), 64);

        assert_ne!(base, ResponseCache::make_fingerprint("b", "m", &messages, 0.0));
        assert_ne!(base, ResponseCache::make_fingerprint("a", "m2", &messages, 0.0));
        assert_ne!(base, ResponseCache::make_fingerprint("a", "m", &messages, 0.7));
        assert_ne!(base, ResponseCache::make_fingerprint("a", "m", &messages[..1], 0.0));

        let reordered = vec![ChatMessage::user("hi"), ChatMessage::system("s")];
        assert_ne!(base, ResponseCache::make_fingerprint("a", "m", &reordered, 0.0));

        let other_role = vec![ChatMessage::system("s"), ChatMessage::assistant("hi")];
        assert_ne!(base, ResponseCache::make_fingerprint("a", "m", &other_role, 0.0));
    }

    #[test]
    fn test_concurrent_puts_respect_capacity() {
        use std::sync::Arc;

        let cache = Arc::new(cache(8));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("{t}-{i}");
                        cache.put(key.clone(), response(&key));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 800);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fingerprint_is_pure(
                backend in "[a-z]{1,8}",
                model in "[a-z0-9-]{1,12}",
                contents in proptest::collection::vec(".{0,32}", 0..5),
                temperature in 0.0f32..2.0,
            ) {
                let messages: Vec<ChatMessage> = contents.iter().map(ChatMessage::user).collect();
                let a = ResponseCache::make_fingerprint(&backend, &model, &messages, temperature);
                let b = ResponseCache::make_fingerprint(
                    &backend,
                    &model,
                    &messages.clone(),
                    temperature,
                );
                prop_assert_eq!(a, b);
            }

            #[test]
            fn distinct_temperatures_give_distinct_keys(t1 in 0.0f32..2.0, t2 in 0.0f32..2.0) {
                prop_assume!(t1 != t2);
                let messages = vec![ChatMessage::user("same")];
                prop_assert_ne!(
                    ResponseCache::make_fingerprint("a", "m", &messages, t1),
                    ResponseCache::make_fingerprint("a", "m", &messages, t2)
                );
            }
        }
    }
}
