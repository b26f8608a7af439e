//! Response Cache
//!
//! Content-addressed caching of generated replies with SHA256 keys.
//! Identical requests (same query, provider, retrieval flag and top-k)
//! hit the same slot regardless of object identity.
//!
//! Entries expire lazily after a TTL and are also removed by a periodic
//! background sweep. When the cache is full, the entry inserted earliest
//! is evicted. This is insertion-order FIFO, deliberately not LRU: a
//! bounded, O(1)-amortized policy that trades perfect recency tracking
//! for simplicity. The cache is best-effort; it never blocks or fails
//! the response path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::providers::TokenUsage;
use crate::retrieval::RetrievedDocument;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// Entry time-to-live
    pub ttl: Duration,
    /// Background sweep interval
    pub sweep_interval: Duration,
    /// Disable to turn both lookup and store into no-ops
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Duration::from_secs(3600),           // 1 hour
            sweep_interval: Duration::from_secs(600), // 10 minutes
            enabled: true,
        }
    }
}

/// Cached reply payload
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub content: String,
    pub provider_id: String,
    pub model_id: String,
    pub usage: TokenUsage,
    pub rag_used: bool,
    pub retrieved_documents: Vec<RetrievedDocument>,
    pub related_questions: Vec<String>,
}

/// Successful lookup result
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: CachedResponse,
    /// Times this entry has been served, including this lookup
    pub hits: u64,
    /// Time since the entry was stored
    pub age: Duration,
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

struct CacheEntry {
    response: CachedResponse,
    created_at: Instant,
    last_accessed: Instant,
    hits: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys in first-insertion order; head is the eviction candidate
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// FIFO-evicting response cache with lazy TTL expiry
pub struct ResponseCache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Compute the cache key for a request four-tuple
    pub fn compute_key(query: &str, provider_id: &str, use_retrieval: bool, top_k: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.trim().to_lowercase().as_bytes());
        hasher.update([0x1f]);
        hasher.update(provider_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update([use_retrieval as u8]);
        hasher.update(top_k.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a previously generated reply.
    ///
    /// An entry past its TTL is treated as absent and removed.
    pub async fn get(
        &self,
        query: &str,
        provider_id: &str,
        use_retrieval: bool,
        top_k: usize,
    ) -> Option<CacheHit> {
        if !self.config.enabled {
            return None;
        }

        let key = Self::compute_key(query, provider_id, use_retrieval, top_k);
        let mut inner = self.inner.write().await;

        match inner.entries.get_mut(&key) {
            Some(entry) if entry.created_at.elapsed() <= self.config.ttl => {
                entry.hits += 1;
                entry.last_accessed = Instant::now();
                let hit = CacheHit {
                    response: entry.response.clone(),
                    hits: entry.hits,
                    age: entry.created_at.elapsed(),
                };
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache HIT: {}", &key[..16]);
                Some(hit)
            }
            Some(_) => {
                inner.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache EXPIRED: {}", &key[..16]);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache MISS: {}", &key[..16]);
                None
            }
        }
    }

    /// Store a generated reply.
    ///
    /// At capacity the oldest-inserted entry is evicted first, regardless
    /// of how recently it was accessed.
    pub async fn insert(
        &self,
        query: &str,
        provider_id: &str,
        use_retrieval: bool,
        top_k: usize,
        response: CachedResponse,
    ) {
        if !self.config.enabled {
            return;
        }

        let key = Self::compute_key(query, provider_id, use_retrieval, top_k);
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let entry = CacheEntry {
            response,
            created_at: now,
            last_accessed: now,
            hits: 0,
        };

        if inner.entries.insert(key.clone(), entry).is_some() {
            // Refreshed an existing slot; its eviction position is unchanged
            debug!("Cache REFRESH: {}", &key[..16]);
            return;
        }

        while inner.entries.len() > self.config.max_entries {
            match inner.order.pop_front() {
                Some(oldest) => {
                    if inner.entries.remove(&oldest).is_some() {
                        debug!("Cache EVICT (oldest insert): {}", &oldest[..16]);
                    }
                }
                None => break,
            }
        }

        inner.order.push_back(key.clone());
        debug!("Cache SET: {}", &key[..16]);
    }

    /// Remove every expired entry; returns how many were dropped
    pub async fn sweep(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let mut inner = self.inner.write().await;
        let ttl = self.config.ttl;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }

        if !expired.is_empty() {
            debug!("Cache sweep removed {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Spawn the periodic sweep task. Abort the handle on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.inner.read().await.entries.len(),
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Drop all entries and reset counters
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(content: &str) -> CachedResponse {
        CachedResponse {
            content: content.to_string(),
            provider_id: "p1".to_string(),
            model_id: "test-model".to_string(),
            usage: TokenUsage::default(),
            rag_used: false,
            retrieved_documents: Vec::new(),
            related_questions: Vec::new(),
        }
    }

    fn test_cache(max_entries: usize, ttl: Duration) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            max_entries,
            ttl,
            sweep_interval: Duration::from_secs(600),
            enabled: true,
        })
    }

    #[tokio::test]
    async fn test_hit_counts_increase() {
        let cache = test_cache(10, Duration::from_secs(60));

        assert!(cache.get("q", "p1", true, 3).await.is_none());
        cache.insert("q", "p1", true, 3, sample_response("answer")).await;

        let first = cache.get("q", "p1", true, 3).await.unwrap();
        assert_eq!(first.hits, 1);
        assert_eq!(first.response.content, "answer");

        let second = cache.get("q", "p1", true, 3).await.unwrap();
        assert_eq!(second.hits, 2);
    }

    #[tokio::test]
    async fn test_key_covers_full_tuple() {
        let cache = test_cache(10, Duration::from_secs(60));
        cache.insert("q", "p1", true, 3, sample_response("a")).await;

        // Any change in the tuple is a distinct slot
        assert!(cache.get("q", "p2", true, 3).await.is_none());
        assert!(cache.get("q", "p1", false, 3).await.is_none());
        assert!(cache.get("q", "p1", true, 5).await.is_none());
        assert!(cache.get("q", "p1", true, 3).await.is_some());
    }

    #[test]
    fn test_key_normalizes_query() {
        let a = ResponseCache::compute_key("  What is ML? ", "p1", true, 3);
        let b = ResponseCache::compute_key("what is ml?", "p1", true, 3);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_lookup() {
        let cache = test_cache(10, Duration::from_millis(20));
        cache.insert("q", "p1", true, 3, sample_response("a")).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("q", "p1", true, 3).await.is_none());
        // The expired entry is physically gone too
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let cache = test_cache(10, Duration::from_millis(20));
        cache.insert("q1", "p1", true, 3, sample_response("a")).await;
        cache.insert("q2", "p1", true, 3, sample_response("b")).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.insert("q3", "p1", true, 3, sample_response("c")).await;

        let removed = cache.sweep().await;
        assert_eq!(removed, 2);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_eviction_is_insertion_order_not_lru() {
        let cache = test_cache(2, Duration::from_secs(60));
        cache.insert("q1", "p1", true, 3, sample_response("a")).await;
        cache.insert("q2", "p1", true, 3, sample_response("b")).await;

        // Touch q1 so LRU would evict q2 instead
        assert!(cache.get("q1", "p1", true, 3).await.is_some());

        cache.insert("q3", "p1", true, 3, sample_response("c")).await;

        // FIFO evicts q1, the oldest insert, despite its recent access
        assert!(cache.get("q1", "p1", true, 3).await.is_none());
        assert!(cache.get("q2", "p1", true, 3).await.is_some());
        assert!(cache.get("q3", "p1", true, 3).await.is_some());
    }

    #[tokio::test]
    async fn test_reinsert_refreshes_without_duplicating() {
        let cache = test_cache(2, Duration::from_secs(60));
        cache.insert("q1", "p1", true, 3, sample_response("a")).await;
        cache.insert("q1", "p1", true, 3, sample_response("a2")).await;

        let hit = cache.get("q1", "p1", true, 3).await.unwrap();
        assert_eq!(hit.response.content, "a2");
        assert_eq!(hit.hits, 1); // counter reset with the refreshed entry
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let cache = ResponseCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });

        cache.insert("q", "p1", true, 3, sample_response("a")).await;
        assert!(cache.get("q", "p1", true, 3).await.is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = test_cache(10, Duration::from_secs(60));
        cache.get("q", "p1", true, 3).await;
        cache.insert("q", "p1", true, 3, sample_response("a")).await;
        cache.get("q", "p1", true, 3).await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate_percent - 50.0).abs() < 0.001);
    }
}
