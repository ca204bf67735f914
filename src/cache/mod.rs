//! Request-fingerprint cache with TTL and approximate-match lookup for
//! reasoning-service calls (C2, `spec.md` §4.2).

mod embedding;

pub use embedding::embed;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: String,
    pub created_at: Instant,
    pub ttl: Duration,
    pub token_estimate: u32,
    embedding: Vec<f32>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

pub struct CacheConfig {
    pub default_ttl: Duration,
    pub similarity_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            similarity_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Two-level lookup: exact-hash match, then approximate match via cosine
/// similarity over a deterministic embedding. Writes are best-effort: a
/// cache miss or failed write never fails the calling operation.
pub struct SimilarityCache {
    config: CacheConfig,
    exact: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SimilarityCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            exact: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn hash(prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the cached response for `prompt` if an exact hash match or a
    /// sufficiently similar embedding is found and not expired.
    pub fn get(&self, prompt: &str) -> Option<String> {
        let key = Self::hash(prompt);
        if let Some(entry) = self.exact.get(&key) {
            if !entry.is_expired() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
        }

        let query_embedding = embed(prompt);
        let mut best: Option<(f32, String)> = None;
        for entry in self.exact.iter() {
            if entry.is_expired() {
                continue;
            }
            let similarity = cosine_similarity(&query_embedding, &entry.embedding);
            if similarity >= self.config.similarity_threshold {
                if best.as_ref().map_or(true, |(s, _)| similarity > *s) {
                    best = Some((similarity, entry.response.clone()));
                }
            }
        }

        if let Some((_, response)) = best {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(response);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Best-effort write: last-writer-wins on concurrent `set` of the same
    /// prompt, per `spec.md` §5's concurrency note.
    pub fn set(&self, prompt: &str, response: String, token_estimate: u32) {
        let key = Self::hash(prompt);
        self.exact.insert(
            key,
            CacheEntry {
                response,
                created_at: Instant::now(),
                ttl: self.config.default_ttl,
                token_estimate,
                embedding: embed(prompt),
            },
        );
    }

    /// Purge expired entries.
    pub fn cleanup(&self) {
        self.exact.retain(|_, entry| !entry.is_expired());
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.exact.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_within_ttl_returns_value() {
        let cache = SimilarityCache::new(CacheConfig::default());
        cache.set("what caused the outage?", "disk full".into(), 10);
        assert_eq!(
            cache.get("what caused the outage?"),
            Some("disk full".into())
        );
    }

    #[test]
    fn get_after_ttl_returns_none() {
        let cache = SimilarityCache::new(CacheConfig {
            default_ttl: Duration::from_millis(5),
            similarity_threshold: 0.95,
        });
        cache.set("prompt", "response".into(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("prompt"), None);
    }

    #[test]
    fn near_identical_prompt_hits_via_embedding() {
        let cache = SimilarityCache::new(CacheConfig {
            default_ttl: Duration::from_secs(60),
            similarity_threshold: 0.9,
        });
        cache.set(
            "investigate high latency on checkout service",
            "db connection pool exhausted".into(),
            20,
        );
        let hit = cache.get("investigate high latency on checkout service now");
        assert_eq!(hit, Some("db connection pool exhausted".into()));
    }

    #[test]
    fn unrelated_prompt_misses() {
        let cache = SimilarityCache::new(CacheConfig::default());
        cache.set("checkout latency spike", "resp".into(), 1);
        assert_eq!(cache.get("completely unrelated log line about disk io"), None);
    }

    #[test]
    fn stats_track_hit_rate() {
        let cache = SimilarityCache::new(CacheConfig::default());
        cache.set("p", "r".into(), 1);
        cache.get("p");
        cache.get("totally different query text");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }
}
