//! TTL-bounded result cache for the read path.
//!
//! Purely an optimization layer: entries are keyed by the serialized query
//! arguments and expire on a wall-clock TTL. Correctness never depends on
//! this cache.

use crate::schema::MetricRow;
use crate::{Error, Result};

use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a cached result stays fresh
    pub ttl: Duration,
    /// Maximum number of cached query results
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 1024,
        }
    }
}

/// Keyed-by-arguments cache over query results.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<String, Arc<Vec<MetricRow>>>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let inner = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.max_entries)
            .build();
        Self { inner }
    }

    /// Returns the cached result for `key`, or runs `fetch` and caches its
    /// output. Concurrent callers for one key share a single fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: String, fetch: F) -> Result<Arc<Vec<MetricRow>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<MetricRow>>>,
    {
        self.inner
            .try_get_with(key, async move { fetch().await.map(Arc::new) })
            .await
            .map_err(|e: Arc<Error>| Error::Cache(e.to_string()))
    }

    /// Drops every cached result.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_second_lookup_is_served_from_cache() {
        let cache = ResultCache::new(CacheConfig::default());
        let fetches = AtomicU32::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_fetch("q1".to_string(), || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Ok(vec![]) }
                })
                .await
                .unwrap();
            assert!(result.is_empty());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = ResultCache::new(CacheConfig::default());
        let fetches = AtomicU32::new(0);

        let first = cache
            .get_or_fetch("q1".to_string(), || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Internal("boom".into())) }
            })
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_fetch("q1".to_string(), || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(vec![]) }
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_forces_refetch() {
        let cache = ResultCache::new(CacheConfig::default());
        let fetches = AtomicU32::new(0);

        for _ in 0..2 {
            cache
                .get_or_fetch("q1".to_string(), || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Ok(vec![]) }
                })
                .await
                .unwrap();
            cache.invalidate_all();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
