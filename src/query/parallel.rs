//! Bounded fan-out for bulk independent queries.
//!
//! Sharing one network client across forked workers corrupts connection
//! state, so each worker here is an independent task that builds its *own*
//! [`QueryNode`] from a factory. Results carry the query that produced
//! them, and a failed fetch never takes down the batch.

use super::{MetricQuery, QueryNode};
use crate::schema::MetricRow;
use crate::{Error, Result};

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One finished fetch, with the query that produced it.
pub struct FetchResult {
    pub query: MetricQuery,
    pub result: Result<Vec<MetricRow>>,
}

/// Queues queries, then fans them out over a bounded worker pool.
pub struct ParallelFetcher {
    build_client: Arc<dyn Fn() -> QueryNode + Send + Sync>,
    queries: Vec<MetricQuery>,
    pool_size: usize,
    use_cache: bool,
}

impl ParallelFetcher {
    /// `build_client` is invoked once per worker so that no client state is
    /// shared between concurrent fetches.
    pub fn new<F>(build_client: F) -> Self
    where
        F: Fn() -> QueryNode + Send + Sync + 'static,
    {
        Self {
            build_client: Arc::new(build_client),
            queries: Vec::new(),
            pool_size: 16,
            use_cache: true,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Bypass each worker's result cache (for testing and backfills).
    pub fn override_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Queues one query for the next [`join`](Self::join).
    pub fn fetch(&mut self, query: MetricQuery) {
        self.queries.push(query);
    }

    /// Runs every queued query and returns all results. Order follows the
    /// queue order; individual failures are carried in their result slot.
    pub async fn join(self) -> Vec<FetchResult> {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        debug!(
            queries = self.queries.len(),
            pool_size = self.pool_size,
            "dispatching parallel fetches"
        );

        let mut handles = Vec::with_capacity(self.queries.len());
        for query in self.queries {
            let semaphore = Arc::clone(&semaphore);
            let build_client = Arc::clone(&self.build_client);
            let use_cache = self.use_cache;
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return FetchResult {
                            query,
                            result: Err(Error::Internal("worker pool closed".to_string())),
                        }
                    }
                };
                // A fresh client per worker: no shared connection state
                let client = build_client();
                let result = if use_cache {
                    client.get_metrics_cached(&query).await
                } else {
                    client.get_metrics(&query).await
                };
                FetchResult { query, result }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "parallel fetch worker panicked");
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingester::Ingester;
    use crate::schema::{DataPoint, MetricRow};
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_parallel_fetch_returns_result_per_query() {
        let store = Arc::new(InMemory::new());
        let ingester = Ingester::new(store.clone());
        let ts = 1_445_356_041_000_i64;
        ingester
            .put_metrics_with_uniquifier(
                "slab01",
                &[MetricRow::new("motion", vec![DataPoint::num(ts, 1.0)])],
                Some("t1"),
            )
            .await
            .unwrap();

        let fetch_store = store.clone();
        let mut fetcher =
            ParallelFetcher::new(move || QueryNode::new(fetch_store.clone())).with_pool_size(4);
        for _ in 0..8 {
            fetcher.fetch(MetricQuery::new(
                "slab01",
                vec!["motion".to_string()],
                ts - 1000,
                ts + 1000,
            ));
        }

        let results = fetcher.join().await;
        assert_eq!(results.len(), 8);
        for fetch in results {
            let rows = fetch.result.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].values, vec![DataPoint::num(ts, 1.0)]);
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_poison_the_batch() {
        let store = Arc::new(InMemory::new());
        let fetch_store = store.clone();
        let mut fetcher = ParallelFetcher::new(move || QueryNode::new(fetch_store.clone()));

        // Empty store: queries simply return no rows
        fetcher.fetch(MetricQuery::new("slab01", vec!["motion".to_string()], 0, 1000));
        fetcher.fetch(MetricQuery::new("slab02", vec!["motion".to_string()], 0, 1000));

        let results = fetcher.join().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|f| f.result.is_ok()));
        assert_eq!(results[0].query.source_id, "slab01");
        assert_eq!(results[1].query.source_id, "slab02");
    }
}
