//! The read path: resolve, fetch, merge, group, filter, aggregate.
//!
//! A query is resolved to the set of bucket key prefixes that could hold
//! matching points, each prefix is listed (compacting opportunistically
//! when a bucket has accumulated too many objects), and every object is
//! parsed and merged with last-write-wins before optional aggregation.
//!
//! All I/O within one call is sequential; for bulk fan-out across many
//! independent queries use [`parallel::ParallelFetcher`], which gives each
//! worker its own client.

pub mod cache;
pub(crate) mod merge;
pub mod parallel;

pub use cache::{CacheConfig, ResultCache};
pub use merge::create_patch;

use crate::aggregate;
use crate::compactor::Compactor;
use crate::faststore::{BuiltinAggregator, FastQuery, FastStore};
use crate::naming;
use crate::retry::RetryPolicy;
use crate::schema::{aggregate_metric_name, parse_aggregation, AggKind, MetricRow, TagSet};
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use merge::{Accumulator, GroupSpec, MergeSpec};
use object_store::{ObjectMeta, ObjectStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

/// How result points are grouped into rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub enum GroupBy {
    /// Merge every point for a metric into one row, regardless of tags
    #[default]
    None,
    /// One row per combination of the listed tag keys. The wildcard entry
    /// `*` upgrades this to [`GroupBy::All`].
    Keys(Vec<String>),
    /// One row per full tag combination
    All,
}

impl GroupBy {
    fn to_group_spec(&self) -> GroupSpec {
        match self {
            GroupBy::None => GroupSpec::NoTags,
            GroupBy::All => GroupSpec::AllTags,
            GroupBy::Keys(keys) if keys.iter().any(|k| k == "*") => GroupSpec::AllTags,
            GroupBy::Keys(keys) => GroupSpec::Keys(keys.iter().cloned().collect()),
        }
    }
}

/// Arguments for one [`QueryNode::get_metrics`] call.
#[derive(Debug, Clone, Serialize)]
pub struct MetricQuery {
    pub source_id: String,
    /// Metric names to fetch, aggregation suffixes included
    pub metric_names: Vec<String>,
    /// Inclusive start, milliseconds
    pub start_ms: i64,
    /// Exclusive end, milliseconds
    pub end_ms: i64,
    pub group_by: GroupBy,
    /// Window length for aggregation; required when `aggregators` is set
    pub aggregation_seconds: Option<u32>,
    /// Statistics to compute over the merged rows
    pub aggregators: Vec<AggKind>,
    /// Points must carry every listed tag/value pair
    pub filter_by_tags: TagSet,
}

impl MetricQuery {
    pub fn new(
        source_id: impl Into<String>,
        metric_names: Vec<String>,
        start_ms: i64,
        end_ms: i64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            metric_names,
            start_ms,
            end_ms,
            group_by: GroupBy::None,
            aggregation_seconds: None,
            aggregators: Vec::new(),
            filter_by_tags: TagSet::new(),
        }
    }
}

/// Arguments for one [`QueryNode::get_aggregate_metrics_fast`] call.
#[derive(Debug, Clone)]
pub struct FastMetricQuery {
    pub source_id: String,
    /// Base metric name, no aggregation suffix
    pub base_metric_name: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub group_by: GroupBy,
    /// Requested window length; must be at least the finest canonical level
    pub aggregation_seconds: u32,
    pub aggregation: FastAggregation,
    pub filter_by_tags: TagSet,
}

/// Which statistic the fast path computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastAggregation {
    Kind(AggKind),
    /// Average of the next-shorter level's means, computed by the fast
    /// store's own aggregator. Approximate by construction; for old data
    /// whose exact sum/count sub-aggregates no longer exist.
    MeanOfMeans,
}

/// Configuration for the query node
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Compact a bucket once more than this many objects pile up under it
    pub compaction_threshold: usize,
    /// Retry policy for object-store calls
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// The read path over one object store.
pub struct QueryNode {
    config: QueryConfig,
    object_store: Arc<dyn ObjectStore>,
    compactor: Compactor,
    cache: Option<ResultCache>,
    fast_store: Option<Arc<dyn FastStore>>,
}

impl QueryNode {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(QueryConfig::default(), object_store)
    }

    pub fn with_config(config: QueryConfig, object_store: Arc<dyn ObjectStore>) -> Self {
        let compactor = Compactor::new(Arc::clone(&object_store));
        Self {
            config,
            object_store,
            compactor,
            cache: None,
            fast_store: None,
        }
    }

    /// Attaches a result cache used by [`get_metrics_cached`](Self::get_metrics_cached).
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attaches the fast store used by
    /// [`get_aggregate_metrics_fast`](Self::get_aggregate_metrics_fast).
    pub fn with_fast_store(mut self, fast_store: Arc<dyn FastStore>) -> Self {
        self.fast_store = Some(fast_store);
        self
    }

    /// Returns metric values for a source over `[start_ms, end_ms)`.
    ///
    /// Keys under each bucket prefix are processed in ascending order, so
    /// for one (metric, tag combination, timestamp) the last-written value
    /// wins. Metrics with no matching points yield no row.
    ///
    /// # Panics
    ///
    /// `source_id` must be non-empty.
    pub async fn get_metrics(&self, query: &MetricQuery) -> Result<Vec<MetricRow>> {
        assert!(!query.source_id.is_empty(), "invalid empty source_id");
        let aggregation = if query.aggregators.is_empty() {
            None
        } else {
            Some(query.aggregation_seconds.ok_or_else(|| {
                Error::Config("aggregators require aggregation_seconds".to_string())
            })?)
        };

        let spec = MergeSpec {
            group: query.group_by.to_group_spec(),
            filter: query.filter_by_tags.clone(),
            metric_names: Some(query.metric_names.iter().cloned().collect::<HashSet<_>>()),
            start_ms: query.start_ms,
            end_ms: query.end_ms,
        };

        let mut accumulator = Accumulator::new();
        for prefix in self.gather_key_prefixes(query) {
            let mut keys = self.list_keys(&prefix).await?;
            if keys.len() > self.config.compaction_threshold {
                info!(prefix = %prefix, objects = keys.len(), "compacting bucket before read");
                self.compactor.compact(&query.source_id, &keys).await?;
                keys = self.list_keys(&prefix).await?;
            }
            for key in &keys {
                let bytes = self.fetch(key).await?;
                merge::accumulate_object(Cursor::new(bytes), key, &spec, &mut accumulator)?;
            }
        }
        let results = merge::into_rows(accumulator);

        if let Some(seconds) = aggregation {
            return Ok(aggregate::aggregate_raw(
                &results,
                query.start_ms,
                query.end_ms,
                &query.aggregators,
                seconds,
            ));
        }
        Ok(results)
    }

    /// [`get_metrics`](Self::get_metrics) through the TTL result cache,
    /// keyed by the full set of query arguments. Falls back to an uncached
    /// read when no cache is attached.
    pub async fn get_metrics_cached(&self, query: &MetricQuery) -> Result<Vec<MetricRow>> {
        match &self.cache {
            None => self.get_metrics(query).await,
            Some(cache) => {
                let key = serde_json::to_string(query)?;
                let result = cache
                    .get_or_fetch(key, || async { self.get_metrics(query).await })
                    .await?;
                Ok(result.as_ref().clone())
            }
        }
    }

    /// Low-latency aggregate fetch from the fast store.
    ///
    /// Canonical window lengths are served directly from the pre-computed
    /// rollups; other lengths are re-aggregated from the next-shorter
    /// canonical level's prerequisite series.
    pub async fn get_aggregate_metrics_fast(
        &self,
        query: &FastMetricQuery,
    ) -> Result<Vec<MetricRow>> {
        let fast_store = self
            .fast_store
            .as_ref()
            .ok_or_else(|| Error::Config("no fast store configured".to_string()))?;
        let query_seconds = aggregate::shorter_preaggregation_length(query.aggregation_seconds);

        let fast_query = |metric_names: Vec<String>, aggregator: Option<BuiltinAggregator>| {
            FastQuery {
                metric_names,
                source_id: query.source_id.clone(),
                filter_by_tags: query.filter_by_tags.clone(),
                group_by: query.group_by.clone(),
                start_ms: query.start_ms,
                end_ms: query.end_ms,
                aggregator,
            }
        };

        match query.aggregation {
            FastAggregation::MeanOfMeans => {
                let name = aggregate_metric_name(
                    &query.base_metric_name,
                    AggKind::Mean,
                    query_seconds,
                );
                fast_store
                    .query(&fast_query(
                        vec![name],
                        Some(BuiltinAggregator {
                            name: "avg".to_string(),
                            sampling_seconds: query.aggregation_seconds,
                        }),
                    ))
                    .await
            }
            FastAggregation::Kind(kind) => {
                if aggregate::AGGREGATION_LEVELS.contains(&query.aggregation_seconds) {
                    // Pre-baked level: read it straight off the fast store
                    let name = aggregate_metric_name(
                        &query.base_metric_name,
                        kind,
                        query.aggregation_seconds,
                    );
                    fast_store.query(&fast_query(vec![name], None)).await
                } else {
                    let names: Vec<String> = aggregate::prerequisite_kinds(kind)
                        .iter()
                        .map(|sub| {
                            aggregate_metric_name(&query.base_metric_name, *sub, query_seconds)
                        })
                        .collect();
                    debug!(?names, "fetching sub-aggregates for re-aggregation");
                    let sub_aggregates = fast_store.query(&fast_query(names, None)).await?;
                    Ok(aggregate::aggregate_rollups(
                        &sub_aggregates,
                        &[kind],
                        query.aggregation_seconds,
                        query.start_ms,
                        query.end_ms,
                    ))
                }
            }
        }
    }

    /// When the bucket covering `time_ms` was last written, or `None` if it
    /// has no objects.
    pub async fn last_modified(
        &self,
        source_id: &str,
        base_metric_name: &str,
        is_aggregate: bool,
        period_seconds: Option<u32>,
        time_ms: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let width = naming::bucket_width(period_seconds, is_aggregate);
        let start = naming::truncate_to_bucket_start(time_ms, width);
        let prefix = naming::key_prefix(source_id, base_metric_name, is_aggregate, start, width);
        let metas = self.list_metas(&prefix).await?;
        Ok(metas.into_iter().map(|meta| meta.last_modified).max())
    }

    /// Every bucket-aligned key prefix a query could touch, unioned across
    /// its metric names.
    fn gather_key_prefixes(&self, query: &MetricQuery) -> BTreeSet<String> {
        let mut prefixes = BTreeSet::new();
        for metric_name in &query.metric_names {
            let (base, aggregation) = parse_aggregation(metric_name);
            let is_aggregate = aggregation.is_some();
            let width =
                naming::bucket_width(aggregation.map(|(_, period)| period), is_aggregate);
            let width_ms = i64::from(width) * 1000;
            let mut current = naming::truncate_to_bucket_start(query.start_ms, width);
            while current < query.end_ms {
                prefixes.insert(naming::key_prefix(
                    &query.source_id,
                    base,
                    is_aggregate,
                    current,
                    width,
                ));
                current += width_ms;
            }
        }
        prefixes
    }

    /// Object names under one bucket prefix, ascending.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .list_metas(prefix)
            .await?
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_metas(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Prefix listing in the store API is per path segment, but our
        // prefixes end mid-file-name; list the parent directory and filter.
        let parent = prefix
            .rsplit_once('/')
            .map(|(directory, _)| directory.to_string())
            .unwrap_or_default();
        self.config
            .retry
            .run("list_keys", || {
                let store = Arc::clone(&self.object_store);
                let parent_path: object_store::path::Path = parent.as_str().into();
                let prefix = prefix.to_string();
                async move {
                    let metas: Vec<ObjectMeta> =
                        store.list(Some(&parent_path)).try_collect().await?;
                    Ok(metas
                        .into_iter()
                        .filter(|meta| meta.location.as_ref().starts_with(&prefix))
                        .collect())
                }
            })
            .await
    }

    async fn fetch(&self, key: &str) -> Result<bytes::Bytes> {
        let path: object_store::path::Path = key.into();
        self.config
            .retry
            .run("fetch_object", || {
                let store = Arc::clone(&self.object_store);
                let path = path.clone();
                async move { Ok(store.get(&path).await?.bytes().await?) }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_key_prefixes_enumerates_buckets() {
        let node = QueryNode::new(Arc::new(object_store::memory::InMemory::new()));
        // 25 minutes spanning three 10-minute buckets
        let start = 1_445_355_600_000; // 15:40:00
        let query = MetricQuery::new("slab01", vec!["motion".to_string()], start, start + 1_500_000);
        let prefixes = node.gather_key_prefixes(&query);
        assert_eq!(prefixes.len(), 3);
        for prefix in &prefixes {
            assert!(prefix.starts_with("10bals/2015/10/20/"));
            assert!(prefix.ends_with('-'));
        }
    }

    #[test]
    fn test_gather_key_prefixes_unions_metric_names() {
        let node = QueryNode::new(Arc::new(object_store::memory::InMemory::new()));
        let start = 1_445_355_600_000;
        let query = MetricQuery::new(
            "slab01",
            vec!["motion".to_string(), "motion.3600s.mean".to_string()],
            start,
            start + 600_000,
        );
        let prefixes = node.gather_key_prefixes(&query);
        // one 10-minute raw bucket + one 1-hour aggregate bucket
        assert_eq!(prefixes.len(), 2);
        assert!(prefixes.iter().any(|p| p.contains("/aggregate/")));
    }

    #[test]
    fn test_group_by_wildcard_means_all_tags() {
        let group = GroupBy::Keys(vec!["version".to_string(), "*".to_string()]);
        assert_eq!(group.to_group_spec(), GroupSpec::AllTags);
    }

    #[tokio::test]
    async fn test_aggregators_require_aggregation_seconds() {
        let node = QueryNode::new(Arc::new(object_store::memory::InMemory::new()));
        let mut query = MetricQuery::new("slab01", vec!["motion".to_string()], 0, 1000);
        query.aggregators = vec![AggKind::Mean];
        assert!(matches!(
            node.get_metrics(&query).await,
            Err(Error::Config(_))
        ));
    }
}
