//! The low-latency secondary time-series store.
//!
//! Canonical-level rollups are mirrored into a fast store so dashboards can
//! read them without touching the object store. The collaborator is an
//! HTTP/JSON query endpoint plus a batched write endpoint; [`HttpFastStore`]
//! speaks that protocol, and [`LocalFastStore`] is the in-memory stand-in
//! for tests and development.

mod http;
mod local;

pub use http::HttpFastStore;
pub use local::LocalFastStore;

use crate::query::GroupBy;
use crate::schema::{MetricRow, TagSet};
use crate::Result;

use async_trait::async_trait;

/// A fast-store built-in aggregator applied server-side at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinAggregator {
    /// Aggregator name understood by the store (e.g. `avg`)
    pub name: String,
    /// Sampling window, aligned to the query start
    pub sampling_seconds: u32,
}

/// One fast-store query.
#[derive(Debug, Clone)]
pub struct FastQuery {
    /// Full metric names (aggregation suffixes included)
    pub metric_names: Vec<String>,
    pub source_id: String,
    /// Points must carry every listed tag/value pair
    pub filter_by_tags: TagSet,
    pub group_by: GroupBy,
    /// Inclusive start, milliseconds
    pub start_ms: i64,
    /// Exclusive end, milliseconds
    pub end_ms: i64,
    /// Optional server-side aggregation
    pub aggregator: Option<BuiltinAggregator>,
}

/// The fast-store collaborator contract.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Runs a query, returning one row per metric name and tag combination.
    async fn query(&self, query: &FastQuery) -> Result<Vec<MetricRow>>;

    /// Writes a batch of rows. Numeric-looking values are shipped as
    /// numbers so the store keeps a single series per metric.
    async fn write(&self, rows: &[MetricRow]) -> Result<()>;
}
