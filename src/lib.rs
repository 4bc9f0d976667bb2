//! # Granary
//!
//! A time-series metric store for sensor telemetry, built on object
//! storage.
//!
//! Granary persists points from many independent physical sources
//! (temperature, airflow, weight, device health) as plain-text
//! line-protocol objects, partitioned by source and time, and maintains
//! multi-resolution rollups (1 min, 10 min, 1 hr, 6 hr) so long range
//! queries never scan raw data.
//!
//! ## Key design points
//!
//! - **Log-structured writes**: every upload is a new object whose key
//!   encodes its write time; nothing is ever overwritten in place
//! - **Last-write-wins merge**: keys sort in write order, so conflicting
//!   points resolve deterministically at read time
//! - **Reversed source ids**: spreads adjacent sources across the store's
//!   key space to avoid partition hot-spots
//! - **Hierarchical rollups**: coarse statistics (including standard
//!   deviation, via parallel-variance combination) are computed from finer
//!   rollups, never from raw points
//!
//! ## Architecture
//!
//! - **Ingester**: stages points into per-bucket local files, uploads them
//! - **Query node**: resolves prefixes, fetches, merges, filters,
//!   aggregates; optionally answers from the low-latency fast store
//! - **Compactor**: collapses a bucket's accumulated objects into one

pub mod aggregate;
pub mod compactor;
pub mod config;
pub mod faststore;
pub mod ingester;
pub mod naming;
pub mod protocol;
pub mod query;
pub mod retry;
pub mod schema;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Configuration for a Granary deployment
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Ingester configuration
    pub ingester: ingester::IngesterConfig,
    /// Query node configuration
    pub query: query::QueryConfig,
    /// Result cache configuration
    pub cache: query::CacheConfig,
}

/// Object storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Cloud provider for object storage.
    pub provider: CloudProvider,
    /// Provider bucket name.
    pub bucket: String,
}

/// Supported object storage cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Memory,
    Aws,
    Gcp,
    Azure,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }

    pub fn object_store_scheme(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Aws => "s3",
            Self::Gcp => "gs",
            Self::Azure => "az",
        }
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "aws" | "s3" => Ok(Self::Aws),
            "gcp" | "gcs" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(format!(
                "unknown cloud provider '{}'; expected one of memory, aws, gcp, azure",
                other
            )),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: CloudProvider::Aws,
            bucket: "granary-metrics".to_string(),
        }
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::compactor::{Compactor, CompactorConfig};
    pub use crate::faststore::{FastStore, HttpFastStore, LocalFastStore};
    pub use crate::ingester::{Ingester, IngesterConfig};
    pub use crate::query::{
        CacheConfig, FastAggregation, FastMetricQuery, GroupBy, MetricQuery, QueryConfig,
        QueryNode, ResultCache,
    };
    pub use crate::schema::{AggKind, DataPoint, MetricRow, TagSet, Value};
    pub use crate::{CloudProvider, Config, Error, Result, StorageConfig};
}
