//! Ingestion: the write path.
//!
//! The ingester turns [`MetricRow`] batches into per-bucket local files via
//! the key-naming scheme, then uploads each file as a new object. Writes
//! are append-only: a bucket accumulates one object per upload, uniquified
//! by write time, and the read path merges them with last-write-wins.
//!
//! Large batches are preferred over many small calls to keep object counts
//! down.

mod staging;

pub use staging::StagingArea;

use crate::protocol::{LineReader, TagSelection};
use crate::retry::RetryPolicy;
use crate::schema::MetricRow;
use crate::Result;

use bytes::Bytes;
use object_store::ObjectStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Timestamps below this magnitude (2100-01-01 in seconds) are interpreted
/// as seconds and rescaled to milliseconds.
const SECONDS_MAGNITUDE_CUTOFF: i64 = 4_102_444_800;

/// Configuration for the ingester
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Directory under which per-call staging directories are created
    pub staging_root: PathBuf,
    /// Retry policy for object-store uploads
    pub retry: RetryPolicy,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir(),
            retry: RetryPolicy::default(),
        }
    }
}

/// The write path.
pub struct Ingester {
    config: IngesterConfig,
    object_store: Arc<dyn ObjectStore>,
}

impl Ingester {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(IngesterConfig::default(), object_store)
    }

    pub fn with_config(config: IngesterConfig, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            object_store,
        }
    }

    /// Posts metric values for one source.
    ///
    /// Each point gets a `source=<source_id>` tag and a default `version=1`
    /// tag (the caller's rows are never mutated); timestamps that look like
    /// seconds are rescaled to milliseconds.
    pub async fn put_metrics(&self, source_id: &str, rows: &[MetricRow]) -> Result<()> {
        self.put_metrics_with_uniquifier(source_id, rows, None).await
    }

    /// [`put_metrics`](Self::put_metrics) with a caller-supplied write-time
    /// uniquifier, for controlled key ordering (compaction).
    pub async fn put_metrics_with_uniquifier(
        &self,
        source_id: &str,
        rows: &[MetricRow],
        uniquifier: Option<&str>,
    ) -> Result<()> {
        let root = self
            .config
            .staging_root
            .join(format!("granary_writer_{}", Uuid::new_v4()));
        let mut staging = StagingArea::create(root)?;
        if let Some(uniquifier) = uniquifier {
            staging.set_custom_uniquifier(uniquifier);
        }

        for row in rows {
            let mut tags = row.tags.clone();
            tags.insert("source".to_string(), source_id.to_string());
            tags.entry("version".to_string())
                .or_insert_with(|| "1".to_string());
            for point in &row.values {
                let timestamp = normalize_timestamp(point.timestamp);
                let writer = staging.writer_for(&row.metric_name, source_id, timestamp)?;
                writer.put_value(&row.metric_name, timestamp, &point.value, &tags)?;
            }
        }

        staging.close_all()?;
        self.upload(&staging).await
    }

    /// Re-ingests a local line-protocol file, bucketing each record by the
    /// source recorded in its tags (`NA` when absent).
    pub async fn put_metrics_from_file(&self, path: &Path) -> Result<()> {
        let root = self
            .config
            .staging_root
            .join(format!("granary_writer_{}", Uuid::new_v4()));
        let mut staging = StagingArea::create(root)?;

        let file = File::open(path)?;
        let mut reader = LineReader::new(BufReader::new(file), TagSelection::All)
            .with_origin(path.display().to_string());
        while let Some(record) = reader.read_record()? {
            let timestamp = normalize_timestamp(record.timestamp);
            let source_id = record
                .tags
                .get("source")
                .cloned()
                .unwrap_or_else(|| "NA".to_string());
            let mut tags = record.tags;
            tags.entry("version".to_string())
                .or_insert_with(|| "1".to_string());
            let writer = staging.writer_for(&record.name, &source_id, timestamp)?;
            writer.put_value(&record.name, timestamp, &record.value, &tags)?;
        }

        staging.close_all()?;
        self.upload(&staging).await
    }

    async fn upload(&self, staging: &StagingArea) -> Result<()> {
        let files = staging.staged_files()?;
        let count = files.len();
        for (key, local_path) in files {
            let payload = Bytes::from(std::fs::read(&local_path)?);
            let object_path: object_store::path::Path = key.as_str().into();
            self.config
                .retry
                .run("put_metrics_object", || {
                    let store = Arc::clone(&self.object_store);
                    let path = object_path.clone();
                    let payload = payload.clone();
                    async move {
                        store.put(&path, payload.into()).await?;
                        Ok(())
                    }
                })
                .await?;
            debug!(key = %object_path, "uploaded metrics object");
        }
        info!(objects = count, "metrics upload complete");
        Ok(())
    }
}

/// Rescales second-resolution timestamps to milliseconds.
pub(crate) fn normalize_timestamp(timestamp: i64) -> i64 {
    if timestamp.abs() < SECONDS_MAGNITUDE_CUTOFF {
        timestamp * 1000
    } else {
        timestamp
    }
}
