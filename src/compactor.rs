//! Compaction: collapsing a bucket's many small objects into one.
//!
//! Ingestion is append-only, so a frequently-written bucket accumulates
//! objects. The compactor merges them with the same last-write-wins rule
//! the read path uses, writes one replacement object whose key sorts
//! strictly *after* every key it replaces, then deletes the originals.
//!
//! Not atomic: a reader racing between the write and the deletes may fetch
//! duplicate points, which the idempotent merge absorbs. A failure part-way
//! leaves extra keys behind for the next attempt to re-observe.

use crate::ingester::Ingester;
use crate::naming;
use crate::query::merge::{self, Accumulator, GroupSpec, MergeSpec};
use crate::retry::RetryPolicy;
use crate::schema::TagSet;
use crate::Result;

use object_store::ObjectStore;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

/// Compactor configuration
#[derive(Debug, Clone, Default)]
pub struct CompactorConfig {
    /// Retry policy for object-store calls
    pub retry: RetryPolicy,
}

/// Merges and replaces objects under one bucket prefix.
pub struct Compactor {
    config: CompactorConfig,
    object_store: Arc<dyn ObjectStore>,
    ingester: Ingester,
}

impl Compactor {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(CompactorConfig::default(), object_store)
    }

    pub fn with_config(config: CompactorConfig, object_store: Arc<dyn ObjectStore>) -> Self {
        let ingester = Ingester::new(Arc::clone(&object_store));
        Self {
            config,
            object_store,
            ingester,
        }
    }

    /// Replaces `keys` with a single merged object.
    ///
    /// Fewer than two keys is a no-op (nothing to merge). The replacement
    /// object's uniquifier is the lexicographically-last original key's
    /// uniquifier plus `_`, so it sorts after everything it replaces and
    /// values arriving between list and write are never shadowed.
    pub async fn compact(&self, source_id: &str, keys: &[String]) -> Result<()> {
        if keys.len() < 2 {
            debug!(count = keys.len(), "compaction threshold not met, skipping");
            return Ok(());
        }
        let mut keys = keys.to_vec();
        keys.sort();

        // Merge everything: all metrics, full tag combinations, all time.
        let spec = MergeSpec {
            group: GroupSpec::AllTags,
            filter: TagSet::new(),
            metric_names: None,
            start_ms: i64::MIN,
            end_ms: i64::MAX,
        };
        let mut accumulator = Accumulator::new();
        for key in &keys {
            let path: object_store::path::Path = key.as_str().into();
            let bytes = self
                .config
                .retry
                .run("compact_fetch", || {
                    let store = Arc::clone(&self.object_store);
                    let path = path.clone();
                    async move { Ok(store.get(&path).await?.bytes().await?) }
                })
                .await?;
            merge::accumulate_object(Cursor::new(bytes), key, &spec, &mut accumulator)?;
        }

        let last_key = &keys[keys.len() - 1];
        let uniquifier = format!("{}_", naming::creation_suffix(last_key)?);

        let rows = merge::into_rows(accumulator);
        self.ingester
            .put_metrics_with_uniquifier(source_id, &rows, Some(&uniquifier))
            .await?;

        for key in &keys {
            let path: object_store::path::Path = key.as_str().into();
            self.config
                .retry
                .run("compact_delete", || {
                    let store = Arc::clone(&self.object_store);
                    let path = path.clone();
                    async move {
                        store.delete(&path).await?;
                        Ok(())
                    }
                })
                .await?;
        }

        info!(
            source_id,
            replaced = keys.len(),
            uniquifier,
            "compaction complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataPoint, MetricRow};
    use futures::TryStreamExt;
    use object_store::memory::InMemory;

    async fn all_keys(store: &InMemory) -> Vec<String> {
        let mut keys: Vec<String> = store
            .list(None)
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_compaction_replaces_keys_with_sorted_successor() {
        let store = Arc::new(InMemory::new());
        let ingester = Ingester::new(store.clone());
        let ts = 1_445_356_041_000_i64;

        for (uniquifier, value) in [("t1", 1.0), ("t2", 2.0), ("t3", 3.0)] {
            let rows = vec![MetricRow::new("motion", vec![DataPoint::num(ts, value)])];
            ingester
                .put_metrics_with_uniquifier("slab01", &rows, Some(uniquifier))
                .await
                .unwrap();
        }
        let keys = all_keys(&store).await;
        assert_eq!(keys.len(), 3);

        let compactor = Compactor::new(store.clone());
        compactor.compact("slab01", &keys).await.unwrap();

        let after = all_keys(&store).await;
        assert_eq!(after.len(), 1);
        // successor key sorts after every replaced key
        assert!(after[0] > keys[2]);
        assert!(after[0].contains("t3_"));

        // merged data carries the last-written value
        let bytes = store
            .get(&after[0].as_str().into())
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains(&format!("put motion {} 3", ts)));
        assert!(!body.contains(&format!("put motion {} 1 ", ts)));
    }

    #[tokio::test]
    async fn test_compacting_a_single_key_is_a_noop() {
        let store = Arc::new(InMemory::new());
        let ingester = Ingester::new(store.clone());
        let rows = vec![MetricRow::new(
            "motion",
            vec![DataPoint::num(1_445_356_041_000, 1.0)],
        )];
        ingester
            .put_metrics_with_uniquifier("slab01", &rows, Some("t1"))
            .await
            .unwrap();

        let keys = all_keys(&store).await;
        let compactor = Compactor::new(store.clone());
        compactor.compact("slab01", &keys).await.unwrap();
        assert_eq!(all_keys(&store).await, keys);
    }
}
