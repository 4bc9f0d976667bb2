//! Integration tests for compaction and its interaction with the read path.

use granary::prelude::*;

use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::sync::Arc;

/// 2015-10-20 15:40:00 UTC
const T0: i64 = 1_445_355_600_000;

async fn store_keys(store: &InMemory) -> Vec<String> {
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

async fn seed_three_uploads(store: &Arc<InMemory>) {
    let ingester = Ingester::new(store.clone());
    for (value, uniquifier) in [(1.0, "t1"), (2.0, "t2"), (3.0, "t3")] {
        let rows = vec![
            MetricRow::new("motion", vec![DataPoint::num(T0, value)]),
            MetricRow::new("motion", vec![DataPoint::num(T0 + 1000, value * 10.0)]),
        ];
        ingester
            .put_metrics_with_uniquifier("slab01", &rows, Some(uniquifier))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_read_path_compacts_crowded_buckets() {
    let store = Arc::new(InMemory::new());
    seed_three_uploads(&store).await;
    assert_eq!(store_keys(&store).await.len(), 3);

    let node = QueryNode::new(store.clone());
    let query = MetricQuery::new("slab01", vec!["motion".to_string()], T0, T0 + 600_000);
    let result = node.get_metrics(&query).await.unwrap();

    // Merged view carries the last-written values
    assert_eq!(
        result[0].values,
        vec![DataPoint::num(T0, 3.0), DataPoint::num(T0 + 1000, 30.0)]
    );

    // ...and the bucket was collapsed to a single object as a side effect
    let after = store_keys(&store).await;
    assert_eq!(after.len(), 1);
    assert!(after[0].contains("t3_"));

    // A second read returns the same data without further compaction
    let again = node.get_metrics(&query).await.unwrap();
    assert_eq!(again, result);
    assert_eq!(store_keys(&store).await, after);
}

#[tokio::test]
async fn test_explicit_compaction_preserves_merged_view() {
    let store = Arc::new(InMemory::new());
    seed_three_uploads(&store).await;

    // Raise the threshold so the read path never compacts on its own
    let config = QueryConfig {
        compaction_threshold: 100,
        ..Default::default()
    };
    let node = QueryNode::with_config(config, store.clone());
    let query = MetricQuery::new("slab01", vec!["motion".to_string()], T0, T0 + 600_000);
    let before = node.get_metrics(&query).await.unwrap();
    assert_eq!(store_keys(&store).await.len(), 3);

    let compactor = Compactor::new(store.clone());
    compactor
        .compact("slab01", &store_keys(&store).await)
        .await
        .unwrap();
    assert_eq!(store_keys(&store).await.len(), 1);

    let after = node.get_metrics(&query).await.unwrap();
    assert_eq!(after, before);

    // Compacting the now-single key is a no-op
    compactor
        .compact("slab01", &store_keys(&store).await)
        .await
        .unwrap();
    assert_eq!(store_keys(&store).await.len(), 1);
}

#[tokio::test]
async fn test_compaction_preserves_tag_combinations_and_strings() {
    let store = Arc::new(InMemory::new());
    let ingester = Ingester::new(store.clone());

    let tags = |version: &str| -> TagSet {
        [("version".to_string(), version.to_string())]
            .into_iter()
            .collect()
    };
    for (uniquifier, version) in [("t1", "1"), ("t2", "2"), ("t3", "2")] {
        let rows = vec![
            MetricRow::new("motion", vec![DataPoint::num(T0, 1.0)]).with_tags(tags("1")),
            MetricRow::new(
                "device.status",
                vec![DataPoint::new(T0, Value::Text(format!("v{}", version)))],
            )
            .with_tags(tags(version)),
        ];
        ingester
            .put_metrics_with_uniquifier("slab01", &rows, Some(uniquifier))
            .await
            .unwrap();
    }

    let compactor = Compactor::new(store.clone());
    compactor
        .compact("slab01", &store_keys(&store).await)
        .await
        .unwrap();

    let node = QueryNode::new(store.clone());
    let mut query = MetricQuery::new(
        "slab01",
        vec!["motion".to_string(), "device.status".to_string()],
        T0,
        T0 + 600_000,
    );
    query.group_by = GroupBy::Keys(vec!["version".to_string()]);
    let mut result = node.get_metrics(&query).await.unwrap();
    result.sort_by(|a, b| (&a.metric_name, &a.tags).cmp(&(&b.metric_name, &b.tags)));

    // status series per version tag survived the merge, with LWW per combo
    assert_eq!(result.len(), 3);
    assert_eq!(result[0].metric_name, "device.status");
    assert_eq!(result[0].values[0].value, Value::Text("v1".into()));
    assert_eq!(result[1].metric_name, "device.status");
    assert_eq!(result[1].values[0].value, Value::Text("v2".into()));
    assert_eq!(result[2].metric_name, "motion");
}
