//! Integration tests for the fast-store read path.

use granary::aggregate;
use granary::prelude::*;
use granary::schema::aggregate_metric_name;

use object_store::memory::InMemory;
use std::sync::Arc;

fn source_tags() -> TagSet {
    [("source".to_string(), "slab01".to_string())]
        .into_iter()
        .collect()
}

/// Seeds the fast store with 60s-level rollups for `temp`:
/// window 0 has one point (5.0), window 60s has three (values summing 30).
async fn seeded_fast_store() -> Arc<LocalFastStore> {
    let fast = Arc::new(LocalFastStore::new());
    let seed = |kind: AggKind, points: Vec<DataPoint>| {
        MetricRow::new(aggregate_metric_name("temp", kind, 60), points).with_tags(source_tags())
    };
    fast.write(&[
        seed(
            AggKind::Count,
            vec![DataPoint::num(0, 1.0), DataPoint::num(60_000, 3.0)],
        ),
        seed(
            AggKind::Sum,
            vec![DataPoint::num(0, 5.0), DataPoint::num(60_000, 30.0)],
        ),
        seed(
            AggKind::Mean,
            vec![DataPoint::num(0, 5.0), DataPoint::num(60_000, 10.0)],
        ),
        seed(
            AggKind::Max,
            vec![DataPoint::num(0, 5.0), DataPoint::num(60_000, 12.0)],
        ),
    ])
    .await
    .unwrap();
    fast
}

fn fast_query(aggregation_seconds: u32, aggregation: FastAggregation) -> FastMetricQuery {
    FastMetricQuery {
        source_id: "slab01".to_string(),
        base_metric_name: "temp".to_string(),
        start_ms: 0,
        end_ms: 120_000,
        group_by: GroupBy::None,
        aggregation_seconds,
        aggregation,
        filter_by_tags: TagSet::new(),
    }
}

#[tokio::test]
async fn test_canonical_level_is_served_directly() {
    let fast = seeded_fast_store().await;
    let node = QueryNode::new(Arc::new(InMemory::new())).with_fast_store(fast);

    let result = node
        .get_aggregate_metrics_fast(&fast_query(60, FastAggregation::Kind(AggKind::Mean)))
        .await
        .unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric_name, "temp.60s.mean");
    assert_eq!(
        result[0].values,
        vec![DataPoint::num(0, 5.0), DataPoint::num(60_000, 10.0)]
    );
}

#[tokio::test]
async fn test_noncanonical_level_reaggregates_subaggregates() {
    let fast = seeded_fast_store().await;
    let node = QueryNode::new(Arc::new(InMemory::new())).with_fast_store(fast);

    let result = node
        .get_aggregate_metrics_fast(&fast_query(120, FastAggregation::Kind(AggKind::Mean)))
        .await
        .unwrap();

    // Exact mean over both child windows: (5 + 30) / (1 + 3)
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].metric_name, "temp.120s.mean");
    assert_eq!(result[0].values, vec![DataPoint::num(0, 8.75)]);
}

#[tokio::test]
async fn test_noncanonical_max_uses_single_prerequisite() {
    let fast = seeded_fast_store().await;
    let node = QueryNode::new(Arc::new(InMemory::new())).with_fast_store(fast);

    let result = node
        .get_aggregate_metrics_fast(&fast_query(120, FastAggregation::Kind(AggKind::Max)))
        .await
        .unwrap();
    assert_eq!(result[0].values, vec![DataPoint::num(0, 12.0)]);
}

#[tokio::test]
async fn test_mean_of_means_is_approximate() {
    let fast = seeded_fast_store().await;
    let node = QueryNode::new(Arc::new(InMemory::new())).with_fast_store(fast);

    let result = node
        .get_aggregate_metrics_fast(&fast_query(120, FastAggregation::MeanOfMeans))
        .await
        .unwrap();

    // Unweighted average of the two child means: (5 + 10) / 2, which
    // differs from the exact 8.75 because the windows have unequal counts
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].values, vec![DataPoint::num(0, 7.5)]);
}

#[tokio::test]
async fn test_fast_path_requires_a_fast_store() {
    let node = QueryNode::new(Arc::new(InMemory::new()));
    let result = node
        .get_aggregate_metrics_fast(&fast_query(60, FastAggregation::Kind(AggKind::Mean)))
        .await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_rollup_pipeline_through_fast_store() {
    // Aggregate raw points locally, ship the canonical rollups to the fast
    // store, and confirm the fast path reproduces the direct aggregate.
    let raw = vec![MetricRow::new(
        "temp",
        (0..10)
            .map(|i| DataPoint::num(i * 12_000, i as f64))
            .collect(),
    )
    .with_tags(source_tags())];

    let rollups = aggregate::aggregate_raw(
        &raw,
        0,
        120_000,
        &[AggKind::Sum, AggKind::Count, AggKind::Mean],
        60,
    );
    // Shipped rows keep the source tag because aggregation groups by the
    // full tag set
    let fast = Arc::new(LocalFastStore::new());
    fast.write(&rollups).await.unwrap();

    let node = QueryNode::new(Arc::new(InMemory::new())).with_fast_store(fast);
    let fast_result = node
        .get_aggregate_metrics_fast(&fast_query(120, FastAggregation::Kind(AggKind::Mean)))
        .await
        .unwrap();

    let direct = aggregate::aggregate_raw(&raw, 0, 120_000, &[AggKind::Mean], 120);
    let direct_mean = direct
        .iter()
        .find(|row| row.metric_name == "temp.120s.mean")
        .unwrap();
    assert_eq!(fast_result[0].values, direct_mean.values);
}
