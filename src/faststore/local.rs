//! In-memory fast store for tests and development.

use super::{FastQuery, FastStore};
use crate::query::GroupBy;
use crate::schema::{DataPoint, MetricRow, TagSet, Value};
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// An in-process [`FastStore`] with the same visible semantics as the HTTP
/// protocol: upserts per (name, tags, timestamp), numeric coercion on
/// write, and the `avg` built-in aggregator.
#[derive(Default)]
pub struct LocalFastStore {
    series: RwLock<HashMap<(String, TagSet), BTreeMap<i64, Value>>>,
}

impl LocalFastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FastStore for LocalFastStore {
    async fn query(&self, query: &FastQuery) -> Result<Vec<MetricRow>> {
        let series = self.series.read();
        let mut rows = Vec::new();

        for metric_name in &query.metric_names {
            // tag combination -> timestamp -> value
            let mut groups: BTreeMap<TagSet, BTreeMap<i64, Value>> = BTreeMap::new();
            for ((name, tags), values) in series.iter() {
                if name != metric_name {
                    continue;
                }
                if tags.get("source").map(String::as_str) != Some(query.source_id.as_str()) {
                    continue;
                }
                if !query
                    .filter_by_tags
                    .iter()
                    .all(|(key, value)| tags.get(key) == Some(value))
                {
                    continue;
                }
                let combination = match &query.group_by {
                    GroupBy::None => TagSet::new(),
                    GroupBy::All => tags.clone(),
                    GroupBy::Keys(keys) if keys.iter().any(|k| k == "*") => tags.clone(),
                    GroupBy::Keys(keys) => tags
                        .iter()
                        .filter(|(key, _)| keys.contains(*key))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect(),
                };
                let group = groups.entry(combination).or_default();
                for (timestamp, value) in values.range(query.start_ms..query.end_ms) {
                    group.insert(*timestamp, value.clone());
                }
            }

            for (tags, values) in groups {
                let points: Vec<DataPoint> = match &query.aggregator {
                    None => values
                        .into_iter()
                        .map(|(timestamp, value)| DataPoint { timestamp, value })
                        .collect(),
                    Some(aggregator) => {
                        if aggregator.name != "avg" {
                            return Err(Error::FastStore(format!(
                                "unsupported built-in aggregator '{}'",
                                aggregator.name
                            )));
                        }
                        average_windows(&values, query.start_ms, aggregator.sampling_seconds)
                    }
                };
                rows.push(MetricRow {
                    metric_name: metric_name.clone(),
                    tags,
                    values: points,
                });
            }
        }
        Ok(rows)
    }

    async fn write(&self, rows: &[MetricRow]) -> Result<()> {
        let mut series = self.series.write();
        for row in rows {
            let slot = series
                .entry((row.metric_name.clone(), row.tags.clone()))
                .or_default();
            for point in &row.values {
                // Same coercion the HTTP client applies on write
                let value = match point.value.as_f64() {
                    Some(number) => Value::Number(number),
                    None => point.value.clone(),
                };
                slot.insert(point.timestamp, value);
            }
        }
        Ok(())
    }
}

/// The `avg` built-in: mean of numeric values per sampling window, aligned
/// to the query start.
fn average_windows(
    values: &BTreeMap<i64, Value>,
    start_ms: i64,
    sampling_seconds: u32,
) -> Vec<DataPoint> {
    let window_ms = i64::from(sampling_seconds) * 1000;
    let mut sums: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for (timestamp, value) in values {
        if let Some(number) = value.as_f64() {
            let window = start_ms + ((timestamp - start_ms) / window_ms) * window_ms;
            let slot = sums.entry(window).or_insert((0.0, 0.0));
            slot.0 += number;
            slot.1 += 1.0;
        }
    }
    sums.into_iter()
        .map(|(window, (sum, count))| DataPoint::num(window, sum / count))
        .collect()
}
