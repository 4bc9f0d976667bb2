//! HTTP/JSON client for the fast store's query protocol.

use super::{FastQuery, FastStore};
use crate::query::GroupBy;
use crate::retry::RetryPolicy;
use crate::schema::{DataPoint, MetricRow, TagSet, Value};
use crate::{Error, Result};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Client for a fast store reachable over HTTP.
pub struct HttpFastStore {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFastStore {
    /// `base_url` is scheme + host (+ optional port), no trailing slash.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn post_json(
        &self,
        operation: &'static str,
        url: String,
        body: serde_json::Value,
        expected_status: u16,
    ) -> Result<String> {
        self.retry
            .run(operation, || {
                let client = self.client.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = client.post(&url).json(&body).send().await?;
                    let status = response.status();
                    let text = response.text().await?;
                    if status.as_u16() != expected_status {
                        if status.is_server_error() {
                            return Err(Error::Unavailable(format!(
                                "fast store returned {}: {}",
                                status, text
                            )));
                        }
                        return Err(Error::FastStore(format!(
                            "fast store returned {}: {}",
                            status, text
                        )));
                    }
                    Ok(text)
                }
            })
            .await
    }

    /// Tag keys present on a metric for a source and time range; needed to
    /// expand group-by-everything queries, since the protocol only groups
    /// by named tags.
    async fn tag_names(
        &self,
        source_id: &str,
        metric_name: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<String>> {
        let body = json!({
            "metrics": [{
                "name": metric_name,
                "tags": {"source": [source_id]},
            }],
            "cache_time": 0,
            "start_absolute": start_ms,
            "end_absolute": end_ms - 1,
        });
        let text = self
            .post_json(
                "fast_store_tag_names",
                format!("{}/api/v1/datapoints/query/tags", self.base_url),
                body,
                200,
            )
            .await?;
        let response: TagsResponse = serde_json::from_str(&text)
            .map_err(|e| Error::FastStore(format!("unparsable tags response: {}", e)))?;
        let tags = response
            .queries
            .first()
            .and_then(|q| q.results.first())
            .map(|r| r.tags.keys().cloned().collect())
            .unwrap_or_default();
        Ok(tags)
    }
}

#[async_trait]
impl FastStore for HttpFastStore {
    async fn query(&self, query: &FastQuery) -> Result<Vec<MetricRow>> {
        let mut metrics = Vec::new();
        for metric_name in &query.metric_names {
            let mut tag_filter = serde_json::Map::new();
            tag_filter.insert("source".to_string(), json!(query.source_id));
            for (key, value) in &query.filter_by_tags {
                tag_filter.insert(key.clone(), json!(value));
            }
            let mut metric = json!({
                "name": metric_name,
                "tags": tag_filter,
            });

            let group_tags: Vec<String> = match &query.group_by {
                GroupBy::None => Vec::new(),
                GroupBy::Keys(keys) if !keys.iter().any(|k| k == "*") => keys.clone(),
                // A wildcard (or GroupBy::All) groups by every tag the store
                // has seen for this metric
                _ => {
                    self.tag_names(&query.source_id, metric_name, query.start_ms, query.end_ms)
                        .await?
                }
            };
            if !group_tags.is_empty() {
                metric["group_by"] = json!([{"name": "tag", "tags": group_tags}]);
            }
            if let Some(aggregator) = &query.aggregator {
                metric["aggregators"] = json!([{
                    "name": aggregator.name,
                    "align_sampling": true,
                    "sampling": {"value": aggregator.sampling_seconds, "unit": "seconds"},
                }]);
            }
            metrics.push(metric);
        }

        let body = json!({
            "metrics": metrics,
            "cache_time": 0,
            "start_absolute": query.start_ms,
            "end_absolute": query.end_ms - 1,
        });
        debug!(url = %self.base_url, "fast store query");
        let text = self
            .post_json(
                "fast_store_query",
                format!("{}/api/v1/datapoints/query", self.base_url),
                body,
                200,
            )
            .await?;

        let response: QueryResponse = serde_json::from_str(&text)
            .map_err(|e| Error::FastStore(format!("unparsable query response: {}", e)))?;
        Ok(convert_response(response))
    }

    async fn write(&self, rows: &[MetricRow]) -> Result<()> {
        let mut datapoints = Vec::new();
        for row in rows {
            for point in &row.values {
                // Ship numeric-looking values as numbers: the store keeps
                // separate series for mixed value types otherwise.
                let value = match point.value.as_f64() {
                    Some(number) => json!(number),
                    None => json!(point.value.to_string()),
                };
                datapoints.push(json!({
                    "name": row.metric_name,
                    "timestamp": point.timestamp,
                    "value": value,
                    "tags": row.tags,
                }));
            }
        }
        if datapoints.is_empty() {
            return Ok(());
        }
        self.post_json(
            "fast_store_write",
            format!("{}/api/v1/datapoints", self.base_url),
            json!(datapoints),
            204,
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    queries: Vec<QueryGroupSet>,
}

#[derive(Debug, Deserialize)]
struct QueryGroupSet {
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    name: String,
    #[serde(default)]
    group_by: Vec<GroupByEntry>,
    values: Vec<(i64, serde_json::Value)>,
}

#[derive(Debug, Deserialize)]
struct GroupByEntry {
    #[serde(default)]
    group: TagSet,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    queries: Vec<TagsGroupSet>,
}

#[derive(Debug, Deserialize)]
struct TagsGroupSet {
    results: Vec<TagsResult>,
}

#[derive(Debug, Deserialize)]
struct TagsResult {
    #[serde(default)]
    tags: std::collections::BTreeMap<String, serde_json::Value>,
}

fn convert_response(response: QueryResponse) -> Vec<MetricRow> {
    let mut rows = Vec::new();
    for group_set in response.queries {
        for result in group_set.results {
            let tags: TagSet = result
                .group_by
                .first()
                .map(|entry| entry.group.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .collect();
            let values = result
                .values
                .into_iter()
                .map(|(timestamp, value)| {
                    let value = match value.as_f64() {
                        Some(number) => Value::Number(number),
                        None => Value::Text(
                            value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
                        ),
                    };
                    DataPoint { timestamp, value }
                })
                .collect();
            rows.push(MetricRow {
                metric_name: result.name,
                tags,
                values,
            });
        }
    }
    rows
}
