//! The metric data model shared by every read/write API.
//!
//! A query or write batch is a list of [`MetricRow`]s: one row per
//! (metric name, tag combination), carrying datapoints sorted ascending by
//! timestamp. Timestamps are milliseconds since the Unix epoch. Values may
//! be non-numeric; such points still count toward `count` aggregates but are
//! excluded from numeric statistics.

mod names;

pub use names::{
    aggregate_metric_name, all_aggregate_names, parse_aggregation, AggKind, AGGREGATE_KINDS,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag key/value pairs attached to a datapoint or row.
///
/// Ordered so that equal tag sets compare and hash identically regardless of
/// insertion order; used directly as a grouping/merge key.
pub type TagSet = BTreeMap<String, String>;

/// A datapoint value: numeric, or a free-form string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value, parsing text the way the line protocol
    /// parses value tokens.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(t) => t.trim().parse().ok(),
        }
    }

    /// Tolerant equality: numbers compare via [`is_close`], everything else
    /// compares exactly.
    pub fn is_close_to(&self, other: &Value) -> bool {
        if self == other {
            return true;
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => is_close(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(t) => write!(f, "{}", t),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(t: &str) -> Self {
        Value::Text(t.to_string())
    }
}

/// One metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub value: Value,
}

impl DataPoint {
    pub fn new(timestamp: i64, value: Value) -> Self {
        Self { timestamp, value }
    }

    pub fn num(timestamp: i64, value: f64) -> Self {
        Self::new(timestamp, Value::Number(value))
    }
}

/// One time series: a metric name, a tag combination, and its datapoints.
///
/// `values` are sorted ascending by timestamp with unique timestamps; this
/// is the unit exchanged between all read and write APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric_name: String,
    #[serde(default)]
    pub tags: TagSet,
    pub values: Vec<DataPoint>,
}

impl MetricRow {
    pub fn new(metric_name: impl Into<String>, values: Vec<DataPoint>) -> Self {
        Self {
            metric_name: metric_name.into(),
            tags: TagSet::new(),
            values,
        }
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    /// The row's `version` tag as a number, `-1.0` when absent or unparsable.
    pub fn version(&self) -> f64 {
        self.tags
            .get("version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1.0)
    }
}

/// Equality after rounding both sides to 5 significant digits.
///
/// Used when diffing datasets so that values that survived a write/read
/// round trip through the text protocol still compare equal.
pub fn is_close(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    format!("{:.4e}", a) == format!("{:.4e}", b)
}
