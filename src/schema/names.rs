//! Metric-name codec for aggregation suffixes.
//!
//! An aggregate series is named `<base>.<period>s.<kind>`, e.g.
//! `airflow.temperature.out.600s.mean`. A name without a valid suffix is a
//! raw (unaggregated) metric.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The statistic kinds the aggregation engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggKind {
    Mean,
    Max,
    Min,
    Count,
    Sd,
    Sum,
    First,
    Last,
}

/// All statistic kinds, in canonical emission order.
pub const AGGREGATE_KINDS: [AggKind; 8] = [
    AggKind::Count,
    AggKind::Sum,
    AggKind::Max,
    AggKind::Min,
    AggKind::Mean,
    AggKind::First,
    AggKind::Last,
    AggKind::Sd,
];

impl AggKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggKind::Mean => "mean",
            AggKind::Max => "max",
            AggKind::Min => "min",
            AggKind::Count => "count",
            AggKind::Sd => "sd",
            AggKind::Sum => "sum",
            AggKind::First => "first",
            AggKind::Last => "last",
        }
    }
}

impl fmt::Display for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(AggKind::Mean),
            "max" => Ok(AggKind::Max),
            "min" => Ok(AggKind::Min),
            "count" => Ok(AggKind::Count),
            "sd" => Ok(AggKind::Sd),
            "sum" => Ok(AggKind::Sum),
            "first" => Ok(AggKind::First),
            "last" => Ok(AggKind::Last),
            _ => Err(()),
        }
    }
}

/// Splits a metric name into its base name and, when present, the
/// aggregation suffix `(kind, period_seconds)`.
///
/// Returns `(name, None)` for raw metrics; base names may themselves
/// contain dots.
pub fn parse_aggregation(metric_name: &str) -> (&str, Option<(AggKind, u32)>) {
    let mut segments = metric_name.rsplitn(3, '.');
    let kind_segment = segments.next();
    let period_segment = segments.next();
    let base = segments.next();
    if let (Some(kind_segment), Some(period_segment), Some(base)) =
        (kind_segment, period_segment, base)
    {
        if let Ok(kind) = kind_segment.parse::<AggKind>() {
            if let Some(digits) = period_segment.strip_suffix('s') {
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(period) = digits.parse::<u32>() {
                        return (base, Some((kind, period)));
                    }
                }
            }
        }
    }
    (metric_name, None)
}

/// Builds the aggregate series name for a base metric.
pub fn aggregate_metric_name(base: &str, kind: AggKind, period_seconds: u32) -> String {
    format!("{}.{}s.{}", base, period_seconds, kind.as_str())
}

/// Names of every statistic series at one aggregation level.
pub fn all_aggregate_names(base: &str, period_seconds: u32) -> Vec<String> {
    AGGREGATE_KINDS
        .iter()
        .map(|kind| aggregate_metric_name(base, *kind, period_seconds))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_name() {
        assert_eq!(parse_aggregation("motion"), ("motion", None));
        assert_eq!(
            parse_aggregation("airflow.temperature.out"),
            ("airflow.temperature.out", None)
        );
    }

    #[test]
    fn test_parse_aggregate_name() {
        assert_eq!(
            parse_aggregation("motion.60s.count"),
            ("motion", Some((AggKind::Count, 60)))
        );
        assert_eq!(
            parse_aggregation("airflow.temperature.out.3600s.mean"),
            ("airflow.temperature.out", Some((AggKind::Mean, 3600)))
        );
    }

    #[test]
    fn test_parse_near_miss_suffixes() {
        // Wrong kind, missing 's', non-numeric period: all raw names.
        assert_eq!(parse_aggregation("motion.60s.median"), ("motion.60s.median", None));
        assert_eq!(parse_aggregation("motion.60.count"), ("motion.60.count", None));
        assert_eq!(parse_aggregation("motion.xs.count"), ("motion.xs.count", None));
        assert_eq!(parse_aggregation("60s.mean"), ("60s.mean", None));
    }

    #[test]
    fn test_name_round_trip() {
        for kind in AGGREGATE_KINDS {
            let name = aggregate_metric_name("weight", kind, 600);
            assert_eq!(parse_aggregation(&name), ("weight", Some((kind, 600))));
        }
    }

    #[test]
    fn test_all_aggregate_names() {
        let names = all_aggregate_names("motion", 60);
        assert_eq!(names.len(), AGGREGATE_KINDS.len());
        assert!(names.contains(&"motion.60s.sd".to_string()));
    }
}
