//! Deterministic object-key naming and partitioning.
//!
//! Every bucket of points maps one-to-one onto a key of the form
//!
//! ```text
//! <reversed_source>/<YYYY>/<MM>/<DD>[/aggregate]/<HH>-<MM>-<base>[-<width>s]-<uniquifier>.metrics
//! ```
//!
//! The source id is sanitized and *reversed* so that lexically-adjacent
//! sources land far apart in the store's key space, spreading partition
//! load. The write-time uniquifier makes the model append-only: a bucket
//! accumulates keys over time, and lexicographic key order is write order.

use crate::{Error, Result};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Path separator within a key's file name. Forbidden in source ids and
/// metric names.
pub const SEPARATOR: char = '-';

/// File extension for metric objects.
pub const METRICS_EXT: &str = ".metrics";

/// Bucket widths, in seconds, for aggregate data. Raw and sub-10-minute
/// aggregate data shares the narrowest width.
pub const BUCKET_WIDTHS: [u32; 3] = [600, 3600, 21600];

// Bucket widths must tile a UTC day exactly; truncation depends on it.
const _: () = {
    assert!(86_400 % BUCKET_WIDTHS[0] == 0);
    assert!(86_400 % BUCKET_WIDTHS[1] == 0);
    assert!(86_400 % BUCKET_WIDTHS[2] == 0);
};

const MS_PER_DAY: i64 = 86_400_000;

/// The key components of one storage bucket, split so local staging can use
/// the directory and file name separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPath {
    pub directory: String,
    pub file_name: String,
}

impl BucketPath {
    /// The object-store key (without the write-time uniquifier).
    pub fn key(&self) -> String {
        format!("{}/{}", self.directory, self.file_name)
    }
}

/// Fields recovered from an object key by [`parse_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub source_id: String,
    pub start_ms: i64,
    pub base_metric_name: String,
    pub is_aggregate: bool,
    pub width_seconds: u32,
}

/// The storage bucket width for a series.
///
/// Aggregates at canonical widths get their own bucket width; everything
/// else (raw data, 60s aggregates) is grouped into 10-minute buckets.
///
/// # Panics
///
/// An aggregate period of 600s or more that is not a canonical bucket width
/// is a precondition violation.
pub fn bucket_width(period_seconds: Option<u32>, is_aggregate: bool) -> u32 {
    match period_seconds {
        Some(period) if is_aggregate && period >= BUCKET_WIDTHS[0] => {
            assert!(
                BUCKET_WIDTHS.contains(&period),
                "unexpected aggregation level {}, expected one of {:?}",
                period,
                BUCKET_WIDTHS
            );
            period
        }
        _ => BUCKET_WIDTHS[0],
    }
}

/// Floors a timestamp, within its UTC calendar day, to the nearest multiple
/// of `width_seconds` past midnight.
pub fn truncate_to_bucket_start(timestamp_ms: i64, width_seconds: u32) -> i64 {
    // UTC days are a fixed 86400s, so day boundaries are pure arithmetic.
    let day_start = timestamp_ms.div_euclid(MS_PER_DAY) * MS_PER_DAY;
    let width_ms = i64::from(width_seconds) * 1000;
    day_start + ((timestamp_ms - day_start) / width_ms) * width_ms
}

/// Bucket path for a metric name (aggregation suffix honored) at a time.
pub fn bucket_path_for_metric(
    metric_name: &str,
    source_id: &str,
    timestamp_ms: i64,
) -> BucketPath {
    let (base, aggregation) = crate::schema::parse_aggregation(metric_name);
    bucket_path(
        source_id,
        timestamp_ms,
        base,
        aggregation.is_some(),
        aggregation.map(|(_, period)| period),
    )
}

/// Bucket path for explicit components.
///
/// # Panics
///
/// `source_id` and `base_name` must not contain the path separator `-`.
pub fn bucket_path(
    source_id: &str,
    start_ms: i64,
    base_name: &str,
    is_aggregate: bool,
    period_seconds: Option<u32>,
) -> BucketPath {
    assert!(
        !source_id.contains(SEPARATOR) && !base_name.contains(SEPARATOR),
        "source id '{}' and metric name '{}' must not contain '{}'",
        source_id,
        base_name,
        SEPARATOR
    );
    let width = bucket_width(period_seconds, is_aggregate);
    let start = truncate_to_bucket_start(start_ms, width);
    let start: DateTime<Utc> =
        DateTime::from_timestamp_millis(start).expect("bucket start out of representable range");

    let sanitized: String = source_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '(' | ')' | ' '))
        .collect();
    let source_component: String = if sanitized.is_empty() {
        "NO_SOURCE".to_string()
    } else {
        sanitized.chars().rev().collect()
    };

    let mut directory = format!(
        "{}/{}/{:02}/{:02}",
        source_component,
        start.year(),
        start.month(),
        start.day()
    );
    let mut file_name = format!("{:02}-{:02}-{}", start.hour(), start.minute(), base_name);
    if is_aggregate {
        directory.push_str("/aggregate");
        file_name.push_str(&format!("-{}s", width));
    }

    BucketPath { directory, file_name }
}

/// Key prefix covering every object ever written for one bucket.
///
/// The trailing separator distinguishes metrics sharing a name prefix
/// (querying `motion` must not pick up `motion.test` keys).
pub fn key_prefix(
    source_id: &str,
    base_name: &str,
    is_aggregate: bool,
    bucket_start_ms: i64,
    width_seconds: u32,
) -> String {
    let path = bucket_path(
        source_id,
        bucket_start_ms,
        base_name,
        is_aggregate,
        Some(width_seconds),
    );
    format!("{}{}", path.key(), SEPARATOR)
}

/// Inverse of [`bucket_path`]: recovers bucket fields from an object key.
///
/// Tolerates any trailing `-`-delimited suffix (the write-time uniquifier)
/// after the semantic file-name components.
pub fn parse_key(key: &str) -> Result<ParsedKey> {
    let components: Vec<&str> = key.split('/').collect();
    let malformed = || Error::Format(format!("unparsable metric key '{}'", key));
    if components.len() < 2 {
        return Err(malformed());
    }

    let file_name = components[components.len() - 1];
    let is_aggregate = components[components.len() - 2] == "aggregate";
    let date_components = if is_aggregate {
        if components.len() < 6 {
            return Err(malformed());
        }
        &components[components.len() - 6..components.len() - 2]
    } else {
        if components.len() < 5 {
            return Err(malformed());
        }
        &components[components.len() - 5..components.len() - 1]
    };

    let source_id: String = date_components[0].chars().rev().collect();
    let year: i32 = date_components[1].parse().map_err(|_| malformed())?;
    let month: u32 = date_components[2].parse().map_err(|_| malformed())?;
    let day: u32 = date_components[3].parse().map_err(|_| malformed())?;

    let name_components: Vec<&str> = file_name.split(SEPARATOR).collect();
    if name_components.len() < 3 {
        return Err(malformed());
    }
    let hour: u32 = name_components[0].parse().map_err(|_| malformed())?;
    let minute: u32 = name_components[1].parse().map_err(|_| malformed())?;
    let base_metric_name = name_components[2].to_string();

    let mut width_seconds = BUCKET_WIDTHS[0];
    if is_aggregate {
        // Aggregate file names carry their bucket width as a 4th component.
        if name_components.len() < 4 {
            return Err(malformed());
        }
        let width_component = name_components[3];
        width_seconds = width_component
            .strip_suffix('s')
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(malformed)?;
    }

    let start = Utc
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .ok_or_else(malformed)?;

    Ok(ParsedKey {
        source_id,
        start_ms: start.timestamp_millis(),
        base_metric_name,
        is_aggregate,
        width_seconds,
    })
}

/// The narrowest aggregate bucket width.
pub fn first_aggregated_width() -> u32 {
    BUCKET_WIDTHS[0]
}

/// The next-finer aggregate bucket width, or `None` at the bottom rung.
pub fn prev_aggregated_width(width_seconds: u32) -> Option<u32> {
    let index = BUCKET_WIDTHS.iter().position(|&w| w == width_seconds)?;
    index.checked_sub(1).map(|i| BUCKET_WIDTHS[i])
}

/// The next-coarser aggregate bucket width, or `None` at the top rung.
pub fn next_aggregated_width(width_seconds: u32) -> Option<u32> {
    let index = BUCKET_WIDTHS.iter().position(|&w| w == width_seconds)?;
    BUCKET_WIDTHS.get(index + 1).copied()
}

/// Extracts the write-time uniquifier from a full object key.
pub fn creation_suffix(key: &str) -> Result<&str> {
    let suffix = key
        .rfind(SEPARATOR)
        .map(|idx| &key[idx + 1..])
        .ok_or_else(|| Error::Format(format!("key '{}' has no uniquifier suffix", key)))?;
    suffix
        .strip_suffix(METRICS_EXT)
        .ok_or_else(|| Error::Format(format!("key '{}' does not end in {}", key, METRICS_EXT)))
}
