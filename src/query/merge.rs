//! Merge accumulator for the read path.
//!
//! Fetched objects are folded into a three-level structure
//! (metric name, then tag combination, then timestamp), processing keys in
//! ascending lexicographic order so that, for one (metric, tags, timestamp),
//! the last-written value wins.

use crate::protocol::{LineReader, Record, TagSelection};
use crate::schema::{MetricRow, TagSet, Value};
use crate::Result;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::BufRead;

/// Values for one tag combination, ordered by timestamp.
pub(crate) type SeriesMap = BTreeMap<i64, Value>;

/// `metric name → tag combination → timestamp → value`
pub(crate) type Accumulator = HashMap<String, HashMap<TagSet, SeriesMap>>;

/// Which tag combination each accumulated point is grouped under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupSpec {
    /// Group everything together under the empty tag set
    NoTags,
    /// Group by the listed tag keys (intersection with each point's tags)
    Keys(BTreeSet<String>),
    /// A group per full tag combination
    AllTags,
}

/// How records are read, grouped, and filtered during a merge.
#[derive(Debug, Clone)]
pub(crate) struct MergeSpec {
    pub group: GroupSpec,
    /// Points must carry every listed tag/value pair
    pub filter: TagSet,
    /// Restrict to these metric names (`None` accepts every metric)
    pub metric_names: Option<HashSet<String>>,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl MergeSpec {
    /// The reader-side tag selection implied by grouping and filtering:
    /// whatever grouping needs, plus the filter keys. Skips tag parsing
    /// entirely when nobody cares.
    pub fn tag_selection(&self) -> TagSelection {
        match &self.group {
            GroupSpec::AllTags => TagSelection::All,
            GroupSpec::Keys(keys) => {
                let mut wanted: HashSet<String> = keys.iter().cloned().collect();
                wanted.extend(self.filter.keys().cloned());
                TagSelection::Keys(wanted)
            }
            GroupSpec::NoTags => {
                if self.filter.is_empty() {
                    TagSelection::Skip
                } else {
                    TagSelection::Keys(self.filter.keys().cloned().collect())
                }
            }
        }
    }

    fn accepts(&self, record: &Record) -> bool {
        if record.timestamp < self.start_ms || record.timestamp >= self.end_ms {
            return false;
        }
        if let Some(names) = &self.metric_names {
            if !names.contains(&record.name) {
                return false;
            }
        }
        self.filter
            .iter()
            .all(|(key, value)| record.tags.get(key) == Some(value))
    }

    fn tag_combination(&self, record: &Record) -> TagSet {
        match &self.group {
            GroupSpec::NoTags => TagSet::new(),
            GroupSpec::AllTags => record.tags.clone(),
            GroupSpec::Keys(keys) => record
                .tags
                .iter()
                .filter(|(key, _)| keys.contains(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Folds one object's records into the accumulator. Later calls shadow
/// earlier ones per (metric, tag combination, timestamp), so callers must
/// present objects in ascending key order.
pub(crate) fn accumulate_object<R: BufRead>(
    input: R,
    origin: &str,
    spec: &MergeSpec,
    accumulator: &mut Accumulator,
) -> Result<()> {
    let mut reader = LineReader::new(input, spec.tag_selection()).with_origin(origin);
    while let Some(record) = reader.read_record()? {
        if !spec.accepts(&record) {
            continue;
        }
        let combination = spec.tag_combination(&record);
        accumulator
            .entry(record.name)
            .or_default()
            .entry(combination)
            .or_default()
            .insert(record.timestamp, record.value);
    }
    Ok(())
}

/// Flattens the accumulator into rows, values sorted ascending by
/// timestamp, rows ordered by (metric name, tags) for determinism.
pub(crate) fn into_rows(accumulator: Accumulator) -> Vec<MetricRow> {
    let mut rows = Vec::new();
    for (metric_name, combinations) in accumulator {
        for (tags, series) in combinations {
            rows.push(MetricRow {
                metric_name: metric_name.clone(),
                tags,
                values: series
                    .into_iter()
                    .map(|(timestamp, value)| crate::schema::DataPoint { timestamp, value })
                    .collect(),
            });
        }
    }
    rows.sort_by(|a, b| (&a.metric_name, &a.tags).cmp(&(&b.metric_name, &b.tags)));
    rows
}

/// Inverse of [`into_rows`], for diffing datasets.
pub(crate) fn from_rows(rows: &[MetricRow]) -> Accumulator {
    let mut accumulator = Accumulator::new();
    for row in rows {
        let series = accumulator
            .entry(row.metric_name.clone())
            .or_default()
            .entry(row.tags.clone())
            .or_default();
        for point in &row.values {
            series.insert(point.timestamp, point.value.clone());
        }
    }
    accumulator
}

/// The rows that transform `current` into `desired`: every point missing
/// from `current`, plus points whose values differ beyond [`is_close`]
/// tolerance.
///
/// [`is_close`]: crate::schema::is_close
pub fn create_patch(desired: &[MetricRow], current: &[MetricRow]) -> Vec<MetricRow> {
    let desired = from_rows(desired);
    let current = from_rows(current);
    let mut patch = Accumulator::new();

    for (metric_name, desired_combinations) in &desired {
        let current_combinations = current.get(metric_name);
        for (tags, desired_series) in desired_combinations {
            if desired_series.is_empty() {
                continue;
            }
            let patch_series = patch
                .entry(metric_name.clone())
                .or_default()
                .entry(tags.clone())
                .or_default();
            let current_series = current_combinations.and_then(|c| c.get(tags));
            for (timestamp, desired_value) in desired_series {
                let keep = match current_series.and_then(|s| s.get(timestamp)) {
                    None => true,
                    Some(current_value) => !desired_value.is_close_to(current_value),
                };
                if keep {
                    patch_series.insert(*timestamp, desired_value.clone());
                }
            }
        }
    }

    into_rows(patch)
}
