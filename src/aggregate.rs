//! Multi-resolution rollup engine.
//!
//! Two entry points: [`aggregate_raw`] rolls raw points up into fixed
//! windows, and [`aggregate_rollups`] re-aggregates existing rollups into a
//! coarser window. Seven statistic kinds plus `sum` are supported; `sd` is
//! the population standard deviation, combined hierarchically with the
//! parallel-variance formula so coarse levels never need the raw points.
//!
//! Windows are right-open and aligned to the query's start time. A point
//! with a non-numeric value counts toward `count` and can be a `first` or
//! `last`, but is excluded from `sum`/`max`/`min`, and its window reports no
//! `mean` or `sd` at all. That asymmetry (partial vs. full exclusion) is
//! deliberate and load-bearing for rollup re-aggregation: a `count` without
//! a matching `mean` is how coarser levels detect non-numeric windows.

use crate::schema::{
    aggregate_metric_name, parse_aggregation, AggKind, DataPoint, MetricRow, TagSet, Value,
};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// The canonical rollup periods, in seconds, ascending. Every coarser level
/// is computable from the next-finer one.
pub const AGGREGATION_LEVELS: [u32; 4] = [60, 600, 3600, 21600];

/// Child statistic series required to re-aggregate each kind.
///
/// `mean` needs the child `mean` as well: its absence alongside a `count`
/// marks a child window that contained non-numeric values, which would
/// otherwise silently skew the parent.
pub fn prerequisite_kinds(kind: AggKind) -> &'static [AggKind] {
    match kind {
        AggKind::Mean => &[AggKind::Sum, AggKind::Count, AggKind::Mean],
        AggKind::Sd => &[AggKind::Sd, AggKind::Mean, AggKind::Count],
        AggKind::Max => &[AggKind::Max],
        AggKind::Min => &[AggKind::Min],
        AggKind::Count => &[AggKind::Count],
        AggKind::Sum => &[AggKind::Sum],
        AggKind::First => &[AggKind::First],
        AggKind::Last => &[AggKind::Last],
    }
}

/// The longest canonical level not exceeding the requested aggregation.
///
/// # Panics
///
/// Aggregations shorter than the finest canonical level cannot be served
/// from rollups.
pub fn shorter_preaggregation_length(aggregation_seconds: u32) -> u32 {
    assert!(
        aggregation_seconds >= AGGREGATION_LEVELS[0],
        "cannot aggregate from rollups shorter than {} seconds",
        AGGREGATION_LEVELS[0]
    );
    AGGREGATION_LEVELS
        .iter()
        .rev()
        .find(|&&level| aggregation_seconds >= level)
        .copied()
        .unwrap_or(AGGREGATION_LEVELS[0])
}

/// Rows are merged per (base metric name, full tag set).
type MergeKey = (String, TagSet);

fn merge_key(row: &MetricRow) -> MergeKey {
    let (base, _) = parse_aggregation(&row.metric_name);
    (base.to_string(), row.tags.clone())
}

/// Floors a timestamp to its window start, aligned to the query start.
fn round_down(timestamp_ms: i64, start_ms: i64, aggregation_seconds: u32) -> i64 {
    let window_ms = i64::from(aggregation_seconds) * 1000;
    start_ms + ((timestamp_ms - start_ms) / window_ms) * window_ms
}

/// Per-statistic accumulators, keyed by merge key then window start.
///
/// Presence in the outer map doubles as registration: a merge key appears in
/// a kind's output exactly when its accumulator was touched, so a key with
/// no datapoints still yields empty rows for every kind it registered.
#[derive(Default)]
struct AggState {
    counts: HashMap<MergeKey, BTreeMap<i64, f64>>,
    sums: HashMap<MergeKey, BTreeMap<i64, f64>>,
    maxes: HashMap<MergeKey, BTreeMap<i64, f64>>,
    mins: HashMap<MergeKey, BTreeMap<i64, f64>>,
    firsts: HashMap<MergeKey, BTreeMap<i64, (i64, Value)>>,
    lasts: HashMap<MergeKey, BTreeMap<i64, (i64, Value)>>,
    /// Windows known to contain (or derive from) non-numeric values
    non_numeric: HashMap<MergeKey, BTreeSet<i64>>,
}

impl AggState {
    fn all_numeric(&self, key: &MergeKey, window: i64) -> bool {
        !self
            .non_numeric
            .get(key)
            .map_or(false, |windows| windows.contains(&window))
    }
}

fn record_first(slot: &mut BTreeMap<i64, (i64, Value)>, window: i64, ts: i64, value: &Value) {
    match slot.get(&window) {
        Some((existing, _)) if *existing <= ts => {}
        _ => {
            slot.insert(window, (ts, value.clone()));
        }
    }
}

fn record_last(slot: &mut BTreeMap<i64, (i64, Value)>, window: i64, ts: i64, value: &Value) {
    match slot.get(&window) {
        Some((existing, _)) if ts <= *existing => {}
        _ => {
            slot.insert(window, (ts, value.clone()));
        }
    }
}

fn sorted_keys<V>(map: &HashMap<MergeKey, V>) -> Vec<&MergeKey> {
    let mut keys: Vec<&MergeKey> = map.keys().collect();
    keys.sort();
    keys
}

/// Rolls raw rows up into `dest_seconds` windows over `[start_ms, end_ms)`.
///
/// Every input row yields one output row per requested kind (empty when the
/// row had no in-range points), named `<base>.<dest>s.<kind>`.
///
/// # Panics
///
/// Input rows must be raw, unaggregated metrics; use [`aggregate_rollups`]
/// for re-aggregation.
pub fn aggregate_raw(
    data: &[MetricRow],
    start_ms: i64,
    end_ms: i64,
    kinds: &[AggKind],
    dest_seconds: u32,
) -> Vec<MetricRow> {
    let mut state = AggState::default();

    for row in data {
        let (_, aggregation) = parse_aggregation(&row.metric_name);
        assert!(
            aggregation.is_none(),
            "aggregate_raw only accepts unaggregated rows, got '{}'",
            row.metric_name
        );
        let key = merge_key(row);

        // Register every statistic for this key up front so empty series
        // still produce (empty) result rows.
        let counts = state.counts.entry(key.clone()).or_default();
        let sums = state.sums.entry(key.clone()).or_default();
        let maxes = state.maxes.entry(key.clone()).or_default();
        let mins = state.mins.entry(key.clone()).or_default();
        let firsts = state.firsts.entry(key.clone()).or_default();
        let lasts = state.lasts.entry(key.clone()).or_default();
        let non_numeric = state.non_numeric.entry(key.clone()).or_default();

        for point in &row.values {
            if point.timestamp < start_ms || point.timestamp >= end_ms {
                continue;
            }
            let window = round_down(point.timestamp, start_ms, dest_seconds);
            *counts.entry(window).or_insert(0.0) += 1.0;
            record_first(firsts, window, point.timestamp, &point.value);
            record_last(lasts, window, point.timestamp, &point.value);
            match point.value.as_f64() {
                Some(number) => {
                    *sums.entry(window).or_insert(0.0) += number;
                    maxes
                        .entry(window)
                        .and_modify(|m| *m = m.max(number))
                        .or_insert(number);
                    mins.entry(window)
                        .and_modify(|m| *m = m.min(number))
                        .or_insert(number);
                }
                None => {
                    non_numeric.insert(window);
                }
            }
        }
    }

    let mut results = prepare_results(kinds, dest_seconds, &state);

    if kinds.contains(&AggKind::Sd) {
        // Second pass: accumulate squared deviation from each window's mean.
        let mut variances: HashMap<MergeKey, BTreeMap<i64, f64>> = HashMap::new();
        for row in data {
            let key = merge_key(row);
            let key_variances = variances.entry(key.clone()).or_default();
            let (Some(sums), Some(counts)) = (state.sums.get(&key), state.counts.get(&key))
            else {
                continue;
            };
            for point in &row.values {
                if point.timestamp < start_ms || point.timestamp >= end_ms {
                    continue;
                }
                if let Some(number) = point.value.as_f64() {
                    let window = round_down(point.timestamp, start_ms, dest_seconds);
                    let (Some(sum), Some(count)) = (sums.get(&window), counts.get(&window))
                    else {
                        continue;
                    };
                    let diff = number - sum / count;
                    *key_variances.entry(window).or_insert(0.0) += diff * diff;
                }
            }
        }

        for key in sorted_keys(&variances) {
            let key_variances = &variances[key];
            let mut values = Vec::new();
            for (window, variance) in key_variances {
                if !state.all_numeric(key, *window) {
                    continue;
                }
                if let Some(count) = state.counts.get(key).and_then(|c| c.get(window)) {
                    values.push(DataPoint::num(*window, (variance / count).sqrt()));
                }
            }
            results.push(MetricRow {
                metric_name: aggregate_metric_name(&key.0, AggKind::Sd, dest_seconds),
                tags: key.1.clone(),
                values,
            });
        }
    }

    results
}

/// Re-aggregates rollup rows into coarser `dest_seconds` windows.
///
/// Input rows must carry aggregation suffixes; each target kind consumes
/// the child series listed by [`prerequisite_kinds`] and ignores the rest.
/// Rows whose prerequisites are missing produce partial or empty output
/// (with a warning) rather than failing the whole call.
pub fn aggregate_rollups(
    rows: &[MetricRow],
    kinds: &[AggKind],
    dest_seconds: u32,
    start_ms: i64,
    end_ms: i64,
) -> Vec<MetricRow> {
    let mut state = AggState::default();
    // Child-window statistics indexed by the child's own timestamp, kept for
    // the variance combination and the numeric-completeness check.
    let mut old_counts: HashMap<MergeKey, BTreeMap<i64, f64>> = HashMap::new();
    let mut old_means: HashMap<MergeKey, BTreeMap<i64, f64>> = HashMap::new();

    let in_range = |ts: i64| ts >= start_ms && ts < end_ms;

    for row in rows {
        let (_, aggregation) = parse_aggregation(&row.metric_name);
        let Some((child_kind, _)) = aggregation else {
            continue;
        };
        let key = merge_key(row);
        match child_kind {
            AggKind::Count => {
                let counts = state.counts.entry(key.clone()).or_default();
                let key_old_counts = old_counts.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    if let Some(number) = point.value.as_f64() {
                        key_old_counts.insert(point.timestamp, number);
                        let window = round_down(point.timestamp, start_ms, dest_seconds);
                        *counts.entry(window).or_insert(0.0) += number;
                    }
                }
            }
            AggKind::Sum => {
                let sums = state.sums.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    if let Some(number) = point.value.as_f64() {
                        let window = round_down(point.timestamp, start_ms, dest_seconds);
                        *sums.entry(window).or_insert(0.0) += number;
                    }
                }
            }
            AggKind::Max => {
                let maxes = state.maxes.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    if let Some(number) = point.value.as_f64() {
                        let window = round_down(point.timestamp, start_ms, dest_seconds);
                        maxes
                            .entry(window)
                            .and_modify(|m| *m = m.max(number))
                            .or_insert(number);
                    }
                }
            }
            AggKind::Min => {
                let mins = state.mins.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    if let Some(number) = point.value.as_f64() {
                        let window = round_down(point.timestamp, start_ms, dest_seconds);
                        mins.entry(window)
                            .and_modify(|m| *m = m.min(number))
                            .or_insert(number);
                    }
                }
            }
            AggKind::First => {
                let firsts = state.firsts.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    let window = round_down(point.timestamp, start_ms, dest_seconds);
                    record_first(firsts, window, point.timestamp, &point.value);
                }
            }
            AggKind::Last => {
                let lasts = state.lasts.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    let window = round_down(point.timestamp, start_ms, dest_seconds);
                    record_last(lasts, window, point.timestamp, &point.value);
                }
            }
            AggKind::Mean => {
                let key_old_means = old_means.entry(key.clone()).or_default();
                for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                    if let Some(number) = point.value.as_f64() {
                        key_old_means.insert(point.timestamp, number);
                    }
                }
            }
            // Standard deviations need the other statistics accumulated
            // first; handled in the dedicated pass below.
            AggKind::Sd => {}
        }
    }

    // A child `count` with no matching `mean` means that child window held
    // non-numeric values; the parent window inherits non-completeness.
    for (key, key_old_counts) in &old_counts {
        let key_old_means = old_means.entry(key.clone()).or_default();
        for child_ts in key_old_counts.keys() {
            if !key_old_means.contains_key(child_ts) {
                let window = round_down(*child_ts, start_ms, dest_seconds);
                state.non_numeric.entry(key.clone()).or_default().insert(window);
            }
        }
    }

    let mut results = prepare_results(kinds, dest_seconds, &state);

    if kinds.contains(&AggKind::Sd) {
        let mut variance_numerators: HashMap<MergeKey, BTreeMap<i64, f64>> = HashMap::new();
        for row in rows {
            let (_, aggregation) = parse_aggregation(&row.metric_name);
            if aggregation.map(|(kind, _)| kind) != Some(AggKind::Sd) {
                continue;
            }
            let key = merge_key(row);
            let numerators = variance_numerators.entry(key.clone()).or_default();
            for point in row.values.iter().filter(|p| in_range(p.timestamp)) {
                let Some(child_sd) = point.value.as_f64() else {
                    continue;
                };
                let window = round_down(point.timestamp, start_ms, dest_seconds);
                let parent_mean = match (
                    state.sums.get(&key).and_then(|m| m.get(&window)),
                    state.counts.get(&key).and_then(|m| m.get(&window)),
                ) {
                    (Some(sum), Some(count)) if *count != 0.0 => sum / count,
                    _ => {
                        warn!(
                            metric = %row.metric_name,
                            window,
                            "sd re-aggregation is missing sum/count prerequisites, skipping window"
                        );
                        continue;
                    }
                };
                let child_count = old_counts
                    .get(&key)
                    .and_then(|m| m.get(&point.timestamp))
                    .copied()
                    .unwrap_or(0.0);
                let child_mean = old_means
                    .get(&key)
                    .and_then(|m| m.get(&point.timestamp))
                    .copied()
                    .unwrap_or(0.0);
                *numerators.entry(window).or_insert(0.0) +=
                    variance_numerator_term(child_sd, child_count, child_mean, parent_mean);
            }
        }

        for key in sorted_keys(&variance_numerators) {
            let mut values = Vec::new();
            for (window, numerator) in &variance_numerators[key] {
                match state.counts.get(key).and_then(|m| m.get(window)) {
                    Some(count) if *count != 0.0 => {
                        values.push(DataPoint::num(*window, (numerator / count).sqrt()));
                    }
                    _ => {}
                }
            }
            results.push(MetricRow {
                metric_name: aggregate_metric_name(&key.0, AggKind::Sd, dest_seconds),
                tags: key.1.clone(),
                values,
            });
        }
    }

    results
}

/// One child window's contribution to the parent variance numerator:
/// `count * sd^2 + count * (mean_child - mean_parent)^2`.
fn variance_numerator_term(
    child_sd: f64,
    child_count: f64,
    child_mean: f64,
    parent_mean: f64,
) -> f64 {
    let mean_diff = child_mean - parent_mean;
    child_sd * child_sd * child_count + child_count * mean_diff * mean_diff
}

/// Emits result rows for every kind except `sd` (which needs its own pass).
fn prepare_results(kinds: &[AggKind], dest_seconds: u32, state: &AggState) -> Vec<MetricRow> {
    let mut results = Vec::new();
    let emit = |results: &mut Vec<MetricRow>, key: &MergeKey, kind: AggKind, values| {
        results.push(MetricRow {
            metric_name: aggregate_metric_name(&key.0, kind, dest_seconds),
            tags: key.1.clone(),
            values,
        });
    };

    if kinds.contains(&AggKind::Count) {
        for key in sorted_keys(&state.counts) {
            let values = state.counts[key]
                .iter()
                .map(|(w, count)| DataPoint::num(*w, *count))
                .collect();
            emit(&mut results, key, AggKind::Count, values);
        }
    }
    if kinds.contains(&AggKind::Sum) {
        for key in sorted_keys(&state.sums) {
            let values = state.sums[key]
                .iter()
                .map(|(w, sum)| DataPoint::num(*w, *sum))
                .collect();
            emit(&mut results, key, AggKind::Sum, values);
        }
    }
    if kinds.contains(&AggKind::Max) {
        for key in sorted_keys(&state.maxes) {
            let values = state.maxes[key]
                .iter()
                .map(|(w, max)| DataPoint::num(*w, *max))
                .collect();
            emit(&mut results, key, AggKind::Max, values);
        }
    }
    if kinds.contains(&AggKind::Min) {
        for key in sorted_keys(&state.mins) {
            let values = state.mins[key]
                .iter()
                .map(|(w, min)| DataPoint::num(*w, *min))
                .collect();
            emit(&mut results, key, AggKind::Min, values);
        }
    }
    if kinds.contains(&AggKind::Mean) {
        for key in sorted_keys(&state.sums) {
            let sums = &state.sums[key];
            let mut values = Vec::new();
            for (window, sum) in sums {
                // A window with non-numeric values has an unusable count, so
                // it gets no mean at all.
                if !state.all_numeric(key, *window) {
                    continue;
                }
                match state.counts.get(key).and_then(|c| c.get(window)) {
                    Some(count) if *count != 0.0 => {
                        values.push(DataPoint::num(*window, sum / count));
                    }
                    _ => {
                        warn!(
                            metric = %key.0,
                            window,
                            "sum without matching count, skipping window"
                        );
                    }
                }
            }
            emit(&mut results, key, AggKind::Mean, values);
        }
    }
    if kinds.contains(&AggKind::First) {
        for key in sorted_keys(&state.firsts) {
            let values = state.firsts[key]
                .values()
                .map(|(ts, value)| DataPoint::new(*ts, value.clone()))
                .collect();
            emit(&mut results, key, AggKind::First, values);
        }
    }
    if kinds.contains(&AggKind::Last) {
        for key in sorted_keys(&state.lasts) {
            let values = state.lasts[key]
                .values()
                .map(|(ts, value)| DataPoint::new(*ts, value.clone()))
                .collect();
            emit(&mut results, key, AggKind::Last, values);
        }
    }

    results
}
