// chronicle_core/src/query/mod.rs
//
// Query adapter: matchers in, matrices out.
//
// The adapter owns no storage. It resolves matchers to series through
// the engine's index, pulls raw ranges, and shapes them for the two
// Prometheus-style query forms: instant (latest sample at or before a
// timestamp) and range (the series sampled at step boundaries, each
// point being the most recent sample within the lookback window).
// Failures propagate; a matrix is never partially filled.

use std::sync::Arc;

use crate::engine::{Deadline, StorageEngine};
use crate::error::{ChronicleError, Result};
use crate::index::Matcher;
use crate::types::{LabelSet, Sample};

/// One series' latest sample at an instant.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub labels: LabelSet,
    pub sample: Sample,
}

/// One series' step-aligned samples over a range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

/// A range-query result: one entry per matched series that produced
/// at least one point, ordered by canonical label form.
pub type Matrix = Vec<RangeSeries>;

pub struct QueryAdapter {
    engine: Arc<StorageEngine>,
}

impl QueryAdapter {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// Latest sample per matched series with
    /// `at - lookback <= ts <= at`. Series with nothing in the window
    /// are omitted.
    pub fn instant(
        &self,
        matchers: &[Matcher],
        at_ms: i64,
        deadline: &Deadline,
    ) -> Result<Vec<InstantSample>> {
        deadline.check()?;
        let lookback = self.engine.config().lookback_ms;
        let window_start = at_ms.saturating_sub(lookback);

        let mut out = Vec::new();
        for (_, labels) in self.engine.match_series(matchers)? {
            let samples = self
                .engine
                .read_with_deadline(&labels, window_start, at_ms, deadline)?;
            if let Some(sample) = samples.last() {
                out.push(InstantSample { labels, sample: *sample });
            }
        }
        sort_by_labels(&mut out, |entry| &entry.labels);
        Ok(out)
    }

    /// Sample each matched series at `start, start+step, ..., <= end`.
    /// Each point takes the most recent raw sample at or before the
    /// step timestamp, no older than the lookback window. Series with
    /// no points in range are omitted.
    pub fn range(
        &self,
        matchers: &[Matcher],
        start: i64,
        mut end: i64,
        step: i64,
        deadline: &Deadline,
    ) -> Result<Matrix> {
        deadline.check()?;
        if step <= 0 {
            return Err(ChronicleError::invalid("query step must be positive"));
        }
        if end < start {
            end = start;
        }
        let lookback = self.engine.config().lookback_ms;

        let mut matrix = Matrix::new();
        for (_, labels) in self.engine.match_series(matchers)? {
            deadline.check()?;
            // Raw window reaches back one lookback before `start` so
            // the first step can still see a recent sample.
            let raw = self.engine.read_with_deadline(
                &labels,
                start.saturating_sub(lookback),
                end,
                deadline,
            )?;
            if raw.is_empty() {
                continue;
            }

            let mut samples = Vec::new();
            let mut t = start;
            while t <= end {
                if let Some(value) = value_at(&raw, t, lookback) {
                    samples.push(Sample::new(t, value));
                }
                let Some(next) = t.checked_add(step) else {
                    break;
                };
                t = next;
            }
            if !samples.is_empty() {
                matrix.push(RangeSeries { labels, samples });
            }
        }
        sort_by_labels(&mut matrix, |entry| &entry.labels);
        Ok(matrix)
    }
}

/// Most recent raw value at or before `t`, no older than `lookback`.
/// `raw` is sorted ascending by timestamp.
fn value_at(raw: &[Sample], t: i64, lookback: i64) -> Option<f64> {
    let idx = raw.partition_point(|s| s.timestamp <= t);
    if idx == 0 {
        return None;
    }
    let candidate = raw[idx - 1];
    if candidate.timestamp >= t.saturating_sub(lookback) {
        Some(candidate.value)
    } else {
        None
    }
}

fn sort_by_labels<T>(entries: &mut [T], labels_of: impl Fn(&T) -> &LabelSet) {
    entries.sort_by(|a, b| labels_of(a).canonical().cmp(labels_of(b).canonical()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::error::ErrorKind;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().copied()).unwrap()
    }

    /// Engine with three `up` series (zones a/b/c), scraped every 10s
    /// from t=0 to t=100s, values = zone index + t/1000.
    fn adapter() -> QueryAdapter {
        let engine = Arc::new(StorageEngine::new(EngineConfig::default()));
        for (i, zone) in ["a", "b", "c"].iter().enumerate() {
            let set = labels(&[("__name__", "up"), ("zone", zone)]);
            let samples: Vec<Sample> = (0..=10)
                .map(|k| Sample::new(k * 10_000, i as f64 + k as f64 * 10.0))
                .collect();
            engine.write(&set, &samples).unwrap();
        }
        QueryAdapter::new(engine)
    }

    #[test]
    fn test_instant_latest_at_or_before() {
        let adapter = adapter();
        let got = adapter
            .instant(&[Matcher::eq("zone", "a")], 25_000, &Deadline::none())
            .unwrap();
        assert_eq!(got.len(), 1);
        // Latest sample at or before 25s is the 20s scrape.
        assert_eq!(got[0].sample.timestamp, 20_000);
        assert_eq!(got[0].sample.value, 20.0);
    }

    #[test]
    fn test_instant_respects_lookback() {
        let adapter = adapter();
        // 100s past the last scrape but within the 5m lookback.
        let got = adapter
            .instant(&[Matcher::eq("zone", "a")], 200_000, &Deadline::none())
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sample.timestamp, 100_000);

        // Far beyond the lookback: nothing.
        let got = adapter
            .instant(&[Matcher::eq("zone", "a")], 1_000_000, &Deadline::none())
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_range_step_alignment() {
        let adapter = adapter();
        let matrix = adapter
            .range(&[Matcher::eq("zone", "b")], 0, 100_000, 25_000, &Deadline::none())
            .unwrap();
        assert_eq!(matrix.len(), 1);
        let ts: Vec<i64> = matrix[0].samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![0, 25_000, 50_000, 75_000, 100_000]);
        // Step points carry the most recent raw value at or before them.
        assert_eq!(matrix[0].samples[1].value, 1.0 + 20.0); // raw @ 20s
        assert_eq!(matrix[0].samples[2].value, 1.0 + 50.0); // raw @ 50s
    }

    #[test]
    fn test_range_all_series_sorted() {
        let adapter = adapter();
        let matrix = adapter
            .range(&[Matcher::eq("__name__", "up")], 0, 100_000, 50_000, &Deadline::none())
            .unwrap();
        assert_eq!(matrix.len(), 3);
        let zones: Vec<&str> = matrix
            .iter()
            .map(|s| s.labels.get("zone").unwrap())
            .collect();
        assert_eq!(zones, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_range_lookback_gap_produces_hole() {
        let engine = Arc::new(StorageEngine::new(EngineConfig {
            lookback_ms: 5_000,
            ..EngineConfig::default()
        }));
        let set = labels(&[("__name__", "gappy")]);
        // Samples at 0 and 60s; 30s step lands in a coverage hole.
        engine
            .write(&set, &[Sample::new(0, 1.0), Sample::new(60_000, 2.0)])
            .unwrap();
        let adapter = QueryAdapter::new(engine);

        let matrix = adapter
            .range(&[Matcher::eq("__name__", "gappy")], 0, 60_000, 30_000, &Deadline::none())
            .unwrap();
        let ts: Vec<i64> = matrix[0].samples.iter().map(|s| s.timestamp).collect();
        // The 30s step sees nothing within 5s lookback.
        assert_eq!(ts, vec![0, 60_000]);
    }

    #[test]
    fn test_range_unmatched_series_omitted() {
        let adapter = adapter();
        let matrix = adapter
            .range(&[Matcher::eq("zone", "zz")], 0, 100_000, 10_000, &Deadline::none())
            .unwrap();
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_range_invalid_step() {
        let adapter = adapter();
        let err = adapter
            .range(&[Matcher::eq("zone", "a")], 0, 100, 0, &Deadline::none())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_range_end_before_start_clamps() {
        let adapter = adapter();
        let matrix = adapter
            .range(&[Matcher::eq("zone", "a")], 50_000, 10_000, 1_000, &Deadline::none())
            .unwrap();
        // Clamped to a single evaluation at start.
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].samples.len(), 1);
        assert_eq!(matrix[0].samples[0].timestamp, 50_000);
    }

    #[test]
    fn test_deadline_aborts_without_partial_result() {
        let adapter = adapter();
        let err = adapter
            .range(
                &[Matcher::eq("__name__", "up")],
                0,
                100_000,
                10_000,
                &Deadline::expired(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
