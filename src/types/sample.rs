// chronicle_core/src/types/sample.rs
//
// Sample, metric type, and granularity primitives.
//
// Timestamps are milliseconds since the Unix epoch, as i64. Values are
// f64; NaN is storable but never equal to itself, so ordering and
// deduplication key on the timestamp alone.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single timestamped value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Bit-exact value equality. Unlike `==`, treats identical NaN
    /// payloads as equal; used by round-trip tests.
    pub fn bits_eq(&self, other: &Sample) -> bool {
        self.timestamp == other.timestamp && self.value.to_bits() == other.value.to_bits()
    }
}

impl PartialOrd for Sample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Equal => self.value.partial_cmp(&other.value),
            unequal => Some(unequal),
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.value)
    }
}

/// Metric type tag. Advisory for the storage layer: it selects the
/// default codec pair and is surfaced back to queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetricType {
    Counter = 1,
    Gauge = 2,
    Histogram = 3,
    Summary = 4,
}

impl MetricType {
    /// Raw u8 value for binary serialization.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Reconstruct from raw u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MetricType::Counter),
            2 => Some(MetricType::Gauge),
            3 => Some(MetricType::Histogram),
            4 => Some(MetricType::Summary),
            _ => None,
        }
    }

    /// Parse from a string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Some(MetricType::Counter),
            "gauge" => Some(MetricType::Gauge),
            "histogram" => Some(MetricType::Histogram),
            "summary" => Some(MetricType::Summary),
            _ => None,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        };
        f.write_str(name)
    }
}

impl Default for MetricType {
    fn default() -> Self {
        MetricType::Gauge
    }
}

/// Per-series granularity hint: expected sample interval and retention
/// horizon. Informs the seal policy; retention enforcement itself lives
/// outside the storage core (see `StorageEngine::drop_before`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Granularity {
    /// Expected sample interval in milliseconds. 0 = unknown.
    pub interval_ms: i64,
    /// Retention period in milliseconds. 0 = unbounded.
    pub retention_ms: i64,
}

impl Granularity {
    pub fn new(interval_ms: i64, retention_ms: i64) -> Self {
        Self { interval_ms, retention_ms }
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Self { interval_ms: 0, retention_ms: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_ordering_by_timestamp() {
        let a = Sample::new(1, 9.0);
        let b = Sample::new(2, 1.0);
        assert!(a < b);
        assert!(b > a);
    }

    #[test]
    fn test_nan_never_equal() {
        let a = Sample::new(1, f64::NAN);
        let b = Sample::new(1, f64::NAN);
        assert_ne!(a, b);
        // But the bit patterns still round-trip comparably.
        assert!(a.bits_eq(&b));
    }

    #[test]
    fn test_metric_type_roundtrip_u8() {
        for t in [
            MetricType::Counter,
            MetricType::Gauge,
            MetricType::Histogram,
            MetricType::Summary,
        ] {
            assert_eq!(MetricType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(MetricType::from_u8(0), None);
        assert_eq!(MetricType::from_u8(5), None);
    }

    #[test]
    fn test_metric_type_parse() {
        assert_eq!(MetricType::parse("counter"), Some(MetricType::Counter));
        assert_eq!(MetricType::parse("GAUGE"), Some(MetricType::Gauge));
        assert_eq!(MetricType::parse("unknown"), None);
    }
}
