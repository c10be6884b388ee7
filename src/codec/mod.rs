// chronicle_core/src/codec/mod.rs
//
// Pluggable stream codecs.
//
// A block holds one codec per stream kind (timestamps, values, label
// dictionary), selected at block creation and recorded in the block
// header flags so deserialization reconstructs the same set. Every
// codec must round-trip its input exactly; compression is an encoding
// choice, never a semantic one.

pub mod bitstream;
pub mod labels;
pub mod timestamp;
pub mod value;

use std::fmt;
use std::sync::Arc;

use crate::error::{ChronicleError, Result};
use crate::types::MetricType;

pub use labels::PlainLabelCodec;
pub use timestamp::{DeltaDeltaTimestampCodec, RawTimestampCodec};
pub use value::{RawValueCodec, XorValueCodec};

/// Stable codec identifiers, persisted in block header flags.
pub mod codec_id {
    pub const TS_RAW: u8 = 0;
    pub const TS_DELTA_DELTA: u8 = 1;

    pub const VAL_RAW: u8 = 0;
    pub const VAL_XOR: u8 = 1;

    pub const LABEL_PLAIN: u8 = 0;
}

/// Timestamp stream encoder/decoder.
///
/// `decode` takes the expected sample count; packed encodings pad the
/// final byte and cannot infer the count from the blob alone.
pub trait TimestampCodec: Send + Sync {
    fn id(&self) -> u8;
    fn encode(&self, timestamps: &[i64]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<i64>>;
}

/// Value stream encoder/decoder. Must round-trip NaN bit patterns.
pub trait ValueCodec: Send + Sync {
    fn id(&self) -> u8;
    fn encode(&self, values: &[f64]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<f64>>;
}

/// Label dictionary encoder/decoder. Must round-trip the empty table.
pub trait LabelCodec: Send + Sync {
    fn id(&self) -> u8;
    fn encode_dict(&self, strings: &[String]) -> Result<Vec<u8>>;
    fn decode_dict(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

/// The three codec capabilities a block carries.
#[derive(Clone)]
pub struct CodecSet {
    pub timestamps: Arc<dyn TimestampCodec>,
    pub values: Arc<dyn ValueCodec>,
    pub labels: Arc<dyn LabelCodec>,
}

impl CodecSet {
    /// Pass-through codecs for all three streams. The default.
    pub fn raw() -> Self {
        Self {
            timestamps: Arc::new(RawTimestampCodec),
            values: Arc::new(RawValueCodec),
            labels: Arc::new(PlainLabelCodec),
        }
    }

    /// Delta-of-delta timestamps + XOR values.
    pub fn compressed() -> Self {
        Self {
            timestamps: Arc::new(DeltaDeltaTimestampCodec),
            values: Arc::new(XorValueCodec),
            labels: Arc::new(PlainLabelCodec),
        }
    }

    /// Default selection by metric type. Counters and gauges are
    /// monotonic-ish and slow-drifting, where the packed codecs earn
    /// their keep; histogram and summary series stay raw.
    pub fn for_metric(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Counter | MetricType::Gauge => Self::compressed(),
            MetricType::Histogram | MetricType::Summary => Self::raw(),
        }
    }

    /// Reconstruct a set from persisted codec ids.
    pub fn from_ids(ts_id: u8, val_id: u8, label_id: u8) -> Result<Self> {
        let timestamps: Arc<dyn TimestampCodec> = match ts_id {
            codec_id::TS_RAW => Arc::new(RawTimestampCodec),
            codec_id::TS_DELTA_DELTA => Arc::new(DeltaDeltaTimestampCodec),
            other => {
                return Err(ChronicleError::corrupt(format!(
                    "unknown timestamp codec id {other}"
                )))
            }
        };
        let values: Arc<dyn ValueCodec> = match val_id {
            codec_id::VAL_RAW => Arc::new(RawValueCodec),
            codec_id::VAL_XOR => Arc::new(XorValueCodec),
            other => {
                return Err(ChronicleError::corrupt(format!(
                    "unknown value codec id {other}"
                )))
            }
        };
        let labels: Arc<dyn LabelCodec> = match label_id {
            codec_id::LABEL_PLAIN => Arc::new(PlainLabelCodec),
            other => {
                return Err(ChronicleError::corrupt(format!(
                    "unknown label codec id {other}"
                )))
            }
        };
        Ok(Self { timestamps, values, labels })
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::raw()
    }
}

impl fmt::Debug for CodecSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecSet")
            .field("timestamps", &self.timestamps.id())
            .field("values", &self.values.id())
            .field("labels", &self.labels.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_raw() {
        let set = CodecSet::default();
        assert_eq!(set.timestamps.id(), codec_id::TS_RAW);
        assert_eq!(set.values.id(), codec_id::VAL_RAW);
        assert_eq!(set.labels.id(), codec_id::LABEL_PLAIN);
    }

    #[test]
    fn test_metric_type_selection() {
        let counter = CodecSet::for_metric(MetricType::Counter);
        assert_eq!(counter.timestamps.id(), codec_id::TS_DELTA_DELTA);
        assert_eq!(counter.values.id(), codec_id::VAL_XOR);

        let histogram = CodecSet::for_metric(MetricType::Histogram);
        assert_eq!(histogram.timestamps.id(), codec_id::TS_RAW);
        assert_eq!(histogram.values.id(), codec_id::VAL_RAW);
    }

    #[test]
    fn test_from_ids_roundtrip() {
        for set in [CodecSet::raw(), CodecSet::compressed()] {
            let rebuilt =
                CodecSet::from_ids(set.timestamps.id(), set.values.id(), set.labels.id()).unwrap();
            assert_eq!(rebuilt.timestamps.id(), set.timestamps.id());
            assert_eq!(rebuilt.values.id(), set.values.id());
            assert_eq!(rebuilt.labels.id(), set.labels.id());
        }
    }

    #[test]
    fn test_from_ids_unknown_rejected() {
        assert!(CodecSet::from_ids(9, 0, 0).is_err());
        assert!(CodecSet::from_ids(0, 9, 0).is_err());
        assert!(CodecSet::from_ids(0, 0, 9).is_err());
    }
}
