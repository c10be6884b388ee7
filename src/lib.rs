// chronicle_core/src/lib.rs
//
// Chronicle Core — the storage engine for labeled time series.
//
// Writes route through the engine to per-series head blocks encoded
// by pluggable codecs; sealed blocks persist through a byte sink and
// recover by adoption. Reads resolve label matchers against the
// inverted index and merge-deduplicate across the block chain.

pub mod block;
pub mod codec;
pub mod engine;
pub mod error;
pub mod index;
pub mod persist;
pub mod query;
pub mod series;
pub mod types;

pub use block::{Block, BlockHeader, BLOCK_HEADER_SIZE, BLOCK_MAGIC, BLOCK_VERSION};
pub use codec::{
    CodecSet, DeltaDeltaTimestampCodec, LabelCodec, PlainLabelCodec, RawTimestampCodec,
    RawValueCodec, TimestampCodec, ValueCodec, XorValueCodec,
};
pub use engine::{BlockSink, Deadline, EngineConfig, StorageEngine};
pub use error::{ChronicleError, ErrorKind, Result};
pub use index::{LabelIndex, Matcher};
pub use persist::BlockLog;
pub use query::{InstantSample, Matrix, QueryAdapter, RangeSeries};
pub use series::Series;
pub use types::{Granularity, Label, LabelSet, MetricType, Sample, METRIC_NAME_LABEL};
