// chronicle_core/src/codec/timestamp.rs
//
// Timestamp stream codecs.
//
// Two encodings: raw little-endian i64 (id 0, the default) and
// delta-of-delta with zigzag varints (id 1). Monotonic millisecond
// streams make second differences tiny, so the varint form collapses a
// regular scrape cadence to roughly one byte per sample.

use crate::codec::bitstream::{get_uvarint, put_uvarint, unzigzag, zigzag};
use crate::codec::{codec_id, TimestampCodec};
use crate::error::{ChronicleError, Result};

/// Pass-through codec: 8 bytes LE per timestamp.
#[derive(Debug, Default)]
pub struct RawTimestampCodec;

impl TimestampCodec for RawTimestampCodec {
    fn id(&self) -> u8 {
        codec_id::TS_RAW
    }

    fn encode(&self, timestamps: &[i64]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(timestamps.len() * 8);
        for ts in timestamps {
            out.extend_from_slice(&ts.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<i64>> {
        if bytes.len() != count * 8 {
            return Err(ChronicleError::corrupt(format!(
                "raw timestamp blob is {} bytes, expected {}",
                bytes.len(),
                count * 8
            )));
        }
        let mut out = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(8) {
            out.push(i64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes")));
        }
        Ok(out)
    }
}

/// Delta-of-delta codec over zigzag varints.
///
/// Stream layout: first timestamp, then the first delta, then the
/// second difference for every remaining sample, all zigzag varints.
/// Round-trips any i64 sequence exactly, monotonic or not.
#[derive(Debug, Default)]
pub struct DeltaDeltaTimestampCodec;

impl TimestampCodec for DeltaDeltaTimestampCodec {
    fn id(&self) -> u8 {
        codec_id::TS_DELTA_DELTA
    }

    fn encode(&self, timestamps: &[i64]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(timestamps.len() + 9);
        let Some(&first) = timestamps.first() else {
            return Ok(out);
        };
        put_uvarint(&mut out, zigzag(first));

        if timestamps.len() == 1 {
            return Ok(out);
        }
        let mut prev = timestamps[1];
        let mut prev_delta = timestamps[1].wrapping_sub(first);
        put_uvarint(&mut out, zigzag(prev_delta));

        for &ts in &timestamps[2..] {
            let delta = ts.wrapping_sub(prev);
            put_uvarint(&mut out, zigzag(delta.wrapping_sub(prev_delta)));
            prev = ts;
            prev_delta = delta;
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<i64>> {
        // Cap the pre-allocation; a corrupt count fails on truncation
        // long before the vector grows.
        let mut out = Vec::with_capacity(count.min(bytes.len() + 1));
        if count == 0 {
            if !bytes.is_empty() {
                return Err(ChronicleError::corrupt("timestamp blob has trailing data"));
            }
            return Ok(out);
        }

        let mut pos = 0usize;
        let first = unzigzag(get_uvarint(bytes, &mut pos)?);
        out.push(first);

        if count > 1 {
            let mut prev = first;
            let mut prev_delta = unzigzag(get_uvarint(bytes, &mut pos)?);
            prev = prev.wrapping_add(prev_delta);
            out.push(prev);

            for _ in 2..count {
                let dod = unzigzag(get_uvarint(bytes, &mut pos)?);
                prev_delta = prev_delta.wrapping_add(dod);
                prev = prev.wrapping_add(prev_delta);
                out.push(prev);
            }
        }

        if pos != bytes.len() {
            return Err(ChronicleError::corrupt("timestamp blob has trailing data"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(codec: &dyn TimestampCodec, input: &[i64]) {
        let bytes = codec.encode(input).unwrap();
        let decoded = codec.decode(&bytes, input.len()).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_raw_roundtrip() {
        roundtrip(&RawTimestampCodec, &[]);
        roundtrip(&RawTimestampCodec, &[0, -1, i64::MAX, i64::MIN, 42]);
    }

    #[test]
    fn test_raw_length_mismatch() {
        assert!(RawTimestampCodec.decode(&[0u8; 7], 1).is_err());
        assert!(RawTimestampCodec.decode(&[0u8; 16], 1).is_err());
    }

    #[test]
    fn test_delta_delta_roundtrip_regular_cadence() {
        let input: Vec<i64> = (0..200).map(|i| 1_000_000 + i * 15_000).collect();
        let bytes = DeltaDeltaTimestampCodec.encode(&input).unwrap();
        // A fixed cadence collapses to one byte per sample after the
        // first two entries.
        assert!(bytes.len() < input.len() * 2 + 16);
        let decoded = DeltaDeltaTimestampCodec.decode(&bytes, input.len()).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_delta_delta_roundtrip_edges() {
        roundtrip(&DeltaDeltaTimestampCodec, &[]);
        roundtrip(&DeltaDeltaTimestampCodec, &[7]);
        roundtrip(&DeltaDeltaTimestampCodec, &[7, 7]);
        roundtrip(&DeltaDeltaTimestampCodec, &[i64::MIN, 0, i64::MAX]);
        roundtrip(&DeltaDeltaTimestampCodec, &[10, 5, 30, 29, 1000]);
    }

    #[test]
    fn test_delta_delta_trailing_data_rejected() {
        let mut bytes = DeltaDeltaTimestampCodec.encode(&[1, 2, 3]).unwrap();
        bytes.push(0x00);
        assert!(DeltaDeltaTimestampCodec.decode(&bytes, 3).is_err());
    }

    proptest! {
        #[test]
        fn prop_delta_delta_roundtrip(input in proptest::collection::vec(any::<i64>(), 0..256)) {
            let bytes = DeltaDeltaTimestampCodec.encode(&input).unwrap();
            let decoded = DeltaDeltaTimestampCodec.decode(&bytes, input.len()).unwrap();
            prop_assert_eq!(decoded, input);
        }
    }
}
