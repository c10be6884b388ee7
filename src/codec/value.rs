// chronicle_core/src/codec/value.rs
//
// Value stream codecs.
//
// Two encodings: raw little-endian f64 bit patterns (id 0, the
// default) and Gorilla-style XOR compression (id 1). Both operate on
// the raw u64 bit patterns, so NaN payloads and signed zeros survive
// the round trip exactly.

use crate::codec::bitstream::{BitReader, BitWriter};
use crate::codec::{codec_id, ValueCodec};
use crate::error::{ChronicleError, Result};

/// Pass-through codec: 8 bytes LE per value.
#[derive(Debug, Default)]
pub struct RawValueCodec;

impl ValueCodec for RawValueCodec {
    fn id(&self) -> u8 {
        codec_id::VAL_RAW
    }

    fn encode(&self, values: &[f64]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(values.len() * 8);
        for v in values {
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<f64>> {
        if bytes.len() != count * 8 {
            return Err(ChronicleError::corrupt(format!(
                "raw value blob is {} bytes, expected {}",
                bytes.len(),
                count * 8
            )));
        }
        let mut out = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(8) {
            let bits = u64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes"));
            out.push(f64::from_bits(bits));
        }
        Ok(out)
    }
}

/// Gorilla XOR codec.
///
/// The first value is stored as 64 raw bits. Each subsequent value is
/// XORed with its predecessor:
///   - zero XOR            -> control bit `0`
///   - reusing last window -> `10`, then the meaningful bits
///   - new window          -> `11`, 5 bits leading-zero count,
///                            6 bits (meaningful - 1), meaningful bits
#[derive(Debug, Default)]
pub struct XorValueCodec;

impl ValueCodec for XorValueCodec {
    fn id(&self) -> u8 {
        codec_id::VAL_XOR
    }

    fn encode(&self, values: &[f64]) -> Result<Vec<u8>> {
        let mut w = BitWriter::new();
        let Some(first) = values.first() else {
            return Ok(Vec::new());
        };
        w.write_bits(first.to_bits(), 64);

        let mut prev = first.to_bits();
        // Current window; (leading, meaningful) with meaningful = 0
        // meaning "no window yet".
        let mut win_leading = 0u8;
        let mut win_meaningful = 0u8;

        for v in &values[1..] {
            let bits = v.to_bits();
            let xor = prev ^ bits;
            prev = bits;

            if xor == 0 {
                w.write_bit(false);
                continue;
            }
            w.write_bit(true);

            // Cap leading at 31 so it fits the 5-bit field.
            let leading = (xor.leading_zeros().min(31)) as u8;
            let trailing = xor.trailing_zeros() as u8;
            let meaningful = 64 - leading - trailing;

            let window_fits = win_meaningful > 0
                && leading >= win_leading
                && (64 - win_leading - win_meaningful) <= trailing;
            if window_fits {
                w.write_bit(false);
                let shift = 64 - win_leading - win_meaningful;
                w.write_bits(xor >> shift, win_meaningful);
            } else {
                w.write_bit(true);
                w.write_bits(u64::from(leading), 5);
                w.write_bits(u64::from(meaningful - 1), 6);
                w.write_bits(xor >> trailing, meaningful);
                win_leading = leading;
                win_meaningful = meaningful;
            }
        }
        Ok(w.into_bytes())
    }

    fn decode(&self, bytes: &[u8], count: usize) -> Result<Vec<f64>> {
        // Cap the pre-allocation; a corrupt count fails on truncation
        // long before the vector grows.
        let mut out = Vec::with_capacity(count.min(bytes.len() * 8 + 1));
        if count == 0 {
            return Ok(out);
        }
        let mut r = BitReader::new(bytes);
        let mut prev = r.read_bits(64)?;
        out.push(f64::from_bits(prev));

        let mut win_leading = 0u8;
        let mut win_meaningful = 0u8;

        for _ in 1..count {
            if !r.read_bit()? {
                out.push(f64::from_bits(prev));
                continue;
            }
            if r.read_bit()? {
                win_leading = r.read_bits(5)? as u8;
                win_meaningful = r.read_bits(6)? as u8 + 1;
                if win_leading + win_meaningful > 64 {
                    return Err(ChronicleError::corrupt("xor window exceeds 64 bits"));
                }
            } else if win_meaningful == 0 {
                return Err(ChronicleError::corrupt(
                    "xor stream reuses a window before defining one",
                ));
            }
            let shift = 64 - win_leading - win_meaningful;
            let xor = r.read_bits(win_meaningful)? << shift;
            prev ^= xor;
            out.push(f64::from_bits(prev));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_bits_eq(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.to_bits(), y.to_bits(), "{x} != {y} at bit level");
        }
    }

    fn roundtrip(codec: &dyn ValueCodec, input: &[f64]) {
        let bytes = codec.encode(input).unwrap();
        let decoded = codec.decode(&bytes, input.len()).unwrap();
        assert_bits_eq(&decoded, input);
    }

    #[test]
    fn test_raw_roundtrip() {
        roundtrip(&RawValueCodec, &[]);
        roundtrip(&RawValueCodec, &[0.0, -0.0, 1.5, f64::INFINITY, f64::NEG_INFINITY]);
    }

    #[test]
    fn test_raw_preserves_nan_payload() {
        let quiet = f64::from_bits(0x7ff8_0000_0000_0001);
        let signaling = f64::from_bits(0x7ff0_0000_0000_0002);
        roundtrip(&RawValueCodec, &[quiet, signaling, f64::NAN]);
    }

    #[test]
    fn test_xor_roundtrip_slow_drift() {
        let input: Vec<f64> = (0..300).map(|i| 100.0 + 0.1 * i as f64).collect();
        let bytes = XorValueCodec.encode(&input).unwrap();
        // Slowly drifting gauges compress well below raw.
        assert!(bytes.len() < input.len() * 8);
        let decoded = XorValueCodec.decode(&bytes, input.len()).unwrap();
        assert_bits_eq(&decoded, &input);
    }

    #[test]
    fn test_xor_roundtrip_edges() {
        roundtrip(&XorValueCodec, &[]);
        roundtrip(&XorValueCodec, &[42.0]);
        roundtrip(&XorValueCodec, &[1.0, 1.0, 1.0]);
        roundtrip(&XorValueCodec, &[0.0, -0.0, 0.0]);
        roundtrip(&XorValueCodec, &[f64::MIN, f64::MAX, 0.0, f64::EPSILON]);
    }

    #[test]
    fn test_xor_preserves_nan_payload() {
        let quiet = f64::from_bits(0x7ff8_0000_0000_0001);
        roundtrip(&XorValueCodec, &[1.0, quiet, f64::NAN, quiet, 1.0]);
    }

    #[test]
    fn test_xor_truncated_stream_rejected() {
        let bytes = XorValueCodec.encode(&[1.0, 2.0, 3.0]).unwrap();
        assert!(XorValueCodec.decode(&bytes[..bytes.len() - 1], 3).is_err());
    }

    proptest! {
        #[test]
        fn prop_xor_roundtrip_bit_patterns(
            bits in proptest::collection::vec(any::<u64>(), 0..128)
        ) {
            let input: Vec<f64> = bits.into_iter().map(f64::from_bits).collect();
            let encoded = XorValueCodec.encode(&input).unwrap();
            let decoded = XorValueCodec.decode(&encoded, input.len()).unwrap();
            for (x, y) in decoded.iter().zip(&input) {
                prop_assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }
}
