// chronicle_core/src/codec/labels.rs
//
// Label dictionary codec.
//
// Blocks intern every distinct label name and value into one string
// table; per-series label sets are stored as index pairs into it (see
// the block postings section). The codec owns the string table bytes.

use crate::codec::{codec_id, LabelCodec};
use crate::error::{ChronicleError, Result};

/// Plain dictionary: `count:u32, (len:u32, utf8 bytes)*`, little-endian.
#[derive(Debug, Default)]
pub struct PlainLabelCodec;

impl LabelCodec for PlainLabelCodec {
    fn id(&self) -> u8 {
        codec_id::LABEL_PLAIN
    }

    fn encode_dict(&self, strings: &[String]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + strings.iter().map(|s| 4 + s.len()).sum::<usize>());
        out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        for s in strings {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Ok(out)
    }

    fn decode_dict(&self, bytes: &[u8]) -> Result<Vec<String>> {
        let mut pos = 0usize;
        let count = read_u32(bytes, &mut pos)? as usize;
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let len = read_u32(bytes, &mut pos)? as usize;
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| ChronicleError::corrupt("label dictionary truncated"))?;
            let s = std::str::from_utf8(&bytes[pos..end])
                .map_err(|_| ChronicleError::corrupt("label dictionary is not UTF-8"))?;
            out.push(s.to_owned());
            pos = end;
        }
        if pos != bytes.len() {
            return Err(ChronicleError::corrupt("label dictionary has trailing data"));
        }
        Ok(out)
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| ChronicleError::corrupt("label dictionary truncated"))?;
    let value = u32::from_le_bytes(bytes[*pos..end].try_into().expect("slice is 4 bytes"));
    *pos = end;
    Ok(value)
}
