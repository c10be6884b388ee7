// chronicle_core/src/block/mod.rs
//
// Columnar sample container bounded by a time window.
//
// Lifecycle: Open -> (append*, seal) -> Sealed -> (read*, serialize).
// Open blocks buffer per-series sample vectors sorted by timestamp.
// Sealing runs the codec set over every buffer, drops the raw buffers,
// and fixes the body CRC. Sealed blocks are immutable; they are shared
// between readers without locking.
//
// On-disk layout (little-endian):
//
// ```text
// Offset | Size | Field
// -------|------|----------------------------
//  0     |  4   | magic (0x4252_4843, "CHRB")
//  4     |  2   | version (1)
//  6     |  2   | flags (bit 0 sealed, bits 4-7 ts codec,
//        |      |        bits 8-11 value codec, bits 12-15 label codec)
//  8     |  8   | id
// 16     |  8   | start_time (ms)
// 24     |  8   | end_time (ms)
// 32     |  4   | crc32 of the body
// 36     |  4   | reserved (0)
// ```
//
// Body: three u32-length-prefixed sections — label dictionary,
// postings (per-series label index pairs), samples (per-series codec
// blobs).

use std::collections::HashMap;

use crate::codec::CodecSet;
use crate::error::{ChronicleError, Result};
use crate::types::{LabelSet, Sample};

/// `"CHRB"` as a little-endian u32.
pub const BLOCK_MAGIC: u32 = 0x4252_4843;
/// Current on-disk format version.
pub const BLOCK_VERSION: u16 = 1;
/// Fixed header size in bytes.
pub const BLOCK_HEADER_SIZE: usize = 40;

mod flag {
    pub const SEALED: u16 = 1 << 0;
    pub const TS_CODEC_SHIFT: u16 = 4;
    pub const VAL_CODEC_SHIFT: u16 = 8;
    pub const LABEL_CODEC_SHIFT: u16 = 12;
    pub const CODEC_MASK: u16 = 0xf;
}

/// Fixed-size block header. `start_time`/`end_time` track the min/max
/// sample timestamp actually appended, not a nominal window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub crc32: u32,
    pub reserved: u32,
}

impl BlockHeader {
    fn new(id: u64) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            version: BLOCK_VERSION,
            flags: 0,
            id,
            start_time: i64::MAX,
            end_time: i64::MIN,
            crc32: 0,
            reserved: 0,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.start_time.to_le_bytes());
        out.extend_from_slice(&self.end_time.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(ChronicleError::corrupt("block shorter than its header"));
        }
        // Offsets mirror the layout table in the module docs.
        Ok(Self {
            magic: u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
            version: u16::from_le_bytes(bytes[4..6].try_into().expect("2 bytes")),
            flags: u16::from_le_bytes(bytes[6..8].try_into().expect("2 bytes")),
            id: u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
            start_time: i64::from_le_bytes(bytes[16..24].try_into().expect("8 bytes")),
            end_time: i64::from_le_bytes(bytes[24..32].try_into().expect("8 bytes")),
            crc32: u32::from_le_bytes(bytes[32..36].try_into().expect("4 bytes")),
            reserved: u32::from_le_bytes(bytes[36..40].try_into().expect("4 bytes")),
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.flags & flag::SEALED != 0
    }
}

/// In-memory buffer for one series in an open block.
#[derive(Debug)]
struct SeriesBuffer {
    labels: LabelSet,
    /// Sorted by timestamp, unique timestamps.
    samples: Vec<Sample>,
}

/// One series' encoded streams in a sealed block.
#[derive(Debug)]
struct SealedSeries {
    labels: LabelSet,
    n_samples: u32,
    ts_blob: Vec<u8>,
    val_blob: Vec<u8>,
}

#[derive(Debug)]
enum State {
    Open(Vec<SeriesBuffer>),
    Sealed(Vec<SealedSeries>),
}

/// A columnar container for one or more series' samples.
#[derive(Debug)]
pub struct Block {
    header: BlockHeader,
    codecs: CodecSet,
    /// Backdating tolerance below `start_time`, in ms.
    tolerance_ms: i64,
    state: State,
    /// Label-set id -> position in the state vector.
    lookup: HashMap<u64, usize>,
}

impl Block {
    /// Create an empty open block using the given codec set.
    pub fn new(id: u64, codecs: CodecSet) -> Self {
        Self::with_tolerance(id, codecs, 0)
    }

    /// Create an open block that accepts samples up to `tolerance_ms`
    /// older than its current start time.
    pub fn with_tolerance(id: u64, codecs: CodecSet, tolerance_ms: i64) -> Self {
        Self {
            header: BlockHeader::new(id),
            codecs,
            tolerance_ms,
            state: State::Open(Vec::new()),
            lookup: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn is_sealed(&self) -> bool {
        self.header.is_sealed()
    }

    /// Min appended timestamp; `i64::MAX` while empty.
    pub fn start_time(&self) -> i64 {
        self.header.start_time
    }

    /// Max appended timestamp; `i64::MIN` while empty.
    pub fn end_time(&self) -> i64 {
        self.header.end_time
    }

    /// True when `[start, end]` intersects the appended time range.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.header.start_time <= end && self.header.end_time >= start
    }

    pub fn num_series(&self) -> usize {
        match &self.state {
            State::Open(buffers) => buffers.len(),
            State::Sealed(series) => series.len(),
        }
    }

    pub fn num_samples(&self) -> usize {
        match &self.state {
            State::Open(buffers) => buffers.iter().map(|b| b.samples.len()).sum(),
            State::Sealed(series) => series.iter().map(|s| s.n_samples as usize).sum(),
        }
    }

    /// Append one sample for `labels`.
    ///
    /// Fails with `Sealed` on a sealed block and `OutOfRange` when the
    /// timestamp falls below `start_time - tolerance`. An append at a
    /// timestamp the series already holds is dropped (first write
    /// wins); a backdated-but-in-range sample is inserted in sorted
    /// position.
    pub fn append(&mut self, labels: &LabelSet, sample: Sample) -> Result<()> {
        let buffers = match &mut self.state {
            State::Sealed(_) => {
                return Err(ChronicleError::Sealed { block_id: self.header.id })
            }
            State::Open(buffers) => buffers,
        };

        if self.header.start_time != i64::MAX {
            let min_allowed = self.header.start_time.saturating_sub(self.tolerance_ms);
            if sample.timestamp < min_allowed {
                return Err(ChronicleError::OutOfRange {
                    timestamp: sample.timestamp,
                    min_allowed,
                });
            }
        }

        let key = labels.id();
        let idx = match self.lookup.get(&key) {
            Some(&idx) if buffers[idx].labels == *labels => idx,
            Some(_) => {
                // Hash collision between distinct label sets inside one
                // block; the registry resolves these, a block cannot.
                return Err(ChronicleError::internal(format!(
                    "label-set hash collision in block {}",
                    self.header.id
                )));
            }
            None => {
                buffers.push(SeriesBuffer { labels: labels.clone(), samples: Vec::new() });
                self.lookup.insert(key, buffers.len() - 1);
                buffers.len() - 1
            }
        };

        let samples = &mut buffers[idx].samples;
        match samples.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
            // Duplicate timestamp: keep the first occurrence.
            Ok(_) => {}
            Err(pos) => samples.insert(pos, sample),
        }

        self.header.start_time = self.header.start_time.min(sample.timestamp);
        self.header.end_time = self.header.end_time.max(sample.timestamp);
        Ok(())
    }

    /// Samples stored for `labels`, in timestamp order; empty when the
    /// block does not hold the series. Allowed in both states; sealed
    /// blocks decode on demand.
    pub fn read(&self, labels: &LabelSet) -> Result<Vec<Sample>> {
        let key = labels.id();
        let Some(&idx) = self.lookup.get(&key) else {
            return Ok(Vec::new());
        };
        match &self.state {
            State::Open(buffers) => {
                let buffer = &buffers[idx];
                if buffer.labels != *labels {
                    return Ok(Vec::new());
                }
                Ok(buffer.samples.clone())
            }
            State::Sealed(series) => {
                let entry = &series[idx];
                if entry.labels != *labels {
                    return Ok(Vec::new());
                }
                self.decode_series(entry)
            }
        }
    }

    /// All label sets held by this block, in storage order.
    pub fn label_sets(&self) -> Vec<LabelSet> {
        match &self.state {
            State::Open(buffers) => buffers.iter().map(|b| b.labels.clone()).collect(),
            State::Sealed(series) => series.iter().map(|s| s.labels.clone()).collect(),
        }
    }

    fn decode_series(&self, entry: &SealedSeries) -> Result<Vec<Sample>> {
        let n = entry.n_samples as usize;
        let timestamps = self.codecs.timestamps.decode(&entry.ts_blob, n)?;
        let values = self.codecs.values.decode(&entry.val_blob, n)?;
        if timestamps.len() != values.len() {
            return Err(ChronicleError::internal(
                "timestamp and value streams disagree on length",
            ));
        }
        Ok(timestamps
            .into_iter()
            .zip(values)
            .map(|(timestamp, value)| Sample { timestamp, value })
            .collect())
    }

    /// Flush buffered columnar state through the codecs, fix the body
    /// CRC, and flip to the sealed state. Idempotent.
    pub fn seal(&mut self) -> Result<()> {
        let buffers = match &mut self.state {
            State::Sealed(_) => return Ok(()),
            State::Open(buffers) => std::mem::take(buffers),
        };

        let mut sealed = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let timestamps: Vec<i64> = buffer.samples.iter().map(|s| s.timestamp).collect();
            let values: Vec<f64> = buffer.samples.iter().map(|s| s.value).collect();
            sealed.push(SealedSeries {
                labels: buffer.labels,
                n_samples: buffer.samples.len() as u32,
                ts_blob: self.codecs.timestamps.encode(&timestamps)?,
                val_blob: self.codecs.values.encode(&values)?,
            });
        }

        self.header.flags = flag::SEALED
            | (u16::from(self.codecs.timestamps.id()) & flag::CODEC_MASK) << flag::TS_CODEC_SHIFT
            | (u16::from(self.codecs.values.id()) & flag::CODEC_MASK) << flag::VAL_CODEC_SHIFT
            | (u16::from(self.codecs.labels.id()) & flag::CODEC_MASK) << flag::LABEL_CODEC_SHIFT;
        self.state = State::Sealed(sealed);
        self.header.crc32 = crc32fast::hash(&self.build_body()?);

        tracing::debug!(
            block = self.header.id,
            series = self.num_series(),
            samples = self.num_samples(),
            "sealed block"
        );
        Ok(())
    }

    // -------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------

    fn build_body(&self) -> Result<Vec<u8>> {
        let series = match &self.state {
            State::Open(_) => {
                return Err(ChronicleError::invalid("block must be sealed before serialization"))
            }
            State::Sealed(series) => series,
        };

        // Intern every label name and value, first appearance wins.
        let mut dict: Vec<String> = Vec::new();
        let mut interned: HashMap<String, u32> = HashMap::new();
        let mut intern = |dict: &mut Vec<String>,
                          interned: &mut HashMap<String, u32>,
                          s: &str| {
            if let Some(&idx) = interned.get(s) {
                return idx;
            }
            let idx = dict.len() as u32;
            dict.push(s.to_owned());
            interned.insert(s.to_owned(), idx);
            idx
        };

        let mut postings = Vec::new();
        postings.extend_from_slice(&(series.len() as u32).to_le_bytes());
        for (ref_id, entry) in series.iter().enumerate() {
            postings.extend_from_slice(&(ref_id as u32).to_le_bytes());
            postings.extend_from_slice(&(entry.labels.len() as u32).to_le_bytes());
            for label in entry.labels.iter() {
                let name_idx = intern(&mut dict, &mut interned, &label.name);
                let value_idx = intern(&mut dict, &mut interned, &label.value);
                postings.extend_from_slice(&name_idx.to_le_bytes());
                postings.extend_from_slice(&value_idx.to_le_bytes());
            }
        }

        let dict_section = self.codecs.labels.encode_dict(&dict)?;

        let mut samples = Vec::new();
        for (ref_id, entry) in series.iter().enumerate() {
            samples.extend_from_slice(&(ref_id as u32).to_le_bytes());
            samples.extend_from_slice(&entry.n_samples.to_le_bytes());
            samples.extend_from_slice(&(entry.ts_blob.len() as u32).to_le_bytes());
            samples.extend_from_slice(&entry.ts_blob);
            samples.extend_from_slice(&(entry.val_blob.len() as u32).to_le_bytes());
            samples.extend_from_slice(&entry.val_blob);
        }

        let mut body =
            Vec::with_capacity(12 + dict_section.len() + postings.len() + samples.len());
        for section in [&dict_section, &postings, &samples] {
            body.extend_from_slice(&(section.len() as u32).to_le_bytes());
            body.extend_from_slice(section);
        }
        Ok(body)
    }

    /// Serialize a sealed block to its on-disk byte form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = self.build_body()?;
        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + body.len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Inverse of `serialize`. Validates magic, version, and the body
    /// CRC; reconstructs the codec set from the header flags.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let header = BlockHeader::read_from(bytes)?;
        if header.magic != BLOCK_MAGIC {
            return Err(ChronicleError::corrupt(format!(
                "bad block magic {:#010x}",
                header.magic
            )));
        }
        if header.version != BLOCK_VERSION {
            return Err(ChronicleError::corrupt(format!(
                "unsupported block version {}",
                header.version
            )));
        }
        if !header.is_sealed() {
            return Err(ChronicleError::corrupt("serialized block is not sealed"));
        }

        let body = &bytes[BLOCK_HEADER_SIZE..];
        let crc = crc32fast::hash(body);
        if crc != header.crc32 {
            return Err(ChronicleError::corrupt(format!(
                "crc mismatch: header {:#010x}, body {:#010x}",
                header.crc32, crc
            )));
        }

        let codecs = CodecSet::from_ids(
            ((header.flags >> flag::TS_CODEC_SHIFT) & flag::CODEC_MASK) as u8,
            ((header.flags >> flag::VAL_CODEC_SHIFT) & flag::CODEC_MASK) as u8,
            ((header.flags >> flag::LABEL_CODEC_SHIFT) & flag::CODEC_MASK) as u8,
        )?;

        let mut pos = 0usize;
        let dict_section = read_section(body, &mut pos)?;
        let postings_section = read_section(body, &mut pos)?;
        let samples_section = read_section(body, &mut pos)?;
        if pos != body.len() {
            return Err(ChronicleError::corrupt("block body has trailing data"));
        }

        let dict = codecs.labels.decode_dict(dict_section)?;

        // Postings: rebuild each series' label set from dictionary refs.
        let mut ppos = 0usize;
        let n_series = read_u32(postings_section, &mut ppos)? as usize;
        let mut label_sets = Vec::with_capacity(n_series);
        for expect_ref in 0..n_series {
            let series_ref = read_u32(postings_section, &mut ppos)? as usize;
            if series_ref != expect_ref {
                return Err(ChronicleError::corrupt("postings series refs out of order"));
            }
            let n_labels = read_u32(postings_section, &mut ppos)? as usize;
            let mut labels = LabelSet::new();
            for _ in 0..n_labels {
                let name_idx = read_u32(postings_section, &mut ppos)? as usize;
                let value_idx = read_u32(postings_section, &mut ppos)? as usize;
                let name = dict
                    .get(name_idx)
                    .ok_or_else(|| ChronicleError::corrupt("posting name ref out of bounds"))?;
                let value = dict
                    .get(value_idx)
                    .ok_or_else(|| ChronicleError::corrupt("posting value ref out of bounds"))?;
                labels.add(name.clone(), value.clone())?;
            }
            label_sets.push(labels);
        }
        if ppos != postings_section.len() {
            return Err(ChronicleError::corrupt("postings section has trailing data"));
        }

        // Samples: one record per series, same order as postings.
        let mut spos = 0usize;
        let mut series = Vec::with_capacity(n_series);
        let mut lookup = HashMap::with_capacity(n_series);
        for (idx, labels) in label_sets.into_iter().enumerate() {
            let series_ref = read_u32(samples_section, &mut spos)? as usize;
            if series_ref != idx {
                return Err(ChronicleError::corrupt("sample series refs out of order"));
            }
            let n_samples = read_u32(samples_section, &mut spos)?;
            let ts_blob = read_blob(samples_section, &mut spos)?.to_vec();
            let val_blob = read_blob(samples_section, &mut spos)?.to_vec();
            lookup.insert(labels.id(), idx);
            series.push(SealedSeries { labels, n_samples, ts_blob, val_blob });
        }
        if spos != samples_section.len() {
            return Err(ChronicleError::corrupt("samples section has trailing data"));
        }

        Ok(Self {
            header,
            codecs,
            tolerance_ms: 0,
            state: State::Sealed(series),
            lookup,
        })
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| ChronicleError::corrupt("block section truncated"))?;
    let value = u32::from_le_bytes(bytes[*pos..end].try_into().expect("slice is 4 bytes"));
    *pos = end;
    Ok(value)
}

fn read_section<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    read_blob(bytes, pos)
}

fn read_blob<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32(bytes, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| ChronicleError::corrupt("block section truncated"))?;
    let blob = &bytes[*pos..end];
    *pos = end;
    Ok(blob)
}
