// chronicle_core/src/persist/mod.rs
//
// Mmap-backed sealed-block journal.
//
// The engine treats durability as an opaque byte sink; this module is
// the reference implementation. Sealed blocks are appended to a
// memory-mapped file as length-prefixed, CRC-guarded entries. On
// reopen, the log scans forward to the end of the last valid entry and
// appends after it. Recovery deserializes every valid entry and hands
// the blocks back to an engine via `adopt_block`; ranges that overlap
// live data are absorbed by read-time deduplication.
//
// Entry layout (little-endian, payload follows immediately):
//
// ```text
// [8: sequence][4: payload_len][4: crc32(payload)]
// ```

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::block::Block;
use crate::engine::{BlockSink, StorageEngine};
use crate::error::Result;

/// Size of the per-entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Default log capacity: 64 MB.
pub const DEFAULT_LOG_CAPACITY: usize = 64 * 1024 * 1024;

const _: () = assert!(ENTRY_HEADER_SIZE == 8 + 4 + 4);

struct LogInner {
    mmap: MmapMut,
    /// Byte offset one past the last valid entry.
    write_pos: usize,
    next_seq: u64,
    capacity: usize,
}

/// Append-only block journal over a memory-mapped file.
pub struct BlockLog {
    inner: Mutex<LogInner>,
    path: PathBuf,
}

impl BlockLog {
    /// Open or create the log file at `path`, sized to `capacity`
    /// bytes. An existing file is scanned so new entries append after
    /// the last valid one.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len() as usize;
        if file_len < capacity {
            file.set_len(capacity as u64)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let (write_pos, next_seq) = Self::scan(&mmap, capacity);
        info!(path = %path.display(), entries = next_seq, "opened block log");

        Ok(Self {
            inner: Mutex::new(LogInner { mmap, write_pos, next_seq, capacity }),
            path,
        })
    }

    /// Open with the default 64 MB capacity.
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, DEFAULT_LOG_CAPACITY)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one serialized block. Returns the assigned sequence
    /// number. The write is a bounds-checked copy into the mapped
    /// region; the OS flushes dirty pages in the background and
    /// `flush` forces it.
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let entry_size = ENTRY_HEADER_SIZE + payload.len();
        if inner.write_pos + entry_size > inner.capacity {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "block log capacity exhausted",
            )
            .into());
        }

        let seq = inner.next_seq;
        let crc = crc32fast::hash(payload);
        let pos = inner.write_pos;

        inner.mmap[pos..pos + 8].copy_from_slice(&seq.to_le_bytes());
        inner.mmap[pos + 8..pos + 12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        inner.mmap[pos + 12..pos + 16].copy_from_slice(&crc.to_le_bytes());
        inner.mmap[pos + 16..pos + 16 + payload.len()].copy_from_slice(payload);

        inner.write_pos += entry_size;
        inner.next_seq += 1;
        Ok(seq)
    }

    /// Force an msync of the mapped region.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().mmap.flush()?;
        Ok(())
    }

    /// Number of entries written.
    pub fn entry_count(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Bytes consumed so far.
    pub fn len_bytes(&self) -> usize {
        self.inner.lock().write_pos
    }

    /// Deserialize every valid entry into a block, in append order.
    /// Scanning stops at the first invalid entry header or payload
    /// CRC (the end of the valid log); a CRC-valid entry that fails
    /// block deserialization is genuine corruption and propagates.
    pub fn read_all_blocks(&self) -> Result<Vec<Block>> {
        let inner = self.inner.lock();
        let mut blocks = Vec::new();
        let mut pos = 0usize;
        let mut seq = 0u64;

        while pos + ENTRY_HEADER_SIZE <= inner.write_pos {
            let Some((payload_end, payload)) = Self::entry_at(&inner.mmap, inner.capacity, pos, seq)
            else {
                break;
            };
            blocks.push(Block::deserialize(payload)?);
            pos = payload_end;
            seq += 1;
        }
        Ok(blocks)
    }

    /// Replay every valid entry into `engine`. Returns the number of
    /// blocks adopted.
    pub fn recover_into(&self, engine: &StorageEngine) -> Result<usize> {
        let blocks = self.read_all_blocks()?;
        let count = blocks.len();
        for block in blocks {
            engine.adopt_block(block)?;
        }
        info!(blocks = count, "recovered block log");
        Ok(count)
    }

    /// Validate the entry at `pos` with expected sequence `seq`.
    /// Returns `(end_offset, payload)` or `None` at end of valid data.
    fn entry_at(mmap: &[u8], capacity: usize, pos: usize, seq: u64) -> Option<(usize, &[u8])> {
        let header = &mmap[pos..pos + ENTRY_HEADER_SIZE];
        let entry_seq = u64::from_le_bytes(header[0..8].try_into().expect("8 bytes"));
        let payload_len = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;
        let crc = u32::from_le_bytes(header[12..16].try_into().expect("4 bytes"));

        if entry_seq != seq || payload_len == 0 {
            return None;
        }
        let payload_start = pos + ENTRY_HEADER_SIZE;
        let payload_end = payload_start.checked_add(payload_len)?;
        if payload_end > capacity {
            return None;
        }
        let payload = &mmap[payload_start..payload_end];
        if crc32fast::hash(payload) != crc {
            warn!(seq, "block log entry failed crc; truncating scan");
            return None;
        }
        Some((payload_end, payload))
    }

    /// Find the write position after the last valid entry.
    fn scan(mmap: &MmapMut, capacity: usize) -> (usize, u64) {
        let mut pos = 0usize;
        let mut seq = 0u64;
        while pos + ENTRY_HEADER_SIZE <= capacity {
            match Self::entry_at(mmap, capacity, pos, seq) {
                Some((payload_end, _)) => {
                    pos = payload_end;
                    seq += 1;
                }
                None => break,
            }
        }
        (pos, seq)
    }
}

/// The log is itself a valid persistence sink: the engine hands it
/// every sealed block as it detaches.
impl BlockSink for BlockLog {
    fn store(&self, block_bytes: &[u8]) -> Result<()> {
        self.append(block_bytes)?;
        Ok(())
    }
}
