// chronicle_core/src/series/mod.rs
//
// A series binds one label set to its chain of blocks: at most one
// open head plus an ordered list of sealed blocks.
//
// The head is the only write target. Reads merge every overlapping
// sealed block AND the head — the head is consulted regardless of its
// header range, because its bounds lag the buffered data during active
// ingestion; filtering the head by header range drops just-written
// samples. Merged output is sorted and deduplicated by timestamp
// (first occurrence wins), which absorbs the overlap a journal replay
// reintroduces.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::Block;
use crate::codec::CodecSet;
use crate::engine::{Deadline, EngineConfig};
use crate::error::Result;
use crate::types::{Granularity, LabelSet, MetricType, Sample};

struct SeriesInner {
    head: Option<Block>,
    /// Sealed blocks ordered by start_time ascending. Ranges may
    /// overlap (journal replay); readers deduplicate.
    sealed: Vec<Arc<Block>>,
}

/// Registry entry for one label set.
pub struct Series {
    id: u64,
    labels: LabelSet,
    metric_type: MetricType,
    granularity: Granularity,
    /// Engine-scoped block id allocator; no process globals.
    block_ids: Arc<AtomicU64>,
    inner: RwLock<SeriesInner>,
}

impl Series {
    pub fn new(
        labels: LabelSet,
        metric_type: MetricType,
        granularity: Granularity,
        block_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id: labels.id(),
            labels,
            metric_type,
            granularity,
            block_ids,
            inner: RwLock::new(SeriesInner { head: None, sealed: Vec::new() }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Append one sample, creating the head block on first write.
    /// Returns `true` when the head has met the seal policy and the
    /// engine should seal it.
    pub fn append(&self, sample: Sample, config: &EngineConfig) -> Result<bool> {
        let mut inner = self.inner.write();

        if inner.head.is_none() {
            let id = self.block_ids.fetch_add(1, Ordering::Relaxed);
            let codecs = CodecSet::for_metric(self.metric_type);
            inner.head = Some(Block::with_tolerance(id, codecs, config.ooo_tolerance_ms));
        }
        let head = inner.head.as_mut().expect("head exists after creation");

        head.append(&self.labels, sample)?;
        Ok(self.head_is_full(head, config))
    }

    /// Seal policy: sample count, or elapsed head span once the
    /// granularity interval is known. 120 samples is the classic
    /// per-chunk convention and the configurable default.
    fn head_is_full(&self, head: &Block, config: &EngineConfig) -> bool {
        if head.num_samples() >= config.seal_threshold_samples {
            return true;
        }
        if self.granularity.interval_ms > 0 {
            let span = head.end_time().saturating_sub(head.start_time());
            let max_span = self
                .granularity
                .interval_ms
                .saturating_mul(config.seal_threshold_samples as i64);
            if span >= max_span {
                return true;
            }
        }
        false
    }

    /// Seal the current head, push it onto the sealed list, and return
    /// it so the engine can hand it to the persistence sink. `None`
    /// when there is no head.
    pub fn seal_head(&self) -> Result<Option<Arc<Block>>> {
        let mut inner = self.inner.write();
        let Some(mut head) = inner.head.take() else {
            return Ok(None);
        };
        head.seal()?;
        let sealed = Arc::new(head);
        Self::insert_sorted(&mut inner.sealed, Arc::clone(&sealed));
        Ok(Some(sealed))
    }

    fn insert_sorted(sealed: &mut Vec<Arc<Block>>, block: Arc<Block>) {
        let pos = sealed
            .partition_point(|b| b.start_time() <= block.start_time());
        sealed.insert(pos, block);
    }

    /// Adopt an externally recovered sealed block (journal replay).
    pub fn add_sealed(&self, block: Arc<Block>) -> Result<()> {
        if !block.is_sealed() {
            return Err(crate::error::ChronicleError::invalid(
                "only sealed blocks can be adopted",
            ));
        }
        let mut inner = self.inner.write();
        Self::insert_sorted(&mut inner.sealed, block);
        Ok(())
    }

    /// Samples in `[start, end]`, merged across sealed blocks and the
    /// head, sorted ascending, deduplicated by timestamp (first
    /// occurrence wins). The deadline is checked at entry and at each
    /// block boundary; expiry yields no partial output.
    pub fn read(&self, start: i64, end: i64, deadline: &Deadline) -> Result<Vec<Sample>> {
        deadline.check()?;
        let inner = self.inner.read();

        let mut merged: Vec<Sample> = Vec::new();
        for block in &inner.sealed {
            deadline.check()?;
            if !block.overlaps(start, end) {
                continue;
            }
            collect_in_range(&block.read(&self.labels)?, start, end, &mut merged);
        }

        // The head is read unconditionally; see module docs.
        if let Some(head) = &inner.head {
            deadline.check()?;
            collect_in_range(&head.read(&self.labels)?, start, end, &mut merged);
        }
        drop(inner);

        merged.sort_by_key(|s| s.timestamp);
        merged.dedup_by_key(|s| s.timestamp);
        Ok(merged)
    }

    /// Atomic 1:1 swap in the sealed list; `false` when `old_id` is
    /// not present. The replacement must already be sealed.
    pub fn replace_block(&self, old_id: u64, new_block: Arc<Block>) -> Result<bool> {
        if !new_block.is_sealed() {
            return Err(crate::error::ChronicleError::invalid(
                "replacement block must be sealed",
            ));
        }
        let mut inner = self.inner.write();
        let Some(pos) = inner.sealed.iter().position(|b| b.id() == old_id) else {
            return Ok(false);
        };
        inner.sealed.remove(pos);
        Self::insert_sorted(&mut inner.sealed, new_block);
        Ok(true)
    }

    /// Atomic 2 -> 1 replacement used by compaction: both source
    /// blocks are removed and the merged block inserted under a single
    /// write lock. `false` (and no change) unless both sources are
    /// present.
    pub fn swap_merged(&self, first_id: u64, second_id: u64, merged: Arc<Block>) -> Result<bool> {
        if !merged.is_sealed() {
            return Err(crate::error::ChronicleError::invalid(
                "merged block must be sealed",
            ));
        }
        let mut inner = self.inner.write();
        let first = inner.sealed.iter().position(|b| b.id() == first_id);
        let second = inner.sealed.iter().position(|b| b.id() == second_id);
        let (Some(first), Some(second)) = (first, second) else {
            return Ok(false);
        };
        let (hi, lo) = if first > second { (first, second) } else { (second, first) };
        inner.sealed.remove(hi);
        inner.sealed.remove(lo);
        Self::insert_sorted(&mut inner.sealed, merged);
        Ok(true)
    }

    /// Sealed blocks, in start-time order. Shared immutable handles;
    /// no lock is needed to read them afterwards.
    pub fn sealed_blocks(&self) -> Vec<Arc<Block>> {
        self.inner.read().sealed.clone()
    }

    pub fn has_head(&self) -> bool {
        self.inner.read().head.is_some()
    }

    pub fn num_samples(&self) -> usize {
        let inner = self.inner.read();
        let head = inner.head.as_ref().map_or(0, Block::num_samples);
        head + inner.sealed.iter().map(|b| b.num_samples()).sum::<usize>()
    }

    pub fn min_timestamp(&self) -> Option<i64> {
        let inner = self.inner.read();
        let mut min: Option<i64> = None;
        for block in &inner.sealed {
            if block.num_samples() > 0 {
                min = Some(min.map_or(block.start_time(), |m| m.min(block.start_time())));
            }
        }
        if let Some(head) = &inner.head {
            if head.num_samples() > 0 {
                min = Some(min.map_or(head.start_time(), |m| m.min(head.start_time())));
            }
        }
        min
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        let inner = self.inner.read();
        let mut max: Option<i64> = None;
        for block in &inner.sealed {
            if block.num_samples() > 0 {
                max = Some(max.map_or(block.end_time(), |m| m.max(block.end_time())));
            }
        }
        if let Some(head) = &inner.head {
            if head.num_samples() > 0 {
                max = Some(max.map_or(head.end_time(), |m| m.max(head.end_time())));
            }
        }
        max
    }

    /// Retire sealed blocks wholly before `ts` (end_time < ts).
    /// Returns how many were dropped. The head is never trimmed here.
    pub fn drop_before(&self, ts: i64) -> usize {
        let mut inner = self.inner.write();
        let before = inner.sealed.len();
        inner.sealed.retain(|b| b.end_time() >= ts);
        before - inner.sealed.len()
    }
}

fn collect_in_range(samples: &[Sample], start: i64, end: i64, out: &mut Vec<Sample>) {
    out.extend(
        samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .copied(),
    );
}
