// chronicle_core/src/engine/mod.rs
//
// The storage engine: write routing, range reads, and the block
// lifecycle (seal / flush / compact / retire).
//
// All state hangs off an engine handle returned by the constructor;
// there is no process-global state and no init/cleanup pair. Lock
// order is engine registry -> label index -> series, never reversed,
// and the persistence sink is always invoked outside per-series locks
// on blocks that are already sealed and detached.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block::Block;
use crate::codec::CodecSet;
use crate::error::{ChronicleError, Result};
use crate::index::{LabelIndex, Matcher};
use crate::series::Series;
use crate::types::{Granularity, LabelSet, MetricType, Sample};

/// Engine tunables. All fields have serde defaults so hosts can load a
/// partial config from any serde format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Head blocks seal at this many samples (the classic 120-sample
    /// chunk convention). The granularity interval, when known, seals
    /// a head early once it spans `interval * threshold` ms.
    pub seal_threshold_samples: usize,
    /// How far below the head's start time an append may reach before
    /// it is rejected with `OutOfRange`.
    pub ooo_tolerance_ms: i64,
    /// Compaction merges adjacent sealed blocks while their combined
    /// sample count stays at or below this.
    pub compaction_max_samples: usize,
    /// Query lookback window: how far behind a step timestamp the
    /// adapter searches for the most recent sample.
    pub lookback_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seal_threshold_samples: 120,
            ooo_tolerance_ms: 0,
            compaction_max_samples: 480,
            lookback_ms: 300_000,
        }
    }
}

/// Caller-supplied deadline, checked at operation entry and at merge
/// boundaries inside reads. The core never suspends; expiry simply
/// aborts with `DeadlineExceeded` and no partial output.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn in_millis(ms: u64) -> Self {
        Self(Some(Instant::now() + Duration::from_millis(ms)))
    }

    /// Already expired; every check fails. Test hook.
    pub fn expired() -> Self {
        Self(Some(Instant::now()))
    }

    pub fn check(&self) -> Result<()> {
        match self.0 {
            Some(t) if Instant::now() >= t => Err(ChronicleError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// Destination for sealed, serialized blocks. Implementations must be
/// thread-safe; the engine calls `store` synchronously after sealing,
/// outside all per-series locks.
pub trait BlockSink: Send + Sync {
    fn store(&self, block_bytes: &[u8]) -> Result<()>;
}

/// Top-level storage façade.
pub struct StorageEngine {
    config: EngineConfig,
    series: RwLock<HashMap<u64, Arc<Series>>>,
    index: LabelIndex,
    block_ids: Arc<AtomicU64>,
    sink: Option<Arc<dyn BlockSink>>,
}

impl StorageEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            series: RwLock::new(HashMap::new()),
            index: LabelIndex::new(),
            block_ids: Arc::new(AtomicU64::new(1)),
            sink: None,
        }
    }

    /// Engine wired to a persistence sink for sealed blocks.
    pub fn with_sink(config: EngineConfig, sink: Arc<dyn BlockSink>) -> Self {
        let mut engine = Self::new(config);
        engine.sink = Some(sink);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------

    /// Append `samples` to the series identified by `labels`, creating
    /// it on first write with default metadata.
    pub fn write(&self, labels: &LabelSet, samples: &[Sample]) -> Result<()> {
        self.write_typed(labels, samples, MetricType::default(), Granularity::default())
    }

    /// Append with explicit series metadata, applied on first creation
    /// only; an existing series keeps its original type and
    /// granularity.
    pub fn write_typed(
        &self,
        labels: &LabelSet,
        samples: &[Sample],
        metric_type: MetricType,
        granularity: Granularity,
    ) -> Result<()> {
        if labels.is_empty() {
            return Err(ChronicleError::invalid("label set must not be empty"));
        }
        if samples.is_empty() {
            return Ok(());
        }

        let series = self.get_or_create(labels, metric_type, granularity)?;

        // Appends happen under the per-series lock inside `append`;
        // sealed blocks are collected and persisted only after every
        // series lock has been released.
        let mut to_persist = Vec::new();
        for sample in samples {
            let full = series.append(*sample, &self.config)?;
            if full {
                if let Some(sealed) = series.seal_head()? {
                    to_persist.push(sealed);
                }
            }
        }

        for block in to_persist {
            self.persist(&block)?;
        }
        Ok(())
    }

    fn get_or_create(
        &self,
        labels: &LabelSet,
        metric_type: MetricType,
        granularity: Granularity,
    ) -> Result<Arc<Series>> {
        let id = labels.id();

        if let Some(series) = self.series.read().get(&id) {
            return Self::verify_identity(series, labels).map(|_| Arc::clone(series));
        }

        // Single critical section for create: registry write lock,
        // then the index (engine -> index order).
        let mut registry = self.series.write();
        if let Some(series) = registry.get(&id) {
            return Self::verify_identity(series, labels).map(|_| Arc::clone(series));
        }
        let series = Arc::new(Series::new(
            labels.clone(),
            metric_type,
            granularity,
            Arc::clone(&self.block_ids),
        ));
        registry.insert(id, Arc::clone(&series));
        self.index.insert(id, labels);
        debug!(series = %labels, id, "created series");
        Ok(series)
    }

    /// The registry stores the full label set precisely so a hash
    /// collision cannot silently alias two series.
    fn verify_identity(series: &Arc<Series>, labels: &LabelSet) -> Result<()> {
        if series.labels() == labels {
            Ok(())
        } else {
            Err(ChronicleError::internal(format!(
                "series id collision: {} vs {}",
                series.labels(),
                labels
            )))
        }
    }

    fn persist(&self, block: &Arc<Block>) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let bytes = block.serialize()?;
        sink.store(&bytes)
    }

    // -------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------

    /// Samples for `labels` in `[start, end]`, sorted and
    /// deduplicated. An unknown series yields an empty result, not an
    /// error.
    pub fn read(&self, labels: &LabelSet, start: i64, end: i64) -> Result<Vec<Sample>> {
        self.read_with_deadline(labels, start, end, &Deadline::none())
    }

    pub fn read_with_deadline(
        &self,
        labels: &LabelSet,
        start: i64,
        end: i64,
        deadline: &Deadline,
    ) -> Result<Vec<Sample>> {
        deadline.check()?;
        let series = {
            let registry = self.series.read();
            match registry.get(&labels.id()) {
                Some(series) if series.labels() == labels => Arc::clone(series),
                _ => return Ok(Vec::new()),
            }
        };
        series.read(start, end, deadline)
    }

    pub fn label_names(&self) -> Result<Vec<String>> {
        Ok(self.index.label_names())
    }

    /// Values for `name`, sorted; empty (not an error) when unknown.
    pub fn label_values(&self, name: &str) -> Result<Vec<String>> {
        if name.is_empty() {
            return Err(ChronicleError::invalid("label name must not be empty"));
        }
        Ok(self.index.label_values(name))
    }

    /// Resolve matchers to `(series_id, label_set)` pairs, ordered by
    /// series id.
    pub fn match_series(&self, matchers: &[Matcher]) -> Result<Vec<(u64, LabelSet)>> {
        let ids = self.index.matches(matchers)?;
        let registry = self.series.read();
        Ok(ids
            .into_iter()
            .filter_map(|id| registry.get(&id).map(|s| (id, s.labels().clone())))
            .collect())
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Total stored samples for `labels`; 0 when unknown.
    pub fn num_samples(&self, labels: &LabelSet) -> usize {
        let registry = self.series.read();
        match registry.get(&labels.id()) {
            Some(series) if series.labels() == labels => series.num_samples(),
            _ => 0,
        }
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    fn all_series(&self) -> Vec<Arc<Series>> {
        self.series.read().values().cloned().collect()
    }

    /// Seal every series' head and hand the sealed blocks to the sink.
    pub fn flush(&self) -> Result<()> {
        let mut sealed_count = 0usize;
        let mut to_persist = Vec::new();
        for series in self.all_series() {
            if let Some(block) = series.seal_head()? {
                sealed_count += 1;
                to_persist.push(block);
            }
        }
        for block in &to_persist {
            self.persist(block)?;
        }
        info!(sealed = sealed_count, "flushed engine");
        Ok(())
    }

    /// Merge adjacent sealed blocks per series while the combined
    /// sample count stays within `compaction_max_samples`. Swaps are
    /// atomic per series; readers either see the sources or the merged
    /// block, never both.
    pub fn compact(&self) -> Result<()> {
        let mut merged_count = 0usize;
        for series in self.all_series() {
            loop {
                let blocks = series.sealed_blocks();
                let Some(pair) = blocks.windows(2).find(|pair| {
                    pair[0].num_samples() + pair[1].num_samples()
                        <= self.config.compaction_max_samples
                }) else {
                    break;
                };
                let (first, second) = (&pair[0], &pair[1]);

                let merged = self.merge_pair(&series, first, second)?;
                let merged = Arc::new(merged);
                if !series.swap_merged(first.id(), second.id(), Arc::clone(&merged))? {
                    // Lost a race against a concurrent swap; rescan.
                    continue;
                }
                self.persist(&merged)?;
                merged_count += 1;
            }
        }
        info!(merged = merged_count, "compacted engine");
        Ok(())
    }

    fn merge_pair(&self, series: &Arc<Series>, first: &Block, second: &Block) -> Result<Block> {
        let labels = series.labels();
        let mut samples = first.read(labels)?;
        samples.extend(second.read(labels)?);
        samples.sort_by_key(|s| s.timestamp);
        samples.dedup_by_key(|s| s.timestamp);

        let id = self
            .block_ids
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut merged = Block::new(id, CodecSet::for_metric(series.metric_type()));
        for sample in samples {
            merged.append(labels, sample)?;
        }
        merged.seal()?;
        debug!(
            series = %labels,
            first = first.id(),
            second = second.id(),
            merged = id,
            "merged adjacent blocks"
        );
        Ok(merged)
    }

    /// Retention primitive: retire sealed blocks wholly before `ts`
    /// across all series. Policy lives with the caller.
    pub fn drop_before(&self, ts: i64) -> Result<usize> {
        let mut dropped = 0usize;
        for series in self.all_series() {
            dropped += series.drop_before(ts);
        }
        if dropped > 0 {
            info!(dropped, horizon = ts, "retired blocks");
        }
        Ok(dropped)
    }

    /// Recovery path: attach a deserialized sealed block to every
    /// series it contains, creating series and index entries as
    /// needed. Overlap with live data is fine; reads deduplicate.
    pub fn adopt_block(&self, block: Block) -> Result<()> {
        if !block.is_sealed() {
            return Err(ChronicleError::invalid("only sealed blocks can be adopted"));
        }
        let block = Arc::new(block);
        for labels in block.label_sets() {
            let series =
                self.get_or_create(&labels, MetricType::default(), Granularity::default())?;
            series.add_sealed(Arc::clone(&block))?;
        }
        Ok(())
    }

    /// `flush` then release. The handle owns all state; dropping it
    /// after close releases everything.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        info!(series = self.series_count(), "closed engine");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().copied()).unwrap()
    }

    fn engine() -> StorageEngine {
        StorageEngine::new(EngineConfig::default())
    }

    /// Sink that captures every stored block's bytes.
    #[derive(Default)]
    struct CapturingSink {
        stored: Mutex<Vec<Vec<u8>>>,
    }

    impl BlockSink for CapturingSink {
        fn store(&self, block_bytes: &[u8]) -> Result<()> {
            self.stored.lock().push(block_bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_write_then_read_your_writes() {
        let engine = engine();
        let set = labels(&[("__name__", "up"), ("job", "api")]);
        let samples: Vec<Sample> = (0..5).map(|i| Sample::new(i, i as f64)).collect();
        engine.write(&set, &samples).unwrap();

        let got = engine.read(&set, 0, 4).unwrap();
        assert_eq!(got.len(), 5);
        for (i, s) in got.iter().enumerate() {
            assert_eq!(s.timestamp, i as i64);
        }
    }

    #[test]
    fn test_insertion_order_does_not_split_series() {
        let engine = engine();

        let mut first = LabelSet::new();
        first.add("__name__", "boundary_large").unwrap();
        first.add("test", "phase1").unwrap();
        first.add("pool_test", "true").unwrap();
        first.add("size", "large").unwrap();

        let mut second = LabelSet::new();
        second.add("size", "large").unwrap();
        second.add("pool_test", "true").unwrap();
        second.add("test", "phase1").unwrap();
        second.add("__name__", "boundary_large").unwrap();

        assert_eq!(first.id(), second.id());
        engine.write(&first, &[Sample::new(1, 1.0)]).unwrap();
        engine.write(&second, &[Sample::new(2, 2.0)]).unwrap();

        assert_eq!(engine.series_count(), 1);
        assert_eq!(engine.read(&first, 0, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_idempotent_write() {
        let engine = engine();
        let set = labels(&[("__name__", "up")]);
        let samples = [Sample::new(1, 1.0), Sample::new(2, 2.0)];
        engine.write(&set, &samples).unwrap();
        engine.write(&set, &samples).unwrap();

        let got = engine.read(&set, 0, 10).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_read_unknown_series_is_empty() {
        let engine = engine();
        assert!(engine.read(&labels(&[("a", "b")]), 0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_empty_label_set_rejected() {
        let engine = engine();
        let err = engine.write(&LabelSet::new(), &[Sample::new(1, 1.0)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_full_head_seals_and_persists() {
        let sink = Arc::new(CapturingSink::default());
        let engine = StorageEngine::with_sink(EngineConfig::default(), Arc::clone(&sink) as Arc<dyn BlockSink>);
        let set = labels(&[("__name__", "up")]);

        let samples: Vec<Sample> = (0..120).map(|i| Sample::new(i, 1.0)).collect();
        engine.write(&set, &samples).unwrap();

        // The 120th sample hit the threshold: one block sealed and stored.
        assert_eq!(sink.stored.lock().len(), 1);
        let restored = Block::deserialize(&sink.stored.lock()[0]).unwrap();
        assert_eq!(restored.num_samples(), 120);

        // All samples remain readable after the seal.
        assert_eq!(engine.read(&set, 0, 200).unwrap().len(), 120);
    }

    #[test]
    fn test_flush_seals_all_heads() {
        let sink = Arc::new(CapturingSink::default());
        let engine = StorageEngine::with_sink(EngineConfig::default(), Arc::clone(&sink) as Arc<dyn BlockSink>);

        engine.write(&labels(&[("s", "1")]), &[Sample::new(1, 1.0)]).unwrap();
        engine.write(&labels(&[("s", "2")]), &[Sample::new(1, 1.0)]).unwrap();
        engine.flush().unwrap();

        assert_eq!(sink.stored.lock().len(), 2);
        // Reads still see the data afterwards.
        assert_eq!(engine.read(&labels(&[("s", "1")]), 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_label_metadata() {
        let engine = engine();
        engine
            .write(&labels(&[("__name__", "up"), ("zone", "b")]), &[Sample::new(1, 1.0)])
            .unwrap();
        engine
            .write(&labels(&[("__name__", "up"), ("zone", "a")]), &[Sample::new(1, 1.0)])
            .unwrap();

        assert_eq!(engine.label_names().unwrap(), vec!["__name__", "zone"]);
        assert_eq!(engine.label_values("zone").unwrap(), vec!["a", "b"]);
        assert!(engine.label_values("nope").unwrap().is_empty());
        assert!(engine.label_values("").is_err());
    }

    #[test]
    fn test_match_series() {
        let engine = engine();
        for zone in ["a", "b", "c"] {
            engine
                .write(&labels(&[("__name__", "up"), ("zone", zone)]), &[Sample::new(1, 1.0)])
                .unwrap();
        }

        let eq = engine.match_series(&[Matcher::eq("zone", "a")]).unwrap();
        assert_eq!(eq.len(), 1);
        assert_eq!(eq[0].1.get("zone"), Some("a"));

        let ne = engine.match_series(&[Matcher::not_eq("zone", "a")]).unwrap();
        assert_eq!(ne.len(), 2);

        let re = engine.match_series(&[Matcher::regex("zone", "a|b")]).unwrap();
        assert_eq!(re.len(), 2);
    }

    #[test]
    fn test_compact_merges_adjacent_blocks() {
        let engine = engine();
        let set = labels(&[("__name__", "up")]);

        // Two small sealed blocks via explicit flushes.
        engine.write(&set, &[Sample::new(1, 1.0), Sample::new(2, 2.0)]).unwrap();
        engine.flush().unwrap();
        engine.write(&set, &[Sample::new(3, 3.0), Sample::new(4, 4.0)]).unwrap();
        engine.flush().unwrap();

        engine.compact().unwrap();

        let registry = engine.series.read();
        let series = registry.get(&set.id()).unwrap();
        assert_eq!(series.sealed_blocks().len(), 1);
        drop(registry);

        let got = engine.read(&set, 0, 10).unwrap();
        let ts: Vec<i64> = got.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_compact_respects_size_threshold() {
        let config = EngineConfig { compaction_max_samples: 3, ..EngineConfig::default() };
        let engine = StorageEngine::new(config);
        let set = labels(&[("__name__", "up")]);

        engine.write(&set, &[Sample::new(1, 1.0), Sample::new(2, 2.0)]).unwrap();
        engine.flush().unwrap();
        engine.write(&set, &[Sample::new(3, 3.0), Sample::new(4, 4.0)]).unwrap();
        engine.flush().unwrap();

        // 2 + 2 > 3: nothing merges.
        engine.compact().unwrap();
        let registry = engine.series.read();
        assert_eq!(registry.get(&set.id()).unwrap().sealed_blocks().len(), 2);
    }

    #[test]
    fn test_drop_before() {
        let engine = engine();
        let set = labels(&[("__name__", "up")]);
        engine.write(&set, &[Sample::new(10, 1.0)]).unwrap();
        engine.flush().unwrap();
        engine.write(&set, &[Sample::new(100, 2.0)]).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.drop_before(50).unwrap(), 1);
        let got = engine.read(&set, 0, i64::MAX).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, 100);
    }

    #[test]
    fn test_adopt_block_restores_series() {
        // Build and serialize a block in one engine...
        let sink = Arc::new(CapturingSink::default());
        let source = StorageEngine::with_sink(EngineConfig::default(), Arc::clone(&sink) as Arc<dyn BlockSink>);
        let set = labels(&[("__name__", "up"), ("zone", "a")]);
        source.write(&set, &[Sample::new(1, 1.0), Sample::new(2, 2.0)]).unwrap();
        source.flush().unwrap();

        // ...then adopt it into a fresh engine.
        let fresh = engine();
        let block = Block::deserialize(&sink.stored.lock()[0]).unwrap();
        fresh.adopt_block(block).unwrap();

        assert_eq!(fresh.series_count(), 1);
        assert_eq!(fresh.read(&set, 0, 10).unwrap().len(), 2);
        assert_eq!(fresh.label_values("zone").unwrap(), vec!["a"]);

        // Overlapping re-adoption stays deduplicated.
        let block = Block::deserialize(&sink.stored.lock()[0]).unwrap();
        fresh.adopt_block(block).unwrap();
        assert_eq!(fresh.read(&set, 0, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_expired_deadline_aborts() {
        let engine = engine();
        let set = labels(&[("__name__", "up")]);
        engine.write(&set, &[Sample::new(1, 1.0)]).unwrap();
        let err = engine
            .read_with_deadline(&set, 0, 10, &Deadline::expired())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let engine = Arc::new(engine());
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                let worker = t.to_string();
                let set = labels(&[("__name__", "load"), ("worker", worker.as_str())]);
                for i in 0..500i64 {
                    engine.write(&set, &[Sample::new(i, i as f64)]).unwrap();
                }
                // Read-your-writes on this thread's own series.
                let got = engine.read(&set, 0, 499).unwrap();
                assert_eq!(got.len(), 500);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.series_count(), 4);
    }

    #[test]
    fn test_close_flushes() {
        let sink = Arc::new(CapturingSink::default());
        let engine = StorageEngine::with_sink(EngineConfig::default(), Arc::clone(&sink) as Arc<dyn BlockSink>);
        engine.write(&labels(&[("a", "b")]), &[Sample::new(1, 1.0)]).unwrap();
        engine.close().unwrap();
        assert_eq!(sink.stored.lock().len(), 1);
    }
}
