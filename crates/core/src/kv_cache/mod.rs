//! KV cache bookkeeping.
//!
//! [`KVCacheManager`] owns the block pool and one [`BlockTable`] per live
//! sequence, and turns a step's per-sequence token counts into block-table /
//! slot-mapping tensors. It reports exhaustion; choosing a victim is the
//! scheduler's job.

mod block_pool;
mod block_table;
pub mod config;
mod error;
pub mod metrics;
mod paged;
mod past_present;
pub mod slots;

pub use block_pool::BlockId;
pub use block_table::BlockTable;
pub use config::CacheConfig;
pub use error::CacheError;
pub use metrics::{KVCacheMetrics, MetricsSnapshot};
pub use paged::PagedKvCache;
pub use past_present::PastPresentCache;
pub use slots::{SlotRequest, StepLayout, StepMetadata, BLOCK_TABLE_PAD, SLOT_MAPPING_PAD};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use candle_core::Device;
use tracing::{debug, warn};

use block_pool::BlockPool;

pub type SequenceId = u64;

pub struct KVCacheManager {
    block_pool: BlockPool,
    tables: HashMap<SequenceId, BlockTable>,
    block_size: usize,
    metrics: Arc<KVCacheMetrics>,
}

impl KVCacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_metrics(config, Arc::new(KVCacheMetrics::new()))
    }

    pub fn with_metrics(config: &CacheConfig, metrics: Arc<KVCacheMetrics>) -> Self {
        Self {
            block_pool: BlockPool::new(config.num_blocks),
            tables: HashMap::new(),
            block_size: config.block_size,
            metrics,
        }
    }

    /// Start tracking a sequence with an empty block table.
    pub fn add_sequence(&mut self, seq_id: SequenceId) -> Result<(), CacheError> {
        if self.tables.contains_key(&seq_id) {
            return Err(CacheError::DuplicateSequence { seq_id });
        }
        self.tables.insert(seq_id, BlockTable::new(self.block_size));
        Ok(())
    }

    pub fn contains(&self, seq_id: SequenceId) -> bool {
        self.tables.contains_key(&seq_id)
    }

    pub fn num_sequences(&self) -> usize {
        self.tables.len()
    }

    pub fn block_table(&self, seq_id: SequenceId) -> Option<&BlockTable> {
        self.tables.get(&seq_id)
    }

    /// Blocks the given step would have to allocate.
    ///
    /// A sequence may appear at most once per step.
    pub fn blocks_needed(&self, requests: &[SlotRequest]) -> Result<usize, CacheError> {
        let mut seen = HashSet::with_capacity(requests.len());
        if let Some(req) = requests.iter().find(|req| !seen.insert(req.seq_id)) {
            return Err(CacheError::RepeatedInStep { seq_id: req.seq_id });
        }
        requests.iter().try_fold(0, |acc, req| {
            let table = self.table(req.seq_id)?;
            Ok(acc + table.blocks_needed(req.num_new_tokens))
        })
    }

    /// Whether [`Self::plan_step`] would succeed right now.
    pub fn can_schedule(&self, requests: &[SlotRequest]) -> bool {
        self.blocks_needed(requests)
            .is_ok_and(|needed| needed <= self.block_pool.num_free())
    }

    /// Reserve space for one step and lay out where its tokens go.
    ///
    /// All-or-nothing: on [`CacheError::Exhausted`] no table or pool state
    /// has changed. On success every table has advanced by its request's
    /// token count.
    pub fn plan_step(
        &mut self,
        requests: &[SlotRequest],
        is_prompt: bool,
    ) -> Result<StepLayout, CacheError> {
        let needed = self.blocks_needed(requests)?;
        let available = self.block_pool.num_free();
        if needed > available {
            self.metrics.record_exhaustion();
            warn!(
                requested = needed,
                available,
                batch = requests.len(),
                "kv cache exhausted"
            );
            return Err(CacheError::Exhausted {
                requested: needed,
                available,
            });
        }

        let mut fresh = self.block_pool.allocate(needed)?.into_iter();
        if needed > 0 {
            self.metrics.record_allocation(needed);
        }

        let mut block_rows = Vec::with_capacity(requests.len());
        let mut slot_rows = Vec::with_capacity(requests.len());
        let mut context_lens = Vec::with_capacity(requests.len());
        for req in requests {
            let table = self
                .tables
                .get_mut(&req.seq_id)
                .ok_or(CacheError::UnknownSequence { seq_id: req.seq_id })?;
            let grow = table.blocks_needed(req.num_new_tokens);
            let ids: Vec<BlockId> = fresh.by_ref().take(grow).collect();
            table.append_blocks(&ids);

            let start = table.num_tokens();
            slot_rows.push(
                table
                    .slot_mapping(start, req.num_new_tokens)
                    .into_iter()
                    .map(|s| s as i64)
                    .collect(),
            );
            table.advance(req.num_new_tokens);
            block_rows.push(table.block_ids().iter().map(|&b| b as i64).collect());
            context_lens.push(table.num_tokens() as i64);
        }

        debug!(
            batch = requests.len(),
            new_blocks = needed,
            free_blocks = self.block_pool.num_free(),
            is_prompt,
            "planned cache step"
        );
        Ok(StepLayout::from_rows(
            block_rows,
            slot_rows,
            context_lens,
            is_prompt,
        ))
    }

    /// [`Self::plan_step`] followed by upload to `device`.
    pub fn prepare_step(
        &mut self,
        requests: &[SlotRequest],
        is_prompt: bool,
        device: &Device,
    ) -> Result<StepMetadata, CacheError> {
        Ok(self.plan_step(requests, is_prompt)?.to_tensors(device)?)
    }

    /// Forget the last `n` tokens of a sequence, keeping its blocks.
    pub fn rewind(&mut self, seq_id: SequenceId, n: usize) -> Result<(), CacheError> {
        let table = self
            .tables
            .get_mut(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?;
        if n > table.num_tokens() {
            return Err(CacheError::RewindTooFar {
                seq_id,
                requested: n,
                stored: table.num_tokens(),
            });
        }
        table.rewind(n);
        self.metrics.record_rewind(n);
        Ok(())
    }

    /// Stop tracking a sequence and return its blocks to the pool.
    ///
    /// Returns how many blocks were freed.
    pub fn free_sequence(&mut self, seq_id: SequenceId) -> Result<usize, CacheError> {
        let mut table = self
            .tables
            .remove(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?;
        let ids = table.release();
        if !ids.is_empty() {
            self.block_pool.free(&ids)?;
            self.metrics.record_free(ids.len());
        }
        debug!(seq_id, freed = ids.len(), "released sequence blocks");
        Ok(ids.len())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_pool.num_free()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.block_pool.num_total()
    }

    pub fn metrics(&self) -> &Arc<KVCacheMetrics> {
        &self.metrics
    }

    fn table(&self, seq_id: SequenceId) -> Result<&BlockTable, CacheError> {
        self.tables
            .get(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn manager(num_blocks: usize, block_size: usize) -> KVCacheManager {
        KVCacheManager::new(&CacheConfig {
            block_size,
            num_blocks,
            num_layers: 1,
            num_kv_heads: 1,
            head_dim: 4,
            dtype: DType::F32,
            device: Device::Cpu,
        })
    }

    #[test]
    fn prefill_then_decode_grows_tables() {
        let mut mgr = manager(16, 4);
        mgr.add_sequence(1).unwrap();
        mgr.add_sequence(2).unwrap();

        let layout = mgr
            .plan_step(&[SlotRequest::new(1, 6), SlotRequest::new(2, 3)], true)
            .unwrap();
        assert_eq!(layout.block_tables, vec![vec![0, 1], vec![2, -1]]);
        assert_eq!(
            layout.slot_mapping,
            vec![vec![0, 1, 2, 3, 4, 5], vec![8, 9, 10, -1, -1, -1]]
        );
        assert_eq!(layout.context_lens, vec![6, 3]);

        let layout = mgr
            .plan_step(&[SlotRequest::new(1, 1), SlotRequest::new(2, 1)], false)
            .unwrap();
        assert_eq!(layout.slot_mapping, vec![vec![6], vec![11]]);
        assert_eq!(layout.context_lens, vec![7, 4]);

        // Sequence 2 crosses into a new block.
        let layout = mgr
            .plan_step(&[SlotRequest::new(1, 1), SlotRequest::new(2, 1)], false)
            .unwrap();
        assert_eq!(layout.block_tables, vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(layout.slot_mapping, vec![vec![7], vec![12]]);
    }

    #[test]
    fn repeated_sequence_in_one_step_is_rejected() {
        let mut mgr = manager(16, 4);
        mgr.add_sequence(1).unwrap();
        let requests = [SlotRequest::new(1, 3), SlotRequest::new(1, 3)];
        assert!(!mgr.can_schedule(&requests));
        let err = mgr.plan_step(&requests, true).unwrap_err();
        assert!(matches!(err, CacheError::RepeatedInStep { seq_id: 1 }));
        assert_eq!(mgr.num_free_blocks(), 16);
        assert_eq!(mgr.block_table(1).unwrap().num_tokens(), 0);
    }

    #[test]
    fn tables_cover_context_after_every_step() {
        let mut mgr = manager(64, 3);
        for id in 0..4 {
            mgr.add_sequence(id).unwrap();
        }
        let mut history: HashMap<SequenceId, Vec<BlockId>> = HashMap::new();
        for step in 0..10 {
            let requests: Vec<SlotRequest> = (0..4)
                .map(|id| SlotRequest::new(id, if step == 0 { id as usize + 1 } else { 1 }))
                .collect();
            mgr.plan_step(&requests, step == 0).unwrap();
            for id in 0..4 {
                let table = mgr.block_table(id).unwrap();
                assert!(table.block_ids().len() * 3 >= table.num_tokens());
                let before = history.entry(id).or_default();
                assert!(table.block_ids().starts_with(before.as_slice()));
                *before = table.block_ids().to_vec();
            }
        }
    }

    #[test]
    fn exhaustion_leaves_tables_untouched() {
        let mut mgr = manager(3, 4);
        mgr.add_sequence(1).unwrap();
        mgr.add_sequence(2).unwrap();
        mgr.plan_step(&[SlotRequest::new(1, 8)], true).unwrap();
        let snapshot = mgr.block_table(1).unwrap().block_ids().to_vec();

        let err = mgr
            .plan_step(&[SlotRequest::new(1, 1), SlotRequest::new(2, 5)], true)
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Exhausted {
                requested: 3,
                available: 1
            }
        ));
        assert_eq!(mgr.block_table(1).unwrap().block_ids(), snapshot.as_slice());
        assert_eq!(mgr.block_table(1).unwrap().num_tokens(), 8);
        assert_eq!(mgr.block_table(2).unwrap().num_tokens(), 0);
        assert_eq!(mgr.num_free_blocks(), 1);
        assert_eq!(mgr.metrics().exhaustion_events(), 1);
    }

    #[test]
    fn free_returns_blocks_for_reuse() {
        let mut mgr = manager(2, 4);
        mgr.add_sequence(1).unwrap();
        mgr.plan_step(&[SlotRequest::new(1, 8)], true).unwrap();
        assert_eq!(mgr.num_free_blocks(), 0);
        assert_eq!(mgr.free_sequence(1).unwrap(), 2);
        assert_eq!(mgr.num_free_blocks(), 2);
        assert!(!mgr.contains(1));

        mgr.add_sequence(2).unwrap();
        let layout = mgr.plan_step(&[SlotRequest::new(2, 5)], true).unwrap();
        assert_eq!(layout.block_tables[0].len(), 2);
        assert_eq!(mgr.metrics().blocks_freed(), 2);
    }

    #[test]
    fn rewind_reuses_slots_without_new_blocks() {
        let mut mgr = manager(4, 4);
        mgr.add_sequence(1).unwrap();
        mgr.plan_step(&[SlotRequest::new(1, 3)], true).unwrap();
        mgr.plan_step(&[SlotRequest::new(1, 4)], false).unwrap();
        assert_eq!(mgr.num_free_blocks(), 2);

        mgr.rewind(1, 3).unwrap();
        let layout = mgr.plan_step(&[SlotRequest::new(1, 2)], false).unwrap();
        assert_eq!(layout.slot_mapping, vec![vec![4, 5]]);
        assert_eq!(mgr.num_free_blocks(), 2);
        assert_eq!(mgr.metrics().tokens_rewound(), 3);

        let err = mgr.rewind(1, 10).unwrap_err();
        assert!(matches!(err, CacheError::RewindTooFar { stored: 6, .. }));
    }

    #[test]
    fn unknown_and_duplicate_sequences() {
        let mut mgr = manager(4, 4);
        mgr.add_sequence(1).unwrap();
        assert!(matches!(
            mgr.add_sequence(1),
            Err(CacheError::DuplicateSequence { seq_id: 1 })
        ));
        assert!(matches!(
            mgr.plan_step(&[SlotRequest::new(9, 1)], false),
            Err(CacheError::UnknownSequence { seq_id: 9 })
        ));
        assert!(matches!(
            mgr.free_sequence(9),
            Err(CacheError::UnknownSequence { seq_id: 9 })
        ));
        assert!(!mgr.can_schedule(&[SlotRequest::new(1, 17)]));
        assert!(mgr.can_schedule(&[SlotRequest::new(1, 16)]));
    }

    #[test]
    fn prepare_step_uploads_tensors() {
        let mut mgr = manager(4, 2);
        mgr.add_sequence(5).unwrap();
        let meta = mgr
            .prepare_step(&[SlotRequest::new(5, 3)], true, &Device::Cpu)
            .unwrap();
        assert_eq!(meta.block_tables.to_vec2::<i64>().unwrap(), vec![vec![0, 1]]);
        assert_eq!(meta.slot_mapping.to_vec2::<i64>().unwrap(), vec![vec![0, 1, 2]]);
        assert!(meta.is_prompt);
    }
}
