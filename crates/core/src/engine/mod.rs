//! Continuous-batching step driver.
//!
//! [`BatchEngine`] holds every admitted sequence and runs them through the
//! decoder pipeline one step at a time over a shared paged KV cache.
//! Sequences can be admitted or evicted between any two steps; a newly
//! admitted sequence is prefilled in the same step that decodes the others.
//!
//! ```ignore
//! let mut engine = BatchEngine::new(&config, pipeline, cache_config)?;
//! let id = engine.admit(Request::new(prompt, GenerationParams::from_config(&config)))?;
//! while !engine.is_idle() {
//!     let out = engine.step()?;
//!     // stream out.tokens, collect out.finished
//! }
//! ```
//!
//! Exhaustion of the block pool is returned as [`EngineError::Cache`] with
//! no state changed; which sequence to evict is the caller's decision.

mod batch;
mod types;

pub use batch::POSITION_PAD;
pub use types::{EngineError, EngineStats, FinishedSequence, Result, StepOutput};

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use tracing::{debug, info, trace, warn};

use crate::config::{DecoderInputNames, GeneratorConfig};
use crate::kv_cache::{
    CacheConfig, KVCacheManager, PagedKvCache, SequenceId, SlotRequest, StepMetadata,
};
use crate::pipeline::{DecoderPipeline, ManagedTensors, StepPhase};
use crate::request::{Request, SequenceState};
use crate::sampling;
use crate::search::{logits_to_host, SearchError};

use batch::StepBatch;

pub struct BatchEngine {
    pipeline: DecoderPipeline,
    managed: ManagedTensors,
    kv_cache: KVCacheManager,
    names: DecoderInputNames,
    /// Keyed by id, so batch order is admission order.
    sequences: BTreeMap<SequenceId, SequenceState>,
    next_seq_id: SequenceId,
    pad_token_id: u32,
    device: Device,
    num_steps: u64,
}

impl BatchEngine {
    /// Allocate the paged cache and register its buffers as managed tensors
    /// that stages update in place.
    pub fn new(
        config: &GeneratorConfig,
        pipeline: DecoderPipeline,
        cache_config: CacheConfig,
    ) -> Result<Self> {
        if !config.model.kv_cache.paged {
            return Err(EngineError::Config(
                "continuous batching needs kv_cache.paged".into(),
            ));
        }
        if cache_config.num_blocks == 0 {
            return Err(EngineError::Config("kv cache has no blocks".into()));
        }
        let names = config.model.decoder.inputs.clone();
        let cache = PagedKvCache::new(&cache_config, &names)?;

        let mut managed = ManagedTensors::new();
        managed.declare_output(pipeline.logits_name());
        for (name, tensor) in cache.named_tensors() {
            managed.set_input(name, tensor.clone());
            managed.declare_output(name);
        }
        info!(
            num_blocks = cache_config.num_blocks,
            block_size = cache_config.block_size,
            stages = pipeline.stages().len(),
            "batch engine ready"
        );
        Ok(Self {
            pipeline,
            managed,
            kv_cache: KVCacheManager::new(&cache_config),
            names,
            sequences: BTreeMap::new(),
            next_seq_id: 0,
            pad_token_id: config.model.pad_token_id,
            device: cache_config.device,
            num_steps: 0,
        })
    }

    pub fn admit(&mut self, request: Request) -> Result<SequenceId> {
        if request.prompt.is_empty() {
            return Err(EngineError::InvalidRequest("prompt is empty".into()));
        }
        if request.params.max_new_tokens == 0 {
            return Err(EngineError::InvalidRequest(
                "max_new_tokens must be > 0".into(),
            ));
        }
        if request.params.max_new_tokens_for(request.prompt.len()) == 0 {
            return Err(EngineError::InvalidRequest(format!(
                "prompt of {} tokens leaves no room under max_length",
                request.prompt.len()
            )));
        }
        let seq_id = self.next_seq_id;
        self.kv_cache.add_sequence(seq_id)?;
        self.next_seq_id += 1;
        info!(
            seq_id,
            prompt_len = request.prompt.len(),
            max_new_tokens = request.params.max_new_tokens_for(request.prompt.len()),
            "admitted sequence"
        );
        self.sequences
            .insert(seq_id, SequenceState::new(seq_id, request));
        Ok(seq_id)
    }

    /// Drop a running sequence and release its blocks. Returns the tokens it
    /// generated so far.
    pub fn evict(&mut self, seq_id: SequenceId) -> Result<Vec<u32>> {
        let state = self
            .sequences
            .remove(&seq_id)
            .ok_or(EngineError::UnknownSequence(seq_id))?;
        let freed = self.kv_cache.free_sequence(seq_id)?;
        debug!(seq_id, generated = state.num_generated(), freed, "evicted sequence");
        Ok(state.generated().to_vec())
    }

    /// Run one decoder step over every running sequence.
    pub fn step(&mut self) -> Result<StepOutput> {
        if self.sequences.is_empty() {
            return Ok(StepOutput::default());
        }
        let batch = StepBatch::gather(self.sequences.values(), self.pad_token_id);
        let requests = batch.slot_requests();
        let meta = self
            .kv_cache
            .prepare_step(&requests, batch.is_prompt, &self.device)?;

        let rows = match self.forward(&batch, meta) {
            Ok(rows) => rows,
            Err(e) => {
                self.rollback(&requests);
                return Err(e);
            }
        };
        self.num_steps += 1;

        let mut output = StepOutput::default();
        for (seq_id, mut logits) in batch.seq_ids.iter().copied().zip(rows) {
            let Some(state) = self.sequences.get_mut(&seq_id) else {
                continue;
            };
            state.processors.process(&mut logits, &state.tokens);
            let token = sampling::sample(&logits, &state.params.sampling, &mut state.sampler_state);
            state.append(token);
            trace!(seq_id, token, "sampled token");
            output.tokens.push((seq_id, token));

            if let Some(reason) = state.check_finished() {
                state.status = reason.into();
                output.finished.push(FinishedSequence {
                    seq_id,
                    reason,
                    generated_token_ids: state.generated().to_vec(),
                });
            }
        }
        for finished in &output.finished {
            self.sequences.remove(&finished.seq_id);
            self.kv_cache.free_sequence(finished.seq_id)?;
            info!(
                seq_id = finished.seq_id,
                reason = ?finished.reason,
                generated = finished.generated_token_ids.len(),
                "sequence finished"
            );
        }
        debug!(
            step = self.num_steps,
            batch = batch.rows(),
            width = batch.width,
            is_prompt = batch.is_prompt,
            finished = output.finished.len(),
            free_blocks = self.kv_cache.num_free_blocks(),
            "engine step"
        );
        Ok(output)
    }

    /// Step until no sequence is left, collecting every finished sequence.
    pub fn run_to_completion(&mut self) -> Result<Vec<FinishedSequence>> {
        let mut finished = Vec::new();
        while !self.is_idle() {
            finished.extend(self.step()?.finished);
        }
        Ok(finished)
    }

    /// Bind the step's inputs, run the pipeline and pick each row's logits
    /// at its last fed token.
    fn forward(&mut self, batch: &StepBatch, meta: StepMetadata) -> Result<Vec<Vec<f32>>> {
        let rows = batch.rows();
        let names = &self.names;
        self.managed.set_input(
            &names.input_ids,
            Tensor::from_vec(batch.input_ids.clone(), (rows, batch.width), &self.device)?,
        );
        self.managed.set_input(
            &names.position_ids,
            Tensor::from_vec(batch.positions.clone(), (rows, batch.width), &self.device)?,
        );
        self.managed.set_input(&names.block_tables, meta.block_tables);
        self.managed.set_input(&names.slot_mapping, meta.slot_mapping);
        self.managed.set_input(&names.context_lens, meta.context_lens);

        let phase = if meta.is_prompt {
            StepPhase::Prompt
        } else {
            StepPhase::TokenGen
        };
        let logits = self.pipeline.run_step(&mut self.managed, phase)?;
        let dims = logits.dims().to_vec();
        let host = logits_to_host(&logits, rows)?;

        // Logits with fewer positions than fed tokens hold the last one only.
        host.into_iter()
            .zip(&batch.num_new)
            .map(|(positions, &n)| {
                n.min(positions.len())
                    .checked_sub(1)
                    .and_then(|at| positions.into_iter().nth(at))
                    .ok_or_else(|| {
                        EngineError::Logits(SearchError::LogitsShape {
                            expected: format!("[{rows}, positions, vocab] with positions > 0"),
                            actual: dims.clone(),
                        })
                    })
            })
            .collect()
    }

    /// Undo a planned step whose forward pass failed.
    fn rollback(&mut self, requests: &[SlotRequest]) {
        for req in requests {
            if let Err(e) = self.kv_cache.rewind(req.seq_id, req.num_new_tokens) {
                warn!(seq_id = req.seq_id, error = %e, "failed to roll back cache step");
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn num_running(&self) -> usize {
        self.sequences.len()
    }

    pub fn sequence(&self, seq_id: SequenceId) -> Option<&SequenceState> {
        self.sequences.get(&seq_id)
    }

    pub fn kv_cache(&self) -> &KVCacheManager {
        &self.kv_cache
    }

    pub fn managed(&self) -> &ManagedTensors {
        &self.managed
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            num_running_sequences: self.sequences.len(),
            num_steps: self.num_steps,
            num_free_blocks: self.kv_cache.num_free_blocks(),
            num_total_blocks: self.kv_cache.num_total_blocks(),
            block_size: self.kv_cache.block_size(),
            kv_cache_metrics: self.kv_cache.metrics().snapshot(),
        }
    }
}
