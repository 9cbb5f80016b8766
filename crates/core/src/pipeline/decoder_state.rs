use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::managed::ManagedTensors;
use super::orchestrator::DecoderPipeline;
use super::{PipelineError, Result, StepPhase};
use crate::config::{DecoderConfig, DecoderInputNames};
use crate::kv_cache::PastPresentCache;
use crate::search::Sequences;

/// Managed decoder inputs for a fixed batch with a contiguous KV cache.
///
/// Owns `input_ids`, `position_ids`, `attention_mask` and the past key/value
/// tensors. The first [`DecoderState::run`] feeds the left-padded prompts;
/// each later run feeds only the new tokens and appends to the mask and
/// positions. Presents produced by a step become the next step's pasts.
pub struct DecoderState {
    pipeline: DecoderPipeline,
    managed: ManagedTensors,
    names: DecoderInputNames,
    cache: PastPresentCache,
    batch_beam: usize,
    mask: Vec<Vec<i64>>,
    next_position: Vec<i64>,
    first_run: bool,
    device: Device,
}

impl DecoderState {
    pub fn new(
        pipeline: DecoderPipeline,
        decoder: &DecoderConfig,
        sequences: &Sequences,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let batch_beam = sequences.num_rows();
        let len = sequences.sequence_length();
        let pads = sequences.pads();

        let mask: Vec<Vec<i64>> = pads
            .iter()
            .map(|&pad| (0..len).map(|i| i64::from(i >= pad)).collect())
            .collect();
        let positions: Vec<i64> = pads
            .iter()
            .flat_map(|&pad| (0..len).map(move |i| i.saturating_sub(pad) as i64))
            .collect();
        let ids: Vec<u32> = (0..batch_beam)
            .flat_map(|r| sequences.padded(r).iter().copied())
            .collect();

        let cache = PastPresentCache::new(decoder, batch_beam, dtype, device)?;
        let mut managed = ManagedTensors::new();
        let names = decoder.inputs.clone();
        managed.set_input(
            &names.input_ids,
            Tensor::from_vec(ids, (batch_beam, len), device)?,
        );
        managed.set_input(
            &names.position_ids,
            Tensor::from_vec(positions, (batch_beam, len), device)?,
        );
        managed.declare_output(pipeline.logits_name());
        for name in cache.present_names() {
            managed.declare_output(name);
        }

        let mut state = Self {
            pipeline,
            managed,
            names,
            cache,
            batch_beam,
            next_position: pads.iter().map(|&p| (len - p) as i64).collect(),
            mask,
            first_run: true,
            device: device.clone(),
        };
        state.refresh_mask()?;
        state.refresh_pasts();
        Ok(state)
    }

    pub fn managed(&self) -> &ManagedTensors {
        &self.managed
    }

    pub fn pipeline(&self) -> &DecoderPipeline {
        &self.pipeline
    }

    /// Positions held in the KV cache.
    pub fn cached_len(&self) -> usize {
        self.cache.past_len()
    }

    /// Run one decoder step.
    ///
    /// On the first call `next_tokens` is ignored and the prompts are fed.
    /// Afterwards `next_tokens` holds an equal number of tokens per row, and
    /// `next_indices` (beam search) names the row each new row continues.
    pub fn run(&mut self, next_tokens: &[u32], next_indices: Option<&[u32]>) -> Result<Tensor> {
        let phase = if self.first_run {
            StepPhase::Prompt
        } else {
            self.update_inputs(next_tokens, next_indices)?;
            StepPhase::TokenGen
        };
        let logits = self.pipeline.run_step(&mut self.managed, phase)?;
        self.first_run = false;
        self.absorb_presents()?;
        Ok(logits)
    }

    /// Forget the last `n` positions of every row, after the search
    /// dropped rejected tokens.
    pub fn rewind(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let cached = self.cache.past_len();
        if n > cached {
            return Err(PipelineError::Input(format!(
                "cannot rewind {n} positions, only {cached} cached"
            )));
        }
        self.cache.rewind(n)?;
        for (row, next) in self.mask.iter_mut().zip(&mut self.next_position) {
            row.truncate(row.len() - n);
            *next -= n as i64;
        }
        debug!(n, cached = cached - n, "rewound decoder state");
        self.refresh_mask()?;
        self.refresh_pasts();
        Ok(())
    }

    fn update_inputs(&mut self, tokens: &[u32], indices: Option<&[u32]>) -> Result<()> {
        let rows = self.batch_beam;
        if tokens.is_empty() || tokens.len() % rows != 0 {
            return Err(PipelineError::Input(format!(
                "{} next tokens do not split across {rows} rows",
                tokens.len()
            )));
        }
        let per_row = tokens.len() / rows;

        if let Some(indices) = indices {
            if indices.len() != rows {
                return Err(PipelineError::Input(format!(
                    "expected {rows} beam indices, got {}",
                    indices.len()
                )));
            }
            self.mask = indices.iter().map(|&i| self.mask[i as usize].clone()).collect();
            self.next_position = indices
                .iter()
                .map(|&i| self.next_position[i as usize])
                .collect();
            self.cache.reorder(indices)?;
            self.refresh_pasts();
        }

        let mut positions = Vec::with_capacity(tokens.len());
        for (row, next) in self.mask.iter_mut().zip(&mut self.next_position) {
            positions.extend(*next..*next + per_row as i64);
            *next += per_row as i64;
            row.extend(std::iter::repeat(1).take(per_row));
        }
        self.managed.set_input(
            &self.names.input_ids,
            Tensor::from_vec(tokens.to_vec(), (rows, per_row), &self.device)?,
        );
        self.managed.set_input(
            &self.names.position_ids,
            Tensor::from_vec(positions, (rows, per_row), &self.device)?,
        );
        self.refresh_mask()
    }

    /// Move this step's presents into the cache. A pipeline that produces no
    /// presents keeps no KV state.
    fn absorb_presents(&mut self) -> Result<()> {
        let names: Vec<String> = self.cache.present_names().map(str::to_string).collect();
        let produced: Vec<Option<Tensor>> =
            names.iter().map(|n| self.managed.take_output(n)).collect();
        if produced.iter().all(Option::is_none) {
            return Ok(());
        }
        let mut presents = Vec::with_capacity(names.len() / 2);
        for (pair, tensors) in names.chunks(2).zip(produced.chunks(2)) {
            match tensors {
                [Some(k), Some(v)] => presents.push((k.clone(), v.clone())),
                _ => {
                    return Err(PipelineError::Input(format!(
                        "pipeline produced only some presents, '{}' is missing",
                        pair.join("' or '")
                    )))
                }
            }
        }
        self.cache.advance(presents, None)?;
        self.refresh_pasts();
        Ok(())
    }

    fn refresh_mask(&mut self) -> Result<()> {
        let len = self.mask.first().map_or(0, Vec::len);
        let flat: Vec<i64> = self.mask.iter().flatten().copied().collect();
        self.managed.set_input(
            &self.names.attention_mask,
            Tensor::from_vec(flat, (self.batch_beam, len), &self.device)?,
        );
        Ok(())
    }

    fn refresh_pasts(&mut self) {
        let pasts: Vec<(String, Tensor)> = self
            .cache
            .past_inputs()
            .map(|(n, t)| (n.to_string(), t.clone()))
            .collect();
        for (name, tensor) in pasts {
            self.managed.set_input(name, tensor);
        }
    }
}
