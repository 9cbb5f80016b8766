use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Tensor};

use crate::config::{layer_name, ModelConfig};
use crate::pipeline::session::find_input;
use crate::pipeline::{ComputeSession, NamedTensor, OutputBinding, SessionError};

type NextToken = Arc<dyn Fn(u32) -> u32 + Send + Sync>;

/// Logit given to the predicted token; every other token gets 0.
const HOT: f32 = 10.0;

/// `[rows, positions, vocab]` logits predicting `next(token)` at each position.
fn hot_logits(ids: &[Vec<u32>], vocab: usize, next: &NextToken) -> candle_core::Result<Tensor> {
    let rows = ids.len();
    let positions = ids.first().map_or(0, Vec::len);
    let mut data = vec![0f32; rows * positions * vocab];
    for (r, row) in ids.iter().enumerate() {
        for (p, &t) in row.iter().enumerate() {
            let target = next(t) as usize % vocab;
            data[(r * positions + p) * vocab + target] = HOT;
        }
    }
    Tensor::from_vec(data, (rows, positions, vocab), &candle_core::Device::Cpu)
}

/// Deterministic decoder over a contiguous KV cache.
///
/// Every position predicts `next(token)`. Presents are the pasts with one
/// entry per fed token appended, each entry filled with the token id, so a
/// test can read back what the cache holds.
#[derive(Clone)]
pub struct MockDecoderSession {
    vocab_size: usize,
    num_kv_heads: usize,
    head_size: usize,
    input_ids: String,
    logits: String,
    past_names: Vec<String>,
    present_names: Vec<String>,
    extra_inputs: Vec<String>,
    next: NextToken,
    calls: Arc<AtomicUsize>,
}

impl MockDecoderSession {
    pub fn new(model: &ModelConfig, next: impl Fn(u32) -> u32 + Send + Sync + 'static) -> Self {
        let decoder = &model.decoder;
        let layers = 0..decoder.num_hidden_layers;
        let past_names = layers
            .clone()
            .flat_map(|i| {
                [
                    layer_name(&decoder.inputs.past_key_names, i),
                    layer_name(&decoder.inputs.past_value_names, i),
                ]
            })
            .collect();
        let present_names = layers
            .flat_map(|i| {
                [
                    layer_name(&decoder.outputs.present_key_names, i),
                    layer_name(&decoder.outputs.present_value_names, i),
                ]
            })
            .collect();
        Self {
            vocab_size: model.vocab_size,
            num_kv_heads: decoder.num_key_value_heads,
            head_size: decoder.head_size,
            input_ids: decoder.inputs.input_ids.clone(),
            logits: decoder.outputs.logits.clone(),
            past_names,
            present_names,
            extra_inputs: vec![
                decoder.inputs.position_ids.clone(),
                decoder.inputs.attention_mask.clone(),
            ],
            next: Arc::new(next),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn input_names(&self) -> Vec<String> {
        let mut names = vec![self.input_ids.clone()];
        names.extend(self.extra_inputs.iter().cloned());
        names.extend(self.past_names.iter().cloned());
        names
    }

    pub fn output_names(&self) -> Vec<String> {
        let mut names = vec![self.logits.clone()];
        names.extend(self.present_names.iter().cloned());
        names
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ComputeSession for MockDecoderSession {
    fn execute(
        &self,
        inputs: &[NamedTensor],
        outputs: &mut [OutputBinding],
    ) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<Vec<u32>> = find_input(inputs, &self.input_ids)?.to_vec2()?;
        let rows = ids.len();
        let fed = ids.first().map_or(0, Vec::len);

        let per_token = self.num_kv_heads * self.head_size;
        let entries: Vec<f32> = ids
            .iter()
            .flat_map(|row| {
                (0..self.num_kv_heads).flat_map(move |_| {
                    row.iter()
                        .flat_map(move |&t| std::iter::repeat(t as f32).take(self.head_size))
                })
            })
            .collect();
        debug_assert_eq!(entries.len(), rows * fed * per_token);
        let new = Tensor::from_vec(
            entries,
            (rows, self.num_kv_heads, fed, self.head_size),
            &candle_core::Device::Cpu,
        )?;

        for binding in outputs.iter_mut() {
            if binding.name == self.logits {
                binding.set(hot_logits(&ids, self.vocab_size, &self.next)?);
            } else if let Some(i) = self.present_names.iter().position(|n| *n == binding.name) {
                let past = find_input(inputs, &self.past_names[i])?;
                let new = new.to_dtype(past.dtype())?.to_device(past.device())?;
                binding.set(Tensor::cat(&[past, &new], 2)?);
            }
        }
        Ok(())
    }
}

/// One row of what the paged session saw in a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedObservation {
    /// Tokens read back from the cache through the row's block table, after
    /// this step's writes.
    pub context: Vec<u32>,
    pub positions: Vec<i64>,
}

/// Deterministic decoder over paged key/value caches.
///
/// Writes each fed token id into its slot of every `key_cache.{i}` buffer,
/// then reads each row's full context back through its block table. The
/// reconstructed contexts are recorded so tests can check that sequences
/// never overwrite each other.
#[derive(Clone)]
pub struct MockPagedSession {
    vocab_size: usize,
    num_layers: usize,
    block_size: usize,
    per_token: usize,
    names: crate::config::DecoderInputNames,
    logits: String,
    next: NextToken,
    observations: Arc<Mutex<Vec<Vec<PagedObservation>>>>,
}

impl MockPagedSession {
    pub fn new(
        model: &ModelConfig,
        next: impl Fn(u32) -> u32 + Send + Sync + 'static,
    ) -> Self {
        let decoder = &model.decoder;
        Self {
            vocab_size: model.vocab_size,
            num_layers: decoder.num_hidden_layers,
            block_size: model.kv_cache.block_size,
            per_token: decoder.num_key_value_heads * decoder.head_size,
            names: decoder.inputs.clone(),
            logits: decoder.outputs.logits.clone(),
            next: Arc::new(next),
            observations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn cache_names(&self) -> Vec<String> {
        (0..self.num_layers)
            .flat_map(|i| {
                [
                    layer_name(&self.names.key_cache_names, i),
                    layer_name(&self.names.value_cache_names, i),
                ]
            })
            .collect()
    }

    pub fn input_names(&self) -> Vec<String> {
        let mut names = vec![
            self.names.input_ids.clone(),
            self.names.position_ids.clone(),
            self.names.block_tables.clone(),
            self.names.slot_mapping.clone(),
            self.names.context_lens.clone(),
        ];
        names.extend(self.cache_names());
        names
    }

    /// Logits plus the cache buffers, which are updated in place.
    pub fn output_names(&self) -> Vec<String> {
        let mut names = vec![self.logits.clone()];
        names.extend(self.cache_names());
        names
    }

    /// Per-step, per-row observations in call order.
    pub fn observations(&self) -> Vec<Vec<PagedObservation>> {
        self.observations
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    fn write_slots(
        &self,
        cache: &Tensor,
        ids: &[Vec<u32>],
        slots: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>, SessionError> {
        let mut blocks: Vec<Vec<f32>> = cache.to_dtype(DType::F32)?.to_vec2()?;
        for (row_ids, row_slots) in ids.iter().zip(slots) {
            for (&t, &slot) in row_ids.iter().zip(row_slots) {
                if slot < 0 {
                    continue;
                }
                let slot = slot as usize;
                let (block, offset) = (slot / self.block_size, slot % self.block_size);
                let entry = blocks.get_mut(block).ok_or_else(|| SessionError::Shape {
                    name: self.names.slot_mapping.clone(),
                    message: format!("slot {slot} is outside the cache"),
                })?;
                let start = offset * self.per_token;
                entry[start..start + self.per_token].fill(t as f32);
            }
        }
        Ok(blocks)
    }
}

impl ComputeSession for MockPagedSession {
    fn execute(
        &self,
        inputs: &[NamedTensor],
        outputs: &mut [OutputBinding],
    ) -> Result<(), SessionError> {
        let ids: Vec<Vec<u32>> = find_input(inputs, &self.names.input_ids)?.to_vec2()?;
        let positions: Vec<Vec<i64>> = find_input(inputs, &self.names.position_ids)?.to_vec2()?;
        let tables: Vec<Vec<i64>> = find_input(inputs, &self.names.block_tables)?.to_vec2()?;
        let slots: Vec<Vec<i64>> = find_input(inputs, &self.names.slot_mapping)?.to_vec2()?;
        let context_lens: Vec<i64> = find_input(inputs, &self.names.context_lens)?.to_vec1()?;

        let mut key0 = None;
        for name in self.cache_names() {
            let cache = find_input(inputs, &name)?;
            let blocks = self.write_slots(cache, &ids, &slots)?;
            let flat: Vec<f32> = blocks.iter().flatten().copied().collect();
            let updated = Tensor::from_vec(flat, cache.dims(), cache.device())?
                .to_dtype(cache.dtype())?;
            if key0.is_none() {
                key0 = Some(blocks);
            }
            if let Some(binding) = outputs.iter_mut().find(|b| b.name == name) {
                binding.set(updated);
            }
        }

        if let Some(blocks) = key0 {
            let step: Vec<PagedObservation> = tables
                .iter()
                .zip(&context_lens)
                .zip(&positions)
                .map(|((table, &len), pos)| PagedObservation {
                    context: (0..len as usize)
                        .map(|p| {
                            let block = table[p / self.block_size] as usize;
                            blocks[block][(p % self.block_size) * self.per_token] as u32
                        })
                        .collect(),
                    positions: pos.clone(),
                })
                .collect();
            if let Ok(mut log) = self.observations.lock() {
                log.push(step);
            }
        }

        if let Some(binding) = outputs.iter_mut().find(|b| b.name == self.logits) {
            binding.set(hot_logits(&ids, self.vocab_size, &self.next)?);
        }
        Ok(())
    }
}
