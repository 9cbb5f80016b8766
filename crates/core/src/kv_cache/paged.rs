use candle_core::Tensor;

use super::config::CacheConfig;
use super::error::CacheError;
use crate::config::{layer_name, DecoderInputNames};

/// Physical paged KV storage, one key and one value tensor per layer.
///
/// Layout per layer: `[num_blocks, block_size * num_kv_heads * head_dim]`.
/// The attention kernel inside a stage writes new entries at the step's
/// slot mapping; this type only owns the buffers and their managed names.
pub struct PagedKvCache {
    key_caches: Vec<Tensor>,
    value_caches: Vec<Tensor>,
    key_names: Vec<String>,
    value_names: Vec<String>,
    config: CacheConfig,
}

impl PagedKvCache {
    pub fn new(config: &CacheConfig, names: &DecoderInputNames) -> Result<Self, CacheError> {
        let shape = (config.num_blocks, config.block_stride());
        let mut key_caches = Vec::with_capacity(config.num_layers);
        let mut value_caches = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            key_caches.push(Tensor::zeros(shape, config.dtype, &config.device)?);
            value_caches.push(Tensor::zeros(shape, config.dtype, &config.device)?);
        }
        tracing::info!(
            num_layers = config.num_layers,
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            bytes = config.num_blocks * config.bytes_per_block(),
            "allocated paged kv cache"
        );
        Ok(Self {
            key_caches,
            value_caches,
            key_names: (0..config.num_layers)
                .map(|i| layer_name(&names.key_cache_names, i))
                .collect(),
            value_names: (0..config.num_layers)
                .map(|i| layer_name(&names.value_cache_names, i))
                .collect(),
            config: config.clone(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.key_caches.len()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key and value buffers of one layer.
    pub fn layer(&self, layer: usize) -> (&Tensor, &Tensor) {
        (&self.key_caches[layer], &self.value_caches[layer])
    }

    /// `(name, tensor)` pairs in layer order, key before value.
    pub fn named_tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.key_names
            .iter()
            .zip(&self.key_caches)
            .zip(self.value_names.iter().zip(&self.value_caches))
            .flat_map(|((kn, k), (vn, v))| [(kn.as_str(), k), (vn.as_str(), v)])
    }

    /// Re-zero every buffer.
    pub fn reset(&mut self) -> Result<(), CacheError> {
        for t in self.key_caches.iter_mut().chain(self.value_caches.iter_mut()) {
            *t = t.zeros_like()?;
        }
        Ok(())
    }
}
