use candle_core::{DType, Device};

use crate::config::GeneratorConfig;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub device: Device,
}

impl CacheConfig {
    /// Compute num_blocks from a memory budget.
    ///
    /// bytes_per_block_per_layer = 2(K+V) * num_kv_heads * block_size * head_dim * dtype_size
    /// num_blocks = budget_bytes / (num_layers * bytes_per_block_per_layer)
    pub fn from_memory_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        let mut config = Self {
            block_size,
            num_blocks: 0,
            num_layers,
            num_kv_heads,
            head_dim,
            dtype,
            device,
        };
        let per_block = config.bytes_per_block();
        config.num_blocks = if per_block > 0 {
            budget_bytes / per_block
        } else {
            0
        };
        config
    }

    /// Cache geometry from the model descriptor.
    ///
    /// An explicit `kv_cache.num_blocks` wins. Otherwise `device_memory_bytes`
    /// scaled by `gpu_utilization_factor` is turned into a block count.
    pub fn from_generator_config(
        config: &GeneratorConfig,
        device_memory_bytes: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        let decoder = &config.model.decoder;
        let options = &config.model.kv_cache;
        match options.num_blocks {
            Some(num_blocks) => Self {
                block_size: options.block_size,
                num_blocks,
                num_layers: decoder.num_hidden_layers,
                num_kv_heads: decoder.num_key_value_heads,
                head_dim: decoder.head_size,
                dtype,
                device,
            },
            None => {
                let budget =
                    (device_memory_bytes as f64 * options.gpu_utilization_factor as f64) as usize;
                Self::from_memory_budget(
                    budget,
                    decoder.num_hidden_layers,
                    decoder.num_key_value_heads,
                    decoder.head_size,
                    options.block_size,
                    dtype,
                    device,
                )
            }
        }
    }

    /// Bytes one block occupies across all layers, keys and values.
    pub fn bytes_per_block(&self) -> usize {
        2 * self.num_layers
            * self.num_kv_heads
            * self.block_size
            * self.head_dim
            * self.dtype.size_in_bytes()
    }

    /// Width of one row of a paged layer tensor.
    pub fn block_stride(&self) -> usize {
        self.block_size * self.num_kv_heads * self.head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_memory_budget_computes_correct_blocks() {
        // 28 layers, 8 kv heads, head_dim 128, bf16:
        // per block per layer 2 * 8 * 16 * 128 * 2 = 65536 bytes,
        // all layers 1,835,008 bytes, 900 MiB / that = 514 blocks.
        let budget = 900 * 1024 * 1024;
        let config =
            CacheConfig::from_memory_budget(budget, 28, 8, 128, 16, DType::BF16, Device::Cpu);
        assert_eq!(config.num_blocks, 514);
        assert_eq!(config.block_size, 16);
        assert_eq!(config.bytes_per_block(), 1_835_008);
    }

    #[test]
    fn generator_config_uses_utilization_factor() {
        let gen = GeneratorConfig::from_json_str(
            r#"{"model": {"vocab_size": 8, "eos_token_id": 2,
                "kv_cache": {"paged": true, "block_size": 4},
                "decoder": {"num_hidden_layers": 2, "num_key_value_heads": 1, "head_size": 8}}}"#,
        )
        .unwrap();
        // per block: 2 * 2 * 1 * 4 * 8 * 4 bytes = 512; 0.3 * 10240 = 3072 -> 6 blocks
        let config = CacheConfig::from_generator_config(&gen, 10240, DType::F32, Device::Cpu);
        assert_eq!(config.num_blocks, 6);
        assert_eq!(config.block_stride(), 32);
    }

    #[test]
    fn explicit_num_blocks_wins() {
        let gen = GeneratorConfig::from_json_str(
            r#"{"model": {"vocab_size": 8, "eos_token_id": 2,
                "kv_cache": {"paged": true, "num_blocks": 11},
                "decoder": {"num_hidden_layers": 2, "num_key_value_heads": 1, "head_size": 8}}}"#,
        )
        .unwrap();
        let config = CacheConfig::from_generator_config(&gen, 0, DType::F32, Device::Cpu);
        assert_eq!(config.num_blocks, 11);
        assert_eq!(config.block_size, 16);
    }
}
