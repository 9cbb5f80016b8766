//! Shared test utilities for tokengen-core.
//!
//! Deterministic mock compute sessions and tiny generator configurations for
//! exercising the pipeline, search and engine without a real runtime.

mod mock_session;

pub use mock_session::{MockDecoderSession, MockPagedSession, PagedObservation};

use std::sync::Arc;

use crate::config::GeneratorConfig;
use crate::device::DeviceKind;
use crate::pipeline::{ComputeSession, DecoderPipeline, PipelineStage};

/// Tiny decoder config: 16-token vocab, 2 layers, EOS = 1, pad = 0.
pub fn tiny_generator_config() -> GeneratorConfig {
    GeneratorConfig::from_json_str(
        r#"{
            "model": {
                "vocab_size": 16,
                "context_length": 32,
                "pad_token_id": 0,
                "eos_token_id": 1,
                "decoder": {
                    "num_hidden_layers": 2,
                    "num_key_value_heads": 1,
                    "head_size": 2
                },
                "kv_cache": {"block_size": 4, "num_blocks": 16}
            }
        }"#,
    )
    .unwrap_or_else(|e| panic!("tiny config must parse: {e}"))
}

/// [`tiny_generator_config`] with paged attention enabled.
pub fn tiny_paged_config() -> GeneratorConfig {
    let mut config = tiny_generator_config();
    config.model.kv_cache.paged = true;
    config
}

/// A CPU pipeline with one stage named `decoder`.
pub fn single_stage_pipeline(
    session: Arc<dyn ComputeSession>,
    inputs: Vec<String>,
    outputs: Vec<String>,
) -> DecoderPipeline {
    let stage = PipelineStage::new("decoder", session, inputs, outputs);
    DecoderPipeline::new(vec![stage], DeviceKind::Cpu, "logits")
        .unwrap_or_else(|e| panic!("single stage pipeline: {e}"))
}
