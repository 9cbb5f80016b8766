//! Core types for the batch engine.

use serde::Serialize;
use thiserror::Error;

use crate::kv_cache::{CacheError, MetricsSnapshot, SequenceId};
use crate::pipeline::PipelineError;
use crate::request::FinishReason;
use crate::search::SearchError;

// ─── Engine errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("sequence {0} is not running")]
    UnknownSequence(SequenceId),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("logits error: {0}")]
    Logits(#[from] SearchError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ─── Step results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedSequence {
    pub seq_id: SequenceId,
    pub reason: FinishReason,
    pub generated_token_ids: Vec<u32>,
}

/// What one [`super::BatchEngine::step`] produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// One token per sequence in the step, in batch order.
    pub tokens: Vec<(SequenceId, u32)>,
    /// Sequences that hit a stop condition this step. Their cache blocks are
    /// already released.
    pub finished: Vec<FinishedSequence>,
}

impl StepOutput {
    /// True when there was nothing to run.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.finished.is_empty()
    }
}

// ─── Engine Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub num_running_sequences: usize,
    pub num_steps: u64,
    pub num_free_blocks: usize,
    pub num_total_blocks: usize,
    pub block_size: usize,
    pub kv_cache_metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_errors_keep_their_message() {
        let err = EngineError::from(CacheError::Exhausted {
            requested: 4,
            available: 3,
        });
        assert_eq!(
            err.to_string(),
            "cache error: kv cache exhausted: requested 4 blocks, 3 available"
        );
    }

    #[test]
    fn engine_stats_serialize() {
        let stats = EngineStats {
            num_running_sequences: 2,
            num_steps: 5,
            num_free_blocks: 10,
            num_total_blocks: 16,
            block_size: 4,
            kv_cache_metrics: Default::default(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["num_free_blocks"], 10);
        assert_eq!(json["kv_cache_metrics"]["exhaustion_events"], 0);
    }
}
