use thiserror::Error;

use super::SequenceId;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("kv cache exhausted: requested {requested} blocks, {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error("sequence {seq_id} is not registered with the cache")]
    UnknownSequence { seq_id: SequenceId },

    #[error("sequence {seq_id} is already registered with the cache")]
    DuplicateSequence { seq_id: SequenceId },

    #[error("sequence {seq_id} appears more than once in one step")]
    RepeatedInStep { seq_id: SequenceId },

    #[error("cannot rewind sequence {seq_id} by {requested} tokens, only {stored} stored")]
    RewindTooFar {
        seq_id: SequenceId,
        requested: usize,
        stored: usize,
    },

    #[error("tensor '{tensor}' has shape {actual:?}, expected {expected}")]
    UnexpectedShape {
        tensor: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
