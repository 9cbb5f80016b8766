//! Multi-stage decoder execution.
//!
//! A decoder step may be split across several sub-models ("stages"), each run
//! by its own [`ComputeSession`]. [`DecoderPipeline`] runs them in order,
//! feeding managed tensors in and routing intermediate tensors between stages
//! through a step-scoped [`TensorPool`].

mod decoder_state;
mod managed;
mod orchestrator;
mod pool;
pub mod session;
mod stage;

pub use decoder_state::DecoderState;
pub use managed::ManagedTensors;
pub use orchestrator::DecoderPipeline;
pub use pool::TensorPool;
pub use session::{ComputeSession, FnSession, NamedTensor, OutputBinding, SessionError};
pub use stage::PipelineStage;

use thiserror::Error;

use crate::device::DeviceKind;
use crate::kv_cache::CacheError;

/// Which half of generation a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// The step processes whole prompts.
    Prompt,
    /// The step processes newly generated tokens only.
    TokenGen,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(
        "stage '{stage}' cannot bind managed {direction} '{tensor}': \
         its providers do not include the primary device {device}"
    )]
    PlacementMismatch {
        stage: String,
        tensor: String,
        direction: &'static str,
        device: DeviceKind,
    },

    #[error("decoder pipeline has no stages")]
    NoStages,

    #[error("no session loaded for pipeline stage '{model_id}'")]
    MissingSession { model_id: String },

    #[error("no stage produced logits output '{name}'")]
    MissingLogits { name: String },

    #[error("stage '{stage}' failed: {source}")]
    Session {
        stage: String,
        #[source]
        source: SessionError,
    },

    #[error("invalid decoder input: {0}")]
    Input(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
