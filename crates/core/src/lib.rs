//! Step-driven token generation.
//!
//! - [`pipeline`]: runs a decoder step split across ordered stages and keeps
//!   the tensors the decoder owns between steps.
//! - [`search`]: greedy, beam and speculative state machines over logits.
//! - [`kv_cache`]: paged block bookkeeping shared by batched sequences.
//! - [`generator`] and [`speculative`] drive a fixed batch end to end;
//!   [`engine`] admits and evicts sequences between steps.

pub mod config;
pub mod device;
pub mod engine;
pub mod generator;
pub mod kv_cache;
pub mod logging;
pub mod pipeline;
pub mod request;
pub mod sampling;
pub mod search;
pub mod speculative;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{ConfigError, GeneratorConfig};
pub use engine::{BatchEngine, EngineError, StepOutput};
pub use generator::{GeneratedSequence, Generator, GeneratorError};
pub use request::{FinishReason, GenerationParams, Request};
