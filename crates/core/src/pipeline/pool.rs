use std::collections::HashMap;

use candle_core::Tensor;

/// Step-scoped table of tensors produced by one stage for later stages.
///
/// A pool lives for exactly one call to
/// [`DecoderPipeline::run_step`](super::DecoderPipeline::run_step), so nothing
/// produced in one step is visible in the next.
#[derive(Debug, Default)]
pub struct TensorPool {
    tensors: HashMap<String, Tensor>,
}

impl TensorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; a later stage may re-produce a name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
