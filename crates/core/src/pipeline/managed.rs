use std::collections::{HashMap, HashSet};

use candle_core::Tensor;

/// Tensors the decoder owns across steps: token ids, positions, masks, KV
/// buffers, block tables, slot mappings and logits.
///
/// Inputs are set by the step driver before a step. Outputs are declared by
/// name up front and filled by whichever stage produces them. An output that
/// shares its name with an input replaces that input when it is written, the
/// way a stage updates a device buffer in place.
#[derive(Debug, Default)]
pub struct ManagedTensors {
    inputs: HashMap<String, Tensor>,
    declared_outputs: HashSet<String>,
    outputs: HashMap<String, Tensor>,
}

impl ManagedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.inputs.insert(name.into(), tensor);
    }

    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.get(name)
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn remove_input(&mut self, name: &str) -> Option<Tensor> {
        self.inputs.remove(name)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    pub fn declare_output(&mut self, name: impl Into<String>) {
        self.declared_outputs.insert(name.into());
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.declared_outputs.contains(name)
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.is_input(name) || self.is_output(name)
    }

    /// Value written to a declared output during the current step.
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }

    pub fn take_output(&mut self, name: &str) -> Option<Tensor> {
        self.outputs.remove(name)
    }

    /// Store a produced output. Returns `false` if `name` is not declared.
    pub fn set_output(&mut self, name: &str, tensor: Tensor) -> bool {
        if !self.declared_outputs.contains(name) {
            return false;
        }
        if let Some(input) = self.inputs.get_mut(name) {
            *input = tensor.clone();
        }
        self.outputs.insert(name.to_string(), tensor);
        true
    }

    /// Forget last step's outputs so a stage that stops producing one is
    /// never mistaken for a fresh value.
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
    }
}
