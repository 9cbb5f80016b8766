//! Interface to the compute runtime.
//!
//! A [`ComputeSession`] is one loaded sub-model bound to a device. It reads
//! named input tensors and fills named output slots; how it computes them is
//! the runtime's business.

use candle_core::Tensor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device error: {0}")]
    Device(String),

    #[error("shape error on '{name}': {message}")]
    Shape { name: String, message: String },

    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// An input bound to a stage for one step.
#[derive(Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Tensor,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

/// An output slot; the session fills `tensor`.
#[derive(Debug, Clone)]
pub struct OutputBinding {
    pub name: String,
    pub tensor: Option<Tensor>,
}

impl OutputBinding {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensor: None,
        }
    }

    pub fn set(&mut self, tensor: Tensor) {
        self.tensor = Some(tensor);
    }
}

pub trait ComputeSession: Send + Sync {
    /// Run the sub-model once.
    ///
    /// Outputs the session does not produce may be left empty.
    fn execute(
        &self,
        inputs: &[NamedTensor],
        outputs: &mut [OutputBinding],
    ) -> Result<(), SessionError>;
}

/// Look up an input by name.
pub fn find_input<'a>(inputs: &'a [NamedTensor], name: &str) -> Result<&'a Tensor, SessionError> {
    inputs
        .iter()
        .find(|t| t.name == name)
        .map(|t| &t.tensor)
        .ok_or_else(|| SessionError::MissingInput(name.to_string()))
}

/// Session backed by a closure.
pub struct FnSession<F> {
    f: F,
}

impl<F> FnSession<F>
where
    F: Fn(&[NamedTensor], &mut [OutputBinding]) -> Result<(), SessionError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ComputeSession for FnSession<F>
where
    F: Fn(&[NamedTensor], &mut [OutputBinding]) -> Result<(), SessionError> + Send + Sync,
{
    fn execute(
        &self,
        inputs: &[NamedTensor],
        outputs: &mut [OutputBinding],
    ) -> Result<(), SessionError> {
        (self.f)(inputs, outputs)
    }
}
