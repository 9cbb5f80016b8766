use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use super::session::{ComputeSession, NamedTensor, OutputBinding, SessionError};
use super::StepPhase;
use crate::config::PipelineStageConfig;
use crate::device::DeviceKind;

/// One sub-model of a multi-stage decoder.
///
/// The descriptor part (names, providers, phase flags) is fixed at load time.
/// The bound input/output lists are rebuilt every step by the orchestrator.
pub struct PipelineStage {
    model_id: String,
    session: Arc<dyn ComputeSession>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    /// `None` when the stage has no session options of its own.
    providers: Option<Vec<String>>,
    run_on_prompt: bool,
    run_on_token_gen: bool,
    bound_inputs: Vec<NamedTensor>,
    bound_outputs: Vec<OutputBinding>,
}

impl PipelineStage {
    pub fn new(
        model_id: impl Into<String>,
        session: Arc<dyn ComputeSession>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            session,
            inputs,
            outputs,
            providers: None,
            run_on_prompt: true,
            run_on_token_gen: true,
            bound_inputs: Vec::new(),
            bound_outputs: Vec::new(),
        }
    }

    pub fn from_config(config: &PipelineStageConfig, session: Arc<dyn ComputeSession>) -> Self {
        let mut stage = Self::new(
            config.model_id.clone(),
            session,
            config.inputs.clone(),
            config.outputs.clone(),
        );
        stage.providers = config
            .provider_names()
            .map(|names| names.into_iter().map(str::to_string).collect());
        stage.run_on_prompt = config.run_on_prompt;
        stage.run_on_token_gen = config.run_on_token_gen;
        stage
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = Some(providers.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_phases(mut self, run_on_prompt: bool, run_on_token_gen: bool) -> Self {
        self.run_on_prompt = run_on_prompt;
        self.run_on_token_gen = run_on_token_gen;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|n| n == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|n| n == name)
    }

    /// Whether tensors on `primary` can be bound to this stage.
    ///
    /// CPU tensors are always accepted. An accelerator is accepted if the
    /// stage lists its provider, or if the stage has no session options.
    pub fn supports_primary_device(&self, primary: DeviceKind) -> bool {
        let Some(wanted) = primary.provider_name() else {
            return true;
        };
        match &self.providers {
            None => true,
            Some(names) => names.iter().any(|n| n.eq_ignore_ascii_case(wanted)),
        }
    }

    pub fn runs_in(&self, phase: StepPhase) -> bool {
        match phase {
            StepPhase::Prompt => self.run_on_prompt,
            StepPhase::TokenGen => self.run_on_token_gen,
        }
    }

    pub fn clear_io(&mut self) {
        self.bound_inputs.clear();
        self.bound_outputs.clear();
    }

    pub fn bind_input(&mut self, name: &str, tensor: Tensor) {
        self.bound_inputs.push(NamedTensor::new(name, tensor));
    }

    pub fn bind_output(&mut self, name: &str) {
        self.bound_outputs.push(OutputBinding::empty(name));
    }

    pub fn bound_inputs(&self) -> &[NamedTensor] {
        &self.bound_inputs
    }

    pub fn bound_outputs(&self) -> &[OutputBinding] {
        &self.bound_outputs
    }

    pub fn execute(&mut self) -> Result<(), SessionError> {
        self.session
            .execute(&self.bound_inputs, &mut self.bound_outputs)
    }

    /// Produced outputs of the last execution, in declared order.
    pub fn produced(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.bound_outputs
            .iter()
            .filter_map(|b| b.tensor.as_ref().map(|t| (b.name.as_str(), t)))
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("model_id", &self.model_id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("providers", &self.providers)
            .field("run_on_prompt", &self.run_on_prompt)
            .field("run_on_token_gen", &self.run_on_token_gen)
            .finish_non_exhaustive()
    }
}
