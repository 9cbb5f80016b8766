use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, trace};

use super::managed::ManagedTensors;
use super::pool::TensorPool;
use super::session::ComputeSession;
use super::stage::PipelineStage;
use super::{PipelineError, Result, StepPhase};
use crate::config::GeneratorConfig;
use crate::device::DeviceKind;

/// Drives an ordered list of stages once per decoding step.
#[derive(Debug)]
pub struct DecoderPipeline {
    stages: Vec<PipelineStage>,
    primary: DeviceKind,
    logits_name: String,
}

impl DecoderPipeline {
    pub fn new(
        stages: Vec<PipelineStage>,
        primary: DeviceKind,
        logits_name: impl Into<String>,
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        Ok(Self {
            stages,
            primary,
            logits_name: logits_name.into(),
        })
    }

    /// Build stages from the decoder pipeline description, taking each
    /// stage's session from `sessions` by model id.
    pub fn from_config(
        config: &GeneratorConfig,
        sessions: &HashMap<String, Arc<dyn ComputeSession>>,
    ) -> Result<Self> {
        let decoder = &config.model.decoder;
        let stages = decoder
            .pipeline
            .iter()
            .map(|stage| {
                let session = sessions.get(&stage.model_id).cloned().ok_or_else(|| {
                    PipelineError::MissingSession {
                        model_id: stage.model_id.clone(),
                    }
                })?;
                Ok(PipelineStage::from_config(stage, session))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(stages, config.primary_device_kind(), &decoder.outputs.logits)
    }

    pub fn primary_device(&self) -> DeviceKind {
        self.primary
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn logits_name(&self) -> &str {
        &self.logits_name
    }

    /// Check that every managed tensor an active stage touches can live on
    /// that stage's device.
    pub fn validate_placement(&self, managed: &ManagedTensors, phase: StepPhase) -> Result<()> {
        for stage in self.stages.iter().filter(|s| s.runs_in(phase)) {
            if stage.supports_primary_device(self.primary) {
                continue;
            }
            let input = stage
                .inputs()
                .iter()
                .find(|n| managed.is_input(n))
                .map(|n| (n, "input"));
            let output = stage
                .outputs()
                .iter()
                .find(|n| managed.is_output(n))
                .map(|n| (n, "output"));
            if let Some((tensor, direction)) = input.or(output) {
                return Err(PipelineError::PlacementMismatch {
                    stage: stage.model_id().to_string(),
                    tensor: tensor.clone(),
                    direction,
                    device: self.primary,
                });
            }
        }
        Ok(())
    }

    /// Run every stage active in `phase` in declared order and return the
    /// logits.
    ///
    /// Placement is checked for all stages before any stage runs. Outputs
    /// declared in `managed` are written back there; all other outputs go to
    /// a pool that lives only for this call.
    pub fn run_step(&mut self, managed: &mut ManagedTensors, phase: StepPhase) -> Result<Tensor> {
        self.validate_placement(managed, phase)?;
        managed.clear_outputs();
        for stage in &mut self.stages {
            stage.clear_io();
        }

        let mut pool = TensorPool::new();
        for stage in self.stages.iter_mut().filter(|s| s.runs_in(phase)) {
            for name in stage.inputs().to_vec() {
                if let Some(t) = managed.input(&name).or_else(|| pool.get(&name)) {
                    stage.bind_input(&name, t.clone());
                }
            }
            for name in stage.outputs().to_vec() {
                stage.bind_output(&name);
            }

            trace!(
                stage = stage.model_id(),
                inputs = stage.bound_inputs().len(),
                outputs = stage.bound_outputs().len(),
                "executing stage"
            );
            stage.execute().map_err(|source| PipelineError::Session {
                stage: stage.model_id().to_string(),
                source,
            })?;

            for (name, tensor) in stage.produced() {
                if !managed.set_output(name, tensor.clone()) {
                    pool.insert(name, tensor.clone());
                }
            }
        }
        debug!(?phase, pooled = pool.len(), "pipeline step complete");

        managed
            .output(&self.logits_name)
            .cloned()
            .ok_or_else(|| PipelineError::MissingLogits {
                name: self.logits_name.clone(),
            })
    }
}
