//! Integration tests for multi-stage decoder pipelines built from a model
//! descriptor: tensor routing, placement validation and pool lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tokengen_core::device::DeviceKind;
use tokengen_core::pipeline::session::find_input;
use tokengen_core::pipeline::{
    ComputeSession, DecoderPipeline, FnSession, ManagedTensors, NamedTensor, OutputBinding,
    PipelineError, SessionError, StepPhase,
};
use tokengen_core::GeneratorConfig;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn config(pipeline: &str) -> GeneratorConfig {
    GeneratorConfig::from_json_str(&format!(
        r#"{{
            "model": {{
                "vocab_size": 16,
                "context_length": 32,
                "pad_token_id": 0,
                "eos_token_id": 1,
                "decoder": {{
                    "num_hidden_layers": 1,
                    "num_key_value_heads": 1,
                    "head_size": 2,
                    "pipeline": {pipeline}
                }}
            }}
        }}"#
    ))
    .unwrap()
}

fn session<F>(calls: &Arc<AtomicUsize>, f: F) -> Arc<dyn ComputeSession>
where
    F: Fn(&[NamedTensor], &mut [OutputBinding]) -> Result<(), SessionError>
        + Send
        + Sync
        + 'static,
{
    let calls = calls.clone();
    Arc::new(FnSession::new(
        move |inputs: &[NamedTensor], outputs: &mut [OutputBinding]| {
            calls.fetch_add(1, Ordering::SeqCst);
            f(inputs, outputs)
        },
    ))
}

fn set(outputs: &mut [OutputBinding], name: &str, tensor: Tensor) {
    if let Some(binding) = outputs.iter_mut().find(|b| b.name == name) {
        binding.set(tensor);
    }
}

fn managed(ids: &[u32], positions: &[i64]) -> ManagedTensors {
    let mut managed = ManagedTensors::new();
    let n = ids.len();
    managed.set_input(
        "input_ids",
        Tensor::from_vec(ids.to_vec(), (1, n), &Device::Cpu).unwrap(),
    );
    managed.set_input(
        "position_ids",
        Tensor::from_vec(positions.to_vec(), (1, n), &Device::Cpu).unwrap(),
    );
    managed.declare_output("logits");
    managed
}

// ─── Routing ─────────────────────────────────────────────────────────────────

#[test]
fn three_stage_pipeline_routes_through_pool() {
    let config = config(
        r#"[
            {"model_id": "embed", "inputs": ["input_ids"], "outputs": ["hidden"]},
            {"model_id": "body", "inputs": ["hidden", "position_ids"],
             "outputs": ["hidden2", "scratch"],
             "session_options": {"provider_options": [{"cpu": {}}]}},
            {"model_id": "head", "inputs": ["hidden2"], "outputs": ["logits"]}
        ]"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut sessions: HashMap<String, Arc<dyn ComputeSession>> = HashMap::new();
    sessions.insert(
        "embed".into(),
        session(&calls, |inputs, outputs| {
            let ids = find_input(inputs, "input_ids")?.to_dtype(DType::F32)?;
            set(outputs, "hidden", ids);
            Ok(())
        }),
    );
    sessions.insert(
        "body".into(),
        session(&calls, |inputs, outputs| {
            let hidden = find_input(inputs, "hidden")?;
            let positions = find_input(inputs, "position_ids")?.to_dtype(DType::F32)?;
            set(outputs, "hidden2", (hidden + positions)?);
            set(outputs, "scratch", hidden.zeros_like()?);
            Ok(())
        }),
    );
    sessions.insert(
        "head".into(),
        session(&calls, |inputs, outputs| {
            let hidden = find_input(inputs, "hidden2")?;
            set(outputs, "logits", (hidden * 2.0)?);
            Ok(())
        }),
    );

    let mut pipeline = DecoderPipeline::from_config(&config, &sessions).unwrap();
    assert_eq!(pipeline.primary_device(), DeviceKind::Cpu);
    assert_eq!(pipeline.stages().len(), 3);

    let mut managed = managed(&[3, 4], &[0, 1]);
    let logits = pipeline.run_step(&mut managed, StepPhase::Prompt).unwrap();
    let values: Vec<Vec<f32>> = logits.to_vec2().unwrap();
    assert_eq!(values, vec![vec![6.0, 10.0]]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Intermediate and unconsumed outputs never become managed.
    assert!(managed.output("logits").is_some());
    assert!(managed.output("hidden").is_none());
    assert!(managed.output("scratch").is_none());
    assert!(!managed.is_managed("hidden2"));
}

#[test]
fn missing_session_is_reported() {
    let config = config(r#"[{"model_id": "embed", "outputs": ["logits"]}]"#);
    let err = DecoderPipeline::from_config(&config, &HashMap::new()).unwrap_err();
    assert!(matches!(err, PipelineError::MissingSession { model_id } if model_id == "embed"));
}

// ─── Placement ───────────────────────────────────────────────────────────────

#[test]
fn cpu_only_stage_cannot_bind_accelerator_tensors() {
    let config = config(
        r#"[
            {"model_id": "embed", "inputs": ["input_ids"], "outputs": ["hidden"],
             "session_options": {"provider_options": [{"cuda": {"enable_cuda_graph": "0"}}]}},
            {"model_id": "head", "inputs": ["hidden"], "outputs": ["logits"],
             "session_options": {"provider_options": [{"cpu": {}}]}}
        ]"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut sessions: HashMap<String, Arc<dyn ComputeSession>> = HashMap::new();
    for id in ["embed", "head"] {
        sessions.insert(id.into(), session(&calls, |_, _| Ok(())));
    }
    let mut pipeline = DecoderPipeline::from_config(&config, &sessions).unwrap();
    assert_eq!(pipeline.primary_device(), DeviceKind::Cuda);

    let mut managed = managed(&[3], &[0]);
    let err = pipeline
        .run_step(&mut managed, StepPhase::Prompt)
        .unwrap_err();
    match err {
        PipelineError::PlacementMismatch {
            stage,
            tensor,
            direction,
            ..
        } => {
            assert_eq!(stage, "head");
            assert_eq!(tensor, "logits");
            assert_eq!(direction, "output");
        }
        other => panic!("expected placement mismatch, got {other}"),
    }
    // Nothing ran, so no stage saw partially placed inputs.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ─── Pool lifetime ───────────────────────────────────────────────────────────

#[test]
fn pool_values_do_not_survive_the_step() {
    let config = config(
        r#"[
            {"model_id": "prime", "inputs": ["input_ids"], "outputs": ["carry"],
             "run_on_token_gen": false},
            {"model_id": "head", "inputs": ["carry", "input_ids"], "outputs": ["logits"]}
        ]"#,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut sessions: HashMap<String, Arc<dyn ComputeSession>> = HashMap::new();
    sessions.insert(
        "prime".into(),
        session(&calls, |inputs, outputs| {
            let ids = find_input(inputs, "input_ids")?.to_dtype(DType::F32)?;
            set(outputs, "carry", ids);
            Ok(())
        }),
    );
    sessions.insert(
        "head".into(),
        session(&calls, |inputs, outputs| {
            let carry = find_input(inputs, "carry")?;
            set(outputs, "logits", carry.clone());
            Ok(())
        }),
    );
    let mut pipeline = DecoderPipeline::from_config(&config, &sessions).unwrap();

    let mut managed = managed(&[5], &[0]);
    pipeline.run_step(&mut managed, StepPhase::Prompt).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // `prime` is skipped on token steps, so step one's `carry` must be gone.
    let err = pipeline
        .run_step(&mut managed, StepPhase::TokenGen)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "stage 'head' failed: missing input 'carry'"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
