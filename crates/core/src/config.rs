//! Generator configuration (the model descriptor).
//!
//! Parsed from a `genai_config.json`-shaped document. Loading the file is the
//! only I/O here; model-file discovery belongs to the caller.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::device::DeviceKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    #[serde(default)]
    pub context_length: usize,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default, deserialize_with = "one_or_many")]
    pub eos_token_id: Vec<u32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub kv_cache: PagedCacheOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub session_options: Option<SessionOptions>,
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
    pub head_size: usize,
    #[serde(default)]
    pub hidden_size: usize,
    #[serde(default)]
    pub inputs: DecoderInputNames,
    #[serde(default)]
    pub outputs: DecoderOutputNames,
    #[serde(default)]
    pub pipeline: Vec<PipelineStageConfig>,
}

/// Names of the managed decoder inputs. `%d` is replaced by the layer index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderInputNames {
    pub input_ids: String,
    pub position_ids: String,
    pub attention_mask: String,
    pub past_key_names: String,
    pub past_value_names: String,
    pub key_cache_names: String,
    pub value_cache_names: String,
    pub block_tables: String,
    pub slot_mapping: String,
    pub context_lens: String,
}

impl Default for DecoderInputNames {
    fn default() -> Self {
        Self {
            input_ids: "input_ids".to_string(),
            position_ids: "position_ids".to_string(),
            attention_mask: "attention_mask".to_string(),
            past_key_names: "past_key_values.%d.key".to_string(),
            past_value_names: "past_key_values.%d.value".to_string(),
            key_cache_names: "key_cache.%d".to_string(),
            value_cache_names: "value_cache.%d".to_string(),
            block_tables: "block_tables".to_string(),
            slot_mapping: "slot_mapping".to_string(),
            context_lens: "context_lens".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderOutputNames {
    pub logits: String,
    pub present_key_names: String,
    pub present_value_names: String,
}

impl Default for DecoderOutputNames {
    fn default() -> Self {
        Self {
            logits: "logits".to_string(),
            present_key_names: "present.%d.key".to_string(),
            present_value_names: "present.%d.value".to_string(),
        }
    }
}

/// One sub-model of a pipelined decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageConfig {
    pub model_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub session_options: Option<SessionOptions>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "enabled")]
    pub run_on_prompt: bool,
    #[serde(default = "enabled")]
    pub run_on_token_gen: bool,
}

impl PipelineStageConfig {
    /// Provider names from the session options, `None` when the stage uses
    /// default session options.
    pub fn provider_names(&self) -> Option<Vec<&str>> {
        self.session_options.as_ref().map(|opts| {
            opts.provider_options
                .iter()
                .map(|p| p.name.as_str())
                .collect()
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub provider_options: Vec<ProviderOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intra_op_num_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_op_num_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
}

/// A single execution provider entry.
///
/// On the wire each entry is an object with exactly one member,
/// `{"cuda": {"enable_cuda_graph": "0"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, BTreeMap<String, String>>",
    into = "BTreeMap<String, BTreeMap<String, String>>"
)]
pub struct ProviderOptions {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl TryFrom<BTreeMap<String, BTreeMap<String, String>>> for ProviderOptions {
    type Error = String;

    fn try_from(map: BTreeMap<String, BTreeMap<String, String>>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "each provider_options entry must have exactly one member, found {}",
                map.len()
            ));
        }
        let (name, options) = map.into_iter().next().ok_or("empty provider entry")?;
        Ok(Self { name, options })
    }
}

impl From<ProviderOptions> for BTreeMap<String, BTreeMap<String, String>> {
    fn from(p: ProviderOptions) -> Self {
        BTreeMap::from([(p.name, p.options)])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagedCacheOptions {
    #[serde(alias = "paged_cache")]
    pub paged: bool,
    pub block_size: usize,
    pub num_blocks: Option<usize>,
    pub gpu_utilization_factor: f32,
}

impl Default for PagedCacheOptions {
    fn default() -> Self {
        Self {
            paged: false,
            block_size: 16,
            num_blocks: None,
            gpu_utilization_factor: 0.3,
        }
    }
}

/// Default search parameters; requests may override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub min_length: usize,
    /// 0 means "use the model context length".
    pub max_length: usize,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    pub do_sample: bool,
    pub early_stopping: bool,
    pub random_seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_length: 0,
            max_length: 0,
            num_beams: 1,
            num_return_sequences: 1,
            top_k: 50,
            top_p: 1.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            do_sample: false,
            early_stopping: true,
            random_seed: None,
        }
    }
}

impl GeneratorConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        let search = &self.search;
        if model.vocab_size == 0 {
            return Err(ConfigError::Invalid("vocab_size must be > 0".into()));
        }
        if model.eos_token_id.is_empty() {
            return Err(ConfigError::Invalid("eos_token_id is required".into()));
        }
        if search.num_beams == 0 {
            return Err(ConfigError::Invalid("num_beams must be >= 1".into()));
        }
        if search.num_return_sequences == 0 || search.num_return_sequences > search.num_beams {
            return Err(ConfigError::Invalid(format!(
                "num_return_sequences ({}) must be in 1..={}",
                search.num_return_sequences, search.num_beams
            )));
        }
        if search.temperature <= 0.0 {
            return Err(ConfigError::Invalid("temperature must be > 0".into()));
        }
        if !(search.top_p > 0.0 && search.top_p <= 1.0) {
            return Err(ConfigError::Invalid("top_p must be in (0, 1]".into()));
        }
        if model.kv_cache.block_size == 0 {
            return Err(ConfigError::Invalid("kv_cache.block_size must be > 0".into()));
        }

        let inputs = &model.decoder.inputs;
        let outputs = &model.decoder.outputs;
        for template in [
            &inputs.past_key_names,
            &inputs.past_value_names,
            &inputs.key_cache_names,
            &inputs.value_cache_names,
            &outputs.present_key_names,
            &outputs.present_value_names,
        ] {
            if !template.contains("%d") {
                return Err(ConfigError::Invalid(format!(
                    "layer name template '{template}' has no %d placeholder"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &model.decoder.pipeline {
            if !seen.insert(stage.model_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pipeline model_id '{}'",
                    stage.model_id
                )));
            }
            if stage.outputs.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pipeline stage '{}' declares no outputs",
                    stage.model_id
                )));
            }
        }
        Ok(())
    }

    /// Maximum total sequence length (prompt + generated).
    pub fn max_length(&self) -> usize {
        if self.search.max_length > 0 {
            self.search.max_length
        } else {
            self.model.context_length
        }
    }

    /// Device kind of the first stage that names an execution provider.
    ///
    /// If no stage names one, every stage runs on CPU and so does the batch.
    pub fn primary_device_kind(&self) -> DeviceKind {
        let decoder = &self.model.decoder;
        decoder
            .pipeline
            .iter()
            .filter_map(|stage| stage.session_options.as_ref())
            .chain(decoder.session_options.as_ref())
            .flat_map(|opts| opts.provider_options.iter())
            .find(|p| !p.name.is_empty())
            .map(|p| DeviceKind::from_provider(&p.name))
            .unwrap_or_default()
    }
}

/// Expand a `%d` layer-name template.
pub fn layer_name(template: &str, layer: usize) -> String {
    template.replacen("%d", &layer.to_string(), 1)
}

fn default_model_type() -> String {
    "decoder-pipeline".to_string()
}

fn enabled() -> bool {
    true
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE_CONFIG: &str = r#"{
        "model": {
            "type": "phi3",
            "vocab_size": 32064,
            "context_length": 4096,
            "pad_token_id": 32000,
            "eos_token_id": [32000, 32007],
            "bos_token_id": 1,
            "decoder": {
                "num_hidden_layers": 2,
                "num_key_value_heads": 4,
                "head_size": 8,
                "pipeline": [
                    {
                        "model_id": "embeds",
                        "filename": "embeds.onnx",
                        "inputs": ["input_ids"],
                        "outputs": ["inputs_embeds"],
                        "session_options": {
                            "provider_options": [{"cuda": {"enable_cuda_graph": "0"}}]
                        }
                    },
                    {
                        "model_id": "transformer",
                        "inputs": ["inputs_embeds", "attention_mask"],
                        "outputs": ["hidden_states"],
                        "run_on_prompt": true,
                        "run_on_token_gen": true
                    },
                    {
                        "model_id": "lm_head",
                        "inputs": ["hidden_states"],
                        "outputs": ["logits"],
                        "session_options": {"provider_options": [{"qnn": {}}]}
                    }
                ]
            }
        },
        "search": {"max_length": 64, "top_k": 1}
    }"#;

    #[test]
    fn parse_pipeline_config() {
        let config = GeneratorConfig::from_json_str(PIPELINE_CONFIG).unwrap();
        let decoder = &config.model.decoder;
        assert_eq!(decoder.pipeline.len(), 3);
        assert_eq!(decoder.pipeline[0].model_id, "embeds");
        assert_eq!(decoder.pipeline[0].provider_names(), Some(vec!["cuda"]));
        assert_eq!(decoder.pipeline[1].provider_names(), None);
        assert_eq!(decoder.pipeline[2].provider_names(), Some(vec!["qnn"]));
        assert_eq!(
            decoder.pipeline[0].session_options.as_ref().unwrap().provider_options[0]
                .options
                .get("enable_cuda_graph")
                .map(String::as_str),
            Some("0")
        );
        assert_eq!(config.model.eos_token_id, vec![32000, 32007]);
        assert_eq!(config.search.top_k, 1);
        assert_eq!(config.max_length(), 64);
        assert_eq!(config.primary_device_kind(), DeviceKind::Cuda);
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = GeneratorConfig::from_json_str(
            r#"{"model": {"vocab_size": 8, "context_length": 32, "eos_token_id": 2,
                "decoder": {"num_hidden_layers": 1, "num_key_value_heads": 1, "head_size": 4}}}"#,
        )
        .unwrap();
        assert_eq!(config.model.eos_token_id, vec![2]);
        assert_eq!(config.model.decoder.inputs.input_ids, "input_ids");
        assert_eq!(config.model.decoder.outputs.logits, "logits");
        assert_eq!(config.model.kv_cache.block_size, 16);
        assert!(!config.model.kv_cache.paged);
        assert_eq!(config.search.num_beams, 1);
        assert_eq!(config.search.top_k, 50);
        assert!(config.search.early_stopping);
        assert_eq!(config.max_length(), 32);
        assert_eq!(config.primary_device_kind(), DeviceKind::Cpu);
    }

    #[test]
    fn provider_entry_with_two_members_is_rejected() {
        let json = r#"{"model": {"vocab_size": 8, "eos_token_id": 2,
            "decoder": {"num_hidden_layers": 1, "num_key_value_heads": 1, "head_size": 4,
              "session_options": {"provider_options": [{"cuda": {}, "dml": {}}]}}}}"#;
        let err = GeneratorConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    fn paged_cache_alias() {
        let json = r#"{"model": {"vocab_size": 8, "eos_token_id": 2,
            "kv_cache": {"paged_cache": true, "block_size": 4, "num_blocks": 10},
            "decoder": {"num_hidden_layers": 1, "num_key_value_heads": 1, "head_size": 4}}}"#;
        let config = GeneratorConfig::from_json_str(json).unwrap();
        assert!(config.model.kv_cache.paged);
        assert_eq!(config.model.kv_cache.num_blocks, Some(10));
    }

    #[test]
    fn validate_rejects_bad_search() {
        let json = r#"{"model": {"vocab_size": 8, "eos_token_id": 2,
            "decoder": {"num_hidden_layers": 1, "num_key_value_heads": 1, "head_size": 4}},
            "search": {"num_beams": 2, "num_return_sequences": 3}}"#;
        let err = GeneratorConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("num_return_sequences"));
    }

    #[test]
    fn validate_rejects_duplicate_stage_ids() {
        let json = r#"{"model": {"vocab_size": 8, "eos_token_id": 2,
            "decoder": {"num_hidden_layers": 1, "num_key_value_heads": 1, "head_size": 4,
              "pipeline": [
                {"model_id": "a", "outputs": ["x"]},
                {"model_id": "a", "outputs": ["logits"]}
              ]}}}"#;
        let err = GeneratorConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("duplicate pipeline model_id 'a'"));
    }

    #[test]
    fn layer_name_expands_placeholder() {
        assert_eq!(layer_name("present.%d.key", 3), "present.3.key");
        assert_eq!(layer_name("key_cache.%d", 0), "key_cache.0");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genai_config.json");
        fs::write(&path, PIPELINE_CONFIG).unwrap();
        let config = GeneratorConfig::from_file(&path).unwrap();
        assert_eq!(config.model.vocab_size, 32064);

        let missing = GeneratorConfig::from_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
