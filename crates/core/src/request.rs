use serde::Serialize;

use crate::config::GeneratorConfig;
use crate::kv_cache::SequenceId;
use crate::sampling::{LogitsProcessorPipeline, SamplerState, SamplingParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Admitted, prompt not yet in the cache.
    Waiting,
    Decoding,
    FinishedEos,
    FinishedLength,
    FinishedStop,
}

impl RequestStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::FinishedEos | Self::FinishedLength | Self::FinishedStop
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Waiting | Self::Decoding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Eos,
    Length,
    Stop,
}

impl From<FinishReason> for RequestStatus {
    fn from(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Eos => Self::FinishedEos,
            FinishReason::Length => Self::FinishedLength,
            FinishReason::Stop => Self::FinishedStop,
        }
    }
}

/// Per-request generation limits and selection policy.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    /// End-of-sequence tokens are suppressed until this many are generated.
    pub min_new_tokens: usize,
    /// Total length cap, prompt included. Tightens `max_new_tokens` once
    /// the prompt length is known.
    pub max_length: Option<usize>,
    /// Total length before end-of-sequence is allowed, prompt included.
    pub min_length: usize,
    pub eos_token_ids: Vec<u32>,
    /// Extra tokens that end generation with [`FinishReason::Stop`].
    pub stop_token_ids: Vec<u32>,
    pub ignore_eos: bool,
    pub sampling: SamplingParams,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            min_new_tokens: 0,
            max_length: None,
            min_length: 0,
            eos_token_ids: Vec::new(),
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            sampling: SamplingParams::greedy(),
        }
    }
}

impl GenerationParams {
    /// Defaults taken from the model descriptor's `search` section. Its
    /// lengths count the prompt, so they stay totals until admission.
    pub fn from_config(config: &GeneratorConfig) -> Self {
        let max_length = config.max_length();
        Self {
            max_new_tokens: max_length,
            max_length: Some(max_length),
            min_length: config.search.min_length,
            eos_token_ids: config.model.eos_token_id.clone(),
            sampling: SamplingParams::from(&config.search),
            ..Default::default()
        }
    }

    /// Generation budget for a prompt of `prompt_len` tokens.
    pub fn max_new_tokens_for(&self, prompt_len: usize) -> usize {
        match self.max_length {
            Some(total) => self.max_new_tokens.min(total.saturating_sub(prompt_len)),
            None => self.max_new_tokens,
        }
    }

    /// Tokens that must be generated before end-of-sequence is allowed.
    pub fn min_new_tokens_for(&self, prompt_len: usize) -> usize {
        self.min_new_tokens
            .max(self.min_length.saturating_sub(prompt_len))
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
}

/// A prompt waiting for admission.
#[derive(Debug, Clone)]
pub struct Request {
    pub prompt: Vec<u32>,
    pub params: GenerationParams,
}

impl Request {
    pub fn new(prompt: Vec<u32>, params: GenerationParams) -> Self {
        Self { prompt, params }
    }
}

pub struct SequenceState {
    pub seq_id: SequenceId,
    pub prompt_len: usize,
    /// Prompt followed by generated tokens.
    pub tokens: Vec<u32>,
    /// Tokens whose KV entries are in the cache.
    pub num_computed_tokens: usize,
    pub status: RequestStatus,
    pub params: GenerationParams,
    pub sampler_state: SamplerState,
    pub processors: LogitsProcessorPipeline,
}

impl SequenceState {
    /// Length totals in `request.params` are resolved against the prompt
    /// here; the stored params only carry per-sequence budgets.
    pub fn new(seq_id: SequenceId, request: Request) -> Self {
        let Request { prompt, mut params } = request;
        params.max_new_tokens = params.max_new_tokens_for(prompt.len());
        params.min_new_tokens = params.min_new_tokens_for(prompt.len());
        let processors = LogitsProcessorPipeline::from_params(
            params.sampling.repetition_penalty,
            prompt.len() + params.min_new_tokens,
            &params.eos_token_ids,
        );
        Self {
            seq_id,
            prompt_len: prompt.len(),
            tokens: prompt,
            num_computed_tokens: 0,
            status: RequestStatus::Waiting,
            sampler_state: SamplerState::new(params.sampling.seed),
            params,
            processors,
        }
    }

    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    pub fn num_generated(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }

    /// Tokens the next step has to feed: the whole prompt before prefill,
    /// the last sampled token afterwards.
    pub fn pending_tokens(&self) -> &[u32] {
        &self.tokens[self.num_computed_tokens..]
    }

    pub fn is_prefill(&self) -> bool {
        self.num_computed_tokens == 0
    }

    /// Record a step: the pending tokens are now cached and `token` was
    /// sampled after them.
    pub fn append(&mut self, token: u32) {
        self.num_computed_tokens = self.tokens.len();
        self.tokens.push(token);
        self.status = RequestStatus::Decoding;
    }

    /// Stop condition after the last append, if any.
    pub fn check_finished(&self) -> Option<FinishReason> {
        let last = *self.generated().last()?;
        let generated = self.num_generated();
        // The length limit overrides the minimum.
        if generated >= self.params.max_new_tokens {
            return Some(FinishReason::Length);
        }
        if generated < self.params.min_new_tokens {
            return None;
        }
        if !self.params.ignore_eos && self.params.eos_token_ids.contains(&last) {
            return Some(FinishReason::Eos);
        }
        if self.params.stop_token_ids.contains(&last) {
            return Some(FinishReason::Stop);
        }
        None
    }
}
