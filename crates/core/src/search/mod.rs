//! Decoding search strategies.
//!
//! Every strategy implements [`Search`]. Operations a strategy does not
//! support return [`SearchError::Unsupported`] so callers can branch on
//! capability instead of aborting.

mod beam;
mod beam_scorer;
mod greedy;
mod sequences;
mod speculative;

pub use beam::BeamSearch;
pub use beam_scorer::{BeamHypotheses, BeamScorer, Hypothesis, ScoredCandidate};
pub use greedy::GreedySearch;
pub use sequences::Sequences;
pub use speculative::{CandidateVerdict, SpeculativeGreedySearch};

use candle_core::{DType, Tensor};
use thiserror::Error;

use crate::config::GeneratorConfig;
use crate::sampling::SamplingParams;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("{strategy} search does not support {operation}")]
    Unsupported {
        strategy: &'static str,
        operation: &'static str,
    },

    #[error("logits have shape {actual:?}, expected {expected}")]
    LogitsShape { expected: String, actual: Vec<usize> },

    #[error("invalid batch: {0}")]
    Batch(String),

    #[error("no logits set for this step")]
    NoLogits,

    #[error("invalid candidates: {0}")]
    InvalidCandidates(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Batch-level search parameters.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub batch_size: usize,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    /// Total length cap, prompt included.
    pub max_length: usize,
    pub min_length: usize,
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub pad_token_id: u32,
    pub eos_token_ids: Vec<u32>,
    pub sampling: SamplingParams,
}

impl SearchParams {
    pub fn from_config(config: &GeneratorConfig, batch_size: usize) -> Self {
        let search = &config.search;
        Self {
            batch_size,
            num_beams: search.num_beams,
            num_return_sequences: search.num_return_sequences,
            max_length: config.max_length(),
            min_length: search.min_length,
            length_penalty: search.length_penalty,
            early_stopping: search.early_stopping,
            pad_token_id: config.model.pad_token_id,
            eos_token_ids: config.model.eos_token_id.clone(),
            sampling: SamplingParams::from(search),
        }
    }

    pub fn batch_beam(&self) -> usize {
        self.batch_size * self.num_beams
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }
}

/// Common contract of the search strategies.
///
/// A step is: [`Search::set_logits`], optional processing
/// ([`Search::apply_repetition_penalty`], [`Search::apply_min_length`]),
/// then exactly one selection call, which appends to the history.
pub trait Search {
    fn strategy(&self) -> &'static str;

    fn set_logits(&mut self, logits: &Tensor) -> Result<()>;

    /// One token per row, as chosen by the last selection.
    fn next_tokens(&self) -> &[u32];

    /// Row each survivor of the last step continues.
    fn next_indices(&self) -> Result<&[u32]> {
        Err(self.unsupported("next_indices"))
    }

    fn sequence_lengths(&self) -> Vec<usize>;

    /// Padded length shared by all rows.
    fn sequence_length(&self) -> usize;

    fn sequence(&self, index: usize) -> &[u32];

    fn is_done(&self) -> bool;

    fn select_top(&mut self) -> Result<()>;

    fn apply_min_length(&mut self, min_length: usize) -> Result<()>;

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()>;

    fn sample_top_k(&mut self, _k: usize, _temperature: f32) -> Result<()> {
        Err(self.unsupported("sample_top_k"))
    }

    fn sample_top_p(&mut self, _p: f32, _temperature: f32) -> Result<()> {
        Err(self.unsupported("sample_top_p"))
    }

    fn sample_top_k_top_p(&mut self, _k: usize, _p: f32, _temperature: f32) -> Result<()> {
        Err(self.unsupported("sample_top_k_top_p"))
    }

    /// Append `tokens` (an equal share per row) bypassing selection.
    fn set_next_tokens(&mut self, _tokens: &[u32]) -> Result<()> {
        Err(self.unsupported("set_next_tokens"))
    }

    fn drop_last_tokens(&mut self, _n: usize) -> Result<()> {
        Err(self.unsupported("drop_last_tokens"))
    }

    fn check_candidates(
        &mut self,
        _sequence: &[u32],
        _candidate_length: usize,
    ) -> Result<CandidateVerdict> {
        Err(self.unsupported("check_candidates"))
    }

    fn unsupported(&self, operation: &'static str) -> SearchError {
        SearchError::Unsupported {
            strategy: self.strategy(),
            operation,
        }
    }
}

/// Run the configured selection policy for one step.
///
/// Penalties and suppression are applied before selecting; sampling calls
/// are only made when `params.do_sample` asks for them.
pub fn select_next_tokens(search: &mut dyn Search, params: &SearchParams) -> Result<()> {
    let sampling = &params.sampling;
    if sampling.repetition_penalty != 1.0 {
        search.apply_repetition_penalty(sampling.repetition_penalty)?;
    }
    if params.min_length > 0 {
        search.apply_min_length(params.min_length)?;
    }
    if sampling.is_greedy() {
        return search.select_top();
    }
    match (sampling.top_k > 1, sampling.top_p < 1.0) {
        (true, true) => {
            search.sample_top_k_top_p(sampling.top_k, sampling.top_p, sampling.temperature)
        }
        (true, false) => search.sample_top_k(sampling.top_k, sampling.temperature),
        (false, true) => search.sample_top_p(sampling.top_p, sampling.temperature),
        (false, false) => search.sample_top_k(0, sampling.temperature),
    }
}

/// Host copy of logits as `[row][position][vocab]`.
///
/// Accepts `[rows, vocab]` (one position) or `[rows, positions, vocab]`.
pub(crate) fn logits_to_host(logits: &Tensor, rows: usize) -> Result<Vec<Vec<Vec<f32>>>> {
    let logits = logits.to_dtype(DType::F32)?;
    let host = match logits.dims() {
        [r, _] if *r == rows => logits
            .to_vec2::<f32>()?
            .into_iter()
            .map(|row| vec![row])
            .collect(),
        [r, _, _] if *r == rows => logits.to_vec3::<f32>()?,
        dims => {
            return Err(SearchError::LogitsShape {
                expected: format!("[{rows}, vocab] or [{rows}, positions, vocab]"),
                actual: dims.to_vec(),
            })
        }
    };
    Ok(host)
}
