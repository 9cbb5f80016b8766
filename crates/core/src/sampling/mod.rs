//! Token selection primitives shared by the search strategies and the batch
//! engine: argmax, temperature-scaled top-k / top-p sampling, and the logits
//! processors applied before any of them.

pub mod logits_processor;

pub use logits_processor::{
    LogitsProcessor, LogitsProcessorPipeline, MinLengthProcessor, RepetitionPenaltyProcessor,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SearchConfig;

/// Parameters controlling token selection for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// false selects the argmax regardless of the other knobs.
    pub do_sample: bool,
    /// Logit divisor; must be > 0.
    pub temperature: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: usize,
    /// Nucleus threshold in (0, 1]. 1.0 = disabled.
    pub top_p: f32,
    /// 1.0 = none, >1.0 discourages tokens already in the sequence.
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for SamplingParams {
    fn from(search: &SearchConfig) -> Self {
        Self {
            do_sample: search.do_sample,
            temperature: search.temperature,
            top_k: search.top_k,
            top_p: search.top_p,
            repetition_penalty: search.repetition_penalty,
            seed: search.random_seed,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.top_k == 1
    }
}

/// Per-sequence RNG.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Pick a token from already-processed logits according to `params`.
pub fn sample(logits: &[f32], params: &SamplingParams, state: &mut SamplerState) -> u32 {
    if params.is_greedy() {
        return argmax(logits);
    }
    let rng = state.rng_mut();
    match (params.top_k > 1, params.top_p < 1.0) {
        (true, true) => sample_top_k_top_p(logits, params.top_k, params.top_p, params.temperature, rng),
        (true, false) => sample_top_k(logits, params.top_k, params.temperature, rng),
        (false, true) => sample_top_p(logits, params.top_p, params.temperature, rng),
        (false, false) => sample_top_k(logits, logits.len(), params.temperature, rng),
    }
}

pub fn sample_top_k(logits: &[f32], k: usize, temperature: f32, rng: &mut StdRng) -> u32 {
    sample_top_k_top_p(logits, k, 1.0, temperature, rng)
}

pub fn sample_top_p(logits: &[f32], p: f32, temperature: f32, rng: &mut StdRng) -> u32 {
    sample_top_k_top_p(logits, 0, p, temperature, rng)
}

/// Restrict to the `k` most likely tokens (0 = all), then to the smallest
/// prefix whose probability mass reaches `p`, and draw from what is left.
///
/// Falls back to the argmax when filtering leaves nothing to draw from.
pub fn sample_top_k_top_p(
    logits: &[f32],
    k: usize,
    p: f32,
    temperature: f32,
    rng: &mut StdRng,
) -> u32 {
    let candidates = filter_top_k_top_p(logits, k, p, temperature);
    let total: f32 = candidates.iter().map(|&(_, prob)| prob).sum();
    if candidates.is_empty() || !(total > 0.0) {
        return argmax(logits);
    }
    let r = rng.gen::<f32>() * total;
    let mut cumsum = 0.0f32;
    for &(token, prob) in &candidates {
        cumsum += prob;
        if r < cumsum {
            return token;
        }
    }
    candidates[candidates.len() - 1].0
}

/// Surviving `(token, probability)` pairs in descending probability order.
/// Probabilities are not renormalised after the cut.
pub fn filter_top_k_top_p(logits: &[f32], k: usize, p: f32, temperature: f32) -> Vec<(u32, f32)> {
    let mut order: Vec<usize> = (0..logits.len())
        .filter(|&i| logits[i] > f32::NEG_INFINITY)
        .collect();
    order.sort_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if k > 0 {
        order.truncate(k);
    }
    if order.is_empty() {
        return Vec::new();
    }

    let scaled: Vec<f32> = order.iter().map(|&i| logits[i] / temperature).collect();
    let probs = softmax(&scaled);

    let mut kept = Vec::with_capacity(order.len());
    let mut cumsum = 0.0f32;
    for (&i, &prob) in order.iter().zip(&probs) {
        kept.push((i as u32, prob));
        cumsum += prob;
        if cumsum >= p {
            break;
        }
    }
    kept
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// log_softmax(x_i) = x_i - max(x) - log(sum(exp(x_j - max(x))))
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    best as u32
}
