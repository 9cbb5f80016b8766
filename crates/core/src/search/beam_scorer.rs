//! Beam bookkeeping: which candidates survive a step and which hypotheses
//! are finished.

use std::cmp::Ordering;

use super::{Result, SearchError, Sequences};

/// A finished hypothesis and its length-normalised score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
}

/// A possible extension of one beam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCandidate {
    /// Cumulative log-probability if this token is chosen.
    pub score: f32,
    pub token: u32,
    /// Global row (batch * num_beams + beam) being extended.
    pub row: usize,
}

/// The best `num_beams` finished hypotheses of one batch entry.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    beams: Vec<Hypothesis>,
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            beams: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            early_stopping,
            worst_score: f32::INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// `sum_logprobs / len^length_penalty`.
    pub fn normalized(&self, sum_logprobs: f32, length: usize) -> f32 {
        sum_logprobs / (length.max(1) as f32).powf(self.length_penalty)
    }

    /// Offer a finished hypothesis; keeps it if it ranks among the best.
    pub fn add(&mut self, tokens: &[u32], sum_logprobs: f32) {
        let score = self.normalized(sum_logprobs, tokens.len());
        if self.beams.len() < self.num_beams || score > self.worst_score {
            self.beams.push(Hypothesis {
                tokens: tokens.to_vec(),
                score,
            });
            if self.beams.len() > self.num_beams {
                let worst = self
                    .beams
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.score.partial_cmp(&b.1.score).unwrap_or(Ordering::Equal))
                    .map(|(i, _)| i);
                if let Some(worst) = worst {
                    self.beams.remove(worst);
                }
            }
            self.worst_score = self
                .beams
                .iter()
                .map(|h| h.score)
                .fold(f32::INFINITY, f32::min);
        }
    }

    /// Whether no running beam can still beat the finished ones.
    pub fn is_done(&self, best_sum_logprobs: f32, current_length: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst_score >= self.normalized(best_sum_logprobs, current_length)
    }

    /// Hypotheses by descending score.
    pub fn sorted(&self) -> Vec<Hypothesis> {
        let mut beams = self.beams.clone();
        beams.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        beams
    }
}

/// Selects surviving beams each step and collects finished hypotheses.
pub struct BeamScorer {
    batch_size: usize,
    num_beams: usize,
    pad_token_id: u32,
    eos_token_ids: Vec<u32>,
    hypotheses: Vec<BeamHypotheses>,
    done: Vec<bool>,
    beam_scores: Vec<f32>,
    next_tokens: Vec<u32>,
    next_indices: Vec<u32>,
    finalized: bool,
}

impl BeamScorer {
    pub fn new(
        batch_size: usize,
        num_beams: usize,
        length_penalty: f32,
        early_stopping: bool,
        pad_token_id: u32,
        eos_token_ids: Vec<u32>,
    ) -> Self {
        let rows = batch_size * num_beams;
        // All beams of an entry start identical; only the first may expand
        // on the first step or the top-k would be k copies of one token.
        let beam_scores = (0..rows)
            .map(|r| if r % num_beams == 0 { 0.0 } else { -1e9 })
            .collect();
        Self {
            batch_size,
            num_beams,
            pad_token_id,
            eos_token_ids,
            hypotheses: (0..batch_size)
                .map(|_| BeamHypotheses::new(num_beams, length_penalty, early_stopping))
                .collect(),
            done: vec![false; batch_size],
            beam_scores,
            next_tokens: vec![pad_token_id; rows],
            next_indices: (0..rows as u32).collect(),
            finalized: false,
        }
    }

    pub fn beam_scores(&self) -> &[f32] {
        &self.beam_scores
    }

    pub fn next_tokens(&self) -> &[u32] {
        &self.next_tokens
    }

    pub fn next_indices(&self) -> &[u32] {
        &self.next_indices
    }

    pub fn is_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn hypotheses(&self, batch: usize) -> &BeamHypotheses {
        &self.hypotheses[batch]
    }

    /// Pick the next `num_beams` rows of each batch entry.
    ///
    /// `candidates[b]` must be sorted by descending score and hold at least
    /// `num_beams` non-EOS entries for every running batch entry; otherwise
    /// nothing is updated and an error is returned.
    pub fn process(
        &mut self,
        sequences: &Sequences,
        candidates: &[Vec<ScoredCandidate>],
    ) -> Result<()> {
        if candidates.len() != self.batch_size {
            return Err(SearchError::InvalidCandidates(format!(
                "{} candidate lists for batch of {}",
                candidates.len(),
                self.batch_size
            )));
        }
        for (b, cands) in candidates.iter().enumerate() {
            let usable = cands
                .iter()
                .filter(|c| !self.eos_token_ids.contains(&c.token))
                .count();
            if !self.done[b] && usable < self.num_beams {
                return Err(SearchError::InvalidCandidates(format!(
                    "batch entry {b} has {usable} non-EOS candidates, needs {}",
                    self.num_beams
                )));
            }
        }

        let current_length = sequences.sequence_length() + 1;
        for (b, cands) in candidates.iter().enumerate() {
            let base = b * self.num_beams;
            if self.done[b] {
                for j in 0..self.num_beams {
                    self.beam_scores[base + j] = 0.0;
                    self.next_tokens[base + j] = self.pad_token_id;
                    self.next_indices[base + j] = (base + j) as u32;
                }
                continue;
            }

            let mut filled = 0;
            for (rank, cand) in cands.iter().enumerate() {
                if self.eos_token_ids.contains(&cand.token) {
                    // Only EOS candidates ranked inside the beam width finish.
                    if rank < self.num_beams {
                        self.hypotheses[b].add(sequences.sequence(cand.row), cand.score);
                    }
                } else {
                    self.beam_scores[base + filled] = cand.score;
                    self.next_tokens[base + filled] = cand.token;
                    self.next_indices[base + filled] = cand.row as u32;
                    filled += 1;
                }
                if filled == self.num_beams {
                    break;
                }
            }

            let best = cands.first().map_or(f32::NEG_INFINITY, |c| c.score);
            self.done[b] = self.hypotheses[b].is_done(best, current_length);
        }
        Ok(())
    }

    /// Move still-running beams into the hypothesis sets. Runs once; later
    /// calls are no-ops.
    pub fn finalize(&mut self, sequences: &Sequences) {
        if self.finalized {
            return;
        }
        for b in 0..self.batch_size {
            if self.done[b] {
                continue;
            }
            for j in 0..self.num_beams {
                let row = b * self.num_beams + j;
                self.hypotheses[b].add(sequences.sequence(row), self.beam_scores[row]);
            }
        }
        self.finalized = true;
    }

    /// Best `num_return_sequences` hypotheses per batch entry.
    pub fn outputs(&self, num_return_sequences: usize) -> Vec<Vec<Hypothesis>> {
        self.hypotheses
            .iter()
            .map(|h| {
                let mut sorted = h.sorted();
                sorted.truncate(num_return_sequences);
                sorted
            })
            .collect()
    }
}
