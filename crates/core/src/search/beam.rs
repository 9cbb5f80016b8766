use std::cmp::Ordering;

use candle_core::Tensor;

use super::beam_scorer::{BeamScorer, Hypothesis, ScoredCandidate};
use super::{logits_to_host, Result, Search, SearchError, SearchParams, Sequences};
use crate::sampling::{log_softmax, LogitsProcessor, MinLengthProcessor, RepetitionPenaltyProcessor};

/// Beam search over `batch_size * num_beams` rows.
///
/// Each step every beam is expanded by log-probability, the scorer keeps the
/// best `num_beams` continuations per batch entry, and rows are reshuffled so
/// row `j` continues row `next_indices()[j]`.
pub struct BeamSearch {
    params: SearchParams,
    sequences: Sequences,
    scorer: BeamScorer,
    logits: Option<Vec<Vec<f32>>>,
    done: bool,
}

impl BeamSearch {
    pub fn new(params: SearchParams, prompts: &[Vec<u32>]) -> Result<Self> {
        if prompts.len() != params.batch_size {
            return Err(SearchError::Batch(format!(
                "expected {} prompts, got {}",
                params.batch_size,
                prompts.len()
            )));
        }
        if params.num_beams < 2 {
            return Err(SearchError::Batch(format!(
                "beam search needs num_beams >= 2, got {}",
                params.num_beams
            )));
        }
        let sequences = Sequences::new(prompts, params.num_beams, params.pad_token_id);
        let done = params.max_length > 0 && sequences.sequence_length() >= params.max_length;
        let scorer = BeamScorer::new(
            params.batch_size,
            params.num_beams,
            params.length_penalty,
            params.early_stopping,
            params.pad_token_id,
            params.eos_token_ids.clone(),
        );
        Ok(Self {
            params,
            sequences,
            scorer,
            logits: None,
            done,
        })
    }

    pub fn scorer(&self) -> &BeamScorer {
        &self.scorer
    }

    /// Cumulative log-probability of each row.
    pub fn beam_scores(&self) -> &[f32] {
        self.scorer.beam_scores()
    }

    /// Close out the search and select the final hypotheses.
    ///
    /// Safe to call more than once; only the first call changes state.
    pub fn finalize(&mut self) -> Vec<Vec<Hypothesis>> {
        self.scorer.finalize(&self.sequences);
        self.done = true;
        self.scorer.outputs(self.params.num_return_sequences)
    }

    fn process_rows(&mut self, processor: &dyn LogitsProcessor) -> Result<()> {
        let logits = self.logits.as_mut().ok_or(SearchError::NoLogits)?;
        for (i, row) in logits.iter_mut().enumerate() {
            processor.process(row, self.sequences.sequence(i));
        }
        Ok(())
    }

    /// Top candidates of one batch entry, best first.
    ///
    /// Each EOS id can take at most one slot per beam, so keeping
    /// `num_beams * (1 + eos ids)` leaves `num_beams` non-EOS candidates.
    fn candidates(&self, logits: &[Vec<f32>], batch: usize) -> Vec<ScoredCandidate> {
        let num_beams = self.params.num_beams;
        let scores = self.scorer.beam_scores();
        let mut all: Vec<ScoredCandidate> = (0..num_beams)
            .flat_map(|j| {
                let row = batch * num_beams + j;
                let base = scores[row];
                log_softmax(&logits[row])
                    .into_iter()
                    .enumerate()
                    .map(move |(token, lp)| ScoredCandidate {
                        score: base + lp,
                        token: token as u32,
                        row,
                    })
            })
            .collect();
        all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        all.truncate(num_beams * (1 + self.params.eos_token_ids.len()));
        all
    }
}

impl Search for BeamSearch {
    fn strategy(&self) -> &'static str {
        "beam"
    }

    fn set_logits(&mut self, logits: &Tensor) -> Result<()> {
        let host = logits_to_host(logits, self.params.batch_beam())?;
        self.logits = Some(
            host.into_iter()
                .map(|mut positions| positions.pop().unwrap_or_default())
                .collect(),
        );
        Ok(())
    }

    fn next_tokens(&self) -> &[u32] {
        self.scorer.next_tokens()
    }

    fn next_indices(&self) -> Result<&[u32]> {
        Ok(self.scorer.next_indices())
    }

    fn sequence_lengths(&self) -> Vec<usize> {
        self.sequences.sequence_lengths()
    }

    fn sequence_length(&self) -> usize {
        self.sequences.sequence_length()
    }

    fn sequence(&self, index: usize) -> &[u32] {
        self.sequences.sequence(index)
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn select_top(&mut self) -> Result<()> {
        let logits = self.logits.take().ok_or(SearchError::NoLogits)?;
        let candidates: Vec<Vec<ScoredCandidate>> = (0..self.params.batch_size)
            .map(|b| self.candidates(&logits, b))
            .collect();
        self.scorer.process(&self.sequences, &candidates)?;
        self.sequences
            .reorder_and_append(self.scorer.next_indices(), self.scorer.next_tokens());

        let at_max = self.params.max_length > 0
            && self.sequences.sequence_length() >= self.params.max_length;
        if self.scorer.is_done() || at_max {
            self.done = true;
        }
        Ok(())
    }

    fn apply_min_length(&mut self, min_length: usize) -> Result<()> {
        let processor = MinLengthProcessor::new(min_length, self.params.eos_token_ids.clone());
        self.process_rows(&processor)
    }

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()> {
        self.process_rows(&RepetitionPenaltyProcessor::new(penalty))
    }
}
