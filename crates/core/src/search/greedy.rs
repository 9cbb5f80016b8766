use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{logits_to_host, Result, Search, SearchError, SearchParams, Sequences};
use crate::sampling::{self, LogitsProcessor, MinLengthProcessor, RepetitionPenaltyProcessor};

/// One token per row per step, by argmax or by sampling.
///
/// Once a row emits an end-of-sequence token every later token in that row
/// is the pad token, and the row no longer counts toward `not_done`.
pub struct GreedySearch {
    params: SearchParams,
    pub(super) sequences: Sequences,
    /// Last-position logits per row for the current step.
    pub(super) logits: Option<Vec<Vec<f32>>>,
    next_tokens: Vec<u32>,
    eos_seen: Vec<bool>,
    not_done_count: usize,
    done: bool,
    rng: StdRng,
}

impl GreedySearch {
    pub fn new(params: SearchParams, prompts: &[Vec<u32>]) -> Result<Self> {
        if prompts.len() != params.batch_size {
            return Err(SearchError::Batch(format!(
                "expected {} prompts, got {}",
                params.batch_size,
                prompts.len()
            )));
        }
        let sequences = Sequences::new(prompts, 1, params.pad_token_id);
        let rng = match params.sampling.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let done = params.max_length > 0 && sequences.sequence_length() >= params.max_length;
        Ok(Self {
            next_tokens: vec![params.pad_token_id; params.batch_size],
            eos_seen: vec![false; params.batch_size],
            not_done_count: params.batch_size,
            sequences,
            logits: None,
            params,
            done,
            rng,
        })
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn sequences(&self) -> &Sequences {
        &self.sequences
    }

    pub fn eos_seen(&self) -> &[bool] {
        &self.eos_seen
    }

    pub fn not_done_count(&self) -> usize {
        self.not_done_count
    }

    fn process_rows(&mut self, processor: &dyn LogitsProcessor) -> Result<()> {
        let logits = self.logits.as_mut().ok_or(SearchError::NoLogits)?;
        for (i, row) in logits.iter_mut().enumerate() {
            processor.process(row, self.sequences.sequence(i));
        }
        Ok(())
    }

    /// Choose a token per still-running row, then commit the step.
    fn select_with<F>(&mut self, mut pick: F) -> Result<()>
    where
        F: FnMut(&[f32], &mut StdRng) -> u32,
    {
        let logits = self.logits.take().ok_or(SearchError::NoLogits)?;
        let tokens: Vec<u32> = logits
            .iter()
            .zip(&self.eos_seen)
            .map(|(row, &seen)| {
                if seen {
                    self.params.pad_token_id
                } else {
                    pick(row, &mut self.rng)
                }
            })
            .collect();
        self.commit(&tokens);
        Ok(())
    }

    /// Append one token per row and update end-of-sequence bookkeeping.
    pub(super) fn commit(&mut self, tokens: &[u32]) {
        let mut tokens = tokens.to_vec();
        self.pad_if_already_eos(&mut tokens);
        self.sequences.append(&tokens);
        self.next_tokens = tokens;
        self.update_done();
    }

    /// Append several tokens per row, as if each had been selected in turn.
    pub(super) fn commit_many(&mut self, tokens: &[u32]) -> Result<()> {
        let rows = self.params.batch_size;
        if rows == 0 || tokens.len() % rows != 0 {
            return Err(SearchError::InvalidCandidates(format!(
                "{} tokens do not split across {rows} rows",
                tokens.len()
            )));
        }
        let per_row = tokens.len() / rows;
        for step in 0..per_row {
            let column: Vec<u32> = (0..rows).map(|r| tokens[r * per_row + step]).collect();
            self.commit(&column);
        }
        Ok(())
    }

    fn pad_if_already_eos(&mut self, tokens: &mut [u32]) {
        for (row, token) in tokens.iter_mut().enumerate() {
            if self.eos_seen[row] {
                *token = self.params.pad_token_id;
            } else if self.params.is_eos(*token) {
                self.eos_seen[row] = true;
                self.not_done_count -= 1;
            }
        }
    }

    fn update_done(&mut self) {
        let at_max = self.params.max_length > 0
            && self.sequences.sequence_length() >= self.params.max_length;
        self.done = self.not_done_count == 0 || at_max;
    }

    /// Recompute end-of-sequence flags from the history, after a rollback.
    pub(super) fn recount_eos(&mut self) {
        self.not_done_count = 0;
        for row in 0..self.params.batch_size {
            let seen = self
                .sequences
                .generated(row)
                .iter()
                .any(|&t| self.params.is_eos(t));
            self.eos_seen[row] = seen;
            if !seen {
                self.not_done_count += 1;
            }
        }
        self.update_done();
    }
}

impl Search for GreedySearch {
    fn strategy(&self) -> &'static str {
        "greedy"
    }

    fn set_logits(&mut self, logits: &Tensor) -> Result<()> {
        let host = logits_to_host(logits, self.params.batch_size)?;
        self.logits = Some(
            host.into_iter()
                .map(|mut positions| positions.pop().unwrap_or_default())
                .collect(),
        );
        Ok(())
    }

    fn next_tokens(&self) -> &[u32] {
        &self.next_tokens
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
        self.select_with(|row, _| sampling::argmax(row))
    }

    fn apply_min_length(&mut self, min_length: usize) -> Result<()> {
        let processor = MinLengthProcessor::new(min_length, self.params.eos_token_ids.clone());
        self.process_rows(&processor)
    }

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()> {
        self.process_rows(&RepetitionPenaltyProcessor::new(penalty))
    }

    fn sample_top_k(&mut self, k: usize, temperature: f32) -> Result<()> {
        self.select_with(|row, rng| sampling::sample_top_k(row, k, temperature, rng))
    }

    fn sample_top_p(&mut self, p: f32, temperature: f32) -> Result<()> {
        self.select_with(|row, rng| sampling::sample_top_p(row, p, temperature, rng))
    }

    fn sample_top_k_top_p(&mut self, k: usize, p: f32, temperature: f32) -> Result<()> {
        self.select_with(|row, rng| sampling::sample_top_k_top_p(row, k, p, temperature, rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingParams;
    use candle_core::Device;

    const PAD: u32 = 0;
    const EOS: u32 = 1;

    fn params(batch_size: usize, max_length: usize) -> SearchParams {
        SearchParams {
            batch_size,
            num_beams: 1,
            num_return_sequences: 1,
            max_length,
            min_length: 0,
            length_penalty: 1.0,
            early_stopping: true,
            pad_token_id: PAD,
            eos_token_ids: vec![EOS],
            sampling: SamplingParams::greedy(),
        }
    }

    /// Logits with a single hot token per row.
    fn hot(tokens: &[u32], vocab: usize) -> Tensor {
        let data: Vec<f32> = tokens
            .iter()
            .flat_map(|&t| (0..vocab).map(move |v| if v as u32 == t { 5.0 } else { 0.0 }))
            .collect();
        Tensor::from_vec(data, (tokens.len(), vocab), &Device::Cpu).unwrap()
    }

    #[test]
    fn all_rows_eos_finishes_in_one_step() {
        let mut search = GreedySearch::new(params(3, 32), &[vec![4], vec![5, 6], vec![7]]).unwrap();
        search.set_logits(&hot(&[EOS, EOS, EOS], 8)).unwrap();
        search.select_top().unwrap();
        assert!(search.is_done());
        assert_eq!(search.next_tokens(), &[EOS, EOS, EOS]);
        assert_eq!(search.not_done_count(), 0);
    }

    #[test]
    fn finished_rows_emit_pad() {
        let mut search = GreedySearch::new(params(2, 32), &[vec![4], vec![5]]).unwrap();
        search.set_logits(&hot(&[EOS, 3], 8)).unwrap();
        search.select_top().unwrap();
        assert!(!search.is_done());

        search.set_logits(&hot(&[6, 7], 8)).unwrap();
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[PAD, 7]);
        assert_eq!(search.sequence(0), &[4, EOS, PAD]);
        assert_eq!(search.sequence(1), &[5, 3, 7]);
    }

    #[test]
    fn max_length_ends_search() {
        let mut search = GreedySearch::new(params(1, 3), &[vec![4, 4]]).unwrap();
        search.set_logits(&hot(&[6], 8)).unwrap();
        search.select_top().unwrap();
        assert!(search.is_done());
        assert_eq!(search.sequence_length(), 3);
    }

    #[test]
    fn min_length_blocks_eos() {
        let mut search = GreedySearch::new(params(1, 32), &[vec![4]]).unwrap();
        search.set_logits(&hot(&[EOS], 8)).unwrap();
        search.apply_min_length(3).unwrap();
        search.select_top().unwrap();
        assert_ne!(search.next_tokens()[0], EOS);
        assert!(!search.is_done());
    }

    #[test]
    fn repetition_penalty_changes_choice() {
        let mut search = GreedySearch::new(params(1, 32), &[vec![3]]).unwrap();
        let logits = Tensor::new(&[[0.0f32, 0.0, 0.0, 2.0, 1.5]], &Device::Cpu).unwrap();
        search.set_logits(&logits).unwrap();
        search.apply_repetition_penalty(2.0).unwrap();
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[4]);
    }

    #[test]
    fn selection_without_logits_fails() {
        let mut search = GreedySearch::new(params(1, 32), &[vec![3]]).unwrap();
        assert!(matches!(search.select_top(), Err(SearchError::NoLogits)));
    }

    #[test]
    fn speculative_operations_are_unsupported() {
        let mut search = GreedySearch::new(params(1, 32), &[vec![3]]).unwrap();
        let err = search.drop_last_tokens(1).unwrap_err();
        assert_eq!(err.to_string(), "greedy search does not support drop_last_tokens");
        assert!(search.next_indices().is_err());
        assert!(search.check_candidates(&[1, 2], 1).is_err());
    }

    #[test]
    fn sampling_stays_in_top_k() {
        let mut p = params(1, 64);
        p.sampling.seed = Some(3);
        let mut search = GreedySearch::new(p, &[vec![2]]).unwrap();
        let logits = Tensor::new(&[[0.0f32, -9.0, 3.0, 2.9, -9.0]], &Device::Cpu).unwrap();
        for _ in 0..20 {
            search.set_logits(&logits).unwrap();
            search.sample_top_k(2, 1.0).unwrap();
            let t = search.next_tokens()[0];
            assert!(t == 2 || t == 3, "sampled {t}");
        }
    }
}
