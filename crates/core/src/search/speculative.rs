use candle_core::Tensor;

use super::greedy::GreedySearch;
use super::{logits_to_host, Result, Search, SearchError, SearchParams};
use crate::sampling::{self, LogitsProcessorPipeline};

/// Outcome of verifying a drafted continuation against the target model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateVerdict {
    /// Number of drafted tokens the target model agrees with.
    pub accepted_len: usize,
    /// Target model's token after the accepted prefix: a correction when a
    /// draft was rejected, a bonus token when all were accepted.
    pub next_token: u32,
}

/// Greedy search that can verify drafted tokens and roll back rejected ones.
///
/// Only a single sequence is supported. Logits for every fed position are
/// kept so a whole draft window can be checked from one forward pass.
pub struct SpeculativeGreedySearch {
    inner: GreedySearch,
    positions: Option<Vec<Vec<f32>>>,
}

impl SpeculativeGreedySearch {
    pub fn new(params: SearchParams, prompt: &[u32]) -> Result<Self> {
        if params.batch_size != 1 || params.num_beams != 1 {
            return Err(SearchError::Batch(format!(
                "speculative search runs one sequence, got batch {} x beams {}",
                params.batch_size, params.num_beams
            )));
        }
        Ok(Self {
            inner: GreedySearch::new(params, &[prompt.to_vec()])?,
            positions: None,
        })
    }

    pub fn params(&self) -> &SearchParams {
        self.inner.params()
    }

    /// Tokens generated after the prompt.
    pub fn generated(&self) -> &[u32] {
        self.inner.sequences().generated(0)
    }

    pub fn eos_seen(&self) -> bool {
        self.inner.eos_seen()[0]
    }
}

impl Search for SpeculativeGreedySearch {
    fn strategy(&self) -> &'static str {
        "speculative"
    }

    fn set_logits(&mut self, logits: &Tensor) -> Result<()> {
        let positions = logits_to_host(logits, 1)?
            .into_iter()
            .next()
            .unwrap_or_default();
        self.inner.logits = Some(positions.last().cloned().into_iter().collect());
        self.positions = Some(positions);
        Ok(())
    }

    fn next_tokens(&self) -> &[u32] {
        self.inner.next_tokens()
    }

    fn sequence_lengths(&self) -> Vec<usize> {
        self.inner.sequence_lengths()
    }

    fn sequence_length(&self) -> usize {
        self.inner.sequence_length()
    }

    fn sequence(&self, index: usize) -> &[u32] {
        self.inner.sequence(index)
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    fn select_top(&mut self) -> Result<()> {
        self.positions = None;
        self.inner.select_top()
    }

    fn apply_min_length(&mut self, min_length: usize) -> Result<()> {
        self.inner.apply_min_length(min_length)
    }

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()> {
        self.inner.apply_repetition_penalty(penalty)
    }

    fn sample_top_k(&mut self, k: usize, temperature: f32) -> Result<()> {
        self.positions = None;
        self.inner.sample_top_k(k, temperature)
    }

    fn sample_top_p(&mut self, p: f32, temperature: f32) -> Result<()> {
        self.positions = None;
        self.inner.sample_top_p(p, temperature)
    }

    fn sample_top_k_top_p(&mut self, k: usize, p: f32, temperature: f32) -> Result<()> {
        self.positions = None;
        self.inner.sample_top_k_top_p(k, p, temperature)
    }

    fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        self.inner.commit_many(tokens)
    }

    fn drop_last_tokens(&mut self, n: usize) -> Result<()> {
        let generated = self.inner.sequences().generated(0).len();
        if n > generated {
            return Err(SearchError::InvalidCandidates(format!(
                "cannot drop {n} tokens, only {generated} generated"
            )));
        }
        self.inner.sequences.drop_last(n);
        self.inner.recount_eos();
        Ok(())
    }

    /// Compare the last `candidate_length` tokens of `sequence` with the
    /// argmax of the last `candidate_length + 1` logit positions.
    ///
    /// Position `i` of that window predicts draft token `i`; the extra final
    /// position predicts the token after a fully accepted draft. Repetition
    /// penalty and min-length suppression are applied to each position with
    /// the history that precedes it, as a plain greedy step would.
    fn check_candidates(
        &mut self,
        sequence: &[u32],
        candidate_length: usize,
    ) -> Result<CandidateVerdict> {
        let positions = self.positions.as_ref().ok_or(SearchError::NoLogits)?;
        if sequence.len() < candidate_length {
            return Err(SearchError::InvalidCandidates(format!(
                "sequence of {} tokens has no {candidate_length} candidates",
                sequence.len()
            )));
        }
        if positions.len() < candidate_length + 1 {
            return Err(SearchError::InvalidCandidates(format!(
                "{candidate_length} candidates need {} logit positions, got {}",
                candidate_length + 1,
                positions.len()
            )));
        }
        let window = &positions[positions.len() - (candidate_length + 1)..];
        let start = sequence.len() - candidate_length;
        let drafts = &sequence[start..];

        let params = self.inner.params();
        let processors = LogitsProcessorPipeline::from_params(
            params.sampling.repetition_penalty,
            params.min_length,
            &params.eos_token_ids,
        );
        let target = |i: usize| {
            let mut logits = window[i].clone();
            processors.process(&mut logits, &sequence[..start + i]);
            sampling::argmax(&logits)
        };

        let accepted_len = drafts
            .iter()
            .enumerate()
            .take_while(|&(i, &draft)| target(i) == draft)
            .count();
        let next_token = target(accepted_len);
        Ok(CandidateVerdict {
            accepted_len,
            next_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingParams;
    use candle_core::Device;

    const EOS: u32 = 1;
    const VOCAB: usize = 12;

    fn params() -> SearchParams {
        SearchParams {
            batch_size: 1,
            num_beams: 1,
            num_return_sequences: 1,
            max_length: 64,
            min_length: 0,
            length_penalty: 1.0,
            early_stopping: true,
            pad_token_id: 0,
            eos_token_ids: vec![EOS],
            sampling: SamplingParams::greedy(),
        }
    }

    /// `[1, positions, VOCAB]` logits with one hot token per position.
    fn window(argmaxes: &[u32]) -> Tensor {
        let data: Vec<f32> = argmaxes
            .iter()
            .flat_map(|&t| (0..VOCAB).map(move |v| if v as u32 == t { 4.0 } else { 0.0 }))
            .collect();
        Tensor::from_vec(data, (1, argmaxes.len(), VOCAB), &Device::Cpu).unwrap()
    }

    #[test]
    fn rejects_after_first_mismatch() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2]).unwrap();
        search.set_next_tokens(&[5, 6, 7]).unwrap();
        search.set_logits(&window(&[5, 6, 9, 3])).unwrap();
        let seq = search.sequence(0).to_vec();
        let verdict = search.check_candidates(&seq, 3).unwrap();
        assert_eq!(
            verdict,
            CandidateVerdict {
                accepted_len: 2,
                next_token: 9
            }
        );
    }

    #[test]
    fn full_acceptance_yields_bonus_token() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2]).unwrap();
        search.set_next_tokens(&[5, 6]).unwrap();
        search.set_logits(&window(&[5, 6, 8])).unwrap();
        let seq = search.sequence(0).to_vec();
        let verdict = search.check_candidates(&seq, 2).unwrap();
        assert_eq!(verdict.accepted_len, 2);
        assert_eq!(verdict.next_token, 8);
    }

    #[test]
    fn early_eos_draft_is_rejected_before_min_length() {
        let mut p = params();
        p.min_length = 4;
        let mut search = SpeculativeGreedySearch::new(p, &[2]).unwrap();
        search.set_next_tokens(&[5, EOS]).unwrap();
        search.set_logits(&window(&[5, EOS, 7])).unwrap();
        let seq = search.sequence(0).to_vec();
        // `[2, 5]` is shorter than 4, so EOS is masked and the tie goes to 0.
        let verdict = search.check_candidates(&seq, 2).unwrap();
        assert_eq!(
            verdict,
            CandidateVerdict {
                accepted_len: 1,
                next_token: 0
            }
        );
    }

    #[test]
    fn repetition_penalty_applies_to_each_position() {
        let mut p = params();
        p.sampling.repetition_penalty = 2.0;
        let mut search = SpeculativeGreedySearch::new(p, &[2]).unwrap();
        search.set_next_tokens(&[5, 5]).unwrap();
        let mut data = vec![0f32; 3 * VOCAB];
        // Position 0: 5 is unseen and wins outright.
        data[5] = 4.0;
        data[6] = 3.0;
        // Position 1: 5 is now in the history, 4.0 / 2 loses to 3.0.
        data[VOCAB + 5] = 4.0;
        data[VOCAB + 6] = 3.0;
        data[2 * VOCAB + 8] = 4.0;
        let logits = Tensor::from_vec(data, (1, 3, VOCAB), &Device::Cpu).unwrap();
        search.set_logits(&logits).unwrap();
        let seq = search.sequence(0).to_vec();
        let verdict = search.check_candidates(&seq, 2).unwrap();
        assert_eq!(verdict.accepted_len, 1);
        assert_eq!(verdict.next_token, 6);
    }

    #[test]
    fn acceptance_never_exceeds_candidate_length() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2, 3]).unwrap();
        search.set_next_tokens(&[4, 4, 4, 4]).unwrap();
        search.set_logits(&window(&[4, 4, 4, 4, 4, 4])).unwrap();
        let seq = search.sequence(0).to_vec();
        for k in 0..=4 {
            let verdict = search.check_candidates(&seq, k).unwrap();
            assert!(verdict.accepted_len <= k);
        }
    }

    #[test]
    fn drop_then_reappend_restores_state() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2]).unwrap();
        search.set_next_tokens(&[4, 5, EOS]).unwrap();
        assert!(search.is_done());
        let before = (search.sequence(0).to_vec(), search.eos_seen(), search.is_done());

        search.drop_last_tokens(2).unwrap();
        assert_eq!(search.sequence(0), &[2, 4]);
        assert!(!search.eos_seen());
        assert!(!search.is_done());

        search.set_next_tokens(&[5, EOS]).unwrap();
        let after = (search.sequence(0).to_vec(), search.eos_seen(), search.is_done());
        assert_eq!(before, after);
    }

    #[test]
    fn cannot_drop_into_prompt() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2, 3]).unwrap();
        search.set_next_tokens(&[4]).unwrap();
        let err = search.drop_last_tokens(2).unwrap_err();
        assert!(matches!(err, SearchError::InvalidCandidates(_)));
        assert_eq!(search.sequence(0), &[2, 3, 4]);
    }

    #[test]
    fn window_needs_enough_positions() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2]).unwrap();
        search.set_next_tokens(&[5, 6]).unwrap();
        search.set_logits(&window(&[5, 6])).unwrap();
        let seq = search.sequence(0).to_vec();
        assert!(search.check_candidates(&seq, 2).is_err());
    }

    #[test]
    fn plain_greedy_step_still_works() {
        let mut search = SpeculativeGreedySearch::new(params(), &[2]).unwrap();
        search.set_logits(&window(&[9, 7])).unwrap();
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[7]);
        assert_eq!(search.generated(), &[7]);
    }

    #[test]
    fn batches_are_rejected() {
        let mut p = params();
        p.batch_size = 2;
        assert!(SpeculativeGreedySearch::new(p, &[2]).is_err());
    }
}
