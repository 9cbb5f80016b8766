//! Speculative decoding for a single sequence.
//!
//! A [`DraftProposer`] guesses the next few tokens, the target decoder
//! scores all of them in one forward pass, and
//! [`SpeculativeGreedySearch::check_candidates`] keeps the prefix the target
//! model agrees with. Rejected tokens are dropped from the search history and
//! rewound out of the KV cache. The output is identical to plain greedy
//! decoding; only the number of decoder calls changes.

mod ngram;

pub use ngram::{NGramConfig, NGramProposer};

use candle_core::{DType, Device};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::GeneratorConfig;
use crate::generator::{GeneratorError, Result};
use crate::pipeline::{DecoderPipeline, DecoderState};
use crate::search::{select_next_tokens, Search, SearchParams, Sequences, SpeculativeGreedySearch};

/// Source of draft tokens.
///
/// Proposers see the whole sequence (prompt plus accepted tokens) and return
/// up to `max_tokens` guesses. An empty vec means no guess this step.
pub trait DraftProposer: Send {
    fn propose(&mut self, tokens: &[u32], max_tokens: usize) -> Vec<u32>;

    /// Called after verification with how many of `proposed` were accepted.
    fn on_verified(&mut self, _accepted: usize, _proposed: usize) {}

    /// Name for logging.
    fn name(&self) -> &str;
}

/// Counters for one speculative run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpecDecodeStats {
    /// Decoder calls, including the prompt.
    pub num_steps: u64,
    pub num_draft_tokens: u64,
    pub num_accepted_tokens: u64,
    /// Tokens appended to the sequence.
    pub num_emitted_tokens: u64,
}

impl SpecDecodeStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.num_draft_tokens == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_draft_tokens as f64
        }
    }
}

pub struct SpeculativeDecoder<P: DraftProposer> {
    params: SearchParams,
    search: SpeculativeGreedySearch,
    state: DecoderState,
    proposer: P,
    num_speculative_tokens: usize,
    stats: SpecDecodeStats,
    started: bool,
}

impl<P: DraftProposer> SpeculativeDecoder<P> {
    pub fn new(
        config: &GeneratorConfig,
        pipeline: DecoderPipeline,
        prompt: &[u32],
        proposer: P,
        num_speculative_tokens: usize,
        device: &Device,
    ) -> Result<Self> {
        if prompt.is_empty() {
            return Err(GeneratorError::Prompts("prompt is empty".into()));
        }
        let params = SearchParams::from_config(config, 1);
        let search = SpeculativeGreedySearch::new(params.clone(), prompt)?;
        let sequences = Sequences::new(&[prompt.to_vec()], 1, params.pad_token_id);
        let state = DecoderState::new(
            pipeline,
            &config.model.decoder,
            &sequences,
            DType::F32,
            device,
        )?;
        info!(
            proposer = proposer.name(),
            num_speculative_tokens,
            max_length = params.max_length,
            "speculative decoder created"
        );
        Ok(Self {
            params,
            search,
            state,
            proposer,
            num_speculative_tokens,
            stats: SpecDecodeStats::default(),
            started: false,
        })
    }

    pub fn search(&self) -> &SpeculativeGreedySearch {
        &self.search
    }

    pub fn stats(&self) -> &SpecDecodeStats {
        &self.stats
    }

    pub fn proposer(&self) -> &P {
        &self.proposer
    }

    pub fn is_done(&self) -> bool {
        self.search.is_done()
    }

    /// One decoder call. Returns the number of tokens appended.
    pub fn step(&mut self) -> Result<usize> {
        if !self.started {
            self.started = true;
            return self.plain_step(&[]);
        }
        let sequence = self.search.sequence(0).to_vec();
        let last = sequence.last().copied().unwrap_or(self.params.pad_token_id);

        // Leave room for the correction token.
        let room = self.params.max_length.saturating_sub(sequence.len() + 1);
        let k = room.min(self.num_speculative_tokens);
        let mut drafts = if k > 0 {
            self.proposer.propose(&sequence, k)
        } else {
            Vec::new()
        };
        drafts.truncate(k);
        // Nothing after an end-of-sequence draft can be kept.
        if let Some(eos) = drafts.iter().position(|&t| self.params.is_eos(t)) {
            drafts.truncate(eos + 1);
        }
        if drafts.is_empty() {
            return self.plain_step(&[last]);
        }
        self.verify(last, &drafts)
    }

    fn plain_step(&mut self, tokens: &[u32]) -> Result<usize> {
        let logits = self.state.run(tokens, None)?;
        self.search.set_logits(&logits)?;
        select_next_tokens(&mut self.search, &self.params)?;
        self.stats.num_steps += 1;
        self.stats.num_emitted_tokens += 1;
        Ok(1)
    }

    fn verify(&mut self, last: u32, drafts: &[u32]) -> Result<usize> {
        let k = drafts.len();
        self.search.set_next_tokens(drafts)?;

        let mut feed = Vec::with_capacity(k + 1);
        feed.push(last);
        feed.extend_from_slice(drafts);
        let logits = self.state.run(&feed, None)?;
        self.search.set_logits(&logits)?;

        let sequence = self.search.sequence(0).to_vec();
        let verdict = self.search.check_candidates(&sequence, k)?;
        let rejected = k - verdict.accepted_len;
        self.search.drop_last_tokens(rejected)?;
        self.state.rewind(rejected)?;

        let mut emitted = verdict.accepted_len;
        // An accepted end-of-sequence draft already finished the sequence.
        if !self.search.is_done() {
            self.search.set_next_tokens(&[verdict.next_token])?;
            emitted += 1;
        }
        self.proposer.on_verified(verdict.accepted_len, k);

        self.stats.num_steps += 1;
        self.stats.num_draft_tokens += k as u64;
        self.stats.num_accepted_tokens += verdict.accepted_len as u64;
        self.stats.num_emitted_tokens += emitted as u64;
        debug!(
            proposed = k,
            accepted = verdict.accepted_len,
            next_token = verdict.next_token,
            length = self.search.sequence_length(),
            "verified draft"
        );
        Ok(emitted)
    }

    /// Run until done and return the full sequence (prompt included).
    pub fn generate(mut self) -> Result<Vec<u32>> {
        while !self.is_done() {
            self.step()?;
        }
        info!(
            steps = self.stats.num_steps,
            drafted = self.stats.num_draft_tokens,
            accepted = self.stats.num_accepted_tokens,
            "speculative generation finished"
        );
        Ok(self.search.sequence(0).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_stage_pipeline, tiny_generator_config, MockDecoderSession};
    use std::sync::Arc;

    /// Always proposes a fixed continuation.
    struct Scripted {
        drafts: Vec<u32>,
        verified: Vec<(usize, usize)>,
    }

    impl DraftProposer for Scripted {
        fn propose(&mut self, _tokens: &[u32], max_tokens: usize) -> Vec<u32> {
            self.drafts.iter().copied().take(max_tokens).collect()
        }

        fn on_verified(&mut self, accepted: usize, proposed: usize) {
            self.verified.push((accepted, proposed));
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn decoder<P: DraftProposer>(
        config: &GeneratorConfig,
        prompt: &[u32],
        proposer: P,
        k: usize,
    ) -> (SpeculativeDecoder<P>, MockDecoderSession) {
        let session = MockDecoderSession::new(&config.model, |t| (t + 1) % 16);
        let pipeline = single_stage_pipeline(
            Arc::new(session.clone()),
            session.input_names(),
            session.output_names(),
        );
        let decoder =
            SpeculativeDecoder::new(config, pipeline, prompt, proposer, k, &Device::Cpu).unwrap();
        (decoder, session)
    }

    #[test]
    fn partial_acceptance_rolls_back() {
        let config = tiny_generator_config();
        let proposer = Scripted {
            drafts: vec![5, 6, 9],
            verified: Vec::new(),
        };
        let (mut decoder, session) = decoder(&config, &[3], proposer, 3);
        assert_eq!(decoder.step().unwrap(), 1);
        assert_eq!(decoder.search().sequence(0), &[3, 4]);

        // 5 and 6 match, 9 is replaced by the model's 7.
        assert_eq!(decoder.step().unwrap(), 3);
        assert_eq!(decoder.search().sequence(0), &[3, 4, 5, 6, 7]);
        assert_eq!(decoder.state.cached_len(), 4);
        assert_eq!(decoder.proposer().verified, vec![(2, 3)]);
        assert_eq!(session.calls(), 2);
    }

    #[test]
    fn full_acceptance_adds_bonus_token() {
        let config = tiny_generator_config();
        let proposer = Scripted {
            drafts: vec![5, 6],
            verified: Vec::new(),
        };
        let (mut decoder, _) = decoder(&config, &[3], proposer, 2);
        decoder.step().unwrap();
        assert_eq!(decoder.step().unwrap(), 3);
        assert_eq!(decoder.search().sequence(0), &[3, 4, 5, 6, 7]);
        assert_eq!(decoder.stats().num_accepted_tokens, 2);
    }

    #[test]
    fn accepted_eos_draft_finishes_without_bonus() {
        let config = tiny_generator_config();
        let proposer = Scripted {
            drafts: vec![0, 1, 2],
            verified: Vec::new(),
        };
        let (mut decoder, _) = decoder(&config, &[14], proposer, 3);
        decoder.step().unwrap();
        assert_eq!(decoder.step().unwrap(), 2);
        assert!(decoder.is_done());
        assert_eq!(decoder.search().sequence(0), &[14, 15, 0, 1]);
    }

    #[test]
    fn min_length_and_penalty_match_plain_greedy() {
        let mut config = tiny_generator_config();
        config.search.min_length = 8;
        config.search.max_length = 10;
        config.search.repetition_penalty = 1.3;

        let session = MockDecoderSession::new(&config.model, |t| (t + 1) % 16);
        let pipeline = single_stage_pipeline(
            Arc::new(session.clone()),
            session.input_names(),
            session.output_names(),
        );
        let greedy = crate::Generator::new(&config, pipeline, &[vec![14]], &Device::Cpu)
            .unwrap()
            .generate()
            .unwrap()
            .remove(0)
            .tokens;
        // EOS is masked until the sequence holds 8 tokens.
        assert_eq!(greedy, vec![14, 15, 0, 0, 0, 0, 0, 0, 1]);

        let proposer = Scripted {
            drafts: vec![0, 1, 2],
            verified: Vec::new(),
        };
        let (decoder, _) = decoder(&config, &[14], proposer, 3);
        assert_eq!(decoder.generate().unwrap(), greedy);
    }

    #[test]
    fn matches_plain_greedy_output() {
        let mut config = tiny_generator_config();
        config.search.max_length = 24;
        let proposer = NGramProposer::new(NGramConfig {
            min_n: 1,
            max_n: 3,
            num_speculative_tokens: 4,
        });
        // Non-terminating cycle so the n-gram proposer has repeats to find.
        let session = MockDecoderSession::new(&config.model, |t| if t >= 9 { 2 } else { t + 1 });
        let pipeline = single_stage_pipeline(
            Arc::new(session.clone()),
            session.input_names(),
            session.output_names(),
        );
        let decoder =
            SpeculativeDecoder::new(&config, pipeline, &[2], proposer, 4, &Device::Cpu).unwrap();
        let tokens = decoder.generate().unwrap();

        let expected: Vec<u32> = (0..24).map(|i| 2 + (i % 8) as u32).collect();
        assert_eq!(tokens, expected);
        assert!(session.calls() < 23);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let config = tiny_generator_config();
        let session = MockDecoderSession::new(&config.model, |t| t);
        let pipeline = single_stage_pipeline(
            Arc::new(session.clone()),
            session.input_names(),
            session.output_names(),
        );
        let result = SpeculativeDecoder::new(
            &config,
            pipeline,
            &[],
            NGramProposer::default(),
            3,
            &Device::Cpu,
        );
        assert!(matches!(result, Err(GeneratorError::Prompts(_))));
    }

    #[test]
    fn acceptance_rate_handles_no_drafts() {
        let stats = SpecDecodeStats::default();
        assert_eq!(stats.acceptance_rate(), 0.0);
        let stats = SpecDecodeStats {
            num_draft_tokens: 4,
            num_accepted_tokens: 3,
            ..Default::default()
        };
        assert_eq!(stats.acceptance_rate(), 0.75);
    }
}
