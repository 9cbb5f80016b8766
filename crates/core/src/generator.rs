//! Fixed-batch generation driver.
//!
//! Couples a [`DecoderState`] (contiguous KV cache) with a greedy or beam
//! search and runs them step by step until every sequence is done.

use candle_core::{DType, Device};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::GeneratorConfig;
use crate::pipeline::{DecoderPipeline, DecoderState, PipelineError};
use crate::search::{
    select_next_tokens, BeamSearch, GreedySearch, Search, SearchError, SearchParams, Sequences,
};

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("invalid prompts: {0}")]
    Prompts(String),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

pub type Result<T> = std::result::Result<T, GeneratorError>;

/// One returned sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    pub batch_index: usize,
    /// Prompt followed by generated tokens. Greedy rows that finished early
    /// are padded to the batch length.
    pub tokens: Vec<u32>,
    /// Length-normalised log-probability (beam search only).
    pub score: Option<f32>,
}

enum Strategy {
    Greedy(GreedySearch),
    Beam(BeamSearch),
}

pub struct Generator {
    params: SearchParams,
    strategy: Strategy,
    state: DecoderState,
    steps: usize,
}

impl Generator {
    /// KV tensors are kept in `F32`.
    pub fn new(
        config: &GeneratorConfig,
        pipeline: DecoderPipeline,
        prompts: &[Vec<u32>],
        device: &Device,
    ) -> Result<Self> {
        if prompts.is_empty() {
            return Err(GeneratorError::Prompts("no prompts".into()));
        }
        if let Some(i) = prompts.iter().position(Vec::is_empty) {
            return Err(GeneratorError::Prompts(format!("prompt {i} is empty")));
        }
        let params = SearchParams::from_config(config, prompts.len());
        let sequences = Sequences::new(prompts, params.num_beams, params.pad_token_id);
        let state = DecoderState::new(
            pipeline,
            &config.model.decoder,
            &sequences,
            DType::F32,
            device,
        )?;
        let strategy = if params.num_beams > 1 {
            Strategy::Beam(BeamSearch::new(params.clone(), prompts)?)
        } else {
            Strategy::Greedy(GreedySearch::new(params.clone(), prompts)?)
        };
        info!(
            batch_size = params.batch_size,
            num_beams = params.num_beams,
            max_length = params.max_length,
            "generator created"
        );
        Ok(Self {
            params,
            strategy,
            state,
            steps: 0,
        })
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn search(&self) -> &dyn Search {
        match &self.strategy {
            Strategy::Greedy(s) => s,
            Strategy::Beam(s) => s,
        }
    }

    fn search_mut(&mut self) -> &mut dyn Search {
        match &mut self.strategy {
            Strategy::Greedy(s) => s,
            Strategy::Beam(s) => s,
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.search().is_done()
    }

    /// Run the decoder on the last selected tokens and hand the logits to
    /// the search.
    pub fn compute_logits(&mut self) -> Result<()> {
        let search = self.search();
        let tokens = search.next_tokens().to_vec();
        let indices = search.next_indices().ok().map(<[u32]>::to_vec);
        let logits = self.state.run(&tokens, indices.as_deref())?;
        self.search_mut().set_logits(&logits)?;
        Ok(())
    }

    pub fn generate_next_token(&mut self) -> Result<()> {
        let params = self.params.clone();
        select_next_tokens(self.search_mut(), &params)?;
        self.steps += 1;
        debug!(
            step = self.steps,
            length = self.search().sequence_length(),
            done = self.is_done(),
            "generated token"
        );
        Ok(())
    }

    /// Run steps until done, then return the results.
    pub fn generate(mut self) -> Result<Vec<GeneratedSequence>> {
        while !self.is_done() {
            self.compute_logits()?;
            self.generate_next_token()?;
        }
        info!(steps = self.steps, "generation finished");
        Ok(self.finalize())
    }

    /// Current results. For beam search this closes out the hypotheses;
    /// calling it again returns the same sequences.
    pub fn finalize(&mut self) -> Vec<GeneratedSequence> {
        match &mut self.strategy {
            Strategy::Beam(search) => search
                .finalize()
                .into_iter()
                .enumerate()
                .flat_map(|(batch_index, hyps)| {
                    hyps.into_iter().map(move |h| GeneratedSequence {
                        batch_index,
                        tokens: h.tokens,
                        score: Some(h.score),
                    })
                })
                .collect(),
            Strategy::Greedy(search) => (0..self.params.batch_size)
                .map(|batch_index| GeneratedSequence {
                    batch_index,
                    tokens: search.sequence(batch_index).to_vec(),
                    score: None,
                })
                .collect(),
        }
    }
}
