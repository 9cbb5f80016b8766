//! Logits processors applied before token selection.
//!
//! Processors run in order over one row of raw logits: penalties first, then
//! suppression. `sequence` is the row's full token history, prompt included.

use std::collections::HashSet;

/// A transformation of one row of logits.
pub trait LogitsProcessor: Send + Sync {
    fn process(&self, logits: &mut [f32], sequence: &[u32]);

    /// Name for debugging.
    fn name(&self) -> &'static str;
}

/// CTRL-style repetition penalty: each distinct token already in the
/// sequence has a positive logit divided by, or a negative logit multiplied
/// by, the penalty.
pub struct RepetitionPenaltyProcessor {
    penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn process(&self, logits: &mut [f32], sequence: &[u32]) {
        let seen: HashSet<u32> = sequence.iter().copied().collect();
        for token_id in seen {
            if let Some(logit) = logits.get_mut(token_id as usize) {
                if *logit > 0.0 {
                    *logit /= self.penalty;
                } else {
                    *logit *= self.penalty;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Forbids every end-of-sequence token until the sequence is `min_length` long.
pub struct MinLengthProcessor {
    min_length: usize,
    eos_token_ids: Vec<u32>,
}

impl MinLengthProcessor {
    pub fn new(min_length: usize, eos_token_ids: Vec<u32>) -> Self {
        Self {
            min_length,
            eos_token_ids,
        }
    }
}

impl LogitsProcessor for MinLengthProcessor {
    fn process(&self, logits: &mut [f32], sequence: &[u32]) {
        if sequence.len() >= self.min_length {
            return;
        }
        for &eos in &self.eos_token_ids {
            if let Some(logit) = logits.get_mut(eos as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn name(&self) -> &'static str {
        "min_length"
    }
}

/// Ordered list of processors.
#[derive(Default)]
pub struct LogitsProcessorPipeline {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard pipeline, skipping processors that would be no-ops.
    pub fn from_params(repetition_penalty: f32, min_length: usize, eos_token_ids: &[u32]) -> Self {
        let mut pipeline = Self::new();
        if repetition_penalty != 1.0 {
            pipeline.push(Box::new(RepetitionPenaltyProcessor::new(repetition_penalty)));
        }
        if min_length > 0 && !eos_token_ids.is_empty() {
            pipeline.push(Box::new(MinLengthProcessor::new(
                min_length,
                eos_token_ids.to_vec(),
            )));
        }
        pipeline
    }

    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn process(&self, logits: &mut [f32], sequence: &[u32]) {
        for processor in &self.processors {
            processor.process(logits, sequence);
        }
    }
}
