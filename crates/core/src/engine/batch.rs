//! Host-side layout of one engine step.

use crate::kv_cache::{SequenceId, SlotRequest};
use crate::request::SequenceState;

/// Padding for positions of rows shorter than the step width.
pub const POSITION_PAD: i64 = -1;

/// Token ids and positions of one step, `[rows, width]`, right-padded.
///
/// Row order is the order sequences were gathered in; the block tables and
/// slot mapping for the step follow the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepBatch {
    pub seq_ids: Vec<SequenceId>,
    pub num_new: Vec<usize>,
    pub input_ids: Vec<u32>,
    pub positions: Vec<i64>,
    pub width: usize,
    pub is_prompt: bool,
}

impl StepBatch {
    pub fn gather<'a>(
        sequences: impl IntoIterator<Item = &'a SequenceState>,
        pad_token_id: u32,
    ) -> Self {
        let sequences: Vec<&SequenceState> = sequences.into_iter().collect();
        let width = sequences
            .iter()
            .map(|s| s.pending_tokens().len())
            .max()
            .unwrap_or(0);

        let mut batch = Self {
            seq_ids: Vec::with_capacity(sequences.len()),
            num_new: Vec::with_capacity(sequences.len()),
            input_ids: Vec::with_capacity(sequences.len() * width),
            positions: Vec::with_capacity(sequences.len() * width),
            width,
            is_prompt: false,
        };
        for seq in sequences {
            let pending = seq.pending_tokens();
            let start = seq.num_computed_tokens as i64;
            batch.seq_ids.push(seq.seq_id);
            batch.num_new.push(pending.len());
            batch.is_prompt |= seq.is_prefill();

            batch.input_ids.extend_from_slice(pending);
            batch
                .input_ids
                .extend(std::iter::repeat(pad_token_id).take(width - pending.len()));
            batch
                .positions
                .extend(start..start + pending.len() as i64);
            batch
                .positions
                .extend(std::iter::repeat(POSITION_PAD).take(width - pending.len()));
        }
        batch
    }

    pub fn rows(&self) -> usize {
        self.seq_ids.len()
    }

    pub fn slot_requests(&self) -> Vec<SlotRequest> {
        self.seq_ids
            .iter()
            .zip(&self.num_new)
            .map(|(&id, &n)| SlotRequest::new(id, n))
            .collect()
    }
}
