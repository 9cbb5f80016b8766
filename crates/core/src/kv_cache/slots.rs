//! Per-step block-table / slot-mapping layout.
//!
//! Rows follow the order of the step's [`SlotRequest`]s. Ragged rows are
//! padded with `-1` so every sequence presents the same tensor shape.

use candle_core::{Device, Tensor};

use super::SequenceId;

pub const BLOCK_TABLE_PAD: i64 = -1;
pub const SLOT_MAPPING_PAD: i64 = -1;

/// One sequence's share of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub seq_id: SequenceId,
    /// Tokens whose KV entries this step writes (prompt length on prefill, 1 on decode).
    pub num_new_tokens: usize,
}

impl SlotRequest {
    pub fn new(seq_id: SequenceId, num_new_tokens: usize) -> Self {
        Self {
            seq_id,
            num_new_tokens,
        }
    }
}

/// Host-side layout of one step, before upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    /// `[batch, max_blocks]`, padded with [`BLOCK_TABLE_PAD`].
    pub block_tables: Vec<Vec<i64>>,
    /// `[batch, max_new_tokens]`, padded with [`SLOT_MAPPING_PAD`].
    pub slot_mapping: Vec<Vec<i64>>,
    /// Tokens stored per sequence once this step's writes land.
    pub context_lens: Vec<i64>,
    pub is_prompt: bool,
}

/// Device tensors consumed by paged attention.
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub block_tables: Tensor,
    pub slot_mapping: Tensor,
    pub context_lens: Tensor,
    pub is_prompt: bool,
}

impl StepLayout {
    pub(crate) fn from_rows(
        block_rows: Vec<Vec<i64>>,
        slot_rows: Vec<Vec<i64>>,
        context_lens: Vec<i64>,
        is_prompt: bool,
    ) -> Self {
        Self {
            block_tables: pad_rows(block_rows, BLOCK_TABLE_PAD),
            slot_mapping: pad_rows(slot_rows, SLOT_MAPPING_PAD),
            context_lens,
            is_prompt,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.context_lens.len()
    }

    pub fn max_blocks(&self) -> usize {
        self.block_tables.first().map_or(0, Vec::len)
    }

    pub fn max_new_tokens(&self) -> usize {
        self.slot_mapping.first().map_or(0, Vec::len)
    }

    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<StepMetadata> {
        let batch = self.batch_size();
        Ok(StepMetadata {
            block_tables: rows_to_tensor(&self.block_tables, batch, self.max_blocks(), device)?,
            slot_mapping: rows_to_tensor(
                &self.slot_mapping,
                batch,
                self.max_new_tokens(),
                device,
            )?,
            context_lens: Tensor::from_vec(self.context_lens.clone(), batch, device)?,
            is_prompt: self.is_prompt,
        })
    }
}

fn pad_rows(mut rows: Vec<Vec<i64>>, pad: i64) -> Vec<Vec<i64>> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in &mut rows {
        row.resize(width, pad);
    }
    rows
}

fn rows_to_tensor(
    rows: &[Vec<i64>],
    batch: usize,
    width: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (batch, width), device)
}
