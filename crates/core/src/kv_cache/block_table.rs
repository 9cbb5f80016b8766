use super::block_pool::BlockId;

/// Per-sequence mapping: logical block index to physical [`BlockId`].
///
/// Holds `len(blocks) * block_size >= num_tokens` at all times. Blocks are
/// only appended while the sequence lives; [`BlockTable::rewind`] lowers the
/// token count but keeps every block.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens_stored: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens_stored: 0,
            block_size,
        }
    }

    /// Total tokens currently stored.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens_stored
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Token positions the current blocks can hold.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    /// How many new blocks are needed to store `new_tokens` additional tokens.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        if new_tokens == 0 {
            return 0;
        }
        let total_after = self.num_tokens_stored + new_tokens;
        total_after
            .div_ceil(self.block_size)
            .saturating_sub(self.blocks.len())
    }

    pub fn append_blocks(&mut self, block_ids: &[BlockId]) {
        self.blocks.extend_from_slice(block_ids);
    }

    /// Advance fill by `n` tokens.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.num_tokens_stored + n <= self.capacity());
        self.num_tokens_stored += n;
    }

    /// Forget the last `n` tokens. Blocks stay attached for reuse.
    pub fn rewind(&mut self, n: usize) {
        assert!(
            n <= self.num_tokens_stored,
            "cannot rewind {n} tokens, only {} stored",
            self.num_tokens_stored
        );
        self.num_tokens_stored -= n;
    }

    /// Physical slots for positions `[start_pos, start_pos + n)`.
    pub fn slot_mapping(&self, start_pos: usize, n: usize) -> Vec<usize> {
        (start_pos..start_pos + n)
            .map(|pos| {
                let block_idx = pos / self.block_size;
                let offset = pos % self.block_size;
                self.blocks[block_idx] * self.block_size + offset
            })
            .collect()
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Release all blocks, returning their ids for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.num_tokens_stored = 0;
        std::mem::take(&mut self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table() {
        let table = BlockTable::new(16);
        assert_eq!(table.num_tokens(), 0);
        assert_eq!(table.capacity(), 0);
        assert!(table.block_ids().is_empty());
    }

    #[test]
    fn blocks_needed_cross_boundary() {
        let mut table = BlockTable::new(16);
        assert_eq!(table.blocks_needed(1), 1);
        table.append_blocks(&[0]);
        table.advance(15);
        assert_eq!(table.blocks_needed(1), 0);
        assert_eq!(table.blocks_needed(2), 1);
        assert_eq!(table.blocks_needed(0), 0);
    }

    #[test]
    fn blocks_needed_for_long_prompt() {
        let table = BlockTable::new(16);
        assert_eq!(table.blocks_needed(33), 3);
    }

    #[test]
    fn slot_mapping_cross_block() {
        let mut table = BlockTable::new(16);
        table.append_blocks(&[3, 7]);
        let slots = table.slot_mapping(14, 4);
        assert_eq!(slots, vec![3 * 16 + 14, 3 * 16 + 15, 7 * 16, 7 * 16 + 1]);
    }

    #[test]
    fn rewind_keeps_blocks() {
        let mut table = BlockTable::new(4);
        table.append_blocks(&[2, 5, 9]);
        table.advance(10);
        table.rewind(7);
        assert_eq!(table.num_tokens(), 3);
        assert_eq!(table.block_ids(), &[2, 5, 9]);
        // Space up to the old fill is already backed.
        assert_eq!(table.blocks_needed(9), 0);
        assert_eq!(table.slot_mapping(3, 2), vec![2 * 4 + 3, 5 * 4]);
    }

    #[test]
    #[should_panic(expected = "cannot rewind")]
    fn rewind_past_start_panics() {
        let mut table = BlockTable::new(4);
        table.append_blocks(&[0]);
        table.advance(2);
        table.rewind(3);
    }

    #[test]
    fn release_returns_all() {
        let mut table = BlockTable::new(16);
        table.append_blocks(&[2, 5, 9]);
        table.advance(40);
        assert_eq!(table.release(), vec![2, 5, 9]);
        assert_eq!(table.num_tokens(), 0);
        assert!(table.block_ids().is_empty());
    }
}
