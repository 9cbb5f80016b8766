use super::error::CacheError;

pub type BlockId = usize;

/// Free list of physical cache blocks. Pure bookkeeping, no device awareness.
pub struct BlockPool {
    num_blocks: usize,
    free_list: Vec<BlockId>,
    allocated: Vec<bool>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        // LIFO: pop hands out low ids first and reuses the most recently freed
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            free_list,
            allocated: vec![false; num_blocks],
        }
    }

    /// Take `n` blocks, or none at all if fewer than `n` are free.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, CacheError> {
        if n > self.free_list.len() {
            return Err(CacheError::Exhausted {
                requested: n,
                available: self.free_list.len(),
            });
        }
        let split = self.free_list.len() - n;
        let mut ids = self.free_list.split_off(split);
        ids.reverse();
        for &id in &ids {
            self.allocated[id] = true;
        }
        Ok(ids)
    }

    /// Return blocks to the pool. Ids become reusable immediately.
    pub fn free(&mut self, blocks: &[BlockId]) -> Result<(), CacheError> {
        if let Some(&bad) = blocks
            .iter()
            .find(|&&id| id >= self.num_blocks || !self.allocated[id])
        {
            return Err(CacheError::BlockNotAllocated { block_id: bad });
        }
        for &id in blocks {
            self.allocated[id] = false;
            self.free_list.push(id);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    pub fn num_used(&self) -> usize {
        self.num_blocks - self.free_list.len()
    }
}
