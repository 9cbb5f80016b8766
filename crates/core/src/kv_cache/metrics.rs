//! KV cache counters for monitoring and debugging.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for block pool traffic.
///
/// Shared behind an `Arc` so a scheduler can read them while the manager runs.
pub struct KVCacheMetrics {
    /// Steps that allocated at least one block
    allocations: AtomicU64,
    blocks_allocated: AtomicU64,
    blocks_freed: AtomicU64,
    /// Steps rejected because the pool ran dry
    exhaustion_events: AtomicU64,
    /// Tokens dropped by speculative rollback
    tokens_rewound: AtomicU64,
}

impl Default for KVCacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl KVCacheMetrics {
    pub fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            blocks_allocated: AtomicU64::new(0),
            blocks_freed: AtomicU64::new(0),
            exhaustion_events: AtomicU64::new(0),
            tokens_rewound: AtomicU64::new(0),
        }
    }

    pub fn record_allocation(&self, num_blocks: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_free(&self, num_blocks: usize) {
        self.blocks_freed
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_exhaustion(&self) {
        self.exhaustion_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewind(&self, num_tokens: usize) {
        self.tokens_rewound
            .fetch_add(num_tokens as u64, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_freed(&self) -> u64 {
        self.blocks_freed.load(Ordering::Relaxed)
    }

    pub fn exhaustion_events(&self) -> u64 {
        self.exhaustion_events.load(Ordering::Relaxed)
    }

    pub fn tokens_rewound(&self) -> u64 {
        self.tokens_rewound.load(Ordering::Relaxed)
    }

    /// Blocks currently held by sequences, derived from the counters.
    pub fn blocks_in_use(&self) -> u64 {
        self.blocks_allocated()
            .saturating_sub(self.blocks_freed())
    }

    pub fn reset(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.blocks_allocated.store(0, Ordering::Relaxed);
        self.blocks_freed.store(0, Ordering::Relaxed);
        self.exhaustion_events.store(0, Ordering::Relaxed);
        self.tokens_rewound.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: self.allocations(),
            blocks_allocated: self.blocks_allocated(),
            blocks_freed: self.blocks_freed(),
            blocks_in_use: self.blocks_in_use(),
            exhaustion_events: self.exhaustion_events(),
            tokens_rewound: self.tokens_rewound(),
        }
    }
}

/// Point-in-time copy of [`KVCacheMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub blocks_in_use: u64,
    pub exhaustion_events: u64,
    pub tokens_rewound: u64,
}
