use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::crypto::Hash32;

/// Per-block consensus bookkeeping kept alongside the block itself: the
/// difficulty it was mined at, the branch's cumulative difficulty, whether
/// its parent is still unknown, and the hashes of every known child.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub block_difficulty: U256,
    pub cumulative_difficulty: U256,
    pub orphan: bool,
    pub child_headerhashes: Vec<Hash32>,
}

impl BlockMetadata {
    pub fn create(block_difficulty: U256, cumulative_difficulty: U256, orphan: bool) -> Self {
        Self {
            block_difficulty,
            cumulative_difficulty,
            orphan,
            child_headerhashes: Vec::new(),
        }
    }

    /// `parent.cumulative + difficulty` as checked 256-bit addition.
    /// Overflow means a corrupt or hostile chain, never silent wraparound.
    pub fn accumulate(parent_cumulative: U256, block_difficulty: U256) -> Option<U256> {
        parent_cumulative.checked_add(block_difficulty)
    }

    pub fn add_child_headerhash(&mut self, headerhash: Hash32) {
        if !self.child_headerhashes.contains(&headerhash) {
            self.child_headerhashes.push(headerhash);
        }
    }
}
