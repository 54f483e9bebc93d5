//! Difficulty retargeting and proof-of-work verification.
//!
//! Difficulty is a 256-bit integer; the target is `floor((2^256 - 1) /
//! difficulty)` and a nonce wins when the PoW digest, read as a big-endian
//! 256-bit number, lands at or under the target. Retargeting is proportional
//! to the parent/child timestamp delta, clamped per block.

use primitive_types::U256;

use crate::crypto::{pow_hash, Hash32};

/// Retargeting knobs, lifted out of the node config.
#[derive(Clone, Debug)]
pub struct DifficultyParams {
    pub target_block_time: u64,
    /// Max per-block adjustment, in percent of the parent difficulty.
    pub adjustment_cap_pct: u64,
    pub min_difficulty: U256,
    pub max_difficulty: U256,
}

pub fn target_from_difficulty(difficulty: U256) -> U256 {
    U256::MAX / difficulty.max(U256::one())
}

/// Next block's difficulty and target given the parent's difficulty and the
/// two timestamps. Deterministic; both validator and miner call this.
pub fn calc_difficulty(
    parent_difficulty: U256,
    parent_timestamp: u64,
    child_timestamp: u64,
    params: &DifficultyParams,
) -> (U256, U256) {
    // Non-positive deltas collapse to the minimum allowed of one second.
    let delta = child_timestamp.saturating_sub(parent_timestamp).max(1);

    let proportional = parent_difficulty
        .checked_mul(U256::from(params.target_block_time))
        .map(|scaled| scaled / U256::from(delta))
        .unwrap_or(params.max_difficulty);

    // Clamp to +-cap% per block to resist timestamp manipulation.
    let cap = U256::from(params.adjustment_cap_pct);
    let hundred = U256::from(100u64);
    let lower = parent_difficulty * (hundred - cap) / hundred;
    let upper = parent_difficulty
        .checked_mul(hundred + cap)
        .map(|u| u / hundred)
        .unwrap_or(params.max_difficulty);

    let clamped = proportional.max(lower).min(upper);
    let difficulty = clamped.max(params.min_difficulty).min(params.max_difficulty);
    (difficulty, target_from_difficulty(difficulty))
}

/// Stateless PoW check: `pow_hash(mining_hash || nonce) <= target`.
pub fn verify_pow(mining_hash: &Hash32, mining_nonce: u32, target: U256) -> bool {
    let digest = pow_hash(mining_hash, mining_nonce);
    U256::from_big_endian(&digest) <= target
}
