use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::transaction::Transaction;
use crate::crypto::{sha2_256, Hash32};

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("block has no transactions")]
    Empty,
    #[error("first transaction is not a coinbase")]
    MissingCoinbase,
    #[error("coinbase appears after the first position")]
    StrayCoinbase,
    #[error("duplicate transaction inside block")]
    DuplicateTx,
    #[error("block exceeds transaction limit of {0}")]
    TooManyTransactions(usize),
    #[error("block number {got} does not follow parent height {parent}")]
    BadHeight { parent: u64, got: u64 },
    #[error("prev_headerhash does not match parent")]
    BadParentHash,
    #[error("timestamp {got} not after parent timestamp {parent}")]
    StaleTimestamp { parent: u64, got: u64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_number: u64,
    /// Seconds since the epoch.
    pub timestamp: u64,
    pub prev_headerhash: Hash32,
    pub mining_nonce: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Pairwise-hash commitment over the block's transaction hashes.
fn tx_merkle_root(transactions: &[Transaction]) -> Hash32 {
    if transactions.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash32> = transactions.iter().map(|tx| tx.txhash()).collect();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            // odd leaf promotes by pairing with itself
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut input = [0u8; 64];
                input[..32].copy_from_slice(&pair[0]);
                input[32..].copy_from_slice(&pair[1]);
                sha2_256(&input)
            })
            .collect();
    }
    level[0]
}

impl Block {
    pub fn create(
        block_number: u64,
        prev_headerhash: Hash32,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            header: BlockHeader { block_number, timestamp, prev_headerhash, mining_nonce: 0 },
            transactions,
        }
    }

    pub fn block_number(&self) -> u64 {
        self.header.block_number
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn prev_headerhash(&self) -> Hash32 {
        self.header.prev_headerhash
    }

    /// Pre-nonce digest: everything the miner grinds the nonce against.
    pub fn mining_hash(&self) -> Hash32 {
        let mut input = Vec::with_capacity(8 + 8 + 32 + 32);
        input.extend_from_slice(&self.header.block_number.to_be_bytes());
        input.extend_from_slice(&self.header.timestamp.to_be_bytes());
        input.extend_from_slice(&self.header.prev_headerhash);
        input.extend_from_slice(&tx_merkle_root(&self.transactions));
        sha2_256(&input)
    }

    /// Post-nonce digest identifying the block.
    pub fn header_hash(&self) -> Hash32 {
        let mut input = [0u8; 36];
        input[..32].copy_from_slice(&self.mining_hash());
        input[32..].copy_from_slice(&self.header.mining_nonce.to_be_bytes());
        sha2_256(&input)
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee())
            .sum()
    }

    /// Structure-only checks that need no state: coinbase position,
    /// duplicates, size cap.
    pub fn validate_structure(&self, tx_limit: usize) -> Result<(), BlockError> {
        if self.transactions.is_empty() {
            return Err(BlockError::Empty);
        }
        if !self.transactions[0].is_coinbase() {
            return Err(BlockError::MissingCoinbase);
        }
        if self.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
            return Err(BlockError::StrayCoinbase);
        }
        if self.transactions.len() > tx_limit {
            return Err(BlockError::TooManyTransactions(tx_limit));
        }
        let mut seen = std::collections::HashSet::new();
        for tx in &self.transactions {
            if !seen.insert(tx.txhash()) {
                return Err(BlockError::DuplicateTx);
            }
        }
        Ok(())
    }

    /// Linkage checks against the parent block.
    pub fn validate_parent(&self, parent: &Block) -> Result<(), BlockError> {
        if self.header.block_number != parent.block_number() + 1 {
            return Err(BlockError::BadHeight {
                parent: parent.block_number(),
                got: self.header.block_number,
            });
        }
        if self.header.prev_headerhash != parent.header_hash() {
            return Err(BlockError::BadParentHash);
        }
        if self.header.timestamp <= parent.timestamp() {
            return Err(BlockError::StaleTimestamp {
                parent: parent.timestamp(),
                got: self.header.timestamp,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Address;
    use crate::core::transaction::CoinbaseTx;
    use crate::crypto::xmss::XmssKeypair;

    fn addr(tag: u8) -> Address {
        Address::from_public_key(&XmssKeypair::from_seed(3, [tag; 32]).public_key())
    }

    fn coinbase(amount: u64, number: u64) -> Transaction {
        Transaction::Coinbase(CoinbaseTx::create(addr(0xEE), amount, number))
    }

    #[test]
    fn test_header_hash_commits_to_nonce() {
        let mut block = Block::create(1, [1u8; 32], 100, vec![coinbase(50, 1)]);
        let h0 = block.header_hash();
        let mh0 = block.mining_hash();
        block.header.mining_nonce = 1;
        // mining hash is nonce-independent, header hash is not
        assert_eq!(block.mining_hash(), mh0);
        assert_ne!(block.header_hash(), h0);
    }

    #[test]
    fn test_coinbase_only_block_is_structurally_valid() {
        let block = Block::create(1, [1u8; 32], 100, vec![coinbase(50, 1)]);
        block.validate_structure(100).unwrap();
    }

    #[test]
    fn test_missing_coinbase_rejected() {
        let block = Block::create(1, [1u8; 32], 100, vec![]);
        assert!(matches!(block.validate_structure(100), Err(BlockError::Empty)));
    }

    #[test]
    fn test_duplicate_tx_rejected() {
        let block = Block::create(
            1,
            [1u8; 32],
            100,
            vec![coinbase(50, 1), coinbase(50, 1)],
        );
        // duplicate is also a stray coinbase; structure check catches it first
        assert!(block.validate_structure(100).is_err());
    }

    #[test]
    fn test_parent_linkage() {
        let parent = Block::create(1, [0u8; 32], 100, vec![coinbase(50, 1)]);
        let good = Block::create(2, parent.header_hash(), 160, vec![coinbase(50, 2)]);
        good.validate_parent(&parent).unwrap();

        let stale = Block::create(2, parent.header_hash(), 100, vec![coinbase(50, 2)]);
        assert!(matches!(
            stale.validate_parent(&parent),
            Err(BlockError::StaleTimestamp { .. })
        ));

        let wrong_hash = Block::create(2, [9u8; 32], 160, vec![coinbase(50, 2)]);
        assert!(matches!(
            wrong_hash.validate_parent(&parent),
            Err(BlockError::BadParentHash)
        ));

        let wrong_height = Block::create(5, parent.header_hash(), 160, vec![coinbase(50, 5)]);
        assert!(matches!(
            wrong_height.validate_parent(&parent),
            Err(BlockError::BadHeight { .. })
        ));
    }

    #[test]
    fn test_block_serde_roundtrip_preserves_hash() {
        let block = Block::create(3, [7u8; 32], 500, vec![coinbase(50, 3)]);
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(block, back);
        assert_eq!(block.header_hash(), back.header_hash());

        let bin = bincode::serialize(&block).unwrap();
        let back: Block = bincode::deserialize(&bin).unwrap();
        assert_eq!(block.header_hash(), back.header_hash());
    }
}
