//! Block production: candidate assembly and the nonce search.
//!
//! The search runs on a blocking worker and checks a cancellation token
//! between batches of nonces, so a tip change preempts it quickly. A found
//! block is posted back to the event loop and travels through the exact
//! same `add_block` ingest as a peer block.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consensus::chain::{ChainError, ChainManager};
use crate::consensus::difficulty::verify_pow;
use crate::consensus::mempool::TransactionPool;
use crate::core::address::Address;
use crate::core::block::Block;
use crate::core::transaction::{CoinbaseTx, Transaction};
use crate::crypto::Hash32;
use crate::node::Event;

/// Nonces ground between cancellation checks.
const SEARCH_BATCH: u32 = 2_048;

pub struct Miner {
    mining_address: Address,
    events: mpsc::UnboundedSender<Event>,
    cancel: Option<CancellationToken>,
}

impl Miner {
    pub fn new(mining_address: Address, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { mining_address, events, cancel: None }
    }

    /// Abandon the current search, if any.
    pub fn preempt(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    /// Abandon the current search and start a fresh candidate on the
    /// current tip.
    pub fn restart(&mut self, chain: &ChainManager, pool: &TransactionPool) -> Result<(), ChainError> {
        self.preempt();

        let (block, _, target) = build_candidate(chain, pool, self.mining_address)?;
        tracing::info!(
            height = block.block_number(),
            txs = block.transactions.len(),
            "mining candidate block"
        );

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(mined) = search_nonce(block, target, &token) {
                let _ = events.send(Event::MinedBlock(Box::new(mined)));
            }
        });
        Ok(())
    }
}

/// Assemble an unmined candidate on the current tip paying the coinbase to
/// `mining_address`. Also the backing for the block-template API.
pub fn build_candidate(
    chain: &ChainManager,
    pool: &TransactionPool,
    mining_address: Address,
) -> Result<(Block, U256, U256), ChainError> {
    let tip = chain.tip().ok_or(ChainError::NotLoaded)?.clone();
    let block_number = tip.block_number() + 1;
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let timestamp = now.max(tip.timestamp() + 1);

    let txs = select_transactions(chain, pool, chain.params().block_tx_limit - 1)?;
    let fees: u64 = txs.iter().map(|tx| tx.fee()).sum();
    let mut all = Vec::with_capacity(txs.len() + 1);
    all.push(Transaction::Coinbase(CoinbaseTx::create(
        mining_address,
        chain.params().fixed_reward + fees,
        block_number,
    )));
    all.extend(txs);

    let block = Block::create(block_number, tip.header_hash(), timestamp, all);
    let (difficulty, target) = chain.difficulty_for_child(timestamp)?;
    Ok((block, difficulty, target))
}

/// Grind the 4-byte nonce space from a random offset until the PoW digest
/// meets the target or the token cancels the search.
pub fn search_nonce(mut block: Block, target: U256, token: &CancellationToken) -> Option<Block> {
    let mining_hash: Hash32 = block.mining_hash();
    let start: u32 = rand::thread_rng().gen();
    let mut nonce = start;
    loop {
        for _ in 0..SEARCH_BATCH {
            if verify_pow(&mining_hash, nonce, target) {
                block.header.mining_nonce = nonce;
                tracing::info!(nonce, height = block.block_number(), "nonce found");
                return Some(block);
            }
            nonce = nonce.wrapping_add(1);
            if nonce == start {
                // nonce space exhausted for this candidate
                return None;
            }
        }
        if token.is_cancelled() {
            tracing::debug!(height = block.block_number(), "mining preempted");
            return None;
        }
    }
}

/// Highest-fee subset of the pool respecting per-sender nonce sequencing
/// and the block transaction limit. Repeats the priority walk until a full
/// pass adds nothing, so a high-fee later-nonce transaction still gets in
/// once its predecessor is picked.
fn select_transactions(
    chain: &ChainManager,
    pool: &TransactionPool,
    limit: usize,
) -> Result<Vec<Transaction>, ChainError> {
    let mut selected: Vec<Transaction> = Vec::new();
    let mut picked: HashSet<Hash32> = HashSet::new();
    let mut next_nonce: HashMap<Address, u64> = HashMap::new();
    let mut used_ots: HashSet<(Address, u64)> = HashSet::new();

    loop {
        let mut progressed = false;
        for tx in pool.iter_by_priority() {
            if selected.len() >= limit {
                return Ok(selected);
            }
            let txhash = tx.txhash();
            if picked.contains(&txhash) {
                continue;
            }
            let (Some(address), Some(auth)) = (tx.addr_from(), tx.auth()) else {
                continue;
            };

            if !next_nonce.contains_key(&address) {
                let state = chain.address_state(&address)?;
                next_nonce.insert(address, state.nonce);
            }
            let expected = next_nonce[&address] + 1;
            if auth.nonce != expected {
                continue;
            }
            if used_ots.contains(&(address, auth.ots_key))
                || chain.address_state(&address)?.ots_bitfield.is_used(auth.ots_key)
            {
                continue;
            }

            next_nonce.insert(address, expected);
            used_ots.insert((address, auth.ots_key));
            picked.insert(txhash);
            selected.push(tx.clone());
            progressed = true;
        }
        if !progressed || selected.len() >= limit {
            return Ok(selected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::difficulty::{target_from_difficulty, DifficultyParams};
    use crate::core::address::AddressState;
    use crate::core::transaction::TransferTx;
    use crate::crypto::xmss::XmssKeypair;
    use crate::storage::StateStore;
    use std::sync::Arc;

    fn chain_with_balance(kp: &XmssKeypair, balance: u64) -> ChainManager {
        use crate::consensus::chain::ChainParams;
        let store = Arc::new(StateStore::open_temporary().unwrap());
        let params = ChainParams {
            fixed_reward: 50,
            min_stake_balance: 1_000,
            blocks_per_epoch: 100,
            block_tx_limit: 100,
            genesis_difficulty: U256::one(),
            difficulty: DifficultyParams {
                target_block_time: 60,
                adjustment_cap_pct: 25,
                min_difficulty: U256::one(),
                max_difficulty: U256::from(u64::MAX),
            },
            orphan_prune_depth: 10,
        };
        let mut chain = ChainManager::new(Arc::clone(&store), params);
        let genesis = Block::create(0, [0u8; 32], 1_000, vec![]);
        chain.load(genesis).unwrap();

        let address = Address::from_public_key(&kp.public_key());
        let mut state = AddressState::get_default(address);
        state.balance = balance;
        let mut batch = store.new_batch();
        store.put_address_state(&state, &mut batch).unwrap();
        store.commit(batch).unwrap();
        chain
    }

    fn transfer(kp: &XmssKeypair, amount: u64, fee: u64, nonce: u64, ots: u64) -> Transaction {
        let to = Address::from_public_key(&XmssKeypair::from_seed(4, [0xBB; 32]).public_key());
        let mut tx = Transaction::Transfer(TransferTx::create(
            to,
            amount,
            fee,
            nonce,
            kp.public_key(),
            ots,
        ));
        tx.sign(kp).unwrap();
        tx
    }

    #[test]
    fn test_selection_respects_sender_sequencing() {
        let alice = XmssKeypair::from_seed(4, [1u8; 32]);
        let chain = chain_with_balance(&alice, 10_000);
        let mut pool = TransactionPool::new(100, 16);
        let state = chain
            .address_state(&Address::from_public_key(&alice.public_key()))
            .unwrap();

        // low-fee nonce 1, high-fee nonce 2: priority order is 2 then 1,
        // selection must still emit 1 before 2.
        let n1 = transfer(&alice, 10, 1, 1, 0);
        let n2 = transfer(&alice, 10, 9, 2, 1);
        pool.admit(n1.clone(), &state).unwrap();
        pool.admit(n2.clone(), &state).unwrap();

        let selected = select_transactions(&chain, &pool, 10).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].txhash(), n1.txhash());
        assert_eq!(selected[1].txhash(), n2.txhash());
    }

    #[test]
    fn test_selection_honors_limit() {
        let alice = XmssKeypair::from_seed(4, [1u8; 32]);
        let chain = chain_with_balance(&alice, 10_000);
        let mut pool = TransactionPool::new(100, 16);
        let state = chain
            .address_state(&Address::from_public_key(&alice.public_key()))
            .unwrap();
        for i in 0..5 {
            pool.admit(transfer(&alice, 10, 1, i + 1, i), &state).unwrap();
        }
        let selected = select_transactions(&chain, &pool, 3).unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_search_finds_valid_nonce() {
        let block = Block::create(
            1,
            [1u8; 32],
            2_000,
            vec![Transaction::Coinbase(CoinbaseTx::create(
                Address::from_public_key(&XmssKeypair::from_seed(4, [9u8; 32]).public_key()),
                50,
                1,
            ))],
        );
        let target = target_from_difficulty(U256::from(4));
        let token = CancellationToken::new();
        let mined = search_nonce(block, target, &token).expect("easy target");
        assert!(verify_pow(&mined.mining_hash(), mined.header.mining_nonce, target));
    }

    #[test]
    fn test_cancelled_search_stops() {
        let block = Block::create(1, [1u8; 32], 2_000, vec![]);
        // impossible target so only cancellation can end the search
        let token = CancellationToken::new();
        token.cancel();
        assert!(search_nonce(block, U256::zero(), &token).is_none());
    }
}
