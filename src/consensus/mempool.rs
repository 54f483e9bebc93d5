//! Fee-priority transaction pool with one-time-signature conflict guarding.
//!
//! Three indexes back the pool: the fee-ordered priority map the miner
//! drains, the `(address, ots_key)` set that rejects a second spend of the
//! same XMSS leaf while the first is still pending, and the hash map that
//! both stores payloads and suppresses duplicates.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::core::address::{Address, AddressState};
use crate::core::transaction::{check_against_state, Transaction, TxError};
use crate::crypto::Hash32;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool full: {0} transactions")]
    Full(usize),
    #[error("transaction already in pool")]
    Duplicate,
    #[error("pool already holds a transaction spending ots index {ots_key} of {address}")]
    OtsConflict { address: Address, ots_key: u64 },
    #[error("coinbase transactions are not pooled")]
    Coinbase,
    #[error(transparent)]
    Invalid(#[from] TxError),
}

pub struct TransactionPool {
    capacity: usize,
    /// One past the highest valid OTS leaf (2^xmss_tree_height).
    max_ots_index: u64,
    /// (fee, insertion order) -> txhash; reverse iteration yields highest
    /// fee first and FIFO within a fee.
    by_priority: BTreeMap<(u64, Reverse<u64>), Hash32>,
    txs: HashMap<Hash32, Transaction>,
    priority_keys: HashMap<Hash32, (u64, Reverse<u64>)>,
    ots_index: HashSet<(Address, u64)>,
    /// Highest queued nonce per sender, so a sender can chain transactions
    /// ahead of the tip.
    pending_nonces: HashMap<Address, u64>,
    seq: u64,
}

impl TransactionPool {
    pub fn new(capacity: usize, max_ots_index: u64) -> Self {
        Self {
            capacity,
            max_ots_index,
            by_priority: BTreeMap::new(),
            txs: HashMap::new(),
            priority_keys: HashMap::new(),
            ots_index: HashSet::new(),
            pending_nonces: HashMap::new(),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, txhash: &Hash32) -> bool {
        self.txs.contains_key(txhash)
    }

    /// Admit a transaction against the live tip state of its sender.
    ///
    /// Runs static validation, the pool-level OTS conflict check, the
    /// balance/nonce check and the capacity cap, in that order.
    pub fn admit(&mut self, tx: Transaction, sender_state: &AddressState) -> Result<(), PoolError> {
        if tx.is_coinbase() {
            return Err(PoolError::Coinbase);
        }
        let txhash = tx.txhash();
        if self.txs.contains_key(&txhash) {
            return Err(PoolError::Duplicate);
        }
        if self.txs.len() >= self.capacity {
            return Err(PoolError::Full(self.txs.len()));
        }

        tx.static_validate()?;

        let auth = tx.auth().expect("non-coinbase carries auth");
        let address = tx.addr_from().expect("non-coinbase carries sender");
        if auth.ots_key >= self.max_ots_index {
            return Err(PoolError::Invalid(TxError::InvalidStructure(
                "ots index beyond the tree height",
            )));
        }
        if self.ots_index.contains(&(address, auth.ots_key)) {
            return Err(PoolError::OtsConflict { address, ots_key: auth.ots_key });
        }

        // Nonce continues from whatever this sender already has queued.
        let pending = self.pending_nonces.get(&address).copied();
        let expected = pending.unwrap_or(sender_state.nonce).max(sender_state.nonce) + 1;
        if auth.nonce != expected {
            return Err(PoolError::Invalid(TxError::NonceMismatch {
                expected,
                got: auth.nonce,
            }));
        }

        // Balance and consumed-OTS rules against the chain tip; the nonce
        // part was handled above, so probe with the chain nonce aligned.
        let mut probe = sender_state.clone();
        probe.nonce = auth.nonce - 1;
        check_against_state(&tx, &probe)?;

        let key = (auth.fee, Reverse(self.seq));
        self.seq += 1;
        self.by_priority.insert(key, txhash);
        self.priority_keys.insert(txhash, key);
        self.ots_index.insert((address, auth.ots_key));
        self.pending_nonces.insert(address, auth.nonce);
        self.txs.insert(txhash, tx);
        Ok(())
    }

    /// Lazy fee-descending walk over the pooled transactions.
    pub fn iter_by_priority(&self) -> impl Iterator<Item = &Transaction> {
        self.by_priority
            .iter()
            .rev()
            .filter_map(move |(_, hash)| self.txs.get(hash))
    }

    fn remove_by_hash(&mut self, txhash: &Hash32) -> Option<Transaction> {
        let tx = self.txs.remove(txhash)?;
        if let Some(key) = self.priority_keys.remove(txhash) {
            self.by_priority.remove(&key);
        }
        if let (Some(address), Some(auth)) = (tx.addr_from(), tx.auth()) {
            self.ots_index.remove(&(address, auth.ots_key));
        }
        Some(tx)
    }

    /// Drop everything a freshly applied block made stale: the included
    /// transactions themselves plus any pool entry spending the same
    /// (address, ots) pair.
    pub fn remove_included(&mut self, block_txs: &[Transaction]) {
        let mut touched: HashSet<Address> = HashSet::new();
        for tx in block_txs {
            if let Some(addr) = tx.addr_from() {
                touched.insert(addr);
            }
            self.remove_by_hash(&tx.txhash());

            if let (Some(address), Some(auth)) = (tx.addr_from(), tx.auth()) {
                let conflicts: Vec<Hash32> = self
                    .txs
                    .iter()
                    .filter(|(_, pooled)| {
                        pooled.addr_from() == Some(address)
                            && pooled.auth().map(|a| a.ots_key) == Some(auth.ots_key)
                    })
                    .map(|(h, _)| *h)
                    .collect();
                for hash in conflicts {
                    self.remove_by_hash(&hash);
                }
            }
        }
        for address in touched {
            self.recompute_pending_nonce(&address);
        }
    }

    fn recompute_pending_nonce(&mut self, address: &Address) {
        let highest = self
            .txs
            .values()
            .filter(|tx| tx.addr_from() == Some(*address))
            .filter_map(|tx| tx.auth().map(|a| a.nonce))
            .max();
        match highest {
            Some(n) => {
                self.pending_nonces.insert(*address, n);
            }
            None => {
                self.pending_nonces.remove(address);
            }
        }
    }

    /// Evict entries the chain tip has made permanently stale: a burned
    /// OTS leaf or an already-consumed nonce. Run after a reorg, when
    /// blocks that never passed through `remove_included` became
    /// main-chain. Returns how many were dropped.
    pub fn purge_stale<F>(&mut self, mut state_of: F) -> usize
    where
        F: FnMut(&Address) -> AddressState,
    {
        let stale: Vec<(Hash32, Address)> = self
            .txs
            .iter()
            .filter_map(|(hash, tx)| {
                let address = tx.addr_from()?;
                let auth = tx.auth()?;
                let state = state_of(&address);
                let dead = state.ots_bitfield.is_used(auth.ots_key) || auth.nonce <= state.nonce;
                dead.then_some((*hash, address))
            })
            .collect();
        let count = stale.len();
        let mut touched: HashSet<Address> = HashSet::new();
        for (hash, address) in stale {
            self.remove_by_hash(&hash);
            touched.insert(address);
        }
        for address in touched {
            self.recompute_pending_nonce(&address);
        }
        count
    }

    /// Reorg path: offer abandoned-branch transactions back to the pool.
    /// Each one re-runs full admission against the new tip state, so
    /// anything whose OTS leaf or nonce was consumed on the winning branch
    /// silently stays out. Returns how many came back.
    pub fn requeue<F>(&mut self, txs: Vec<Transaction>, mut state_of: F) -> usize
    where
        F: FnMut(&Address) -> AddressState,
    {
        let mut requeued = 0;
        for tx in txs {
            if tx.is_coinbase() {
                continue;
            }
            let Some(address) = tx.addr_from() else { continue };
            let state = state_of(&address);
            match self.admit(tx, &state) {
                Ok(()) => requeued += 1,
                Err(err) => {
                    tracing::debug!("dropping abandoned-branch tx: {err}");
                }
            }
        }
        requeued
    }
}
