//! Speculative address-state overlay.
//!
//! A block is validated against a copy-on-write map seeded from its parent's
//! state snapshot. Application either succeeds for every transaction and the
//! whole overlay is committed in one batch, or the overlay is dropped and the
//! block rejected; partial application is impossible by construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sled::Batch;

use crate::core::address::{Address, AddressState};
use crate::storage::{StateStore, StorageError};

/// One account's before/after across a single block. `before = None` means
/// the account did not exist prior to the block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateDeltaEntry {
    pub address: Address,
    pub before: Option<AddressState>,
    pub after: AddressState,
}

/// Undo/redo record persisted per block, the raw material for computing
/// parent snapshots on side branches and for switching the materialized
/// state across a reorg.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateDelta {
    pub entries: Vec<StateDeltaEntry>,
}

pub struct StateOverlay<'a> {
    store: &'a StateStore,
    /// Frozen parent-snapshot overrides for addresses whose state at the
    /// parent differs from the materialized (tip) state.
    seed: HashMap<Address, Option<AddressState>>,
    /// Working copies mutated by transaction application.
    cache: HashMap<Address, AddressState>,
}

impl<'a> StateOverlay<'a> {
    /// Overlay on top of the live materialized state (parent == tip).
    pub fn new(store: &'a StateStore) -> Self {
        Self::with_seed(store, HashMap::new())
    }

    /// Overlay whose baseline is the materialized state patched by `seed`;
    /// used when the parent sits on a side branch.
    pub fn with_seed(store: &'a StateStore, seed: HashMap<Address, Option<AddressState>>) -> Self {
        Self { store, seed, cache: HashMap::new() }
    }

    /// State of `address` at the parent snapshot, `None` if absent.
    fn baseline(&self, address: &Address) -> Result<Option<AddressState>, StorageError> {
        if let Some(over) = self.seed.get(address) {
            return Ok(over.clone());
        }
        self.store.get_address_state(address)
    }

    /// Mutable working copy, created on first touch.
    pub fn load_mut(&mut self, address: Address) -> Result<&mut AddressState, StorageError> {
        if !self.cache.contains_key(&address) {
            let state = self
                .baseline(&address)?
                .unwrap_or_else(|| AddressState::get_default(address));
            self.cache.insert(address, state);
        }
        Ok(self.cache.get_mut(&address).unwrap())
    }

    /// Read-only view of the current speculative state.
    pub fn get(&self, address: &Address) -> Result<AddressState, StorageError> {
        if let Some(state) = self.cache.get(address) {
            return Ok(state.clone());
        }
        Ok(self
            .baseline(address)?
            .unwrap_or_else(|| AddressState::get_default(*address)))
    }

    pub fn touched(&self) -> impl Iterator<Item = (&Address, &AddressState)> {
        self.cache.iter()
    }

    /// Capture the before/after record for every touched account.
    pub fn to_delta(&self) -> Result<StateDelta, StorageError> {
        let mut entries = Vec::with_capacity(self.cache.len());
        for (address, after) in &self.cache {
            entries.push(StateDeltaEntry {
                address: *address,
                before: self.baseline(address)?,
                after: after.clone(),
            });
        }
        Ok(StateDelta { entries })
    }

    /// Stage every touched account into `batch`. Only valid when the parent
    /// snapshot is the materialized state itself.
    pub fn flush(&self, batch: &mut Batch) -> Result<(), StorageError> {
        for state in self.cache.values() {
            self.store.put_address_state(state, batch)?;
        }
        Ok(())
    }
}
