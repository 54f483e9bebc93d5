use std::path::Path;

use sled::{Batch, Db};
use thiserror::Error;

use crate::core::address::{Address, AddressState};
use crate::core::block::Block;
use crate::core::metadata::BlockMetadata;
use crate::core::state::StateDelta;
use crate::crypto::Hash32;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

// Key namespaces. Everything lives in one sled tree so a single Batch can
// cover a whole block boundary.
const PREFIX_BLOCK: &[u8] = b"block_";
const PREFIX_METADATA: &[u8] = b"metadata_";
const PREFIX_HEIGHT: &[u8] = b"height_";
const PREFIX_ADDR: &[u8] = b"addr_";
const PREFIX_TXHASH: &[u8] = b"txhash_";
const PREFIX_DELTA: &[u8] = b"delta_";
const KEY_PEERS: &[u8] = b"peers";

fn ns_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

/// Durable key-value store backing the chain. The single source of truth
/// across restarts; every mutation that crosses a block boundary goes
/// through one batch.
pub struct StateStore {
    db: Db,
}

impl StateStore {
    /// Open or create the node database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        tracing::info!("state store opened");
        Ok(Self { db })
    }

    /// In-memory store for tests and tooling.
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn new_batch(&self) -> Batch {
        Batch::default()
    }

    /// All-or-nothing commit of a batch plus a durability flush.
    pub fn commit(&self, batch: Batch) -> Result<(), StorageError> {
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put_raw(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn delete_raw(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(key)?;
        Ok(())
    }

    // -- blocks ----------------------------------------------------------

    pub fn put_block(&self, block: &Block, batch: &mut Batch) -> Result<(), StorageError> {
        let value = bincode::serialize(block)?;
        batch.insert(ns_key(PREFIX_BLOCK, &block.header_hash()), value);
        Ok(())
    }

    pub fn get_block(&self, headerhash: &Hash32) -> Result<Option<Block>, StorageError> {
        match self.db.get(ns_key(PREFIX_BLOCK, headerhash))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn delete_block(&self, headerhash: &Hash32, batch: &mut Batch) {
        batch.remove(ns_key(PREFIX_BLOCK, headerhash));
    }

    // -- block metadata --------------------------------------------------

    pub fn put_block_metadata(
        &self,
        headerhash: &Hash32,
        metadata: &BlockMetadata,
        batch: &mut Batch,
    ) -> Result<(), StorageError> {
        let value = bincode::serialize(metadata)?;
        batch.insert(ns_key(PREFIX_METADATA, headerhash), value);
        Ok(())
    }

    pub fn get_block_metadata(
        &self,
        headerhash: &Hash32,
    ) -> Result<Option<BlockMetadata>, StorageError> {
        match self.db.get(ns_key(PREFIX_METADATA, headerhash))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn delete_block_metadata(&self, headerhash: &Hash32, batch: &mut Batch) {
        batch.remove(ns_key(PREFIX_METADATA, headerhash));
    }

    // -- height map (main chain only) ------------------------------------

    pub fn put_height_mapping(&self, height: u64, headerhash: &Hash32, batch: &mut Batch) {
        batch.insert(ns_key(PREFIX_HEIGHT, &height.to_be_bytes()), &headerhash[..]);
    }

    pub fn delete_height_mapping(&self, height: u64, batch: &mut Batch) {
        batch.remove(ns_key(PREFIX_HEIGHT, &height.to_be_bytes()));
    }

    /// Highest main-chain entry, used to recover the tip after a restart.
    /// Height keys are big-endian so sled's ordered scan ends at the tip.
    pub fn last_height_mapping(&self) -> Result<Option<(u64, Hash32)>, StorageError> {
        match self.db.scan_prefix(PREFIX_HEIGHT).last() {
            Some(entry) => {
                let (key, value) = entry?;
                let mut height_bytes = [0u8; 8];
                height_bytes.copy_from_slice(&key[PREFIX_HEIGHT.len()..]);
                let mut hh = [0u8; 32];
                hh.copy_from_slice(&value);
                Ok(Some((u64::from_be_bytes(height_bytes), hh)))
            }
            None => Ok(None),
        }
    }

    pub fn get_height_mapping(&self, height: u64) -> Result<Option<Hash32>, StorageError> {
        match self.db.get(ns_key(PREFIX_HEIGHT, &height.to_be_bytes()))? {
            Some(v) if v.len() == 32 => {
                let mut hh = [0u8; 32];
                hh.copy_from_slice(&v);
                Ok(Some(hh))
            }
            _ => Ok(None),
        }
    }

    // -- address states --------------------------------------------------

    pub fn put_address_state(
        &self,
        state: &AddressState,
        batch: &mut Batch,
    ) -> Result<(), StorageError> {
        let value = bincode::serialize(state)?;
        batch.insert(ns_key(PREFIX_ADDR, state.address.as_bytes()), value);
        Ok(())
    }

    pub fn delete_address_state(&self, address: &Address, batch: &mut Batch) {
        batch.remove(ns_key(PREFIX_ADDR, address.as_bytes()));
    }

    pub fn get_address_state(&self, address: &Address) -> Result<Option<AddressState>, StorageError> {
        match self.db.get(ns_key(PREFIX_ADDR, address.as_bytes()))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    // -- tx index (txhash -> containing main-chain block) ----------------

    pub fn put_tx_mapping(&self, txhash: &Hash32, headerhash: &Hash32, batch: &mut Batch) {
        batch.insert(ns_key(PREFIX_TXHASH, txhash), &headerhash[..]);
    }

    pub fn delete_tx_mapping(&self, txhash: &Hash32, batch: &mut Batch) {
        batch.remove(ns_key(PREFIX_TXHASH, txhash));
    }

    pub fn get_tx_mapping(&self, txhash: &Hash32) -> Result<Option<Hash32>, StorageError> {
        match self.db.get(ns_key(PREFIX_TXHASH, txhash))? {
            Some(v) if v.len() == 32 => {
                let mut hh = [0u8; 32];
                hh.copy_from_slice(&v);
                Ok(Some(hh))
            }
            _ => Ok(None),
        }
    }

    // -- per-block state deltas (undo/redo data for forks) ---------------

    pub fn put_state_delta(
        &self,
        headerhash: &Hash32,
        delta: &StateDelta,
        batch: &mut Batch,
    ) -> Result<(), StorageError> {
        let value = bincode::serialize(delta)?;
        batch.insert(ns_key(PREFIX_DELTA, headerhash), value);
        Ok(())
    }

    pub fn get_state_delta(&self, headerhash: &Hash32) -> Result<Option<StateDelta>, StorageError> {
        match self.db.get(ns_key(PREFIX_DELTA, headerhash))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn delete_state_delta(&self, headerhash: &Hash32, batch: &mut Batch) {
        batch.remove(ns_key(PREFIX_DELTA, headerhash));
    }

    // -- peer list -------------------------------------------------------

    pub fn put_peer_list(&self, peers: &[String]) -> Result<(), StorageError> {
        let value = bincode::serialize(peers)?;
        self.db.insert(KEY_PEERS, value)?;
        Ok(())
    }

    pub fn get_peer_list(&self) -> Result<Vec<String>, StorageError> {
        match self.db.get(KEY_PEERS)? {
            Some(v) => Ok(bincode::deserialize(&v)?),
            None => Ok(Vec::new()),
        }
    }
}
