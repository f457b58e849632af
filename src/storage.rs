//! Key-value storage boundary and key layout.
//!
//! The core treats persistence as a byte-oriented store with atomic batch
//! writes. Keys live in disjoint single-letter namespaces; values are
//! canonical encodings of the respective entities.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{Hash, OutPoint};

/// Pluggable key-value store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn del(&self, key: &[u8]) -> Result<()>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Apply every staged operation atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

/// Ordered set of writes applied as one atomic unit.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch { ops: Vec::new() }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn del(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Del { key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// In-memory store used by tests and light tooling.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage { map: RwLock::new(BTreeMap::new()) }
    }

    /// Copy of the full key space, for state comparisons in tests.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.map.read().clone()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Del { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// Key namespaces.
const BLOCK_PREFIX: &[u8] = b"B|";
const HEIGHT_PREFIX: &[u8] = b"H|";
const UTXO_PREFIX: &[u8] = b"U|";
const TX_INDEX_PREFIX: &[u8] = b"X|";
const FILTER_PREFIX: &[u8] = b"F|";
const UNDO_PREFIX: &[u8] = b"S|";

/// Tail block hash.
pub const TAIL_KEY: &[u8] = b"T";
/// Serialized eternal block.
pub const ETERNAL_KEY: &[u8] = b"E";
/// Genesis marker, holding the genesis hash.
pub const GENESIS_KEY: &[u8] = b"G";

fn prefixed(prefix: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + payload.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(payload);
    key
}

/// `B|<hash>` → serialized block.
pub fn block_key(hash: &Hash) -> Vec<u8> {
    prefixed(BLOCK_PREFIX, hash)
}

/// `H|<height>` → canonical block hash at that height.
pub fn block_hash_key(height: u32) -> Vec<u8> {
    prefixed(HEIGHT_PREFIX, &height.to_be_bytes())
}

/// `U|<outpoint>` → serialized `UtxoWrap`.
pub fn utxo_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_PREFIX.len() + 36);
    key.extend_from_slice(UTXO_PREFIX);
    key.extend_from_slice(&outpoint.hash);
    key.extend_from_slice(&outpoint.index.to_be_bytes());
    key
}

/// `X|<tx hash>` → `(height, tx index)`.
pub fn tx_index_key(hash: &Hash) -> Vec<u8> {
    prefixed(TX_INDEX_PREFIX, hash)
}

/// `F|<height>` → serialized bloom filter record.
pub fn filter_key(height: u32) -> Vec<u8> {
    prefixed(FILTER_PREFIX, &height.to_be_bytes())
}

/// `S|<hash>` → block undo record.
pub fn undo_key(hash: &Hash) -> Vec<u8> {
    prefixed(UNDO_PREFIX, hash)
}
