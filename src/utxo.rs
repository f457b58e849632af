//! Per-block overlay over the persistent unspent-output set.
//!
//! A `UtxoSet` is created for one block validation, loaded lazily with the
//! outpoints the block references, mutated by apply/revert, and flushed to
//! storage once the block connection succeeds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{CoreError, Result};
use crate::storage::{utxo_key, Storage, WriteBatch};
use crate::types::{Block, OutPoint, Transaction, TxOut};

/// A spendable output with its tracking state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoWrap {
    pub output: TxOut,
    pub block_height: u32,
    pub is_coinbase: bool,
    pub is_spent: bool,
    pub is_modified: bool,
}

/// Pre-spend state of every outpoint a block consumed, persisted alongside
/// the block so a later disconnection can restore the set exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, UtxoWrap)>,
}

/// Write-back overlay mapping outpoints to their wrapped outputs.
#[derive(Debug, Default)]
pub struct UtxoSet {
    utxo_map: HashMap<OutPoint, UtxoWrap>,
}

impl UtxoSet {
    pub fn new() -> Self {
        UtxoSet { utxo_map: HashMap::new() }
    }

    pub fn utxo_map(&self) -> &HashMap<OutPoint, UtxoWrap> {
        &self.utxo_map
    }

    /// Look up a spendable entry; spent entries are invisible.
    pub fn find_utxo(&self, outpoint: &OutPoint) -> Option<&UtxoWrap> {
        self.utxo_map.get(outpoint).filter(|wrap| !wrap.is_spent)
    }

    /// Remove an entry from the overlay without touching storage. Used by
    /// address-scoped scans.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<UtxoWrap> {
        self.utxo_map.remove(outpoint)
    }

    /// Create a fresh entry for `tx.vout[index]`. Fails if the outpoint is
    /// already present and unspent.
    pub fn add_utxo(&mut self, tx: &Transaction, index: u32, block_height: u32) -> Result<()> {
        let output = tx
            .vout
            .get(index as usize)
            .ok_or_else(|| CoreError::InvalidTransaction("output index out of bounds".into()))?;
        let outpoint = OutPoint::new(tx.hash(), index);
        if let Some(existing) = self.utxo_map.get(&outpoint) {
            if !existing.is_spent {
                return Err(CoreError::UtxoAlreadyExists);
            }
        }
        self.utxo_map.insert(
            outpoint,
            UtxoWrap {
                output: output.clone(),
                block_height,
                is_coinbase: tx.is_coinbase(),
                is_spent: false,
                is_modified: true,
            },
        );
        Ok(())
    }

    /// Mark an existing unspent entry as spent, returning its pre-spend
    /// state for the undo record.
    pub fn spend_utxo(&mut self, outpoint: &OutPoint) -> Result<UtxoWrap> {
        let wrap = self.utxo_map.get_mut(outpoint).ok_or(CoreError::UtxoNotFound)?;
        if wrap.is_spent {
            return Err(CoreError::DoubleSpend);
        }
        let mut previous = wrap.clone();
        previous.is_modified = true;
        wrap.is_spent = true;
        wrap.is_modified = true;
        Ok(previous)
    }

    fn apply_tx(
        &mut self,
        tx: &Transaction,
        block_height: u32,
        undo: &mut BlockUndo,
        created_in_block: &mut std::collections::HashSet<OutPoint>,
    ) -> Result<()> {
        if !tx.is_coinbase() {
            for input in &tx.vin {
                let previous = self.spend_utxo(&input.prev_outpoint)?;
                // Outputs created earlier in this block never reached
                // storage; reverting must not resurrect them.
                if !created_in_block.contains(&input.prev_outpoint) {
                    undo.spent.push((input.prev_outpoint.clone(), previous));
                }
            }
        }
        let tx_hash = tx.hash();
        for index in 0..tx.vout.len() as u32 {
            self.add_utxo(tx, index, block_height)?;
            created_in_block.insert(OutPoint::new(tx_hash, index));
        }
        Ok(())
    }

    /// Apply a block's transactions in order, coinbase first. Each
    /// transaction spends its inputs before adding its outputs, so outputs
    /// created earlier in the block resolve for later spenders.
    pub fn apply_block(&mut self, block: &Block) -> Result<BlockUndo> {
        let mut undo = BlockUndo::default();
        let mut created_in_block = std::collections::HashSet::new();
        for tx in &block.txs {
            self.apply_tx(tx, block.header.height, &mut undo, &mut created_in_block)?;
        }
        Ok(undo)
    }

    /// Like `apply_block`, but only outputs whose locking script starts
    /// with `script_prefix` are created. Referenced entries absent from the
    /// overlay are skipped rather than treated as errors.
    pub fn apply_block_with_script_filter(
        &mut self,
        block: &Block,
        script_prefix: &[u8],
    ) -> Result<()> {
        for tx in &block.txs {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    self.utxo_map.remove(&input.prev_outpoint);
                }
            }
            for (index, output) in tx.vout.iter().enumerate() {
                if output.script_pubkey.starts_with(script_prefix) {
                    self.add_utxo(tx, index as u32, block.header.height)?;
                }
            }
        }
        Ok(())
    }

    /// Undo a block: delete the outputs it created and restore the entries
    /// it spent from the undo record.
    pub fn revert_block(&mut self, block: &Block, undo: &BlockUndo) -> Result<()> {
        for tx in block.txs.iter().rev() {
            let tx_hash = tx.hash();
            for (index, output) in tx.vout.iter().enumerate() {
                let outpoint = OutPoint::new(tx_hash, index as u32);
                self.utxo_map.insert(
                    outpoint,
                    UtxoWrap {
                        output: output.clone(),
                        block_height: block.header.height,
                        is_coinbase: tx.is_coinbase(),
                        is_spent: true,
                        is_modified: true,
                    },
                );
            }
        }
        for (outpoint, previous) in &undo.spent {
            let mut restored = previous.clone();
            restored.is_spent = false;
            restored.is_modified = true;
            self.utxo_map.insert(outpoint.clone(), restored);
        }
        Ok(())
    }

    /// Load the entry of one referenced outpoint from storage, unless it is
    /// already in the overlay. Missing outpoints stay absent; validation
    /// reports them.
    fn load_utxo(&mut self, outpoint: &OutPoint, db: &dyn Storage) -> Result<()> {
        if self.utxo_map.contains_key(outpoint) {
            return Ok(());
        }
        if let Some(raw) = db.get(&utxo_key(outpoint))? {
            let mut wrap = UtxoWrap::decode(&raw)?;
            wrap.is_modified = false;
            self.utxo_map.insert(outpoint.clone(), wrap);
        }
        Ok(())
    }

    /// Load every outpoint referenced by the block's non-coinbase inputs.
    pub fn load_block_utxos(&mut self, block: &Block, db: &dyn Storage) -> Result<()> {
        for tx in &block.txs {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                self.load_utxo(&input.prev_outpoint, db)?;
            }
        }
        Ok(())
    }

    /// Stage every modified entry into the batch: unspent entries are
    /// written, spent entries are deleted.
    pub fn write_to_db(&self, batch: &mut WriteBatch) -> Result<()> {
        for (outpoint, wrap) in &self.utxo_map {
            if !wrap.is_modified {
                continue;
            }
            let key = utxo_key(outpoint);
            if wrap.is_spent {
                batch.del(key);
            } else {
                batch.put(key, wrap.encode()?);
            }
        }
        Ok(())
    }
}
