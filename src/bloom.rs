//! Address-indexed bloom filters, one per connected block.
//!
//! The holder is a dense sequence starting at height 1 (the genesis block
//! carries no filter). Each filter contains every locking script a block
//! touched, so an address query only has to open the blocks whose filter
//! matches. Membership tests may yield false positives; callers re-verify
//! against the block data.

use std::collections::HashMap;

use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Codec;
use crate::constants::{BLOCK_FILTER_CAPACITY, BLOOM_FP_RATE};
use crate::error::{CoreError, Result};
use crate::script::Script;
use crate::storage::{filter_key, Storage};
use crate::types::{Block, Hash, OutPoint};
use crate::utxo::UtxoWrap;

/// One block's filter, keyed by its height on the canonical chain.
pub struct BloomEntry {
    pub height: u32,
    pub block_hash: Hash,
    filter: Bloom<[u8]>,
}

/// Persisted form of a filter, sufficient to reconstruct it exactly.
#[derive(Serialize, Deserialize)]
struct FilterRecord {
    block_hash: Hash,
    bitmap: Vec<u8>,
    bits: u64,
    hash_fns: u32,
    sip_keys: [(u64, u64); 2],
}

/// Ordered array of per-block filters, densely indexed by height and
/// truncatable on reversion.
pub struct BloomHolder {
    entries: Vec<BloomEntry>,
}

impl Default for BloomHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomHolder {
    pub fn new() -> Self {
        BloomHolder { entries: Vec::with_capacity(BLOCK_FILTER_CAPACITY) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Height the next appended filter must carry.
    pub fn next_height(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    /// Append the filter for the block at `height` and persist it for
    /// recovery. Filters must be added in strict height order.
    ///
    /// A record already persisted for this height is reused when its stored
    /// block hash matches, skipping recomputation.
    pub fn add_filter<F>(
        &mut self,
        height: u32,
        block_hash: Hash,
        db: &dyn Storage,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Bloom<[u8]>,
    {
        let expected = self.next_height();
        if height != expected {
            return Err(CoreError::FilterOutOfOrder { got: height, expected });
        }

        let key = filter_key(height);
        if let Some(raw) = db.get(&key)? {
            if let Ok(record) = FilterRecord::decode(&raw) {
                if record.block_hash == block_hash {
                    debug!(height, "reusing persisted block filter");
                    let filter = Bloom::from_existing(
                        &record.bitmap,
                        record.bits,
                        record.hash_fns,
                        record.sip_keys,
                    );
                    self.entries.push(BloomEntry { height, block_hash, filter });
                    return Ok(());
                }
            }
        }

        let filter = build();
        let record = FilterRecord {
            block_hash,
            bitmap: filter.bitmap(),
            bits: filter.number_of_bits(),
            hash_fns: filter.number_of_hash_functions(),
            sip_keys: filter.sip_keys(),
        };
        db.put(&key, &record.encode()?)?;
        self.entries.push(BloomEntry { height, block_hash, filter });
        Ok(())
    }

    /// Hashes of all blocks whose filter matches the locking script, in
    /// height order. May contain false positives.
    pub fn list_matched_block_hashes(&self, script_pubkey: &[u8]) -> Vec<Hash> {
        self.entries
            .iter()
            .filter(|entry| entry.filter.check(script_pubkey))
            .map(|entry| entry.block_hash)
            .collect()
    }

    /// Drop every entry at `height` and above. Called when the block at
    /// that height is reverted; any persisted record that survives is
    /// invalidated by hash comparison on reuse.
    pub fn reset_at(&mut self, height: u32) {
        let keep = self
            .entries
            .iter()
            .position(|entry| entry.height >= height)
            .unwrap_or(self.entries.len());
        self.entries.truncate(keep);
    }
}

/// Build the filter for a block: every referenced locking script from the
/// loaded UTXO view plus every created locking script. Token outputs
/// contribute their pay-to-pubkey-hash prefix so holder-address queries
/// still match them.
pub fn build_block_filter(block: &Block, utxo_used: &HashMap<OutPoint, UtxoWrap>) -> Bloom<[u8]> {
    let mut vin_scripts: Vec<&[u8]> = Vec::with_capacity(utxo_used.len());
    for wrap in utxo_used.values() {
        vin_scripts.push(&wrap.output.script_pubkey);
    }

    let mut vout_scripts: Vec<Vec<u8>> = Vec::new();
    for tx in &block.txs {
        for output in &tx.vout {
            let script = Script::from_bytes(output.script_pubkey.clone());
            if script.is_token_issue() || script.is_token_transfer() {
                if let Some(prefix) = script.p2pkh_prefix() {
                    vout_scripts.push(prefix.into_bytes());
                    continue;
                }
            }
            vout_scripts.push(output.script_pubkey.clone());
        }
    }

    let capacity = vin_scripts.len() + vout_scripts.len() + 1;
    let mut filter: Bloom<[u8]> = Bloom::new_for_fp_rate(capacity, BLOOM_FP_RATE);
    for script in &vin_scripts {
        filter.set(script);
    }
    for script in &vout_scripts {
        filter.set(script.as_slice());
    }
    debug!(
        inputs = vin_scripts.len(),
        outputs = vout_scripts.len(),
        "built block filter"
    );
    filter
}
