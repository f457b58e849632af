//! Transaction validation: structural sanity and contextual input checks.

use std::collections::HashSet;

use crate::constants::{COINBASE_MATURITY, LOCK_TIME_THRESHOLD};
use crate::error::{CoreError, Result};
use crate::script::Script;
use crate::types::Transaction;
use crate::utxo::UtxoSet;

/// Context-free sanity checks on one transaction.
///
/// Rejects empty input or output lists, duplicate referenced outpoints,
/// out-of-range coinbase unlocking scripts, null outpoints outside a
/// coinbase and output-sum overflow.
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.vin.is_empty() {
        return Err(CoreError::InvalidTransaction("transaction has no inputs".into()));
    }
    if tx.vout.is_empty() {
        return Err(CoreError::InvalidTransaction("transaction has no outputs".into()));
    }

    let mut total_out: u64 = 0;
    for output in &tx.vout {
        total_out = total_out
            .checked_add(output.value)
            .ok_or_else(|| CoreError::InvalidTransaction("output value sum overflow".into()))?;
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prev_outpoint) {
            return Err(CoreError::InvalidTransaction("duplicate referenced outpoint".into()));
        }
    }

    if tx.is_coinbase() {
        let script_sig_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_sig_len) {
            return Err(CoreError::InvalidTransaction(
                "coinbase unlocking script length out of range".into(),
            ));
        }
    } else {
        for input in &tx.vin {
            if input.prev_outpoint.is_null() {
                return Err(CoreError::InvalidTransaction(
                    "non-coinbase input references the null outpoint".into(),
                ));
            }
        }
    }

    Ok(())
}

/// Whether the transaction's lock-time has elapsed relative to the block it
/// is included in.
///
/// A lock-time below the threshold is a block height; above it, a Unix
/// timestamp. Inputs that all carry the final sequence opt out of the
/// lock-time entirely.
pub fn is_tx_finalized(tx: &Transaction, block_height: u32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let reference = if tx.lock_time < LOCK_TIME_THRESHOLD {
        i64::from(block_height)
    } else {
        block_time
    };
    if i64::from(tx.lock_time) < reference {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == u32::MAX)
}

/// Validate a transaction's inputs against the loaded UTXO view and return
/// the fee it pays.
///
/// Every referenced outpoint must resolve to an unspent entry, coinbase
/// outputs must have matured, and the input sum must cover the output sum.
/// All sums are overflow-checked.
pub fn validate_tx_inputs(utxo_set: &UtxoSet, tx: &Transaction, block_height: u32) -> Result<u64> {
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut total_in: u64 = 0;
    for input in &tx.vin {
        let wrap = utxo_set.find_utxo(&input.prev_outpoint).ok_or(CoreError::UtxoNotFound)?;
        if wrap.is_coinbase && block_height.saturating_sub(wrap.block_height) < COINBASE_MATURITY {
            return Err(CoreError::ImmatureCoinbase);
        }
        total_in = total_in.checked_add(wrap.output.value).ok_or(CoreError::FeeOverflow)?;
    }

    let mut total_out: u64 = 0;
    for output in &tx.vout {
        total_out = total_out.checked_add(output.value).ok_or(CoreError::FeeOverflow)?;
    }

    if total_in < total_out {
        return Err(CoreError::SpendTooHigh { input: total_in, output: total_out });
    }
    Ok(total_in - total_out)
}

/// Run the script machine over every non-coinbase input of the block.
///
/// Scripts run against the pre-application UTXO view, before any of the
/// block's own spends are applied.
pub fn validate_block_scripts(utxo_set: &UtxoSet, block: &crate::types::Block) -> Result<()> {
    for tx in &block.txs {
        if tx.is_coinbase() {
            continue;
        }
        for (input_index, input) in tx.vin.iter().enumerate() {
            let wrap = utxo_set.find_utxo(&input.prev_outpoint).ok_or(CoreError::UtxoNotFound)?;
            let script_sig = Script::from_bytes(input.script_sig.clone());
            let script_pubkey = Script::from_bytes(wrap.output.script_pubkey.clone());
            Script::validate(&script_sig, &script_pubkey, tx, input_index)?;
        }
    }
    Ok(())
}
