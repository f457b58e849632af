//! Subsidy schedule and coinbase value arithmetic.

use crate::constants::{INITIAL_SUBSIDY, SUBSIDY_REDUCTION_INTERVAL};
use crate::error::{CoreError, Result};
use crate::types::Block;

/// Coinbase reward at the given height: 50 tokens, halved every reduction
/// interval, zero once the shift exhausts the value.
pub fn calc_block_subsidy(height: u32) -> u64 {
    let halvings = height / SUBSIDY_REDUCTION_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Enforce `Σ coinbase outputs ≤ subsidy(height) + Σ fees` for a block.
/// Both sums are overflow-checked; overflow rejects the block.
pub fn check_coinbase_value(block: &Block, total_fees: u64) -> Result<()> {
    let coinbase = block.txs.first().ok_or(CoreError::EmptyTransactionList)?;
    let mut total_coinbase: u64 = 0;
    for output in &coinbase.vout {
        total_coinbase = total_coinbase.checked_add(output.value).ok_or(CoreError::FeeOverflow)?;
    }
    let expected = calc_block_subsidy(block.header.height)
        .checked_add(total_fees)
        .ok_or(CoreError::FeeOverflow)?;
    if total_coinbase > expected {
        return Err(CoreError::BadCoinbaseValue { actual: total_coinbase, expected });
    }
    Ok(())
}
