//! Context-free block validation and the transaction root.

use crate::codec::Codec;
use crate::constants::{MAX_BLOCK_SIGOP_CNT, MAX_BLOCK_SIZE, MAX_TIME_OFFSET};
use crate::error::{CoreError, Result};
use crate::opcodes::{OP_CHECKSIG, OP_CHECKSIGVERIFY};
use crate::script::Script;
use crate::transaction::{check_transaction, is_tx_finalized};
use crate::types::{sha256d, Block, Hash, Transaction, ZERO_HASH};

/// Root digest over the block's transaction hashes: pairwise SHA-256d
/// folding, duplicating the last node of odd levels.
pub fn calc_tx_root(txs: &[Transaction]) -> Hash {
    if txs.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&left);
            buf[32..].copy_from_slice(&right);
            next.push(sha256d(&buf));
        }
        level = next;
    }
    level[0]
}

/// Signature operations in one script. Parsing stops at the first
/// malformed push; operations seen up to that point still count.
pub fn count_sig_ops(script: &Script) -> usize {
    let mut count = 0;
    for op in script.iter_ops() {
        if op == OP_CHECKSIG || op == OP_CHECKSIGVERIFY {
            count += 1;
        }
    }
    count
}

fn count_block_sig_ops(block: &Block) -> usize {
    let mut count = 0;
    for tx in &block.txs {
        for input in &tx.vin {
            count += count_sig_ops(&Script::from_bytes(input.script_sig.clone()));
        }
        for output in &tx.vout {
            count += count_sig_ops(&Script::from_bytes(output.script_pubkey.clone()));
        }
    }
    count
}

/// Structural block validation: transaction list shape, serialized size,
/// operation budget, transaction sanity and finality, and the transaction
/// root commitment.
pub fn validate_block(block: &Block) -> Result<()> {
    if block.txs.is_empty() {
        return Err(CoreError::EmptyTransactionList);
    }
    if !block.txs[0].is_coinbase() {
        return Err(CoreError::FirstTxNotCoinbase);
    }
    if block.txs.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(CoreError::MultipleCoinbases);
    }

    let size = block.encode()?.len();
    if size > MAX_BLOCK_SIZE {
        return Err(CoreError::BlockTooLarge(size));
    }

    let sig_ops = count_block_sig_ops(block);
    if sig_ops > MAX_BLOCK_SIGOP_CNT {
        return Err(CoreError::TooManySigOps(sig_ops));
    }

    for tx in &block.txs {
        check_transaction(tx)?;
        if !is_tx_finalized(tx, block.header.height, block.header.time_stamp) {
            return Err(CoreError::Unfinalized);
        }
    }

    if calc_tx_root(&block.txs) != block.header.tx_root {
        return Err(CoreError::InvalidTxRoot);
    }

    Ok(())
}

/// Reject blocks stamped more than the tolerated offset into the future.
pub fn validate_block_time(block: &Block, now: i64) -> Result<()> {
    if block.header.time_stamp > now + MAX_TIME_OFFSET {
        return Err(CoreError::TimeTooNew);
    }
    Ok(())
}
