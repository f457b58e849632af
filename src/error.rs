//! Error types for chain and script validation.

use std::borrow::Cow;
use thiserror::Error;

/// Failure modes of the script virtual machine.
///
/// All variants reject the containing transaction or block; none are fatal
/// to the node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script bounds exceeded")]
    Bounds,

    #[error("not enough data after {0}")]
    PushDataTooShort(&'static str),

    #[error("invalid stack operation")]
    InvalidStackOperation,

    #[error("equal verify failed")]
    EqualVerify,

    #[error("signature verify failed")]
    SignatureVerifyFail,

    #[error("bad opcode 0x{0:02x}")]
    BadOpcode(u8),

    #[error("script number is not minimally encoded")]
    NonMinimalNumber,

    #[error("script number out of range")]
    NumberOutOfRange,

    #[error("script finished with a false top stack value")]
    EvalFalse,

    #[error("input index {0} out of bounds")]
    InputIndexOutOfBounds(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // Structural rejections.
    #[error("block already exists")]
    BlockExists,

    #[error("serialization failed: {0}")]
    Serialization(Cow<'static, str>),

    #[error("block has an empty transaction list")]
    EmptyTransactionList,

    #[error("first transaction is not a coinbase")]
    FirstTxNotCoinbase,

    #[error("coinbase transaction at a non-zero index")]
    MultipleCoinbases,

    #[error("block size {0} exceeds the limit")]
    BlockTooLarge(usize),

    #[error("block signature operation count {0} exceeds the limit")]
    TooManySigOps(usize),

    #[error("transaction root does not match the block header")]
    InvalidTxRoot,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(Cow<'static, str>),

    // Temporal rejections.
    #[error("block timestamp is too far in the future")]
    TimeTooNew,

    #[error("repeated mint at the same time slot")]
    RepeatedMint,

    // Contextual rejections.
    #[error("parent block not found")]
    ParentNotFound,

    #[error("block height does not follow its parent")]
    WrongBlockHeight,

    #[error("spend of an immature coinbase output")]
    ImmatureCoinbase,

    #[error("transaction is not finalized")]
    Unfinalized,

    #[error("fee sum overflow")]
    FeeOverflow,

    #[error("coinbase pays {actual} which exceeds the expected {expected}")]
    BadCoinbaseValue { actual: u64, expected: u64 },

    #[error("referenced output is missing or unspendable")]
    UtxoNotFound,

    #[error("output already exists unspent")]
    UtxoAlreadyExists,

    #[error("double spend of a referenced output")]
    DoubleSpend,

    #[error("total input {input} is below total output {output}")]
    SpendTooHigh { input: u64, output: u64 },

    // Script rejections.
    #[error("script execution failed: {0}")]
    Script(#[from] ScriptError),

    // Consensus-plugin rejections.
    #[error("consensus verification failed: {0}")]
    ConsensusVerify(Cow<'static, str>),

    // Internal failures; propagated to the caller.
    #[error("storage failure: {0}")]
    Storage(Cow<'static, str>),

    #[error("block not found")]
    BlockNotFound,

    #[error("transaction index entry not found")]
    TxIndexNotFound,

    #[error("eternal block height must advance")]
    EternalNotAscending,

    #[error("reorganization aborted: {0}")]
    ReorgAborted(Cow<'static, str>),

    #[error("filter height {got} does not extend the holder at {expected}")]
    FilterOutOfOrder { got: u32, expected: u32 },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Whether the rejection should score the peer that sent the block.
    ///
    /// Structural, temporal, contextual, script and consensus-plugin
    /// rejections are the sender's fault; internal failures and lookup
    /// misses are not.
    pub fn is_peer_fault(&self) -> bool {
        use CoreError::*;
        matches!(
            self,
            Serialization(_)
                | EmptyTransactionList
                | FirstTxNotCoinbase
                | MultipleCoinbases
                | BlockTooLarge(_)
                | TooManySigOps(_)
                | InvalidTxRoot
                | InvalidTransaction(_)
                | TimeTooNew
                | RepeatedMint
                | WrongBlockHeight
                | ImmatureCoinbase
                | Unfinalized
                | FeeOverflow
                | BadCoinbaseValue { .. }
                | UtxoNotFound
                | UtxoAlreadyExists
                | DoubleSpend
                | SpendTooHigh { .. }
                | Script(_)
                | ConsensusVerify(_)
        )
    }
}
