//! Consensus and ledger core of a UTXO-model blockchain node.
//!
//! The crate accepts candidate blocks from peers, validates them against
//! chain rules, maintains the canonical longest chain through
//! reorganizations, and exposes the resulting unspent-output set and
//! transaction index to higher-level services.
//!
//! Four subsystems make up the core:
//!
//! - the block-processing pipeline in [`chain`]: admission, orphan
//!   management, fork choice and reorganization;
//! - the script machine in [`script`], authorizing each input by executing
//!   its unlocking script against the referenced locking script, including
//!   pay-to-script-hash indirection;
//! - the UTXO overlay in [`utxo`], applying and reverting block effects
//!   against pluggable storage with fee and subsidy arithmetic enforced by
//!   [`transaction`] and [`economic`];
//! - the per-height bloom filter holder in [`bloom`], giving address
//!   queries an efficient address-to-block index with reset-on-reorg
//!   semantics.
//!
//! Peer transport, the consensus plugin, persistent storage and sync are
//! external collaborators reached through the traits in [`consensus`] and
//! [`storage`]; chain instances are fully parametrized, so isolated chains
//! can coexist in one process.

pub mod block;
pub mod bloom;
pub mod chain;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod constants;
pub mod economic;
pub mod error;
pub mod eventbus;
pub mod opcodes;
pub mod script;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utxo;

pub use chain::{BlockChain, BlockMessage, ChainService, MessageSender, ServiceHandles};
pub use config::ChainConfig;
pub use error::{CoreError, Result, ScriptError};
