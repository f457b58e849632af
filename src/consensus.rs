//! Interfaces of the external collaborators the chain engine drives.
//!
//! The engine never depends on a concrete consensus, sync or network
//! implementation; instances are parametrized with trait objects so that
//! isolated chains can coexist in one process.

use crate::error::Result;
use crate::eventbus::PeerId;
use crate::types::{Block, Hash};

/// Pluggable consensus engine: signing, epoch verification and
/// eternal-block finalization.
pub trait ConsensusEngine: Send + Sync {
    /// Verify the block's producer signature.
    fn verify_signature(&self, block: &Block) -> Result<()>;

    /// Verify the block was minted in the producer's epoch.
    fn verify_miner_epoch(&self, block: &Block) -> Result<()>;

    /// Record consensus context for a connected candidate block.
    fn store_candidate_context(&self, block_hash: &Hash) -> Result<()>;

    /// Whether the local node currently validates as an active miner.
    fn validate_miner(&self) -> bool;

    /// Advertise a block as an eternal candidate to the miner set.
    fn broadcast_eternal(&self, block: &Block) -> Result<()>;
}

/// Block synchronization driver.
pub trait SyncManager: Send + Sync {
    /// Kick off a full chain sync.
    fn start_sync(&self) -> Result<()>;

    /// Request a targeted light sync from one peer.
    fn active_light_sync(&self, peer: &PeerId) -> Result<()>;
}

/// Outbound block gossip.
pub trait NetworkRelay: Send + Sync {
    fn broadcast_block(&self, block: &Block) -> Result<()>;
}
