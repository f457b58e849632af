//! Chain-wide consensus constants.

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 32_000_000;

/// Maximum number of signature operations permitted in one block.
pub const MAX_BLOCK_SIGOP_CNT: usize = 80_000;

/// Number of confirmations before a coinbase output becomes spendable.
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum tolerated clock skew for a block timestamp, in seconds.
pub const MAX_TIME_OFFSET: i64 = 2 * 60 * 60;

/// Lock-time values below this threshold are block heights, above it Unix
/// timestamps.
pub const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

/// Maximum number of block hashes returned by one sync request.
pub const MAX_BLOCKS_PER_SYNC: u32 = 1024;

/// Orphan-height distance under which a targeted light sync is requested
/// from the sending peer instead of a full sync.
pub const LIGHT_SYNC_THRESHOLD: u32 = 32;

/// Base units per whole token.
pub const TOKENS_PER_COIN: u64 = 100_000_000;

/// Coinbase subsidy of the first reduction period: 50 tokens.
pub const INITIAL_SUBSIDY: u64 = 50 * TOKENS_PER_COIN;

/// Number of blocks between subsidy halvings.
pub const SUBSIDY_REDUCTION_INTERVAL: u32 = 1_728_000;

/// Capacity of the inbound block message channel.
pub const BLOCK_MSG_CHANNEL_SIZE: usize = 1024;

/// Capacity of the eternal-block notification channel.
pub const ETERNAL_MSG_CHANNEL_SIZE: usize = 65_536;

/// Capacity of each event-bus subscriber channel.
pub const EVENT_CHANNEL_SIZE: usize = 1024;

/// Capacity of the hash, height and repeated-mint block caches.
pub const BLOCK_CACHE_SIZE: usize = 512;

/// Initial capacity hint for the per-height bloom filter holder.
pub const BLOCK_FILTER_CAPACITY: usize = 100_000;

/// Target false-positive rate for per-block bloom filters.
pub const BLOOM_FP_RATE: f64 = 1e-4;
