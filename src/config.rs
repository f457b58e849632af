//! Chain instance configuration.

use crate::block::calc_tx_root;
use crate::constants::{BLOCK_MSG_CHANNEL_SIZE, ETERNAL_MSG_CHANNEL_SIZE, INITIAL_SUBSIDY};
use crate::script::{pay_to_pub_key_hash_script, standard_coinbase_signature_script};
use crate::types::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, ZERO_HASH};

/// Parameters of one chain instance. There is no process-wide chain state;
/// every instance carries its own configuration.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// The height-zero block anchoring the instance.
    pub genesis: Block,
    /// Capacity of the inbound block channel.
    pub block_channel_size: usize,
    /// Capacity of the eternal-notification channel.
    pub eternal_channel_size: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            genesis: genesis_block(),
            block_channel_size: BLOCK_MSG_CHANNEL_SIZE,
            eternal_channel_size: ETERNAL_MSG_CHANNEL_SIZE,
        }
    }
}

impl ChainConfig {
    /// Configuration with a custom genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        ChainConfig { genesis, ..ChainConfig::default() }
    }
}

/// The built-in genesis block: a single full-subsidy coinbase paying an
/// unspendable all-zero pubkey hash.
pub fn genesis_block() -> Block {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prev_outpoint: OutPoint::null(),
            script_sig: standard_coinbase_signature_script(0).into_bytes(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: INITIAL_SUBSIDY,
            script_pubkey: pay_to_pub_key_hash_script(&[0u8; 20]).into_bytes(),
        }],
        lock_time: 0,
    };
    let txs = vec![coinbase];
    Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: ZERO_HASH,
            tx_root: calc_tx_root(&txs),
            time_stamp: 1_546_300_800,
            height: 0,
        },
        txs,
    }
}
