//! Shared harness: collaborator test doubles and chain-building helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use chaincore::block::calc_tx_root;
use chaincore::chain::BlockChain;
use chaincore::config::ChainConfig;
use chaincore::consensus::{ConsensusEngine, NetworkRelay, SyncManager};
use chaincore::error::Result;
use chaincore::eventbus::{EventBus, PeerId};
use chaincore::script::{
    calc_sig_hash, pay_to_pub_key_hash_script, signature_script,
    standard_coinbase_signature_script,
};
use chaincore::storage::MemoryStorage;
use chaincore::types::{
    Address, Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut,
};

/// Consensus double: every check passes, the local node is not a miner.
pub struct TestConsensus;

impl ConsensusEngine for TestConsensus {
    fn verify_signature(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn verify_miner_epoch(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn store_candidate_context(&self, _block_hash: &Hash) -> Result<()> {
        Ok(())
    }

    fn validate_miner(&self) -> bool {
        false
    }

    fn broadcast_eternal(&self, _block: &Block) -> Result<()> {
        Ok(())
    }
}

/// Sync double counting requested syncs.
#[derive(Default)]
pub struct TestSync {
    pub full_syncs: AtomicUsize,
    pub light_syncs: AtomicUsize,
}

impl SyncManager for TestSync {
    fn start_sync(&self) -> Result<()> {
        self.full_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn active_light_sync(&self, _peer: &PeerId) -> Result<()> {
        self.light_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestNetwork;

impl NetworkRelay for TestNetwork {
    fn broadcast_block(&self, _block: &Block) -> Result<()> {
        Ok(())
    }
}

pub struct TestChain {
    pub chain: Arc<BlockChain>,
    pub db: Arc<MemoryStorage>,
    pub bus: EventBus,
    pub sync: Arc<TestSync>,
}

/// Chain instance over fresh in-memory storage and the default genesis.
pub fn new_chain() -> TestChain {
    new_chain_on(Arc::new(MemoryStorage::new()))
}

/// Chain instance over the given storage, so tests can reopen a store.
pub fn new_chain_on(db: Arc<MemoryStorage>) -> TestChain {
    let bus = EventBus::new();
    let sync = Arc::new(TestSync::default());
    let chain = BlockChain::new(
        ChainConfig::default(),
        db.clone(),
        Arc::new(TestConsensus),
        sync.clone(),
        Arc::new(TestNetwork),
        bus.clone(),
    )
    .expect("chain must open over fresh storage");
    TestChain { chain: Arc::new(chain), db, bus, sync }
}

/// Deterministic keypair and its address.
pub struct TestKey {
    pub secret: SecretKey,
    pub public: PublicKey,
    pub address: Address,
}

pub fn test_key(seed: u8) -> TestKey {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("non-zero seed yields a valid key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    let address = Address::from_pub_key(&public.serialize());
    TestKey { secret, public, address }
}

/// P2PKH locking script bytes for an address.
pub fn script_for(address: &Address) -> Vec<u8> {
    pay_to_pub_key_hash_script(address.pub_key_hash()).into_bytes()
}

pub fn coinbase_tx(height: u32, value: u64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prev_outpoint: OutPoint::null(),
            script_sig: standard_coinbase_signature_script(height).into_bytes(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut { value, script_pubkey }],
        lock_time: 0,
    }
}

/// Assemble a block on the given parent; the timestamp must be unique
/// chain-wide or the repeated-mint guard rejects it.
pub fn make_block(parent: &Block, mut txs: Vec<Transaction>, time_stamp: i64) -> Block {
    let height = parent.header.height + 1;
    if txs.is_empty() {
        txs.push(coinbase_tx(height, 50 * 100_000_000, script_for(&test_key(0xEE).address)));
    }
    Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: parent.block_hash(),
            tx_root: calc_tx_root(&txs),
            time_stamp,
            height,
        },
        txs,
    }
}

/// Sign one P2PKH input in place.
pub fn sign_input(tx: &mut Transaction, index: usize, script_pubkey: &[u8], key: &TestKey) {
    let secp = Secp256k1::new();
    let sig_hash = calc_sig_hash(script_pubkey, tx, index).expect("input index must exist");
    let message = Message::from_digest_slice(&sig_hash).expect("sig hash is 32 bytes");
    let signature = secp.sign_ecdsa(&message, &key.secret);
    tx.vin[index].script_sig =
        signature_script(&signature.serialize_der(), &key.public.serialize()).into_bytes();
}

/// Submit a locally built block.
pub fn submit(chain: &BlockChain, block: &Block) -> Result<()> {
    chain.process_block(block.clone(), false, false, None)
}

/// Timestamp schedule keeping every block unique; `branch` separates forks.
pub fn ts(height: u32, branch: i64) -> i64 {
    1_546_300_800 + i64::from(height) * 600 + branch
}

/// Extend the chain with `count` plain coinbase blocks and return the new
/// tip.
pub fn mine_filler_blocks(
    chain: &BlockChain,
    from: &Block,
    count: u32,
    miner: &Address,
) -> Block {
    let mut parent = from.clone();
    for _ in 0..count {
        let height = parent.header.height + 1;
        let txs = vec![coinbase_tx(height, 50 * 100_000_000, script_for(miner))];
        let block = make_block(&parent, txs, ts(height, 0));
        submit(chain, &block).expect("filler block must connect");
        parent = block;
    }
    parent
}

/// Total unspent value payable to an address, via the bloom-indexed scan.
pub fn balance(chain: &BlockChain, address: &Address) -> u64 {
    chain
        .load_utxos_by_address(address)
        .expect("address scan must succeed")
        .values()
        .map(|wrap| wrap.output.value)
        .sum()
}
