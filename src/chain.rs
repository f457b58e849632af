//! Chain engine: block admission, orphan management, fork choice and
//! reorganization.
//!
//! A `BlockChain` owns the canonical chain state behind one exclusive chain
//! lock. Block processing, tail and eternal updates and reorganizations run
//! under the write side; queries share the read side. The orphan pool has
//! its own finer lock, acquired while holding the chain lock but never the
//! reverse.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::block::{validate_block, validate_block_time};
use crate::bloom::{build_block_filter, BloomHolder};
use crate::codec::Codec;
use crate::config::ChainConfig;
use crate::consensus::{ConsensusEngine, NetworkRelay, SyncManager};
use crate::constants::{BLOCK_CACHE_SIZE, LIGHT_SYNC_THRESHOLD, MAX_BLOCKS_PER_SYNC};
use crate::economic::check_coinbase_value;
use crate::error::{CoreError, Result};
use crate::eventbus::{Event, EventBus, PeerBehavior, PeerId, TOPIC_CHAIN_UPDATE, TOPIC_CONN_EVENT};
use crate::script::pay_to_pub_key_hash_script;
use crate::storage::{
    block_hash_key, block_key, filter_key, tx_index_key, undo_key, Storage, WriteBatch,
    ETERNAL_KEY, GENESIS_KEY, TAIL_KEY,
};
use crate::transaction::{validate_block_scripts, validate_tx_inputs};
use crate::types::{Address, Block, Hash, OutPoint, Transaction};
use crate::utxo::{BlockUndo, UtxoSet, UtxoWrap};

/// How long a shutting-down service keeps draining queued blocks.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Mutable chain state guarded by the chain lock.
struct ChainInner {
    genesis: Block,
    tail: Block,
    eternal: Block,
    longest_chain_height: u32,
    /// Recently seen blocks by hash, main chain and side chains alike.
    cache: LruCache<Hash, Block>,
    /// Tail blocks by timestamp, for the repeated-mint guard.
    repeated_mint_cache: LruCache<i64, Block>,
    height_to_block: LruCache<u32, Block>,
    filter_holder: BloomHolder,
}

/// Orphan blocks waiting for their parent, indexed both ways.
#[derive(Default)]
struct OrphanPool {
    hash_to_orphan: HashMap<Hash, Block>,
    parent_hash_to_children: HashMap<Hash, Vec<Block>>,
}

/// The consensus and ledger core of one node.
pub struct BlockChain {
    db: Arc<dyn Storage>,
    consensus: Arc<dyn ConsensusEngine>,
    sync_manager: Arc<dyn SyncManager>,
    network: Arc<dyn NetworkRelay>,
    bus: EventBus,
    inner: RwLock<ChainInner>,
    orphans: RwLock<OrphanPool>,
}

impl BlockChain {
    /// Open a chain over the given storage, loading (or seeding) genesis,
    /// tail and eternal pointers and rebuilding the per-height bloom
    /// filters up to the tail.
    pub fn new(
        config: ChainConfig,
        db: Arc<dyn Storage>,
        consensus: Arc<dyn ConsensusEngine>,
        sync_manager: Arc<dyn SyncManager>,
        network: Arc<dyn NetworkRelay>,
        bus: EventBus,
    ) -> Result<Self> {
        let genesis = Self::load_or_store_genesis(&*db, config.genesis)?;
        let eternal = Self::load_eternal(&*db, &genesis)?;
        let tail = Self::load_tail(&*db, &genesis)?;
        let longest_chain_height = tail.header.height;

        let cache_cap = NonZeroUsize::new(BLOCK_CACHE_SIZE).unwrap();
        let inner = ChainInner {
            genesis,
            tail,
            eternal,
            longest_chain_height,
            cache: LruCache::new(cache_cap),
            repeated_mint_cache: LruCache::new(cache_cap),
            height_to_block: LruCache::new(cache_cap),
            filter_holder: BloomHolder::new(),
        };

        let chain = BlockChain {
            db,
            consensus,
            sync_manager,
            network,
            bus,
            inner: RwLock::new(inner),
            orphans: RwLock::new(OrphanPool::default()),
        };
        chain.load_filters()?;
        Ok(chain)
    }

    fn load_or_store_genesis(db: &dyn Storage, genesis: Block) -> Result<Block> {
        if let Some(stored_hash) = db.get(GENESIS_KEY)? {
            let hash: Hash = stored_hash
                .try_into()
                .map_err(|_| CoreError::Storage("malformed genesis marker".into()))?;
            let raw = db.get(&block_key(&hash))?.ok_or(CoreError::BlockNotFound)?;
            return Block::decode(&raw);
        }

        let hash = genesis.block_hash();
        let mut batch = WriteBatch::new();
        batch.put(GENESIS_KEY.to_vec(), hash.to_vec());
        batch.put(block_key(&hash), genesis.encode()?);
        batch.put(block_hash_key(0), hash.to_vec());
        db.write(batch)?;
        Ok(genesis)
    }

    fn load_eternal(db: &dyn Storage, genesis: &Block) -> Result<Block> {
        match db.get(ETERNAL_KEY)? {
            Some(raw) => Block::decode(&raw),
            None => Ok(genesis.clone()),
        }
    }

    fn load_tail(db: &dyn Storage, genesis: &Block) -> Result<Block> {
        match db.get(TAIL_KEY)? {
            Some(raw) => {
                let hash: Hash = raw
                    .try_into()
                    .map_err(|_| CoreError::Storage("malformed tail pointer".into()))?;
                let raw = db.get(&block_key(&hash))?.ok_or(CoreError::BlockNotFound)?;
                Block::decode(&raw)
            }
            None => Ok(genesis.clone()),
        }
    }

    /// Rebuild the bloom filter holder from height 1 to the tail. Persisted
    /// filter records are reused when their stored block hash matches.
    fn load_filters(&self) -> Result<()> {
        let mut inner = self.inner.write();
        for height in 1..=inner.longest_chain_height {
            let block = self.load_block_by_height_inner(&inner, height)?;
            let mut utxo_set = UtxoSet::new();
            utxo_set.load_block_utxos(&block, &*self.db)?;
            let block_hash = block.block_hash();
            inner.filter_holder.add_filter(height, block_hash, &*self.db, || {
                build_block_filter(&block, utxo_set.utxo_map())
            })?;
        }
        Ok(())
    }

    /// Handle to the event bus the chain publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn genesis(&self) -> Block {
        self.inner.read().genesis.clone()
    }

    /// Current main-chain tip.
    pub fn tail_block(&self) -> Block {
        self.inner.read().tail.clone()
    }

    /// Highest irreversibly finalized block.
    pub fn eternal_block(&self) -> Block {
        self.inner.read().eternal.clone()
    }

    /// Height of the main-chain tip.
    pub fn block_height(&self) -> u32 {
        self.inner.read().longest_chain_height
    }

    pub fn orphan_pool_size(&self) -> usize {
        self.orphans.read().hash_to_orphan.len()
    }

    /// Number of per-height bloom filters currently held.
    pub fn bloom_filter_count(&self) -> usize {
        self.inner.read().filter_holder.len()
    }

    /// Advance the eternal pointer. The new block must be strictly higher
    /// than the current eternal block.
    pub fn set_eternal(&self, block: Block) -> Result<()> {
        let mut inner = self.inner.write();
        if block.header.height <= inner.eternal.header.height {
            return Err(CoreError::EternalNotAscending);
        }
        self.db.put(ETERNAL_KEY, &block.encode()?)?;
        inner.eternal = block;
        Ok(())
    }

    /// Load a block from persistent storage by hash.
    pub fn load_block_by_hash(&self, hash: &Hash) -> Result<Block> {
        self.load_block_from_db(hash)
    }

    /// Load the canonical block at a height.
    pub fn load_block_by_height(&self, height: u32) -> Result<Block> {
        let inner = self.inner.read();
        self.load_block_by_height_inner(&inner, height)
    }

    /// Look up a main-chain transaction through the transaction index.
    pub fn load_tx_by_hash(&self, hash: &Hash) -> Result<Transaction> {
        let raw = self.db.get(&tx_index_key(hash))?.ok_or(CoreError::TxIndexNotFound)?;
        let (height, index) = decode_tx_index(&raw)?;
        let block = self.load_block_by_height(height)?;
        let tx = block
            .txs
            .get(index as usize)
            .ok_or_else(|| CoreError::Storage("transaction index out of range".into()))?;
        if tx.hash() != *hash {
            return Err(CoreError::Storage("transaction index hash mismatch".into()));
        }
        Ok(tx.clone())
    }

    /// Sync helper: find the first candidate hash on the main chain and
    /// return up to `MAX_BLOCKS_PER_SYNC` hashes following it.
    pub fn locate_fork_point_and_fetch_headers(&self, candidates: &[Hash]) -> Result<Vec<Hash>> {
        let inner = self.inner.read();
        let tail_height = inner.tail.header.height;
        for candidate in candidates {
            let block = match self.load_block_from_db(candidate) {
                Ok(block) => block,
                Err(CoreError::BlockNotFound) => continue,
                Err(err) => return Err(err),
            };
            let remaining = tail_height.saturating_sub(block.header.height);
            let count = remaining.min(MAX_BLOCKS_PER_SYNC);
            let mut result = Vec::with_capacity(count as usize);
            for offset in 0..count {
                let next = self.load_block_by_height_inner(&inner, block.header.height + 1 + offset)?;
                result.push(next.block_hash());
            }
            return Ok(result);
        }
        Ok(Vec::new())
    }

    /// All unspent outputs currently payable to an address, discovered
    /// through the per-height bloom filters.
    pub fn load_utxos_by_address(&self, addr: &Address) -> Result<HashMap<OutPoint, UtxoWrap>> {
        let script = pay_to_pub_key_hash_script(addr.pub_key_hash());
        let inner = self.inner.read();
        let hashes = inner.filter_holder.list_matched_block_hashes(script.as_bytes());
        drop(inner);

        let mut utxo_set = UtxoSet::new();
        for hash in hashes {
            let block = self.load_block_from_db(&hash)?;
            utxo_set.apply_block_with_script_filter(&block, script.as_bytes())?;
        }

        let mut utxos = HashMap::new();
        for (outpoint, wrap) in utxo_set.utxo_map() {
            if wrap.output.script_pubkey.starts_with(script.as_bytes()) && !wrap.is_spent {
                utxos.insert(outpoint.clone(), wrap.clone());
            }
        }
        Ok(utxos)
    }

    /// Main-chain transactions paying to or spending from an address.
    pub fn transactions_by_address(&self, addr: &Address) -> Result<Vec<Transaction>> {
        let script = pay_to_pub_key_hash_script(addr.pub_key_hash());
        let inner = self.inner.read();
        let hashes = inner.filter_holder.list_matched_block_hashes(script.as_bytes());
        drop(inner);

        let mut utxo_set = UtxoSet::new();
        let mut txs = Vec::new();
        for hash in hashes {
            let block = self.load_block_from_db(&hash)?;
            for tx in &block.txs {
                let mut related = false;
                for (index, output) in tx.vout.iter().enumerate() {
                    if output.script_pubkey.as_slice() == script.as_bytes() {
                        utxo_set.add_utxo(tx, index as u32, block.header.height)?;
                        related = true;
                    }
                }
                for input in &tx.vin {
                    if utxo_set.find_utxo(&input.prev_outpoint).is_some() {
                        utxo_set.remove(&input.prev_outpoint);
                        related = true;
                    }
                }
                if related {
                    txs.push(tx.clone());
                }
            }
        }
        Ok(txs)
    }

    /// Admit a candidate block into the chain.
    ///
    /// Runs the full pipeline under the exclusive chain lock: dedup,
    /// repeated-mint and time guards, consensus verification, structural
    /// validation, orphan admission, connection or reorganization, orphan
    /// drain and side effects.
    pub fn process_block(
        &self,
        block: Block,
        broadcast: bool,
        fast_confirm: bool,
        from: Option<&PeerId>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let block_hash = block.block_hash();
        debug!(hash = %hex::encode(block_hash), height = block.header.height, "processing block");

        if self.verify_exists(&inner, &block_hash) {
            warn!(hash = %hex::encode(block_hash), "block already exists");
            return Err(CoreError::BlockExists);
        }

        if let Some(minted) = inner.repeated_mint_cache.peek(&block.header.time_stamp) {
            if minted.block_hash() != block_hash {
                return Err(CoreError::RepeatedMint);
            }
        }

        validate_block_time(&block, unix_now())?;
        self.consensus.verify_signature(&block)?;
        validate_block(&block)?;

        let prev_hash = block.header.prev_block_hash;
        if !self.block_exists(&inner, &prev_hash) {
            info!(
                hash = %hex::encode(block_hash),
                parent = %hex::encode(prev_hash),
                "adding orphan block"
            );
            self.add_orphan_block(block.clone(), block_hash, prev_hash);

            let tail_height = inner.tail.header.height;
            if let Some(peer) = from {
                if block.header.height > tail_height {
                    if block.header.height - tail_height < LIGHT_SYNC_THRESHOLD {
                        return self.sync_manager.active_light_sync(peer);
                    }
                    self.sync_manager.start_sync()?;
                }
            }
            return Ok(());
        }

        self.try_accept_block(&mut inner, block.clone())?;
        self.process_orphans(&mut inner, &block)?;

        if broadcast {
            let network = Arc::clone(&self.network);
            let relayed = block.clone();
            thread::spawn(move || {
                if let Err(err) = network.broadcast_block(&relayed) {
                    warn!(%err, "block broadcast failed");
                }
            });
        }
        if fast_confirm && self.consensus.validate_miner() {
            let consensus = Arc::clone(&self.consensus);
            let candidate = block.clone();
            thread::spawn(move || {
                if let Err(err) = consensus.broadcast_eternal(&candidate) {
                    warn!(%err, "eternal advertisement failed");
                }
            });
        }

        info!(hash = %hex::encode(block_hash), "accepted block");
        Ok(())
    }

    fn verify_exists(&self, inner: &ChainInner, block_hash: &Hash) -> bool {
        self.block_exists(inner, block_hash) || self.is_in_orphan_pool(block_hash)
    }

    fn block_exists(&self, inner: &ChainInner, block_hash: &Hash) -> bool {
        if inner.cache.contains(block_hash) {
            return true;
        }
        matches!(self.db.get(&block_key(block_hash)), Ok(Some(_)))
    }

    fn is_in_orphan_pool(&self, block_hash: &Hash) -> bool {
        self.orphans.read().hash_to_orphan.contains_key(block_hash)
    }

    fn add_orphan_block(&self, orphan: Block, orphan_hash: Hash, parent_hash: Hash) {
        let mut orphans = self.orphans.write();
        orphans.parent_hash_to_children.entry(parent_hash).or_default().push(orphan.clone());
        orphans.hash_to_orphan.insert(orphan_hash, orphan);
    }

    fn get_parent_block(&self, inner: &ChainInner, block: &Block) -> Option<Block> {
        if block.block_hash() == inner.genesis.block_hash() {
            return Some(inner.genesis.clone());
        }
        if let Some(parent) = inner.cache.peek(&block.header.prev_block_hash) {
            return Some(parent.clone());
        }
        self.load_block_from_db(&block.header.prev_block_hash).ok()
    }

    /// Validate the block in chain context and connect it to the main or a
    /// side chain, reorganizing when the side chain takes over.
    fn try_accept_block(&self, inner: &mut ChainInner, block: Block) -> Result<()> {
        let block_hash = block.block_hash();
        let parent = self.get_parent_block(inner, &block).ok_or(CoreError::ParentNotFound)?;

        self.consensus.verify_miner_epoch(&block)?;

        if block.header.height != parent.header.height + 1 {
            warn!(
                height = block.header.height,
                parent_height = parent.header.height,
                "block height does not follow its parent"
            );
            return Err(CoreError::WrongBlockHeight);
        }

        inner.cache.put(block_hash, block.clone());

        // Case 1: the block extends the main chain tip.
        if block.header.prev_block_hash == inner.tail.block_hash() {
            return self.connect_block(inner, &block);
        }

        // Case 2: side chain, not longer than the main chain.
        if block.header.height <= inner.longest_chain_height {
            info!(
                hash = %hex::encode(block_hash),
                height = block.header.height,
                main_height = inner.longest_chain_height,
                "block extends a side chain without reorganization"
            );
            return Ok(());
        }

        // Case 3: the side chain became the longest chain.
        info!(hash = %hex::encode(block_hash), "block is causing a reorganization");
        self.reorganize(inner, &block)?;
        self.set_tail_block(inner, &block)
    }

    /// Full connection path for a block whose parent is the current tail:
    /// script, input and coinbase validation followed by application.
    fn connect_block(&self, inner: &mut ChainInner, block: &Block) -> Result<()> {
        let mut utxo_set = UtxoSet::new();
        utxo_set.load_block_utxos(block, &*self.db)?;

        // Scripts run before the overlay is mutated; spending updates would
        // make valid scripts fail.
        validate_block_scripts(&utxo_set, block)?;

        let mut total_fees: u64 = 0;
        for tx in &block.txs {
            let fee = validate_tx_inputs(&utxo_set, tx, block.header.height)?;
            total_fees = total_fees.checked_add(fee).ok_or(CoreError::FeeOverflow)?;
        }
        check_coinbase_value(block, total_fees)?;

        self.apply_block(inner, block, utxo_set)?;
        self.set_tail_block(inner, block)
    }

    /// Apply a validated block: flush the UTXO overlay, persist the block,
    /// its undo record and transaction index in one atomic batch, register
    /// its bloom filter and publish the connection event.
    fn apply_block(&self, inner: &mut ChainInner, block: &Block, mut utxo_set: UtxoSet) -> Result<()> {
        let block_hash = block.block_hash();
        let undo = utxo_set.apply_block(block)?;

        let mut batch = WriteBatch::new();
        utxo_set.write_to_db(&mut batch)?;
        batch.put(undo_key(&block_hash), undo.encode()?);
        batch.put(block_key(&block_hash), block.encode()?);
        batch.put(block_hash_key(block.header.height), block_hash.to_vec());
        for (index, tx) in block.txs.iter().enumerate() {
            batch.put(tx_index_key(&tx.hash()), encode_tx_index(block.header.height, index as u32));
        }
        self.db.write(batch)?;

        inner.filter_holder.add_filter(block.header.height, block_hash, &*self.db, || {
            build_block_filter(block, utxo_set.utxo_map())
        })?;

        self.consensus.store_candidate_context(&block_hash)?;
        self.notify_block_connection_update(block, true);
        Ok(())
    }

    /// Undo a connected block: restore the UTXO set from the undo record,
    /// drop the block from the canonical indices, truncate the bloom holder
    /// and publish the disconnection event.
    fn revert_block(&self, inner: &mut ChainInner, block: &Block) -> Result<()> {
        let block_hash = block.block_hash();
        let raw = self
            .db
            .get(&undo_key(&block_hash))?
            .ok_or_else(|| CoreError::Storage("missing undo record for reverted block".into()))?;
        let undo = BlockUndo::decode(&raw)?;

        let mut utxo_set = UtxoSet::new();
        utxo_set.revert_block(block, &undo)?;

        let mut batch = WriteBatch::new();
        utxo_set.write_to_db(&mut batch)?;
        batch.del(undo_key(&block_hash));
        batch.del(block_key(&block_hash));
        batch.del(block_hash_key(block.header.height));
        batch.del(filter_key(block.header.height));
        for tx in &block.txs {
            batch.del(tx_index_key(&tx.hash()));
        }
        self.db.write(batch)?;

        inner.height_to_block.pop(&block.header.height);
        inner.filter_holder.reset_at(block.header.height);
        self.notify_block_connection_update(block, false);
        Ok(())
    }

    /// Switch the main chain to the side chain ending in `block`.
    ///
    /// Detaches from the old tip down to the fork point, then attaches the
    /// side blocks upward. An attach failure rolls the whole transition
    /// back to the pre-reorg chain before reporting the abort.
    fn reorganize(&self, inner: &mut ChainInner, block: &Block) -> Result<()> {
        let (detach, attach) = self.find_fork(inner, block);
        assert!(
            attach.len() > detach.len(),
            "reorganization must attach strictly more blocks ({}) than it detaches ({})",
            attach.len(),
            detach.len()
        );

        let original_tail = inner.tail.clone();

        for detached in &detach {
            self.revert_block(inner, detached)?;
        }

        let mut attached: Vec<Block> = Vec::new();
        for side_block in attach.iter().rev() {
            if let Err(err) = self.connect_block(inner, side_block) {
                error!(%err, "reorganization attach failed, rolling back");
                self.rollback_reorg(inner, &attached, &detach, &original_tail)?;
                return Err(CoreError::ReorgAborted(err.to_string().into()));
            }
            attached.push(side_block.clone());
        }
        Ok(())
    }

    /// Restore the pre-reorg chain after a failed attach: revert what was
    /// attached and reconnect what was detached.
    fn rollback_reorg(
        &self,
        inner: &mut ChainInner,
        attached: &[Block],
        detached: &[Block],
        original_tail: &Block,
    ) -> Result<()> {
        for block in attached.iter().rev() {
            self.revert_block(inner, block)?;
        }
        for block in detached.iter().rev() {
            self.connect_block(inner, block)?;
        }
        self.set_tail_block(inner, original_tail)
    }

    /// Walk both chains back to their deepest common ancestor. Returns the
    /// blocks to detach (old tip first) and to attach (new tip first).
    fn find_fork(&self, inner: &ChainInner, block: &Block) -> (Vec<Block>, Vec<Block>) {
        assert!(
            block.header.height > inner.longest_chain_height,
            "side chain (height {}) must be longer than the main chain (height {}) during reorganization",
            block.header.height,
            inner.longest_chain_height
        );

        let mut detach = Vec::new();
        let mut attach = Vec::new();

        // Bring the side chain walk down to the main chain height.
        let mut side = Some(block.clone());
        for _ in inner.longest_chain_height..block.header.height {
            let Some(current) = side else {
                panic!("side chain walk ended before reaching the main chain height");
            };
            attach.push(current.clone());
            side = self.get_parent_block(inner, &current);
        }

        // Compare both chains at equal heights until the hashes meet.
        let mut main = Some(inner.tail.clone());
        loop {
            let (Some(main_block), Some(side_block)) = (main, side) else {
                panic!("fork point not found although both chains share the genesis block");
            };
            assert_eq!(
                main_block.header.height, side_block.header.height,
                "fork walk must compare blocks at equal heights"
            );
            if main_block.block_hash() == side_block.block_hash() {
                break;
            }
            detach.push(main_block.clone());
            attach.push(side_block.clone());
            main = self.get_parent_block(inner, &main_block);
            side = self.get_parent_block(inner, &side_block);
        }

        (detach, attach)
    }

    /// Drain orphans parented by newly accepted blocks. A drained orphan
    /// that fails to accept is discarded; it would fail again later.
    fn process_orphans(&self, inner: &mut ChainInner, block: &Block) -> Result<()> {
        let mut accepted_hashes = vec![block.block_hash()];
        let mut index = 0;
        while index < accepted_hashes.len() {
            let parent_hash = accepted_hashes[index];
            index += 1;

            let children = {
                let mut orphans = self.orphans.write();
                orphans.parent_hash_to_children.remove(&parent_hash).unwrap_or_default()
            };
            for orphan in children {
                let orphan_hash = orphan.block_hash();
                self.orphans.write().hash_to_orphan.remove(&orphan_hash);
                match self.try_accept_block(inner, orphan) {
                    Ok(()) => accepted_hashes.push(orphan_hash),
                    Err(err @ (CoreError::Storage(_) | CoreError::ReorgAborted(_))) => {
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(
                            %err,
                            hash = %hex::encode(orphan_hash),
                            "discarding orphan that failed to accept"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn set_tail_block(&self, inner: &mut ChainInner, block: &Block) -> Result<()> {
        let block_hash = block.block_hash();
        self.db.put(TAIL_KEY, &block_hash)?;

        inner.repeated_mint_cache.put(block.header.time_stamp, block.clone());
        inner.height_to_block.put(block.header.height, block.clone());
        inner.longest_chain_height = block.header.height;
        inner.tail = block.clone();
        info!(hash = %hex::encode(block_hash), height = block.header.height, "changed chain tail");
        Ok(())
    }

    fn notify_block_connection_update(&self, block: &Block, connected: bool) {
        self.bus.publish(
            TOPIC_CHAIN_UPDATE,
            Event::ChainUpdate { connected, block: block.clone() },
        );
    }

    fn load_block_from_db(&self, hash: &Hash) -> Result<Block> {
        let raw = self.db.get(&block_key(hash))?.ok_or(CoreError::BlockNotFound)?;
        Block::decode(&raw)
    }

    fn load_block_by_height_inner(&self, inner: &ChainInner, height: u32) -> Result<Block> {
        if height == 0 {
            return Ok(inner.genesis.clone());
        }
        if let Some(block) = inner.height_to_block.peek(&height) {
            return Ok(block.clone());
        }
        let raw = self.db.get(&block_hash_key(height))?.ok_or(CoreError::BlockNotFound)?;
        let hash: Hash = raw
            .try_into()
            .map_err(|_| CoreError::Storage("malformed height index entry".into()))?;
        self.load_block_from_db(&hash)
    }
}

fn encode_tx_index(height: u32, index: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&height.to_be_bytes());
    buf.extend_from_slice(&index.to_be_bytes());
    buf
}

fn decode_tx_index(raw: &[u8]) -> Result<(u32, u32)> {
    if raw.len() != 8 {
        return Err(CoreError::Storage("malformed transaction index entry".into()));
    }
    let height = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let index = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    Ok((height, index))
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs() as i64)
}

/// Inbound block payload with its originating peer.
#[derive(Debug, Clone)]
pub struct BlockMessage {
    pub from: Option<PeerId>,
    pub body: Vec<u8>,
}

/// Bounded producer handle whose overflow policy drops the newest message
/// and counts the loss.
pub struct MessageSender<T> {
    tx: Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for MessageSender<T> {
    fn clone(&self) -> Self {
        MessageSender { tx: self.tx.clone(), dropped: Arc::clone(&self.dropped) }
    }
}

impl<T> MessageSender<T> {
    /// Enqueue a message; returns false when it was dropped.
    pub fn send(&self, msg: T) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("inbound channel full, dropping newest message");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Number of messages lost to a full channel.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer endpoints of a running [`ChainService`].
pub struct ServiceHandles {
    pub blocks: MessageSender<BlockMessage>,
    pub eternal: MessageSender<Block>,
    pub shutdown: Sender<()>,
}

/// Single-consumer processing loop owning the chain's serialization
/// discipline: inbound blocks are handled strictly in receive order, one at
/// a time.
pub struct ChainService {
    chain: Arc<BlockChain>,
    block_rx: Receiver<BlockMessage>,
    eternal_rx: Receiver<Block>,
    shutdown_rx: Receiver<()>,
}

impl ChainService {
    pub fn new(chain: Arc<BlockChain>, config: &ChainConfig) -> (Self, ServiceHandles) {
        let (block_tx, block_rx) = bounded(config.block_channel_size);
        let (eternal_tx, eternal_rx) = bounded(config.eternal_channel_size);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let service = ChainService { chain, block_rx, eternal_rx, shutdown_rx };
        let handles = ServiceHandles {
            blocks: MessageSender { tx: block_tx, dropped: Arc::new(AtomicU64::new(0)) },
            eternal: MessageSender { tx: eternal_tx, dropped: Arc::new(AtomicU64::new(0)) },
            shutdown: shutdown_tx,
        };
        (service, handles)
    }

    /// Run until shutdown. Disconnection of any producer also stops the
    /// loop. On shutdown, queued blocks are drained up to a soft deadline
    /// so storage stays consistent.
    pub fn run(self) {
        info!("waiting for new block messages");
        loop {
            select! {
                recv(self.block_rx) -> msg => match msg {
                    Ok(msg) => self.process_block_msg(msg),
                    Err(_) => break,
                },
                recv(self.eternal_rx) -> msg => match msg {
                    Ok(block) => self.process_eternal_msg(block),
                    Err(_) => break,
                },
                recv(self.shutdown_rx) -> _ => {
                    self.drain();
                    break;
                }
            }
        }
        info!("quit chain service loop");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn process_block_msg(&self, msg: BlockMessage) {
        let block = match Block::decode(&msg.body) {
            Ok(block) => block,
            Err(err) => {
                warn!(%err, "failed to deserialize block message");
                if let Some(peer) = msg.from {
                    self.publish_conn_event(peer, PeerBehavior::BadBlock);
                }
                return;
            }
        };

        match self.chain.process_block(block, false, true, msg.from.as_ref()) {
            Err(err) if err.is_peer_fault() => {
                warn!(%err, "rejected block from peer");
                if let Some(peer) = msg.from {
                    self.publish_conn_event(peer, PeerBehavior::BadBlock);
                }
            }
            result => {
                if let Err(err) = result {
                    warn!(%err, "failed to process block message");
                }
                if let Some(peer) = msg.from {
                    self.publish_conn_event(peer, PeerBehavior::NewBlock);
                }
            }
        }
    }

    fn process_eternal_msg(&self, block: Block) {
        let height = block.header.height;
        match self.chain.set_eternal(block) {
            Ok(()) => debug!(height, "advanced eternal block"),
            Err(err) => warn!(%err, height, "failed to advance eternal block"),
        }
    }

    fn publish_conn_event(&self, peer: PeerId, behavior: PeerBehavior) {
        self.chain.bus().publish(TOPIC_CONN_EVENT, Event::ConnEvent { peer, behavior });
    }

    fn drain(&self) {
        let deadline = Instant::now() + SHUTDOWN_DRAIN_DEADLINE;
        while Instant::now() < deadline {
            match self.block_rx.try_recv() {
                Ok(msg) => self.process_block_msg(msg),
                Err(_) => break,
            }
        }
    }
}
