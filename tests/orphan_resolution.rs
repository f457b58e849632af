//! Orphan pool admission and resolution.

mod common;

use std::sync::atomic::Ordering;

use chaincore::error::CoreError;

use common::*;

#[test]
fn orphan_waits_for_its_parent() {
    let harness = new_chain();
    let chain = &harness.chain;

    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));
    let block3 = make_block(&block2, Vec::new(), ts(3, 0));

    submit(chain, &block1).unwrap();

    // Block 3 arrives while block 2 is missing: admitted as an orphan.
    submit(chain, &block3).unwrap();
    assert_eq!(chain.orphan_pool_size(), 1);
    assert_eq!(chain.block_height(), 1);

    // The parent's arrival drains the orphan.
    submit(chain, &block2).unwrap();
    assert_eq!(chain.orphan_pool_size(), 0);
    assert_eq!(chain.block_height(), 3);
    assert_eq!(chain.tail_block().block_hash(), block3.block_hash());
}

#[test]
fn orphan_chains_resolve_recursively() {
    let harness = new_chain();
    let chain = &harness.chain;

    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));
    let block3 = make_block(&block2, Vec::new(), ts(3, 0));
    let block4 = make_block(&block3, Vec::new(), ts(4, 0));

    // Whole descendant chain arrives before its root.
    submit(chain, &block4).unwrap();
    submit(chain, &block3).unwrap();
    submit(chain, &block2).unwrap();
    assert_eq!(chain.orphan_pool_size(), 3);
    assert_eq!(chain.block_height(), 0);

    submit(chain, &block1).unwrap();
    assert_eq!(chain.orphan_pool_size(), 0);
    assert_eq!(chain.block_height(), 4);
    assert_eq!(chain.tail_block().block_hash(), block4.block_hash());
}

#[test]
fn duplicate_orphan_is_rejected() {
    let harness = new_chain();
    let chain = &harness.chain;
    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));

    submit(chain, &block2).unwrap();
    assert_eq!(submit(chain, &block2), Err(CoreError::BlockExists));
    assert_eq!(chain.orphan_pool_size(), 1);
}

#[test]
fn near_orphan_requests_light_sync_from_sender() {
    let harness = new_chain();
    let chain = &harness.chain;
    let peer = "peer-7".to_string();

    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));

    // Height gap of 2 from the tail: targeted sync from the sender.
    chain.process_block(block2, false, false, Some(&peer)).unwrap();
    assert_eq!(harness.sync.light_syncs.load(Ordering::SeqCst), 1);
    assert_eq!(harness.sync.full_syncs.load(Ordering::SeqCst), 0);
}

#[test]
fn far_orphan_triggers_full_sync() {
    let harness = new_chain();
    let chain = &harness.chain;
    let peer = "peer-8".to_string();

    // Build a deep chain locally without submitting it, then hand over a
    // block far above the tail.
    let mut parent = chain.genesis();
    for height in 1..=40u32 {
        parent = make_block(&parent, Vec::new(), ts(height, 0));
    }
    chain.process_block(parent, false, false, Some(&peer)).unwrap();
    assert_eq!(harness.sync.light_syncs.load(Ordering::SeqCst), 0);
    assert_eq!(harness.sync.full_syncs.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_orphan_is_discarded() {
    let harness = new_chain();
    let chain = &harness.chain;

    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    // An orphan claiming an impossible height: accepted into the pool, but
    // discarded when its parent connects.
    let mut bad_child = make_block(&block1, Vec::new(), ts(2, 0));
    bad_child.header.height = 9;
    bad_child.txs[0] = coinbase_tx(9, 50 * 100_000_000, script_for(&test_key(5).address));
    bad_child.header.tx_root = chaincore::block::calc_tx_root(&bad_child.txs);

    submit(chain, &bad_child).unwrap();
    assert_eq!(chain.orphan_pool_size(), 1);

    submit(chain, &block1).unwrap();
    assert_eq!(chain.orphan_pool_size(), 0);
    assert_eq!(chain.block_height(), 1);
    assert_eq!(chain.tail_block().block_hash(), block1.block_hash());
}
