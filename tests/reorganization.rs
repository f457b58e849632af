//! Fork choice and reorganization scenarios.

mod common;

use chaincore::constants::INITIAL_SUBSIDY;
use chaincore::error::CoreError;
use chaincore::eventbus::{Event, TOPIC_CHAIN_UPDATE};
use chaincore::types::{Block, OutPoint, Transaction, TxIn, TxOut};

use common::*;

fn drain_updates(rx: &crossbeam_channel::Receiver<Event>) -> Vec<(bool, Block)> {
    let mut updates = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::ChainUpdate { connected, block } = event {
            updates.push((connected, block));
        }
    }
    updates
}

#[test]
fn longer_side_chain_takes_over() {
    let harness = new_chain();
    let chain = &harness.chain;

    // Main chain: G -> 1 -> 2 -> 3.
    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));
    let block3 = make_block(&block2, Vec::new(), ts(3, 0));
    for block in [&block1, &block2, &block3] {
        submit(chain, block).unwrap();
    }

    // Side chain rooted at 1: 2' -> 3' -> 4'.
    let side2 = make_block(&block1, Vec::new(), ts(2, 7));
    let side3 = make_block(&side2, Vec::new(), ts(3, 7));
    let side4 = make_block(&side3, Vec::new(), ts(4, 7));

    // Not longer than the main chain: stored without reorganization.
    submit(chain, &side2).unwrap();
    submit(chain, &side3).unwrap();
    assert_eq!(chain.block_height(), 3);
    assert_eq!(chain.tail_block().block_hash(), block3.block_hash());

    let updates_rx = harness.bus.subscribe(TOPIC_CHAIN_UPDATE);

    // The fourth side block tips the balance.
    submit(chain, &side4).unwrap();
    assert_eq!(chain.block_height(), 4);
    assert_eq!(chain.tail_block().block_hash(), side4.block_hash());

    // Detach events tip-first, then attach events fork-first.
    let updates = drain_updates(&updates_rx);
    let expected = [
        (false, block3.block_hash()),
        (false, block2.block_hash()),
        (true, side2.block_hash()),
        (true, side3.block_hash()),
        (true, side4.block_hash()),
    ];
    assert_eq!(updates.len(), expected.len());
    for ((connected, block), (expected_connected, expected_hash)) in
        updates.iter().zip(expected.iter())
    {
        assert_eq!(connected, expected_connected);
        assert_eq!(block.block_hash(), *expected_hash);
    }

    // The canonical height index follows the new chain.
    assert_eq!(chain.load_block_by_height(2).unwrap().block_hash(), side2.block_hash());
    assert_eq!(chain.load_block_by_height(3).unwrap().block_hash(), side3.block_hash());
    assert_eq!(chain.load_block_by_height(4).unwrap().block_hash(), side4.block_hash());

    // The bloom holder was truncated and re-extended to the new tip.
    assert_eq!(chain.bloom_filter_count(), 4);

    // Detached blocks fall out of the canonical indices.
    assert_eq!(chain.load_block_by_hash(&block3.block_hash()), Err(CoreError::BlockNotFound));
}

#[test]
fn reorganized_store_matches_a_fresh_replay() {
    let harness = new_chain();
    let chain = &harness.chain;

    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));
    let block3 = make_block(&block2, Vec::new(), ts(3, 0));
    let side2 = make_block(&block1, Vec::new(), ts(2, 7));
    let side3 = make_block(&side2, Vec::new(), ts(3, 7));
    let side4 = make_block(&side3, Vec::new(), ts(4, 7));

    for block in [&block1, &block2, &block3, &side2, &side3, &side4] {
        submit(chain, block).unwrap();
    }
    assert_eq!(chain.tail_block().block_hash(), side4.block_hash());

    // Replay only the winning chain on a fresh store.
    let fresh = new_chain();
    for block in [&block1, &side2, &side3, &side4] {
        submit(&fresh.chain, block).unwrap();
    }

    // Bloom filter records carry per-instance hash keys; everything else
    // must be byte-identical.
    let reorged: Vec<_> = harness
        .db
        .snapshot()
        .into_iter()
        .filter(|(key, _)| !key.starts_with(b"F|"))
        .collect();
    let replayed: Vec<_> = fresh
        .db
        .snapshot()
        .into_iter()
        .filter(|(key, _)| !key.starts_with(b"F|"))
        .collect();
    assert_eq!(reorged, replayed);
}

#[test]
fn double_spend_across_fork_flips_the_winner() {
    let harness = new_chain();
    let chain = &harness.chain;
    let alice = test_key(1);
    let bob = test_key(2);
    let carol = test_key(3);
    let miner = test_key(0xAA);

    let block1 = make_block(
        &chain.genesis(),
        vec![coinbase_tx(1, INITIAL_SUBSIDY, script_for(&alice.address))],
        ts(1, 0),
    );
    submit(chain, &block1).unwrap();
    let funding = OutPoint::new(block1.txs[0].hash(), 0);
    let tip = mine_filler_blocks(chain, &block1, 100, &miner.address);

    let spend_to = |recipient: &TestKey| {
        let mut tx = Transaction {
            version: 1,
            vin: vec![TxIn {
                prev_outpoint: funding.clone(),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: INITIAL_SUBSIDY,
                script_pubkey: script_for(&recipient.address),
            }],
            lock_time: 0,
        };
        sign_input(&mut tx, 0, &script_for(&alice.address), &alice);
        tx
    };

    // Main block 102 pays Bob.
    let tx_bob = spend_to(&bob);
    let main102 = make_block(
        &tip,
        vec![coinbase_tx(102, INITIAL_SUBSIDY, script_for(&miner.address)), tx_bob.clone()],
        ts(102, 0),
    );
    submit(chain, &main102).unwrap();
    assert_eq!(balance(chain, &bob.address), INITIAL_SUBSIDY);
    assert_eq!(chain.load_tx_by_hash(&tx_bob.hash()).unwrap(), tx_bob);

    // Side blocks 102' and 103' spend the same outpoint to Carol.
    let tx_carol = spend_to(&carol);
    let side102 = make_block(
        &tip,
        vec![coinbase_tx(102, INITIAL_SUBSIDY, script_for(&miner.address)), tx_carol.clone()],
        ts(102, 7),
    );
    let side103 = make_block(&side102, Vec::new(), ts(103, 7));
    submit(chain, &side102).unwrap();
    submit(chain, &side103).unwrap();

    assert_eq!(chain.block_height(), 103);
    assert_eq!(chain.tail_block().block_hash(), side103.block_hash());

    // The outpoint now resolves to the side-chain spend.
    assert_eq!(balance(chain, &bob.address), 0);
    assert_eq!(balance(chain, &carol.address), INITIAL_SUBSIDY);
    assert_eq!(chain.load_tx_by_hash(&tx_bob.hash()), Err(CoreError::TxIndexNotFound));
    assert_eq!(chain.load_tx_by_hash(&tx_carol.hash()).unwrap(), tx_carol);
}

#[test]
fn reorg_through_orphan_resolution() {
    let harness = new_chain();
    let chain = &harness.chain;

    let block1 = make_block(&chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));
    submit(chain, &block1).unwrap();
    submit(chain, &block2).unwrap();

    let side2 = make_block(&block1, Vec::new(), ts(2, 7));
    let side3 = make_block(&side2, Vec::new(), ts(3, 7));

    // The longer side tip arrives first and orphans; its parent completes
    // the side chain and triggers the reorganization on drain.
    submit(chain, &side3).unwrap();
    assert_eq!(chain.orphan_pool_size(), 1);
    submit(chain, &side2).unwrap();

    assert_eq!(chain.orphan_pool_size(), 0);
    assert_eq!(chain.block_height(), 3);
    assert_eq!(chain.tail_block().block_hash(), side3.block_hash());
}
