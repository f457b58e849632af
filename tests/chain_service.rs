//! The bounded processing loop and its peer-scoring side effects.

mod common;

use std::time::Duration;

use chaincore::chain::{BlockMessage, ChainService};
use chaincore::codec::Codec;
use chaincore::config::ChainConfig;
use chaincore::eventbus::{Event, PeerBehavior, TOPIC_CONN_EVENT};

use common::*;

fn wait_for_height(chain: &chaincore::chain::BlockChain, height: u32) {
    for _ in 0..200 {
        if chain.block_height() >= height {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("chain never reached height {height}");
}

#[test]
fn inbound_blocks_connect_and_score_the_sender() {
    let harness = new_chain();
    let conn_rx = harness.bus.subscribe(TOPIC_CONN_EVENT);
    let (service, handles) = ChainService::new(harness.chain.clone(), &ChainConfig::default());
    let worker = service.spawn();

    let block1 = make_block(&harness.chain.genesis(), Vec::new(), ts(1, 0));
    let body = block1.encode().unwrap();
    assert!(handles.blocks.send(BlockMessage { from: Some("peer-1".into()), body }));

    wait_for_height(&harness.chain, 1);
    let event = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    match event {
        Event::ConnEvent { peer, behavior } => {
            assert_eq!(peer, "peer-1");
            assert_eq!(behavior, PeerBehavior::NewBlock);
        }
        other => panic!("unexpected event {other:?}"),
    }

    handles.shutdown.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
fn malformed_payload_scores_bad_block() {
    let harness = new_chain();
    let conn_rx = harness.bus.subscribe(TOPIC_CONN_EVENT);
    let (service, handles) = ChainService::new(harness.chain.clone(), &ChainConfig::default());
    let worker = service.spawn();

    assert!(handles
        .blocks
        .send(BlockMessage { from: Some("peer-2".into()), body: vec![0xde, 0xad] }));

    let event = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    match event {
        Event::ConnEvent { peer, behavior } => {
            assert_eq!(peer, "peer-2");
            assert_eq!(behavior, PeerBehavior::BadBlock);
        }
        other => panic!("unexpected event {other:?}"),
    }

    handles.shutdown.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
fn invalid_block_scores_bad_block() {
    let harness = new_chain();
    let conn_rx = harness.bus.subscribe(TOPIC_CONN_EVENT);
    let (service, handles) = ChainService::new(harness.chain.clone(), &ChainConfig::default());
    let worker = service.spawn();

    // Corrupt the transaction-root commitment.
    let mut block1 = make_block(&harness.chain.genesis(), Vec::new(), ts(1, 0));
    block1.header.tx_root = [0xAB; 32];
    assert!(handles
        .blocks
        .send(BlockMessage { from: Some("peer-3".into()), body: block1.encode().unwrap() }));

    let event = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    match event {
        Event::ConnEvent { peer, behavior } => {
            assert_eq!(peer, "peer-3");
            assert_eq!(behavior, PeerBehavior::BadBlock);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(harness.chain.block_height(), 0);

    handles.shutdown.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
fn eternal_notifications_advance_the_pointer() {
    let harness = new_chain();
    let miner = test_key(0xAA);
    let tip = mine_filler_blocks(&harness.chain, &harness.chain.genesis(), 2, &miner.address);

    let (service, handles) = ChainService::new(harness.chain.clone(), &ChainConfig::default());
    let worker = service.spawn();

    handles.eternal.send(tip.clone());
    for _ in 0..200 {
        if harness.chain.eternal_block().block_hash() == tip.block_hash() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(harness.chain.eternal_block().block_hash(), tip.block_hash());

    handles.shutdown.send(()).unwrap();
    worker.join().unwrap();
}

#[test]
fn shutdown_drains_queued_blocks() {
    let harness = new_chain();
    let (service, handles) = ChainService::new(harness.chain.clone(), &ChainConfig::default());

    // Queue a short chain before the worker even starts, then shut down.
    let block1 = make_block(&harness.chain.genesis(), Vec::new(), ts(1, 0));
    let block2 = make_block(&block1, Vec::new(), ts(2, 0));
    for block in [&block1, &block2] {
        assert!(handles.blocks.send(BlockMessage { from: None, body: block.encode().unwrap() }));
    }
    handles.shutdown.send(()).unwrap();

    let worker = service.spawn();
    worker.join().unwrap();
    assert_eq!(harness.chain.block_height(), 2);
}

#[test]
fn overflowing_channel_drops_newest_and_counts() {
    let harness = new_chain();
    let mut config = ChainConfig::default();
    config.block_channel_size = 2;
    let (service, handles) = ChainService::new(harness.chain.clone(), &config);

    // Without a running consumer the third message overflows.
    for _ in 0..2 {
        assert!(handles.blocks.send(BlockMessage { from: None, body: Vec::new() }));
    }
    assert!(!handles.blocks.send(BlockMessage { from: None, body: Vec::new() }));
    assert_eq!(handles.blocks.dropped_count(), 1);
    drop(service);
}
