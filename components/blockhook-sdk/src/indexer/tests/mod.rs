pub mod helpers;

use self::helpers::{bitcoin_header, stacks_block, stacks_microblock};
use super::bitcoin::blocks_pool::BitcoinBlockPool;
use super::stacks::blocks_pool::StacksBlockPool;
use crate::utils::Context;
use blockhook_types::{BlockchainEvent, StacksChainEvent};

#[test]
fn sequential_headers_emit_apply_events() {
    let mut pool = BitcoinBlockPool::new();
    for index in 1..=5 {
        let event = pool
            .process_header(bitcoin_header(index, 'a', 'a'), &Context::empty())
            .unwrap()
            .expect("expected chain event");
        match event {
            BlockchainEvent::BlockchainUpdatedWithHeaders(data) => {
                assert_eq!(data.new_headers.len(), 1);
                assert_eq!(data.new_headers[0].block_identifier.index, index);
            }
            BlockchainEvent::BlockchainUpdatedWithReorg(_) => {
                panic!("unexpected reorg while building a single lineage")
            }
        }
    }
    assert_eq!(pool.get_canonical_tip().unwrap().index, 5);
}

#[test]
fn ingesting_the_same_header_twice_only_emits_once() {
    let mut pool = BitcoinBlockPool::new();
    let event = pool
        .process_header(bitcoin_header(1, 'a', 'a'), &Context::empty())
        .unwrap();
    assert!(event.is_some());
    let replayed = pool
        .process_header(bitcoin_header(1, 'a', 'a'), &Context::empty())
        .unwrap();
    assert!(replayed.is_none());
    let replayed = pool
        .process_header(bitcoin_header(1, 'a', 'a'), &Context::empty())
        .unwrap();
    assert!(replayed.is_none());
}

#[test]
fn orphaned_header_is_buffered_until_parent_shows_up() {
    let mut pool = BitcoinBlockPool::new();
    let _ = pool.process_header(bitcoin_header(1, 'a', 'a'), &Context::empty());
    // Block 3 arrives before block 2.
    let event = pool
        .process_header(bitcoin_header(3, 'a', 'a'), &Context::empty())
        .unwrap();
    assert!(event.is_none());
    // Block 2 unlocks both.
    let event = pool
        .process_header(bitcoin_header(2, 'a', 'a'), &Context::empty())
        .unwrap()
        .expect("expected chain event");
    match event {
        BlockchainEvent::BlockchainUpdatedWithHeaders(data) => {
            let applied: Vec<u64> = data
                .new_headers
                .iter()
                .map(|h| h.block_identifier.index)
                .collect();
            assert_eq!(applied, vec![2, 3]);
        }
        _ => panic!("expected headers event"),
    }
}

#[test]
fn equal_length_fork_does_not_displace_canonical_tip() {
    let mut pool = BitcoinBlockPool::new();
    for index in 1..=3 {
        let _ = pool.process_header(bitcoin_header(index, 'a', 'a'), &Context::empty());
    }
    // Competing blocks at height 2 and 3, forking off block 1.
    let event = pool
        .process_header(bitcoin_header(2, 'b', 'a'), &Context::empty())
        .unwrap();
    assert!(event.is_none());
    let event = pool
        .process_header(bitcoin_header(3, 'b', 'b'), &Context::empty())
        .unwrap();
    assert!(event.is_none());
    assert_eq!(pool.get_canonical_tip().unwrap().hash, "0x6103");
}

#[test]
fn longer_fork_triggers_rollback_then_apply() {
    let mut pool = BitcoinBlockPool::new();
    for index in 1..=3 {
        let _ = pool.process_header(bitcoin_header(index, 'a', 'a'), &Context::empty());
    }
    let _ = pool.process_header(bitcoin_header(2, 'b', 'a'), &Context::empty());
    let _ = pool.process_header(bitcoin_header(3, 'b', 'b'), &Context::empty());
    // The fourth block tips the balance in favor of the b lineage.
    let event = pool
        .process_header(bitcoin_header(4, 'b', 'b'), &Context::empty())
        .unwrap()
        .expect("expected chain event");
    match event {
        BlockchainEvent::BlockchainUpdatedWithReorg(data) => {
            let rolled_back: Vec<u64> = data
                .headers_to_rollback
                .iter()
                .map(|h| h.block_identifier.index)
                .collect();
            let applied: Vec<u64> = data
                .headers_to_apply
                .iter()
                .map(|h| h.block_identifier.index)
                .collect();
            // Rollback is tip to base, apply is base to tip.
            assert_eq!(rolled_back, vec![3, 2]);
            assert_eq!(applied, vec![2, 3, 4]);
        }
        _ => panic!("expected reorg event"),
    }
    assert_eq!(pool.get_canonical_tip().unwrap().index, 4);
}

#[test]
fn blocks_buried_beyond_the_window_are_confirmed_and_evicted() {
    let mut pool = BitcoinBlockPool::new();
    let mut confirmed = vec![];
    for index in 1..=10 {
        if let Some(BlockchainEvent::BlockchainUpdatedWithHeaders(data)) = pool
            .process_header(bitcoin_header(index, 'a', 'a'), &Context::empty())
            .unwrap()
        {
            confirmed.extend(
                data.confirmed_headers
                    .iter()
                    .map(|h| h.block_identifier.index),
            );
        }
    }
    // With a window of 7, the tip at 10 keeps 3..=10; 1 and 2 are buried.
    assert_eq!(confirmed, vec![1, 2]);
}

#[test]
fn reorg_of_exactly_window_depth_is_permitted() {
    let mut pool = BitcoinBlockPool::new();
    // Canonical lineage up to 9: after pruning, the segment spans 2..=9.
    for index in 1..=9 {
        let _ = pool.process_header(bitcoin_header(index, 'a', 'a'), &Context::empty());
    }
    // Competing lineage forking at 2, growing to 10: rolling back 3..=9 (7
    // blocks) is the deepest reorg the window allows.
    let _ = pool.process_header(bitcoin_header(3, 'b', 'a'), &Context::empty());
    for index in 4..=9 {
        let _ = pool.process_header(bitcoin_header(index, 'b', 'b'), &Context::empty());
    }
    let event = pool
        .process_header(bitcoin_header(10, 'b', 'b'), &Context::empty())
        .unwrap()
        .expect("expected chain event");
    match event {
        BlockchainEvent::BlockchainUpdatedWithReorg(data) => {
            assert_eq!(data.headers_to_rollback.len(), 7);
            assert_eq!(data.headers_to_apply.len(), 8);
        }
        _ => panic!("expected reorg event"),
    }
}

#[test]
fn reorg_deeper_than_window_is_fatal() {
    let mut pool = BitcoinBlockPool::new();
    // Build both lineages side by side, then extend the canonical one far
    // enough for the fork point to fall below the pool root.
    for index in 1..=5 {
        let _ = pool.process_header(bitcoin_header(index, 'a', 'a'), &Context::empty());
    }
    let _ = pool.process_header(bitcoin_header(2, 'b', 'a'), &Context::empty());
    for index in 3..=5 {
        let _ = pool.process_header(bitcoin_header(index, 'b', 'b'), &Context::empty());
    }
    for index in 6..=10 {
        let _ = pool.process_header(bitcoin_header(index, 'a', 'a'), &Context::empty());
    }
    // The b lineage overtakes: its common ancestor (block 1) was evicted.
    for index in 6..=10 {
        let _ = pool.process_header(bitcoin_header(index, 'b', 'b'), &Context::empty());
    }
    let res = pool.process_header(bitcoin_header(11, 'b', 'b'), &Context::empty());
    let error = res.expect_err("expected fatal pool error");
    assert!(error.contains("rollback exceeds window"), "{}", error);
}

#[test]
fn stacks_blocks_emit_block_updates() {
    let mut pool = StacksBlockPool::new();
    for index in 1..=3 {
        let event = pool
            .process_block(stacks_block(index, 'a', 'a', None), &Context::empty())
            .unwrap()
            .expect("expected chain event");
        match event {
            StacksChainEvent::ChainUpdatedWithBlocks(data) => {
                assert_eq!(data.new_blocks.len(), 1);
                assert_eq!(data.new_blocks[0].block.block_identifier.index, index);
            }
            _ => panic!("unexpected event while building a single lineage"),
        }
    }
}

#[test]
fn stacks_longer_fork_triggers_rollback_then_apply() {
    let mut pool = StacksBlockPool::new();
    for index in 1..=3 {
        let _ = pool.process_block(stacks_block(index, 'a', 'a', None), &Context::empty());
    }
    let _ = pool.process_block(stacks_block(2, 'b', 'a', None), &Context::empty());
    let _ = pool.process_block(stacks_block(3, 'b', 'b', None), &Context::empty());
    let event = pool
        .process_block(stacks_block(4, 'b', 'b', None), &Context::empty())
        .unwrap()
        .expect("expected chain event");
    match event {
        StacksChainEvent::ChainUpdatedWithReorg(data) => {
            let rolled_back: Vec<u64> = data
                .blocks_to_rollback
                .iter()
                .map(|u| u.block.block_identifier.index)
                .collect();
            let applied: Vec<u64> = data
                .blocks_to_apply
                .iter()
                .map(|u| u.block.block_identifier.index)
                .collect();
            assert_eq!(rolled_back, vec![3, 2]);
            assert_eq!(applied, vec![2, 3, 4]);
        }
        _ => panic!("expected reorg event"),
    }
}

#[test]
fn microblocks_anchored_to_tip_stream_once() {
    let mut pool = StacksBlockPool::new();
    let _ = pool.process_block(stacks_block(1, 'a', 'a', None), &Context::empty());

    let trail = vec![
        stacks_microblock(0, 1, 'a'),
        stacks_microblock(1, 1, 'a'),
    ];
    let event = pool
        .process_microblocks(trail.clone(), &Context::empty())
        .unwrap()
        .expect("expected microblock event");
    match event {
        StacksChainEvent::ChainUpdatedWithMicroblocks(data) => {
            assert_eq!(data.new_microblocks.len(), 2);
        }
        _ => panic!("expected microblocks event"),
    }

    // Replaying the same trail is idempotent.
    let replayed = pool.process_microblocks(trail, &Context::empty()).unwrap();
    assert!(replayed.is_none());
}

#[test]
fn anchored_block_rolls_back_streamed_microblocks_it_does_not_confirm() {
    let mut pool = StacksBlockPool::new();
    let _ = pool.process_block(stacks_block(1, 'a', 'a', None), &Context::empty());
    let _ = pool.process_microblocks(
        vec![stacks_microblock(0, 1, 'a'), stacks_microblock(1, 1, 'a')],
        &Context::empty(),
    );

    // Block 2 confirms the trail only up to sequence 0.
    let event = pool
        .process_block(stacks_block(2, 'a', 'a', Some(0)), &Context::empty())
        .unwrap()
        .expect("expected chain event");
    match event {
        StacksChainEvent::ChainUpdatedWithBlocks(data) => {
            let update = &data.new_blocks[0];
            // Sequence 0 was already streamed; only sequence 1 moves, to the
            // rollback side.
            assert!(update.parent_microblocks_to_apply.is_empty());
            assert_eq!(update.parent_microblocks_to_rollback.len(), 1);
            assert_eq!(
                update.parent_microblocks_to_rollback[0].block_identifier.index,
                1
            );
        }
        _ => panic!("expected blocks event"),
    }
}
