use blockhook_types::{
    BlockHeader, BlockIdentifier, StacksBlockData, StacksBlockMetadata, StacksMicroblockData,
    StacksMicroblockMetadata,
};

pub fn block_id(index: u64, fork: char) -> BlockIdentifier {
    BlockIdentifier {
        index,
        hash: format!("0x{:02x}{:02x}", fork as u8, index),
    }
}

/// Deterministic header generator: `fork` names the lineage, `parent_fork`
/// the lineage the parent belongs to, so forks can branch off one another.
pub fn bitcoin_header(index: u64, fork: char, parent_fork: char) -> BlockHeader {
    BlockHeader {
        block_identifier: block_id(index, fork),
        parent_block_identifier: block_id(index.saturating_sub(1), parent_fork),
    }
}

pub fn stacks_block(
    index: u64,
    fork: char,
    parent_fork: char,
    confirms_microblock_sequence: Option<u64>,
) -> StacksBlockData {
    let parent = block_id(index.saturating_sub(1), parent_fork);
    StacksBlockData {
        block_identifier: block_id(index, fork),
        parent_block_identifier: parent.clone(),
        timestamp: index as i64,
        transactions: vec![],
        metadata: StacksBlockMetadata {
            bitcoin_anchor_block_identifier: block_id(index, 'x'),
            pox_cycle_index: 0,
            pox_cycle_position: 0,
            pox_cycle_length: 10,
            confirm_microblock_identifier: confirms_microblock_sequence
                .map(|sequence| microblock_id(sequence, parent.index, parent_fork)),
            stacks_block_hash: format!("0x{:02x}{:02x}", fork as u8, index),
            tenure_height: None,
            block_time: None,
            signer_bitvec: None,
            signer_signature: None,
            cycle_number: None,
            reward_set: None,
        },
    }
}

fn microblock_id(sequence: u64, anchor_index: u64, anchor_fork: char) -> BlockIdentifier {
    BlockIdentifier {
        index: sequence,
        hash: format!("0xmb{:02x}{:02x}{:02x}", anchor_fork as u8, anchor_index, sequence),
    }
}

pub fn stacks_microblock(sequence: u64, anchor_index: u64, anchor_fork: char) -> StacksMicroblockData {
    let block_identifier = microblock_id(sequence, anchor_index, anchor_fork);
    let parent_block_identifier = if sequence > 0 {
        microblock_id(sequence - 1, anchor_index, anchor_fork)
    } else {
        block_identifier.clone()
    };
    StacksMicroblockData {
        block_identifier,
        parent_block_identifier,
        timestamp: 0,
        transactions: vec![],
        metadata: StacksMicroblockMetadata {
            anchor_block_identifier: block_id(anchor_index, anchor_fork),
        },
    }
}
