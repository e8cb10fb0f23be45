pub mod bitcoin;
pub mod stacks;

use crate::utils::{AbstractBlock, Context};

use blockhook_types::{
    BitcoinBlockSignaling, BitcoinNetwork, BlockHeader, BlockIdentifier, BlockchainEvent,
    StacksBlockData, StacksChainEvent, StacksNetwork, StacksNodeConfig,
};
use hiro_system_kit::slog;
use rocket::serde::json::Value as JsonValue;

use std::collections::VecDeque;

use self::bitcoin::blocks_pool::BitcoinBlockPool;
use self::stacks::blocks_pool::StacksBlockPool;
use self::stacks::{PoxInfo, StacksChainContext};

#[derive(Deserialize, Debug, Clone, Default)]
pub struct AssetClassCache {
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexerConfig {
    pub bitcoin_network: BitcoinNetwork,
    pub stacks_network: StacksNetwork,
    pub bitcoind_rpc_url: String,
    pub bitcoind_rpc_username: String,
    pub bitcoind_rpc_password: String,
    pub bitcoin_block_signaling: BitcoinBlockSignaling,
}

impl IndexerConfig {
    pub fn get_stacks_node_config(&self) -> &StacksNodeConfig {
        match self.bitcoin_block_signaling {
            BitcoinBlockSignaling::Stacks(ref config) => config,
            _ => unreachable!(),
        }
    }
}

/// One fork tracker per chain, behind a single facade owned by the ingestion
/// server.
pub struct Indexer {
    pub config: IndexerConfig,
    stacks_blocks_pool: StacksBlockPool,
    bitcoin_blocks_pool: BitcoinBlockPool,
    pub stacks_context: StacksChainContext,
}

impl Indexer {
    pub fn new(config: IndexerConfig) -> Indexer {
        let stacks_blocks_pool = StacksBlockPool::new();
        let bitcoin_blocks_pool = BitcoinBlockPool::new();
        let stacks_context = StacksChainContext::new(&config.stacks_network);

        Indexer {
            config,
            stacks_blocks_pool,
            bitcoin_blocks_pool,
            stacks_context,
        }
    }

    pub fn seed_stacks_block_pool(&mut self, blocks: Vec<StacksBlockData>, ctx: &Context) {
        self.stacks_blocks_pool.seed_block_pool(blocks, ctx);
    }

    pub fn handle_bitcoin_header(
        &mut self,
        header: BlockHeader,
        ctx: &Context,
    ) -> Result<Option<BlockchainEvent>, String> {
        self.bitcoin_blocks_pool.process_header(header, ctx)
    }

    pub fn handle_stacks_serialized_block(
        &mut self,
        serialized_block: &str,
        ctx: &Context,
    ) -> Result<Option<StacksChainEvent>, String> {
        let block = stacks::standardize_stacks_serialized_block(
            &self.config,
            serialized_block,
            &mut self.stacks_context,
            ctx,
        )?;
        self.stacks_blocks_pool.process_block(block, ctx)
    }

    pub fn handle_stacks_marshalled_block(
        &mut self,
        marshalled_block: JsonValue,
        ctx: &Context,
    ) -> Result<Option<StacksChainEvent>, String> {
        let block = stacks::standardize_stacks_marshalled_block(
            &self.config,
            marshalled_block,
            &mut self.stacks_context,
            ctx,
        )?;
        self.stacks_blocks_pool.process_block(block, ctx)
    }

    pub fn handle_stacks_marshalled_microblock_trail(
        &mut self,
        marshalled_microblock: JsonValue,
        ctx: &Context,
    ) -> Result<Option<StacksChainEvent>, String> {
        let microblocks = stacks::standardize_stacks_marshalled_microblock_trail(
            &self.config,
            marshalled_microblock,
            &mut self.stacks_context,
            ctx,
        )?;
        self.stacks_blocks_pool.process_microblocks(microblocks, ctx)
    }

    pub fn get_pox_info(&self) -> PoxInfo {
        self.stacks_context.pox_info.clone()
    }
}

#[derive(Clone, Debug)]
pub enum ChainSegmentIncompatibility {
    OutdatedBlock,
    OutdatedSegment,
    BlockCollision,
    ParentBlockUnknown,
    AlreadyPresent,
    Unknown,
}

#[derive(Debug)]
pub struct ChainSegmentDivergence {
    pub block_ids_to_apply: Vec<BlockIdentifier>,
    pub block_ids_to_rollback: Vec<BlockIdentifier>,
}

/// A single linear fork, most recent block first. Both pools keep one
/// canonical segment plus a short list of competing segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSegment {
    pub block_ids: VecDeque<BlockIdentifier>,
}

impl ChainSegment {
    pub fn new() -> ChainSegment {
        ChainSegment {
            block_ids: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    pub fn get_tip(&self) -> &BlockIdentifier {
        self.block_ids
            .front()
            .expect("chain segment unexpectedly empty")
    }

    pub fn get_length(&self) -> u64 {
        self.block_ids.len() as u64
    }

    pub fn append_block_identifier(&mut self, block_identifier: &BlockIdentifier) {
        self.block_ids.push_front(block_identifier.clone());
    }

    /// Offset of the given height from the segment tip, if the height falls
    /// within the segment.
    fn get_relative_index(&self, block_identifier: &BlockIdentifier) -> Option<usize> {
        let tip = self.block_ids.front()?;
        if block_identifier.index > tip.index {
            return None;
        }
        let offset = (tip.index - block_identifier.index) as usize;
        if offset >= self.block_ids.len() {
            return None;
        }
        Some(offset)
    }

    pub fn get_block_id(&self, block_identifier: &BlockIdentifier) -> Option<&BlockIdentifier> {
        let offset = self.get_relative_index(block_identifier)?;
        self.block_ids.get(offset)
    }

    fn can_append_block(
        &self,
        block: &dyn AbstractBlock,
    ) -> Result<(), ChainSegmentIncompatibility> {
        let tip = match self.block_ids.front() {
            Some(tip) => tip,
            None => return Ok(()),
        };
        if block.get_identifier().index > tip.index + 1 {
            // A gap between the block and this segment: the segment lost the
            // race or the block's ancestors are still in flight.
            return Err(ChainSegmentIncompatibility::OutdatedSegment);
        }
        if tip.index == block.get_parent_identifier().index {
            return match tip.hash == block.get_parent_identifier().hash {
                true => Ok(()),
                false => Err(ChainSegmentIncompatibility::ParentBlockUnknown),
            };
        }
        if let Some(colliding_block) = self.get_block_id(block.get_identifier()) {
            return match colliding_block.eq(block.get_identifier()) {
                true => Err(ChainSegmentIncompatibility::AlreadyPresent),
                false => Err(ChainSegmentIncompatibility::BlockCollision),
            };
        }
        Err(ChainSegmentIncompatibility::Unknown)
    }

    /// Truncates the segment from its tip down to the given block, which
    /// becomes the new tip. Returns whether the block was found.
    pub fn keep_blocks_from_oldest_to_block_identifier(
        &mut self,
        block_identifier: &BlockIdentifier,
    ) -> bool {
        while let Some(tip) = self.block_ids.pop_front() {
            if tip.eq(block_identifier) {
                self.block_ids.push_front(tip);
                return true;
            }
        }
        false
    }

    /// Tries to append the block to this segment. On a mid-segment collision,
    /// a new fork sharing the ancestors up to the block's parent is returned
    /// instead.
    pub fn try_append_block(
        &mut self,
        block: &dyn AbstractBlock,
        ctx: &Context,
    ) -> (bool, Option<ChainSegment>) {
        match self.can_append_block(block) {
            Ok(()) => {
                self.append_block_identifier(block.get_identifier());
                (true, None)
            }
            Err(ChainSegmentIncompatibility::BlockCollision) => {
                let mut fork = self.clone();
                if fork.keep_blocks_from_oldest_to_block_identifier(block.get_parent_identifier()) {
                    fork.append_block_identifier(block.get_identifier());
                    ctx.try_log(|logger| {
                        slog::info!(logger, "Forking with {}: {}", block.get_identifier(), fork)
                    });
                    (true, Some(fork))
                } else {
                    (false, None)
                }
            }
            Err(_incompatibility) => (false, None),
        }
    }

    /// Walks both segments back to their lowest common ancestor. Rollbacks
    /// come from `other_segment` (canonical), tip to base; applies come from
    /// `self` (the candidate), base to tip. The common ancestor belongs to
    /// neither list.
    pub fn try_identify_divergence(
        &self,
        other_segment: &ChainSegment,
        allow_reset: bool,
        ctx: &Context,
    ) -> Result<ChainSegmentDivergence, ChainSegmentIncompatibility> {
        let mut common_root = None;
        let mut block_ids_to_rollback = vec![];
        let mut block_ids_to_apply = vec![];
        for canonical_cursor in other_segment.block_ids.iter() {
            block_ids_to_apply.clear();
            for candidate_cursor in self.block_ids.iter() {
                if candidate_cursor.eq(canonical_cursor) {
                    common_root = Some(candidate_cursor.clone());
                    break;
                }
                block_ids_to_apply.push(candidate_cursor.clone());
            }
            if common_root.is_some() {
                break;
            }
            block_ids_to_rollback.push(canonical_cursor.clone());
        }
        block_ids_to_apply.reverse();
        ctx.try_log(|logger| {
            slog::debug!(
                logger,
                "Divergence identified: rollback {:?}, apply {:?}",
                block_ids_to_rollback,
                block_ids_to_apply
            )
        });
        match common_root.take() {
            Some(_) => Ok(ChainSegmentDivergence {
                block_ids_to_rollback,
                block_ids_to_apply,
            }),
            None if allow_reset => Ok(ChainSegmentDivergence {
                block_ids_to_rollback,
                block_ids_to_apply,
            }),
            None => Err(ChainSegmentIncompatibility::Unknown),
        }
    }

    /// Drops every block strictly below the cut-off height and returns the
    /// dropped identifiers, oldest first.
    pub fn prune_confirmed_blocks(&mut self, cut_off: u64) -> Vec<BlockIdentifier> {
        let mut pruned = vec![];
        while let Some(oldest) = self.block_ids.back() {
            if oldest.index >= cut_off {
                break;
            }
            if let Some(id) = self.block_ids.pop_back() {
                pruned.push(id);
            }
        }
        pruned
    }
}

impl std::fmt::Display for ChainSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Fork [{}], height = {}",
            self.block_ids
                .iter()
                .map(|b| format!("{}", b))
                .collect::<Vec<_>>()
                .join(", "),
            self.get_length()
        )
    }
}

#[cfg(test)]
pub mod tests;
