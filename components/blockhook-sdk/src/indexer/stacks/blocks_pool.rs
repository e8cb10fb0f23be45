use crate::indexer::{ChainSegment, ChainSegmentDivergence};
use crate::utils::{AbstractBlock, Context};
use blockhook_types::{
    BlockIdentifier, StacksBlockData, StacksBlockUpdate, StacksChainEvent,
    StacksChainUpdatedWithBlocksData, StacksChainUpdatedWithMicroblocksData,
    StacksChainUpdatedWithMicroblocksReorgData, StacksChainUpdatedWithReorgData,
    StacksMicroblockData,
};
use hiro_system_kit::slog;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Depth from the canonical tip at which a Stacks block is buried.
pub const CONFIRMED_SEGMENT_MINIMUM_LENGTH: u64 = 7;

/// Fork tracker over full Stacks blocks. Unlike the Bitcoin pool, blocks are
/// kept whole: the stacks node hands us everything in one POST, and scans
/// reseed the pool with complete blocks after a restart.
pub struct StacksBlockPool {
    canonical_fork_id: usize,
    next_fork_id: usize,
    forks: BTreeMap<usize, ChainSegment>,
    block_store: HashMap<BlockIdentifier, StacksBlockData>,
    orphans: BTreeSet<BlockIdentifier>,
    /// Microblock trails, keyed by anchor block and sequence.
    micro_forks: HashMap<BlockIdentifier, BTreeMap<u64, StacksMicroblockData>>,
    /// Microblocks already delivered through a microblock event while their
    /// anchor was the canonical tip. Kept so anchored confirmation does not
    /// deliver the same transactions twice.
    streamed_microblocks: HashSet<(BlockIdentifier, u64)>,
}

impl StacksBlockPool {
    pub fn new() -> StacksBlockPool {
        StacksBlockPool {
            canonical_fork_id: 0,
            next_fork_id: 1,
            forks: BTreeMap::new(),
            block_store: HashMap::new(),
            orphans: BTreeSet::new(),
            micro_forks: HashMap::new(),
            streamed_microblocks: HashSet::new(),
        }
    }

    /// Loads blocks into the pool without emitting events. Used at boot, with
    /// the unconfirmed blocks checkpointed in the on-disk index.
    pub fn seed_block_pool(&mut self, blocks: Vec<StacksBlockData>, ctx: &Context) {
        let number_of_blocks = blocks.len();
        for block in blocks.into_iter() {
            if self.block_store.contains_key(&block.block_identifier) {
                continue;
            }
            self.block_store
                .insert(block.block_identifier.clone(), block.clone());
            if self.forks.is_empty() {
                let mut segment = ChainSegment::new();
                segment.append_block_identifier(&block.block_identifier);
                self.forks.insert(0, segment);
                self.canonical_fork_id = 0;
                continue;
            }
            if !self.try_attach_block(&block, ctx) {
                self.orphans.insert(block.block_identifier.clone());
            }
        }
        self.elect_canonical_fork();
        ctx.try_log(|logger| {
            slog::info!(logger, "Stacks pool seeded with {} blocks", number_of_blocks)
        });
    }

    pub fn get_canonical_fork(&self) -> Option<&ChainSegment> {
        self.forks.get(&self.canonical_fork_id)
    }

    pub fn get_canonical_tip(&self) -> Option<&BlockIdentifier> {
        self.get_canonical_fork()
            .filter(|fork| !fork.is_empty())
            .map(|fork| fork.get_tip())
    }

    pub fn get_block(&self, block_identifier: &BlockIdentifier) -> Option<&StacksBlockData> {
        self.block_store.get(block_identifier)
    }

    pub fn process_block(
        &mut self,
        block: StacksBlockData,
        ctx: &Context,
    ) -> Result<Option<StacksChainEvent>, String> {
        let block_identifier = block.block_identifier.clone();
        if self.block_store.contains_key(&block_identifier) {
            ctx.try_log(|logger| {
                slog::debug!(logger, "Stacks {} already in pool", block_identifier)
            });
            return Ok(None);
        }
        self.block_store.insert(block_identifier.clone(), block.clone());

        if self.forks.is_empty() {
            let mut genesis_segment = ChainSegment::new();
            genesis_segment.append_block_identifier(&block_identifier);
            self.forks.insert(0, genesis_segment);
            self.canonical_fork_id = 0;
            return Ok(Some(StacksChainEvent::ChainUpdatedWithBlocks(
                StacksChainUpdatedWithBlocksData {
                    new_blocks: vec![self.build_block_update(&block_identifier)],
                    confirmed_blocks: vec![],
                },
            )));
        }

        let previous_canonical = self
            .get_canonical_fork()
            .cloned()
            .ok_or("canonical fork missing from pool")?;

        if !self.try_attach_block(&block, ctx) {
            ctx.try_log(|logger| {
                slog::warn!(
                    logger,
                    "Stacks {} is orphaned, buffering until parent {} shows up",
                    block.block_identifier,
                    block.parent_block_identifier
                )
            });
            self.orphans.insert(block_identifier);
            return Ok(None);
        }
        self.attach_buffered_orphans(ctx);

        self.elect_canonical_fork();
        let canonical = self
            .get_canonical_fork()
            .cloned()
            .ok_or("canonical fork missing from pool")?;

        let ChainSegmentDivergence {
            block_ids_to_rollback,
            block_ids_to_apply,
        } = match canonical.try_identify_divergence(&previous_canonical, false, ctx) {
            Ok(divergence) => divergence,
            Err(_) => {
                // The common ancestor fell below the pool root: the blocks
                // required for the rollback were evicted.
                return Err(format!(
                    "rollback exceeds window: no common ancestor between {} and {} within {} blocks",
                    canonical.get_tip(),
                    previous_canonical.get_tip(),
                    CONFIRMED_SEGMENT_MINIMUM_LENGTH
                ));
            }
        };

        if block_ids_to_rollback.is_empty() && block_ids_to_apply.is_empty() {
            return Ok(None);
        }

        if block_ids_to_rollback.len() as u64 > CONFIRMED_SEGMENT_MINIMUM_LENGTH {
            return Err(format!(
                "rollback exceeds window: fork divergence at {} requires rolling back {} blocks",
                block_ids_to_rollback
                    .last()
                    .map(|b| b.to_string())
                    .unwrap_or_default(),
                block_ids_to_rollback.len()
            ));
        }

        let confirmed_blocks = self.prune_confirmed_segments(ctx);

        let event = if block_ids_to_rollback.is_empty() {
            StacksChainEvent::ChainUpdatedWithBlocks(StacksChainUpdatedWithBlocksData {
                new_blocks: block_ids_to_apply
                    .iter()
                    .map(|id| self.build_block_update(id))
                    .collect(),
                confirmed_blocks,
            })
        } else {
            ctx.try_log(|logger| {
                slog::info!(
                    logger,
                    "Stacks reorg: rolling back {} blocks, applying {} blocks",
                    block_ids_to_rollback.len(),
                    block_ids_to_apply.len()
                )
            });
            StacksChainEvent::ChainUpdatedWithReorg(StacksChainUpdatedWithReorgData {
                blocks_to_rollback: block_ids_to_rollback
                    .iter()
                    .map(|id| self.build_rollback_update(id))
                    .collect(),
                blocks_to_apply: block_ids_to_apply
                    .iter()
                    .map(|id| self.build_block_update(id))
                    .collect(),
                confirmed_blocks,
            })
        };
        Ok(Some(event))
    }

    /// Ingests a microblock trail. New microblocks anchored to the canonical
    /// tip stream out immediately; a sequence collision rolls the stale
    /// suffix back first.
    pub fn process_microblocks(
        &mut self,
        microblocks: Vec<StacksMicroblockData>,
        ctx: &Context,
    ) -> Result<Option<StacksChainEvent>, String> {
        let Some(anchor) = microblocks
            .first()
            .map(|mb| mb.metadata.anchor_block_identifier.clone())
        else {
            return Ok(None);
        };

        let mut new_microblocks = vec![];
        let mut microblocks_to_rollback = vec![];
        let mut trail = self.micro_forks.remove(&anchor).unwrap_or_default();

        for microblock in microblocks.into_iter() {
            let sequence = microblock.block_identifier.index;
            match trail.get(&sequence) {
                Some(known) if known.block_identifier.eq(&microblock.block_identifier) => {
                    continue;
                }
                Some(_) => {
                    // A different microblock at this sequence: the tail of the
                    // trail is being replaced.
                    let stale: Vec<u64> = trail.range(sequence..).map(|(s, _)| *s).collect();
                    for stale_sequence in stale.into_iter() {
                        if let Some(stale_microblock) = trail.remove(&stale_sequence) {
                            if self
                                .streamed_microblocks
                                .remove(&(anchor.clone(), stale_sequence))
                            {
                                microblocks_to_rollback.push(stale_microblock);
                            }
                        }
                    }
                }
                None => {}
            }
            trail.insert(sequence, microblock.clone());
            new_microblocks.push(microblock);
        }
        self.micro_forks.insert(anchor.clone(), trail);

        if new_microblocks.is_empty() && microblocks_to_rollback.is_empty() {
            return Ok(None);
        }

        // Only trails building on the canonical tip stream out; the rest sit
        // in the pool until their anchor wins.
        let anchored_to_canonical_tip = self
            .get_canonical_tip()
            .map(|tip| tip.eq(&anchor))
            .unwrap_or(false);
        if !anchored_to_canonical_tip {
            ctx.try_log(|logger| {
                slog::debug!(
                    logger,
                    "Microblock trail for non-canonical anchor {} buffered",
                    anchor
                )
            });
            return Ok(None);
        }

        for microblock in new_microblocks.iter() {
            self.streamed_microblocks
                .insert((anchor.clone(), microblock.block_identifier.index));
        }

        // Rollback before apply, carried by a single event.
        microblocks_to_rollback.sort_by(|a, b| b.block_identifier.cmp(&a.block_identifier));
        let event = if microblocks_to_rollback.is_empty() {
            StacksChainEvent::ChainUpdatedWithMicroblocks(StacksChainUpdatedWithMicroblocksData {
                new_microblocks,
            })
        } else {
            StacksChainEvent::ChainUpdatedWithMicroblocksReorg(
                StacksChainUpdatedWithMicroblocksReorgData {
                    microblocks_to_rollback,
                    microblocks_to_apply: new_microblocks,
                },
            )
        };
        Ok(Some(event))
    }

    /// Pairs a block with the parent microblocks it confirms (those not yet
    /// streamed) and the streamed ones it leaves unconfirmed.
    fn build_block_update(&mut self, block_identifier: &BlockIdentifier) -> StacksBlockUpdate {
        let block = self
            .block_store
            .get(block_identifier)
            .cloned()
            .expect("block missing from store");
        let mut update = StacksBlockUpdate::new(block);

        let parent = update.block.parent_block_identifier.clone();
        let confirmed_sequence = update
            .block
            .metadata
            .confirm_microblock_identifier
            .as_ref()
            .map(|id| id.index as i128)
            .unwrap_or(-1);

        if let Some(trail) = self.micro_forks.get(&parent) {
            for (sequence, microblock) in trail.iter() {
                let streamed_key = (parent.clone(), *sequence);
                if (*sequence as i128) <= confirmed_sequence {
                    if !self.streamed_microblocks.contains(&streamed_key) {
                        update.parent_microblocks_to_apply.push(microblock.clone());
                    }
                } else if self.streamed_microblocks.contains(&streamed_key) {
                    update
                        .parent_microblocks_to_rollback
                        .push(microblock.clone());
                }
            }
        }
        for microblock in update.parent_microblocks_to_apply.iter() {
            self.streamed_microblocks
                .insert((parent.clone(), microblock.block_identifier.index));
        }
        for microblock in update.parent_microblocks_to_rollback.iter() {
            self.streamed_microblocks
                .remove(&(parent.clone(), microblock.block_identifier.index));
        }
        update
            .parent_microblocks_to_rollback
            .sort_by(|a, b| b.block_identifier.cmp(&a.block_identifier));
        update
    }

    fn build_rollback_update(&self, block_identifier: &BlockIdentifier) -> StacksBlockUpdate {
        let block = self
            .block_store
            .get(block_identifier)
            .cloned()
            .expect("block missing from store");
        StacksBlockUpdate::new(block)
    }

    fn try_attach_block(&mut self, block: &StacksBlockData, ctx: &Context) -> bool {
        let mut attached = false;
        let mut spawned_forks = vec![];
        for (_fork_id, fork) in self.forks.iter_mut() {
            let (appended, new_fork) = fork.try_append_block(block, ctx);
            attached |= appended;
            if let Some(new_fork) = new_fork {
                spawned_forks.push(new_fork);
            }
        }
        for fork in spawned_forks.into_iter() {
            self.forks.insert(self.next_fork_id, fork);
            self.next_fork_id += 1;
        }
        attached
    }

    fn attach_buffered_orphans(&mut self, ctx: &Context) {
        let mut progress = true;
        while progress {
            progress = false;
            let candidates: Vec<BlockIdentifier> = self.orphans.iter().cloned().collect();
            for orphan_id in candidates.into_iter() {
                let Some(block) = self.block_store.get(&orphan_id).cloned() else {
                    self.orphans.remove(&orphan_id);
                    continue;
                };
                if self.try_attach_block(&block, ctx) {
                    ctx.try_log(|logger| {
                        slog::info!(logger, "Stacks orphan {} re-attached", orphan_id)
                    });
                    self.orphans.remove(&orphan_id);
                    progress = true;
                }
            }
        }
    }

    fn elect_canonical_fork(&mut self) {
        let current_len = self
            .forks
            .get(&self.canonical_fork_id)
            .map(|fork| fork.get_length())
            .unwrap_or(0);
        let mut best_id = self.canonical_fork_id;
        let mut best_len = current_len;
        for (fork_id, fork) in self.forks.iter() {
            if fork.get_length() > best_len {
                best_id = *fork_id;
                best_len = fork.get_length();
            } else if fork.get_length() == best_len && *fork_id != best_id {
                // Deterministic tiebreak between two non-canonical twins.
                let candidate_hash = &fork.get_tip().hash;
                let best_hash = self
                    .forks
                    .get(&best_id)
                    .map(|f| f.get_tip().hash.clone())
                    .unwrap_or_default();
                if best_id != self.canonical_fork_id && candidate_hash > &best_hash {
                    best_id = *fork_id;
                }
            }
        }
        self.canonical_fork_id = best_id;
    }

    fn prune_confirmed_segments(&mut self, ctx: &Context) -> Vec<StacksBlockData> {
        // Keep the tip plus one full window below it, so that a reorg of
        // exactly window depth remains resolvable.
        let cut_off = match self.get_canonical_fork() {
            Some(fork) if fork.get_length() > CONFIRMED_SEGMENT_MINIMUM_LENGTH + 1 => fork
                .get_tip()
                .index
                .saturating_sub(CONFIRMED_SEGMENT_MINIMUM_LENGTH),
            _ => return vec![],
        };

        let confirmed_ids = match self.forks.get_mut(&self.canonical_fork_id) {
            Some(fork) => fork.prune_confirmed_blocks(cut_off),
            None => vec![],
        };
        let confirmed_blocks: Vec<StacksBlockData> = confirmed_ids
            .iter()
            .filter_map(|id| self.block_store.get(id).cloned())
            .collect();

        let canonical_fork_id = self.canonical_fork_id;
        self.forks
            .retain(|fork_id, fork| *fork_id == canonical_fork_id || fork.get_tip().index >= cut_off);
        for (fork_id, fork) in self.forks.iter_mut() {
            if *fork_id != canonical_fork_id {
                let _ = fork.prune_confirmed_blocks(cut_off);
            }
        }

        self.orphans.retain(|id| id.index >= cut_off);
        let (forks, orphans) = (&self.forks, &self.orphans);
        self.block_store.retain(|id, _| {
            orphans.contains(id) || forks.values().any(|fork| fork.get_block_id(id).is_some())
        });
        self.micro_forks.retain(|anchor, _| anchor.index >= cut_off);
        self.streamed_microblocks
            .retain(|(anchor, _)| anchor.index >= cut_off);

        if !confirmed_blocks.is_empty() {
            ctx.try_log(|logger| {
                slog::debug!(logger, "Stacks pool root advanced to {}", cut_off)
            });
        }
        confirmed_blocks
    }
}
