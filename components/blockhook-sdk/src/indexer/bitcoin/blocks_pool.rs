use crate::indexer::{ChainSegment, ChainSegmentDivergence};
use crate::utils::{AbstractBlock, Context};
use blockhook_types::{
    BlockHeader, BlockIdentifier, BlockchainEvent, BlockchainUpdatedWithHeaders,
    BlockchainUpdatedWithReorg,
};
use hiro_system_kit::slog;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Depth from the canonical tip at which a block is considered buried. A
/// divergence deeper than this is a fatal pool error: the blocks required to
/// roll back were already evicted.
pub const CONFIRMED_SEGMENT_MINIMUM_LENGTH: u64 = 7;

/// Bounded fork tracker over block headers. Full blocks stay in the observer's
/// cache; the pool only needs parent links to decide what the canonical chain
/// looks like after each arrival.
pub struct BitcoinBlockPool {
    canonical_fork_id: usize,
    next_fork_id: usize,
    forks: BTreeMap<usize, ChainSegment>,
    headers_store: HashMap<BlockIdentifier, BlockHeader>,
    orphans: BTreeSet<BlockIdentifier>,
}

impl BitcoinBlockPool {
    pub fn new() -> BitcoinBlockPool {
        BitcoinBlockPool {
            canonical_fork_id: 0,
            next_fork_id: 1,
            forks: BTreeMap::new(),
            headers_store: HashMap::new(),
            orphans: BTreeSet::new(),
        }
    }

    pub fn get_canonical_fork(&self) -> Option<&ChainSegment> {
        self.forks.get(&self.canonical_fork_id)
    }

    pub fn get_canonical_tip(&self) -> Option<&BlockIdentifier> {
        self.get_canonical_fork()
            .filter(|fork| !fork.is_empty())
            .map(|fork| fork.get_tip())
    }

    pub fn get_header(&self, block_identifier: &BlockIdentifier) -> Option<&BlockHeader> {
        self.headers_store.get(block_identifier)
    }

    pub fn seed_block_pool(&mut self, headers: Vec<BlockHeader>, ctx: &Context) {
        for header in headers.into_iter() {
            if let Err(e) = self.process_header(header, ctx) {
                ctx.try_log(|logger| slog::warn!(logger, "unable to seed block pool: {}", e));
            }
        }
    }

    /// Ingests one header and emits the chain transition it implies, if any.
    /// Duplicates, orphans and blocks extending losing forks are absorbed
    /// silently.
    pub fn process_header(
        &mut self,
        header: BlockHeader,
        ctx: &Context,
    ) -> Result<Option<BlockchainEvent>, String> {
        let block_identifier = header.block_identifier.clone();
        if self.headers_store.contains_key(&block_identifier) {
            ctx.try_log(|logger| {
                slog::debug!(logger, "Bitcoin {} already in pool", block_identifier)
            });
            return Ok(None);
        }
        self.headers_store.insert(block_identifier.clone(), header.clone());

        if self.forks.is_empty() {
            let mut genesis_segment = ChainSegment::new();
            genesis_segment.append_block_identifier(&block_identifier);
            self.forks.insert(0, genesis_segment);
            self.canonical_fork_id = 0;
            return Ok(Some(BlockchainEvent::BlockchainUpdatedWithHeaders(
                BlockchainUpdatedWithHeaders {
                    new_headers: vec![header],
                    confirmed_headers: vec![],
                },
            )));
        }

        let previous_canonical = self
            .get_canonical_fork()
            .cloned()
            .ok_or("canonical fork missing from pool")?;

        if !self.try_attach_header(&header, ctx) {
            ctx.try_log(|logger| {
                slog::warn!(
                    logger,
                    "Bitcoin {} is orphaned, buffering until parent {} shows up",
                    header.block_identifier,
                    header.parent_block_identifier
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
            // The arrival extended a losing fork: canonical chain unchanged.
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

        let confirmed_headers = self.prune_confirmed_segments(ctx);

        let event = if block_ids_to_rollback.is_empty() {
            BlockchainEvent::BlockchainUpdatedWithHeaders(BlockchainUpdatedWithHeaders {
                new_headers: self.resolve_headers(&block_ids_to_apply),
                confirmed_headers,
            })
        } else {
            ctx.try_log(|logger| {
                slog::info!(
                    logger,
                    "Bitcoin reorg: rolling back {} blocks, applying {} blocks",
                    block_ids_to_rollback.len(),
                    block_ids_to_apply.len()
                )
            });
            BlockchainEvent::BlockchainUpdatedWithReorg(BlockchainUpdatedWithReorg {
                headers_to_rollback: self.resolve_headers(&block_ids_to_rollback),
                headers_to_apply: self.resolve_headers(&block_ids_to_apply),
                confirmed_headers,
            })
        };
        Ok(Some(event))
    }

    fn resolve_headers(&self, block_ids: &[BlockIdentifier]) -> Vec<BlockHeader> {
        block_ids
            .iter()
            .filter_map(|id| self.headers_store.get(id).cloned())
            .collect()
    }

    /// Tries the header against every live fork; a mid-segment collision
    /// spawns a new fork sharing the common ancestors.
    fn try_attach_header(&mut self, header: &BlockHeader, ctx: &Context) -> bool {
        let mut attached = false;
        let mut spawned_forks = vec![];
        for (_fork_id, fork) in self.forks.iter_mut() {
            let (appended, new_fork) = fork.try_append_block(header, ctx);
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
                let Some(header) = self.headers_store.get(&orphan_id).cloned() else {
                    self.orphans.remove(&orphan_id);
                    continue;
                };
                if self.try_attach_header(&header, ctx) {
                    ctx.try_log(|logger| {
                        slog::info!(logger, "Bitcoin orphan {} re-attached", orphan_id)
                    });
                    self.orphans.remove(&orphan_id);
                    progress = true;
                }
            }
        }
    }

    /// The canonical fork is the longest segment. Equal-length challengers do
    /// not displace the current tip, preventing oscillation between twins.
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
            }
        }
        self.canonical_fork_id = best_id;
    }

    /// Advances the pool root: blocks buried deeper than the confirmation
    /// window leave the canonical segment, losing forks below the new root are
    /// dropped, and the header arena is swept of unreachable entries.
    fn prune_confirmed_segments(&mut self, ctx: &Context) -> Vec<BlockHeader> {
        // Keep the tip plus one full window below it, so that a reorg of
        // exactly window depth remains resolvable.
        let (tip_index, cut_off) = match self.get_canonical_fork() {
            Some(fork) if fork.get_length() > CONFIRMED_SEGMENT_MINIMUM_LENGTH + 1 => {
                let tip_index = fork.get_tip().index;
                (
                    tip_index,
                    tip_index.saturating_sub(CONFIRMED_SEGMENT_MINIMUM_LENGTH),
                )
            }
            _ => return vec![],
        };

        let confirmed_ids = match self.forks.get_mut(&self.canonical_fork_id) {
            Some(fork) => fork.prune_confirmed_blocks(cut_off),
            None => vec![],
        };
        let confirmed_headers = self.resolve_headers(&confirmed_ids);

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
        self.headers_store.retain(|id, _| {
            orphans.contains(id) || forks.values().any(|fork| fork.get_block_id(id).is_some())
        });

        if !confirmed_headers.is_empty() {
            ctx.try_log(|logger| {
                slog::debug!(
                    logger,
                    "Bitcoin pool root advanced to {} (tip {})",
                    cut_off,
                    tip_index
                )
            });
        }
        confirmed_headers
    }
}
