use std::collections::{HashMap, VecDeque};

use crate::{
    archive::download_stacks_dataset_if_required,
    config::{Config, PredicatesApi},
    scan::common::get_block_heights_to_scan,
    service::{
        open_readwrite_predicates_db_conn_or_panic, set_confirmed_expiration_status,
        set_predicate_scanning_status, set_unconfirmed_expiration_status, ScanningData,
    },
    storage::{
        get_last_block_height_inserted, get_last_unconfirmed_block_height_inserted,
        get_stacks_block_at_block_height, insert_entry_in_stacks_blocks,
        is_stacks_block_present, open_readonly_stacks_db_conn_with_retry,
        open_readwrite_stacks_db_conn,
    },
};
use blockhook_sdk::dispatcher::{Dispatcher, HookOccurrencePayload};
use blockhook_sdk::hooks::stacks::{
    evaluate_stacks_hooks_on_chain_event, handle_stacks_hook_action, StacksHookOccurrence,
};
use blockhook_sdk::hooks::types::StacksHookSpecification;
use blockhook_sdk::indexer::stacks::{
    standardize_stacks_serialized_block, standardize_stacks_serialized_block_header,
    StacksChainContext,
};
use blockhook_sdk::indexer::bitcoin::CONFIRMED_SEGMENT_MINIMUM_LENGTH;
use blockhook_sdk::utils::Context;
use blockhook_types::{
    BlockIdentifier, Chain, StacksBlockUpdate, StacksChainEvent,
    StacksChainUpdatedWithBlocksData,
};
use rocksdb::DB;

use super::common::PredicateScanResult;

#[derive(Debug, Deserialize, Serialize)]
pub struct Record {
    pub id: u64,
    pub created_at: String,
    pub kind: RecordKind,
    pub blob: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub enum RecordKind {
    #[serde(rename = "/new_block")]
    StacksBlockReceived,
    #[serde(rename = "/new_microblocks")]
    StacksMicroblockReceived,
    #[serde(rename = "/new_burn_block")]
    BitcoinBlockReceived,
    #[serde(rename = "/new_mempool_tx")]
    TransactionAdmitted,
    #[serde(rename = "/drop_mempool_tx")]
    TransactionDropped,
    #[serde(rename = "/attachments/new")]
    AttachmentReceived,
}

/// Walks the events archive backwards from the highest header to produce the
/// canonical fork, dropping the orphaned blocks the archive also records.
pub async fn get_canonical_fork_from_tsv(
    config: &mut Config,
    start_block: Option<u64>,
    ctx: &Context,
) -> Result<VecDeque<(BlockIdentifier, BlockIdentifier, String)>, String> {
    let seed_tsv_path = config.expected_local_stacks_tsv_file()?.clone();

    let (record_tx, record_rx) = std::sync::mpsc::channel();

    let mut start_block = start_block.unwrap_or(0);
    info!(
        ctx.expect_logger(),
        "Parsing tsv file to determine canonical fork"
    );
    let parsing_handle = hiro_system_kit::thread_named("Stacks chainstate CSV parsing")
        .spawn(move || {
            let mut reader_builder = csv::ReaderBuilder::default()
                .has_headers(false)
                .delimiter(b'\t')
                .buffer_capacity(8 * (1 << 10))
                .from_path(&seed_tsv_path)
                .expect("unable to create csv reader");

            for result in reader_builder.deserialize() {
                let record: Record = match result {
                    Ok(record) => record,
                    Err(_e) => continue,
                };
                if let RecordKind::StacksBlockReceived = &record.kind {
                    if record_tx.send(Some(record)).is_err() {
                        break;
                    }
                };
            }
            let _ = record_tx.send(None);
        })
        .map_err(|e| format!("unable to spawn thread: {e}"))?;

    let stacks_db = open_readonly_stacks_db_conn_with_retry(&config.expected_cache_path(), 3, ctx)?;
    let canonical_fork = {
        let mut cursor = BlockIdentifier::default();
        let mut dump = HashMap::new();

        while let Ok(Some(mut record)) = record_rx.recv() {
            let (block_identifier, parent_block_identifier) = match (&record.kind, &record.blob) {
                (RecordKind::StacksBlockReceived, Some(blob)) => {
                    match standardize_stacks_serialized_block_header(blob) {
                        Ok(data) => data,
                        Err(e) => {
                            error!(
                                ctx.expect_logger(),
                                "Failed to standardize stacks header: {e}"
                            );
                            continue;
                        }
                    }
                }
                _ => continue,
            };

            if start_block > block_identifier.index {
                // Don't insert blocks that are already in the db, but do fill
                // any gap in our data.
                if is_stacks_block_present(&block_identifier, 0, &stacks_db)
                    || block_identifier.index == 0
                {
                    continue;
                } else {
                    start_block = block_identifier.index;
                    info!(ctx.expect_logger(), "Found missing block ({start_block}) during tsv parsing; will insert into db");
                }
            }

            if block_identifier.index > cursor.index {
                cursor = block_identifier.clone();
            }
            dump.insert(
                block_identifier,
                (parent_block_identifier, record.blob.take().unwrap_or_default()),
            );
        }

        let mut canonical_fork = VecDeque::new();
        while cursor.index > 0 {
            let (block_identifier, (parent_block_identifier, blob)) =
                match dump.remove_entry(&cursor) {
                    Some(entry) => entry,
                    None => break,
                };
            cursor = parent_block_identifier.clone();
            canonical_fork.push_front((block_identifier, parent_block_identifier, blob));
        }
        canonical_fork
    };
    let _ = parsing_handle.join();

    info!(
        ctx.expect_logger(),
        "Finished parsing tsv file to determine canonical fork"
    );
    Ok(canonical_fork)
}

/// Catches the on-disk block index up with the events archive. The index is
/// what historical scans read, sparing the stacks node entirely.
pub async fn consolidate_local_stacks_chainstate_using_csv(
    config: &mut Config,
    ctx: &Context,
) -> Result<(), String> {
    info!(
        ctx.expect_logger(),
        "Building local chainstate from Stacks events archive"
    );

    let downloaded_new_dataset = download_stacks_dataset_if_required(config, ctx).await?;
    if !downloaded_new_dataset {
        return Ok(());
    }

    let stacks_db_rw = open_readwrite_stacks_db_conn(&config.expected_cache_path(), ctx)?;
    let start_block = get_last_block_height_inserted(&stacks_db_rw, ctx).unwrap_or(0);
    let canonical_fork = get_canonical_fork_from_tsv(config, Some(start_block), ctx).await?;

    let indexer_config = config.network.clone();
    let mut chain_ctx = StacksChainContext::new(&config.network.stacks_network);

    let mut blocks_inserted = 0;
    for (block_identifier, _parent, blob) in canonical_fork.into_iter() {
        if block_identifier.index <= start_block && start_block != 0 {
            continue;
        }
        let block =
            match standardize_stacks_serialized_block(&indexer_config, &blob, &mut chain_ctx, ctx)
            {
                Ok(block) => block,
                Err(e) => {
                    error!(ctx.expect_logger(), "{e}");
                    continue;
                }
            };
        insert_entry_in_stacks_blocks(&block, &stacks_db_rw, ctx)?;
        blocks_inserted += 1;
        if blocks_inserted % 2500 == 0 {
            info!(
                ctx.expect_logger(),
                "Importing Stacks block #{}", block.block_identifier.index
            );
        }
    }

    info!(
        ctx.expect_logger(),
        "{} Stacks blocks imported from events archive", blocks_inserted
    );
    Ok(())
}

pub async fn scan_stacks_chainstate_via_rocksdb_using_predicate(
    predicate_spec: &StacksHookSpecification,
    unfinished_scan_data: Option<ScanningData>,
    stacks_db_conn: &DB,
    dispatcher: &Dispatcher,
    config: &Config,
    kill_signal: Option<std::sync::Arc<std::sync::RwLock<bool>>>,
    ctx: &Context,
) -> Result<PredicateScanResult, String> {
    let predicate_uuid = &predicate_spec.uuid;
    let mut chain_tip = match get_last_unconfirmed_block_height_inserted(stacks_db_conn, ctx) {
        Some(chain_tip) => chain_tip,
        None => match get_last_block_height_inserted(stacks_db_conn, ctx) {
            Some(chain_tip) => chain_tip,
            None => {
                info!(ctx.expect_logger(), "No blocks inserted in db; cannot determine Stacks chain tip. Skipping scan of predicate {}", predicate_uuid);
                return Ok(PredicateScanResult::ChainTipReached);
            }
        },
    };

    let block_heights_to_scan = get_block_heights_to_scan(
        &predicate_spec.blocks,
        &predicate_spec.start_block,
        &predicate_spec.end_block,
        &chain_tip,
        &unfinished_scan_data,
    )?;
    let mut block_heights_to_scan = match block_heights_to_scan {
        Some(h) => h,
        // No blocks to scan, go straight to streaming.
        None => return Ok(PredicateScanResult::ChainTipReached),
    };

    let mut predicates_db_conn = match config.http_api {
        PredicatesApi::On(ref api_config) => {
            Some(open_readwrite_predicates_db_conn_or_panic(api_config, ctx))
        }
        PredicatesApi::Off => None,
    };

    let proofs = HashMap::new();
    debug!(
        ctx.expect_logger(),
        "Starting predicate evaluation on Stacks blocks for predicate {}", predicate_uuid
    );
    let mut last_block_scanned = BlockIdentifier::default();
    let mut actions_triggered = 0;
    let mut err_count = 0;

    let (mut number_of_blocks_to_scan, mut number_of_blocks_scanned, mut number_of_times_triggered) = {
        let number_of_blocks_to_scan = block_heights_to_scan.len() as u64;
        match &unfinished_scan_data {
            Some(scan_data) => (
                scan_data.number_of_blocks_to_scan,
                scan_data.number_of_blocks_evaluated,
                scan_data.number_of_times_triggered,
            ),
            None => (number_of_blocks_to_scan, 0, 0u64),
        }
    };

    let mut loop_did_trigger = false;
    while let Some(current_block_height) = block_heights_to_scan.pop_front() {
        if let Some(kill_signal) = kill_signal.clone() {
            if let Ok(kill_signal) = kill_signal.read() {
                if *kill_signal {
                    return Ok(PredicateScanResult::Deregistered);
                }
            }
        }
        if let Some(ref mut predicates_db_conn) = predicates_db_conn {
            if number_of_blocks_scanned % 10 == 0
                || number_of_blocks_scanned == 0
                || loop_did_trigger
            {
                set_predicate_scanning_status(
                    &predicate_spec.key(),
                    number_of_blocks_to_scan,
                    number_of_blocks_scanned,
                    number_of_times_triggered,
                    current_block_height,
                    predicates_db_conn,
                    ctx,
                );
            }
        }
        loop_did_trigger = false;

        if current_block_height > chain_tip {
            let prev_chain_tip = chain_tip;
            chain_tip = match get_last_unconfirmed_block_height_inserted(stacks_db_conn, ctx) {
                Some(chain_tip) => chain_tip,
                None => match get_last_block_height_inserted(stacks_db_conn, ctx) {
                    Some(chain_tip) => chain_tip,
                    None => {
                        warn!(ctx.expect_logger(), "No blocks inserted in db; cannot determine Stacks chain tip. Skipping scan of predicate {}", predicate_uuid);
                        return Ok(PredicateScanResult::ChainTipReached);
                    }
                },
            };
            // If the chain hasn't progressed, break out so we can enter
            // streaming mode, and put back the block we weren't able to scan.
            if current_block_height > chain_tip {
                block_heights_to_scan.push_front(current_block_height);
                break;
            } else {
                number_of_blocks_to_scan += chain_tip - prev_chain_tip;
            }
        }

        number_of_blocks_scanned += 1;

        let block = match get_stacks_block_at_block_height(
            current_block_height,
            true,
            3,
            stacks_db_conn,
        )? {
            Some(block) => block,
            None => {
                match get_stacks_block_at_block_height(current_block_height, false, 3, stacks_db_conn)? {
                    Some(block) => block,
                    None => continue,
                }
            }
        };
        last_block_scanned = block.block_identifier.clone();

        let chain_event =
            StacksChainEvent::ChainUpdatedWithBlocks(StacksChainUpdatedWithBlocksData {
                new_blocks: vec![StacksBlockUpdate::new(block)],
                confirmed_blocks: vec![],
            });

        let (predicates_triggered, _predicates_evaluated, _predicates_expired) =
            evaluate_stacks_hooks_on_chain_event(&chain_event, vec![predicate_spec], ctx);

        for trigger in predicates_triggered.into_iter() {
            let res = match handle_stacks_hook_action(trigger, &proofs, ctx) {
                Err(e) => {
                    warn!(
                        ctx.expect_logger(),
                        "unable to handle action for predicate {}: {}", predicate_uuid, e
                    );
                    err_count += 1;
                    Err(e)
                }
                Ok(action) => {
                    number_of_times_triggered += 1;
                    actions_triggered += 1;
                    loop_did_trigger = true;
                    match action {
                        StacksHookOccurrence::Http(request, data) => {
                            dispatcher.send(request, HookOccurrencePayload::Stacks(data));
                        }
                        StacksHookOccurrence::File(path, bytes) => {
                            dispatcher.send_file_append(
                                Chain::Stacks,
                                predicate_uuid,
                                path,
                                bytes,
                            );
                        }
                        StacksHookOccurrence::Data(_payload) => {}
                    };
                    err_count = 0;
                    Ok(())
                }
            };

            if err_count >= 3 {
                if let Err(e) = res {
                    return Err(format!(
                        "Scan aborted (consecutive action errors >= 3): {}",
                        e
                    ));
                } else {
                    return Err("Scan aborted (consecutive action errors >= 3)".to_string());
                }
            }
        }
    }

    info!(
        ctx.expect_logger(),
        "Predicate {predicate_uuid} scan completed. {number_of_blocks_scanned} blocks scanned, {actions_triggered} actions triggered."
    );

    if let Some(ref mut predicates_db_conn) = predicates_db_conn {
        set_predicate_scanning_status(
            &predicate_spec.key(),
            number_of_blocks_to_scan,
            number_of_blocks_scanned,
            number_of_times_triggered,
            last_block_scanned.index,
            predicates_db_conn,
            ctx,
        );
    }

    if (predicate_spec.blocks.is_some()
        || (predicate_spec.end_block.is_some()
            && predicate_spec.end_block.unwrap() == last_block_scanned.index))
        && block_heights_to_scan.is_empty()
    {
        if let Some(ref mut predicates_db_conn) = predicates_db_conn {
            set_unconfirmed_expiration_status(
                last_block_scanned.index,
                &predicate_spec.key(),
                predicates_db_conn,
                ctx,
            );
            let confirmed_tip = get_last_block_height_inserted(stacks_db_conn, ctx).unwrap_or(0);
            if confirmed_tip.saturating_sub(last_block_scanned.index)
                >= CONFIRMED_SEGMENT_MINIMUM_LENGTH
            {
                set_confirmed_expiration_status(&predicate_spec.key(), predicates_db_conn, ctx);
            }
        }
        return Ok(PredicateScanResult::Expired);
    }

    Ok(PredicateScanResult::ChainTipReached)
}
