use crate::config::{Config, PredicatesApi};
use crate::scan::common::get_block_heights_to_scan;
use crate::service::{
    open_readwrite_predicates_db_conn_or_panic, set_confirmed_expiration_status,
    set_predicate_scanning_status, set_unconfirmed_expiration_status, ScanningData,
};
use blockhook_sdk::dispatcher::{Dispatcher, HookOccurrencePayload};
use blockhook_sdk::hooks::bitcoin::{
    evaluate_bitcoin_hooks_on_chain_event, handle_bitcoin_hook_action, BitcoinHookOccurrence,
    BitcoinTriggerHook,
};
use blockhook_sdk::hooks::types::BitcoinHookSpecification;
use blockhook_sdk::indexer::bitcoin::{
    build_http_client, download_and_parse_block_with_retry, retrieve_block_hash_with_retry,
    standardize_bitcoin_block, CONFIRMED_SEGMENT_MINIMUM_LENGTH,
};
use blockhook_sdk::observer::{gather_proofs, EventObserverConfig};
use blockhook_sdk::utils::Context;
use blockhook_sdk::bitcoincore_rpc::{Auth, Client, RpcApi};
use blockhook_types::{
    BitcoinBlockData, BitcoinChainEvent, BitcoinChainUpdatedWithBlocksData, BlockIdentifier, Chain,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::common::PredicateScanResult;

pub async fn scan_bitcoin_chainstate_via_rpc_using_predicate(
    predicate_spec: &BitcoinHookSpecification,
    unfinished_scan_data: Option<ScanningData>,
    dispatcher: &Dispatcher,
    config: &Config,
    kill_signal: Option<Arc<RwLock<bool>>>,
    ctx: &Context,
) -> Result<PredicateScanResult, String> {
    let predicate_uuid = &predicate_spec.uuid;
    let auth = Auth::UserPass(
        config.network.bitcoind_rpc_username.clone(),
        config.network.bitcoind_rpc_password.clone(),
    );

    let bitcoin_rpc = match Client::new(&config.network.bitcoind_rpc_url, auth) {
        Ok(con) => con,
        Err(message) => {
            return Err(format!("Bitcoin RPC error: {}", message));
        }
    };

    let mut chain_tip = match bitcoin_rpc.get_blockchain_info() {
        Ok(result) => result.blocks,
        Err(e) => {
            return Err(format!("unable to retrieve Bitcoin chain tip ({})", e));
        }
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

    debug!(
        ctx.expect_logger(),
        "Starting predicate evaluation on Bitcoin blocks for predicate {predicate_uuid}",
    );

    let mut last_block_scanned = BlockIdentifier::default();
    let mut actions_triggered = 0;
    let mut err_count = 0;

    let event_observer_config = config.get_event_observer_config();

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
    let mut last_scanned_block_confirmations = 0;
    let http_client = build_http_client();

    let mut loop_did_trigger = false;
    while let Some(current_block_height) = block_heights_to_scan.pop_front() {
        if let Some(kill_signal) = kill_signal.clone() {
            if let Ok(kill_signal) = kill_signal.read() {
                // Predicate deregistered; the checkpoint already written lets
                // a re-registration resume from here.
                if *kill_signal {
                    return Ok(PredicateScanResult::Deregistered);
                }
            }
        }
        if let Some(ref mut predicates_db_conn) = predicates_db_conn {
            if number_of_blocks_scanned % 100 == 0
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
            // We've scanned up to the chain tip as of the start of this scan;
            // see if the chain has progressed since then.
            chain_tip = match bitcoin_rpc.get_blockchain_info() {
                Ok(result) => result.blocks,
                Err(e) => {
                    return Err(format!("unable to retrieve Bitcoin chain tip ({})", e));
                }
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

        let block_hash = retrieve_block_hash_with_retry(
            &http_client,
            &current_block_height,
            &event_observer_config.get_bitcoin_config(),
            ctx,
        )
        .await?;
        let block_breakdown = download_and_parse_block_with_retry(
            &http_client,
            &block_hash,
            &event_observer_config.get_bitcoin_config(),
            ctx,
        )
        .await?;
        last_scanned_block_confirmations = block_breakdown.confirmations;
        let block = match standardize_bitcoin_block(
            block_breakdown,
            &event_observer_config.bitcoin_network,
            ctx,
        ) {
            Ok(data) => data,
            Err((e, _)) => {
                warn!(
                    ctx.expect_logger(),
                    "Unable to standardize block #{} {}: {}", current_block_height, block_hash, e
                );
                continue;
            }
        };
        last_block_scanned = block.block_identifier.clone();

        let res = match process_block_with_predicates(
            block,
            &vec![predicate_spec],
            &event_observer_config,
            dispatcher,
            ctx,
        )
        .await
        {
            Ok(actions) => {
                if actions > 0 {
                    number_of_times_triggered += actions as u64;
                    loop_did_trigger = true;
                }
                actions_triggered += actions;
                Ok(())
            }
            Err(e) => {
                err_count += 1;
                Err(e)
            }
        };

        if err_count >= 3 {
            if let Err(e) = res {
                return Err(format!("Scan aborted (consecutive action errors >= 3): {}", e));
            } else {
                return Err("Scan aborted (consecutive action errors >= 3)".to_string());
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

    // If an end block was provided, or a fixed list of blocks was scanned,
    // check whether every block was processed and the predicate can expire.
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
            if last_scanned_block_confirmations >= CONFIRMED_SEGMENT_MINIMUM_LENGTH as i64 {
                set_confirmed_expiration_status(&predicate_spec.key(), predicates_db_conn, ctx);
            }
        }
        return Ok(PredicateScanResult::Expired);
    }

    Ok(PredicateScanResult::ChainTipReached)
}

pub async fn process_block_with_predicates(
    block: BitcoinBlockData,
    predicates: &Vec<&BitcoinHookSpecification>,
    event_observer_config: &EventObserverConfig,
    dispatcher: &Dispatcher,
    ctx: &Context,
) -> Result<u32, String> {
    let chain_event =
        BitcoinChainEvent::ChainUpdatedWithBlocks(BitcoinChainUpdatedWithBlocksData {
            new_blocks: vec![block],
            confirmed_blocks: vec![],
        });

    let (predicates_triggered, _predicates_evaluated, _predicates_expired) =
        evaluate_bitcoin_hooks_on_chain_event(&chain_event, predicates, ctx);

    execute_predicates_action(predicates_triggered, dispatcher, event_observer_config, ctx).await
}

pub async fn execute_predicates_action<'a>(
    hits: Vec<BitcoinTriggerHook<'a>>,
    dispatcher: &Dispatcher,
    config: &EventObserverConfig,
    ctx: &Context,
) -> Result<u32, String> {
    let mut actions_triggered = 0;
    let mut proofs = HashMap::new();
    for trigger in hits.into_iter() {
        if trigger.hook.include_proof {
            gather_proofs(&trigger, &mut proofs, config, ctx);
        }
        let predicate_uuid = trigger.hook.uuid.clone();
        match handle_bitcoin_hook_action(trigger, &proofs) {
            Err(e) => {
                warn!(
                    ctx.expect_logger(),
                    "unable to handle action for predicate {}: {}", predicate_uuid, e
                );
            }
            Ok(action) => {
                actions_triggered += 1;
                match action {
                    BitcoinHookOccurrence::Http(request, data) => {
                        dispatcher.send(request, HookOccurrencePayload::Bitcoin(data));
                    }
                    BitcoinHookOccurrence::File(path, bytes) => {
                        dispatcher.send_file_append(Chain::Bitcoin, &predicate_uuid, path, bytes);
                    }
                    BitcoinHookOccurrence::Data(_payload) => {}
                };
            }
        }
    }

    Ok(actions_triggered)
}
