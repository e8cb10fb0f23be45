use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};

use blockhook_sdk::{
    dispatcher::Dispatcher,
    hooks::types::{BitcoinHookSpecification, HookSpecification, StacksHookSpecification},
    observer::ObserverCommand,
    utils::Context,
};
use threadpool::ThreadPool;

use crate::{
    config::{Config, PredicatesApi},
    scan::{
        bitcoin::scan_bitcoin_chainstate_via_rpc_using_predicate,
        common::PredicateScanResult,
        stacks::scan_stacks_chainstate_via_rocksdb_using_predicate,
    },
    service::{open_readwrite_predicates_db_conn_or_panic, set_predicate_interrupted_status},
    storage::open_readonly_stacks_db_conn,
};

use super::ScanningData;

pub fn start_stacks_scan_runloop(
    config: &Config,
    stacks_scan_op_rx: crossbeam_channel::Receiver<(
        StacksHookSpecification,
        Option<ScanningData>,
    )>,
    observer_command_tx: Sender<ObserverCommand>,
    dispatcher: Dispatcher,
    kill_switches: Arc<RwLock<HashMap<String, Arc<RwLock<bool>>>>>,
    ctx: &Context,
) {
    let stacks_scan_pool = ThreadPool::new(config.limits.max_number_of_concurrent_stacks_scans);

    while let Ok((predicate_spec, unfinished_scan_data)) = stacks_scan_op_rx.recv() {
        let moved_ctx = ctx.clone();
        let moved_config = config.clone();
        let observer_command_tx = observer_command_tx.clone();
        let moved_dispatcher = dispatcher.clone();

        let kill_switch = Arc::new(RwLock::new(false));
        if let Ok(mut switches) = kill_switches.write() {
            switches.insert(predicate_spec.uuid.clone(), kill_switch.clone());
        }

        stacks_scan_pool.execute(move || {
            let stacks_db_conn =
                match open_readonly_stacks_db_conn(&moved_config.expected_cache_path(), &moved_ctx)
                {
                    Ok(db_conn) => db_conn,
                    Err(e) => {
                        error!(
                            moved_ctx.expect_logger(),
                            "unable to open stacks db: {}", e
                        );
                        return;
                    }
                };

            let op = scan_stacks_chainstate_via_rocksdb_using_predicate(
                &predicate_spec,
                unfinished_scan_data,
                &stacks_db_conn,
                &moved_dispatcher,
                &moved_config,
                Some(kill_switch),
                &moved_ctx,
            );
            let res = hiro_system_kit::nestable_block_on(op);
            let scan_result = match res {
                Ok(scan_result) => scan_result,
                Err(e) => {
                    warn!(
                        moved_ctx.expect_logger(),
                        "Unable to evaluate predicate on Stacks chainstate: {e}",
                    );

                    if let PredicatesApi::On(ref api_config) = moved_config.http_api {
                        let error =
                            format!("Unable to evaluate predicate on Stacks chainstate: {e}");
                        let mut predicates_db_conn =
                            open_readwrite_predicates_db_conn_or_panic(api_config, &moved_ctx);
                        set_predicate_interrupted_status(
                            error,
                            &predicate_spec.key(),
                            &mut predicates_db_conn,
                            &moved_ctx,
                        );
                    }
                    return;
                }
            };
            if let PredicateScanResult::ChainTipReached = scan_result {
                let _ = observer_command_tx.send(ObserverCommand::EnablePredicate(
                    HookSpecification::Stacks(predicate_spec),
                ));
            }
        });
    }
    let _ = stacks_scan_pool.join();
}

pub fn start_bitcoin_scan_runloop(
    config: &Config,
    bitcoin_scan_op_rx: crossbeam_channel::Receiver<(
        BitcoinHookSpecification,
        Option<ScanningData>,
    )>,
    observer_command_tx: Sender<ObserverCommand>,
    dispatcher: Dispatcher,
    kill_switches: Arc<RwLock<HashMap<String, Arc<RwLock<bool>>>>>,
    ctx: &Context,
) {
    let bitcoin_scan_pool = ThreadPool::new(config.limits.max_number_of_concurrent_bitcoin_scans);

    while let Ok((predicate_spec, unfinished_scan_data)) = bitcoin_scan_op_rx.recv() {
        let moved_ctx = ctx.clone();
        let moved_config = config.clone();
        let observer_command_tx = observer_command_tx.clone();
        let moved_dispatcher = dispatcher.clone();

        let kill_switch = Arc::new(RwLock::new(false));
        if let Ok(mut switches) = kill_switches.write() {
            switches.insert(predicate_spec.uuid.clone(), kill_switch.clone());
        }

        bitcoin_scan_pool.execute(move || {
            let op = scan_bitcoin_chainstate_via_rpc_using_predicate(
                &predicate_spec,
                unfinished_scan_data,
                &moved_dispatcher,
                &moved_config,
                Some(kill_switch),
                &moved_ctx,
            );

            let scan_result = match hiro_system_kit::nestable_block_on(op) {
                Ok(scan_result) => scan_result,
                Err(e) => {
                    warn!(
                        moved_ctx.expect_logger(),
                        "Unable to evaluate predicate on Bitcoin chainstate: {e}",
                    );

                    if let PredicatesApi::On(ref api_config) = moved_config.http_api {
                        let error =
                            format!("Unable to evaluate predicate on Bitcoin chainstate: {e}");
                        let mut predicates_db_conn =
                            open_readwrite_predicates_db_conn_or_panic(api_config, &moved_ctx);
                        set_predicate_interrupted_status(
                            error,
                            &predicate_spec.key(),
                            &mut predicates_db_conn,
                            &moved_ctx,
                        )
                    }
                    return;
                }
            };
            if let PredicateScanResult::ChainTipReached = scan_result {
                let _ = observer_command_tx.send(ObserverCommand::EnablePredicate(
                    HookSpecification::Bitcoin(predicate_spec),
                ));
            }
        });
    }
    let _ = bitcoin_scan_pool.join();
}
