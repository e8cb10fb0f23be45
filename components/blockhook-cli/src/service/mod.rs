pub mod http_api;
mod runloops;

use crate::config::{Config, PredicatesApi, PredicatesApiConfig};
use crate::scan::stacks::consolidate_local_stacks_chainstate_using_csv;
use crate::service::http_api::{load_predicates_from_redis, start_predicate_api_server};
use crate::service::runloops::{start_bitcoin_scan_runloop, start_stacks_scan_runloop};
use crate::storage::{
    confirm_entries_in_stacks_blocks, draft_entries_in_stacks_blocks, get_all_unconfirmed_blocks,
    get_last_unconfirmed_block_height_inserted, open_readonly_stacks_db_conn_with_retry,
    open_readwrite_stacks_db_conn,
};

use blockhook_sdk::dispatcher::{DispatchOutcome, Dispatcher};
use blockhook_sdk::hooks::types::{HookSpecification, HookSpecificationNetworkMap, HookRegistry};
use blockhook_sdk::indexer::bitcoin::CONFIRMED_SEGMENT_MINIMUM_LENGTH;
use blockhook_sdk::observer::{
    start_event_observer, ObserverCommand, ObserverEvent, PredicateEvaluationReport,
    StacksObserverStartupContext,
};
use blockhook_sdk::utils::Context;
use blockhook_types::{BitcoinChainEvent, Chain, StacksChainEvent};
use redis::{Commands, Connection};

use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Service {
    config: Config,
    ctx: Context,
}

impl Service {
    pub fn new(config: Config, ctx: Context) -> Self {
        Self { config, ctx }
    }

    pub async fn run(
        &mut self,
        predicates: Vec<HookSpecificationNetworkMap>,
    ) -> Result<(), String> {
        let mut registry = HookRegistry::new();
        let mut unfinished_scans: Vec<(HookSpecification, Option<ScanningData>)> = vec![];

        // If no predicates were passed at launch, retrieve the predicates
        // saved in the registry.
        if predicates.is_empty() && self.config.is_http_api_enabled() {
            let registered_predicates = match load_predicates_from_redis(&self.config, &self.ctx) {
                Ok(predicates) => predicates,
                Err(e) => {
                    error!(
                        self.ctx.expect_logger(),
                        "Failed loading predicates from storage: {}", e
                    );
                    vec![]
                }
            };
            for (predicate, status) in registered_predicates.into_iter() {
                let predicate_uuid = predicate.uuid().to_string();
                let unfinished_scan_data = match status {
                    PredicateStatus::Scanning(data) => Some(data),
                    PredicateStatus::New => None,
                    PredicateStatus::Streaming(data) => Some(ScanningData {
                        number_of_blocks_to_scan: 0,
                        number_of_blocks_evaluated: data.number_of_blocks_evaluated,
                        number_of_times_triggered: data.number_of_times_triggered,
                        last_occurrence: data.last_occurrence,
                        last_evaluated_block_height: data.last_evaluated_block_height,
                    }),
                    PredicateStatus::ConfirmedExpiration(_) | PredicateStatus::Interrupted(_) => {
                        // Terminal: keep it registered for reporting, but do
                        // not resume evaluation.
                        continue;
                    }
                    PredicateStatus::UnconfirmedExpiration(_) => None,
                };
                match registry.register_specification(predicate.clone()) {
                    Ok(_) => {
                        info!(
                            self.ctx.expect_logger(),
                            "Predicate {} retrieved from storage and loaded", predicate_uuid,
                        );
                        unfinished_scans.push((predicate, unfinished_scan_data));
                    }
                    Err(e) => {
                        error!(
                            self.ctx.expect_logger(),
                            "Failed loading predicate from storage: {}", e
                        );
                    }
                }
            }
        }

        // Predicates passed at launch join the registry in their New state.
        for predicate in predicates.into_iter() {
            match registry.register_full_specification(
                (
                    &self.config.network.bitcoin_network,
                    &self.config.network.stacks_network,
                ),
                predicate,
            ) {
                Ok(spec) => {
                    info!(
                        self.ctx.expect_logger(),
                        "Predicate {} retrieved from config and loaded",
                        spec.uuid(),
                    );
                    unfinished_scans.push((spec, None));
                }
                Err(e) => {
                    error!(
                        self.ctx.expect_logger(),
                        "Failed loading predicate from config: {}", e
                    );
                }
            }
        }

        let (observer_command_tx, observer_command_rx) = channel();
        let (observer_event_tx, observer_event_rx) = crossbeam_channel::unbounded();
        let (dispatch_outcome_tx, dispatch_outcome_rx) = crossbeam_channel::unbounded();

        let dispatcher = Dispatcher::start(
            self.config
                .limits
                .max_number_of_processing_threads
                .min(self.config.limits.max_number_of_networking_threads),
            dispatch_outcome_tx,
            &self.ctx,
        );

        let mut event_observer_config = self.config.get_event_observer_config();
        event_observer_config.registry = Some(registry);

        // Download and ingest a Stacks events archive, if a remote source was
        // configured.
        if self.config.rely_on_remote_stacks_tsv() {
            let _ =
                consolidate_local_stacks_chainstate_using_csv(&mut self.config, &self.ctx).await;
        }

        // Reseed the pool with the unconfirmed blocks checkpointed on disk, so
        // streaming resumes without gaps after a restart.
        let mut stacks_startup_context = StacksObserverStartupContext::default();
        if let Ok(stacks_db) =
            open_readonly_stacks_db_conn_with_retry(&self.config.expected_cache_path(), 3, &self.ctx)
        {
            match get_all_unconfirmed_blocks(&stacks_db, &self.ctx) {
                Ok(blocks) => {
                    stacks_startup_context.last_block_height_appended =
                        get_last_unconfirmed_block_height_inserted(&stacks_db, &self.ctx)
                            .unwrap_or(0);
                    stacks_startup_context.block_pool_seed = blocks.into_iter().collect();
                }
                Err(e) => {
                    warn!(
                        self.ctx.expect_logger(),
                        "unable to retrieve unconfirmed blocks: {}", e
                    );
                }
            }
        }

        // Stacks scan operation threadpool.
        let (stacks_scan_op_tx, stacks_scan_op_rx) = crossbeam_channel::unbounded();
        let stacks_scan_kill_switches: Arc<RwLock<HashMap<String, Arc<RwLock<bool>>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let observer_command_tx_moved = observer_command_tx.clone();
        let dispatcher_moved = dispatcher.clone();
        let kill_switches_moved = stacks_scan_kill_switches.clone();
        let _ = hiro_system_kit::thread_named("Stacks scan runloop")
            .spawn(move || {
                start_stacks_scan_runloop(
                    &config,
                    stacks_scan_op_rx,
                    observer_command_tx_moved,
                    dispatcher_moved,
                    kill_switches_moved,
                    &ctx,
                );
            })
            .expect("unable to spawn thread");

        // Bitcoin scan operation threadpool.
        let (bitcoin_scan_op_tx, bitcoin_scan_op_rx) = crossbeam_channel::unbounded();
        let bitcoin_scan_kill_switches: Arc<RwLock<HashMap<String, Arc<RwLock<bool>>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let observer_command_tx_moved = observer_command_tx.clone();
        let dispatcher_moved = dispatcher.clone();
        let kill_switches_moved = bitcoin_scan_kill_switches.clone();
        let _ = hiro_system_kit::thread_named("Bitcoin scan runloop")
            .spawn(move || {
                start_bitcoin_scan_runloop(
                    &config,
                    bitcoin_scan_op_rx,
                    observer_command_tx_moved,
                    dispatcher_moved,
                    kill_switches_moved,
                    &ctx,
                );
            })
            .expect("unable to spawn thread");

        // Enable the HTTP predicates API, if required.
        if let PredicatesApi::On(ref api_config) = self.config.http_api {
            info!(
                self.ctx.expect_logger(),
                "Listening on port {} for predicate registrations", api_config.http_port
            );
            let ctx = self.ctx.clone();
            let api_config = api_config.clone();
            let moved_observer_command_tx = observer_command_tx.clone();
            let _ = hiro_system_kit::thread_named("HTTP Predicate API").spawn(move || {
                let future = start_predicate_api_server(api_config, moved_observer_command_tx, ctx);
                let _ = hiro_system_kit::nestable_block_on(future);
            });
        }

        info!(
            self.ctx.expect_logger(),
            "Listening on port {} for Stacks chain events", event_observer_config.ingestion_port
        );

        // Start the event observer.
        let context_cloned = self.ctx.clone();
        let event_observer_config_moved = event_observer_config.clone();
        let observer_command_tx_moved = observer_command_tx.clone();
        let dispatcher_moved = dispatcher.clone();
        let _ = hiro_system_kit::thread_named("Event observer").spawn(move || {
            let future = start_event_observer(
                event_observer_config_moved,
                observer_command_tx_moved,
                observer_command_rx,
                Some(observer_event_tx),
                dispatcher_moved,
                stacks_startup_context,
                context_cloned,
            );
            let _ = hiro_system_kit::nestable_block_on(future);
        });

        // Kick off the scans of the predicates recovered at boot.
        for (spec, unfinished_scan_data) in unfinished_scans.into_iter() {
            if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn() {
                update_predicate_spec(&spec.key(), &spec, predicates_db_conn, &self.ctx);
                if unfinished_scan_data.is_none() {
                    update_predicate_status(
                        &spec.key(),
                        PredicateStatus::New,
                        predicates_db_conn,
                        &self.ctx,
                    );
                }
            }
            match spec {
                HookSpecification::Stacks(predicate_spec) => {
                    let _ = stacks_scan_op_tx.send((predicate_spec, unfinished_scan_data));
                }
                HookSpecification::Bitcoin(predicate_spec) => {
                    let _ = bitcoin_scan_op_tx.send((predicate_spec, unfinished_scan_data));
                }
            }
        }

        // Expirations awaiting burial beyond the reorg window.
        let mut pending_expirations: HashMap<String, (Chain, u64)> = HashMap::new();
        let mut stacks_event = 0;

        loop {
            crossbeam_channel::select! {
                recv(observer_event_rx) -> msg => {
                    let event = match msg {
                        Ok(event) => event,
                        Err(e) => {
                            error!(
                                self.ctx.expect_logger(),
                                "Error: broken channel {}", e
                            );
                            break;
                        }
                    };
                    match event {
                        ObserverEvent::PredicateRegistered(spec) => {
                            if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn()
                            {
                                update_predicate_spec(
                                    &spec.key(),
                                    &spec,
                                    predicates_db_conn,
                                    &self.ctx,
                                );
                                update_predicate_status(
                                    &spec.key(),
                                    PredicateStatus::New,
                                    predicates_db_conn,
                                    &self.ctx,
                                );
                            }
                            match spec {
                                HookSpecification::Stacks(predicate_spec) => {
                                    let _ = stacks_scan_op_tx.send((predicate_spec, None));
                                }
                                HookSpecification::Bitcoin(predicate_spec) => {
                                    let _ = bitcoin_scan_op_tx.send((predicate_spec, None));
                                }
                            }
                        }
                        ObserverEvent::PredicateEnabled(spec) => {
                            // Scan caught up with the chain tip: the predicate
                            // now streams from the pool.
                            if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn()
                            {
                                update_predicate_spec(
                                    &spec.key(),
                                    &spec,
                                    predicates_db_conn,
                                    &self.ctx,
                                );
                                set_predicate_streaming_status(
                                    StreamingDataUpdate::Checkpoint,
                                    &spec.key(),
                                    predicates_db_conn,
                                    &self.ctx,
                                );
                            }
                        }
                        ObserverEvent::PredicateDeregistered(spec) => {
                            if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn()
                            {
                                let predicate_key = spec.key();
                                let res: Result<(), redis::RedisError> =
                                    predicates_db_conn.del(predicate_key);
                                if let Err(e) = res {
                                    error!(
                                        self.ctx.expect_logger(),
                                        "unable to delete predicate: {}", e
                                    );
                                }
                            }
                            pending_expirations.remove(spec.uuid());
                            // Cancel any scan in progress for this predicate.
                            let kill_switches = match spec {
                                HookSpecification::Stacks(_) => &stacks_scan_kill_switches,
                                HookSpecification::Bitcoin(_) => &bitcoin_scan_kill_switches,
                            };
                            if let Ok(kill_switches) = kill_switches.read() {
                                if let Some(kill_switch) = kill_switches.get(spec.uuid()) {
                                    if let Ok(mut kill_switch) = kill_switch.write() {
                                        *kill_switch = true;
                                    }
                                }
                            }
                        }
                        ObserverEvent::PredicateExpired(data) => {
                            if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn()
                            {
                                let key = match data.chain {
                                    Chain::Bitcoin => {
                                        HookSpecification::bitcoin_key(&data.uuid)
                                    }
                                    Chain::Stacks => HookSpecification::stacks_key(&data.uuid),
                                };
                                set_unconfirmed_expiration_status(
                                    data.block_identifier.index,
                                    &key,
                                    predicates_db_conn,
                                    &self.ctx,
                                );
                            }
                            pending_expirations.insert(
                                data.uuid.clone(),
                                (data.chain, data.block_identifier.index),
                            );
                        }
                        ObserverEvent::PoolFatalError(chain, reason) => {
                            // Every predicate of the chain loses its footing
                            // when the pool drops blocks it still needed.
                            if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn()
                            {
                                mark_chain_predicates_as_interrupted(
                                    &chain,
                                    &reason,
                                    predicates_db_conn,
                                    &self.ctx,
                                );
                            }
                        }
                        ObserverEvent::BitcoinChainEvent((chain_event, report)) => {
                            let tip = match &chain_event {
                                BitcoinChainEvent::ChainUpdatedWithBlocks(data) => data
                                    .new_blocks
                                    .iter()
                                    .map(|b| b.block_identifier.index)
                                    .max(),
                                BitcoinChainEvent::ChainUpdatedWithReorg(data) => data
                                    .blocks_to_apply
                                    .iter()
                                    .map(|b| b.block_identifier.index)
                                    .max(),
                            };
                            self.update_streaming_statuses(&report, Chain::Bitcoin);
                            if let Some(tip) = tip {
                                self.confirm_pending_expirations(&mut pending_expirations, tip);
                            }
                        }
                        ObserverEvent::StacksChainEvent((chain_event, report)) => {
                            if let Ok(stacks_db_conn_rw) = open_readwrite_stacks_db_conn(
                                &self.config.expected_cache_path(),
                                &self.ctx,
                            ) {
                                match &chain_event {
                                    StacksChainEvent::ChainUpdatedWithBlocks(data) => {
                                        stacks_event += 1;
                                        let _ = confirm_entries_in_stacks_blocks(
                                            &data.confirmed_blocks,
                                            &stacks_db_conn_rw,
                                            &self.ctx,
                                        );
                                        let _ = draft_entries_in_stacks_blocks(
                                            &data.new_blocks,
                                            &stacks_db_conn_rw,
                                            &self.ctx,
                                        );
                                    }
                                    StacksChainEvent::ChainUpdatedWithReorg(data) => {
                                        let _ = confirm_entries_in_stacks_blocks(
                                            &data.confirmed_blocks,
                                            &stacks_db_conn_rw,
                                            &self.ctx,
                                        );
                                        let _ = draft_entries_in_stacks_blocks(
                                            &data.blocks_to_apply,
                                            &stacks_db_conn_rw,
                                            &self.ctx,
                                        );
                                    }
                                    StacksChainEvent::ChainUpdatedWithMicroblocks(_)
                                    | StacksChainEvent::ChainUpdatedWithMicroblocksReorg(_)
                                    | StacksChainEvent::ChainUpdatedWithStackerDbChunks(_) => {}
                                };
                            }

                            self.update_streaming_statuses(&report, Chain::Stacks);
                            if let Some(tip) = chain_event
                                .get_latest_block_identifier()
                                .map(|b| b.index)
                            {
                                self.confirm_pending_expirations(&mut pending_expirations, tip);
                            }

                            // Check for a fresher events archive once in a
                            // while, it spares scans from hitting the node.
                            if stacks_event > 32 {
                                stacks_event = 0;
                                let _ = consolidate_local_stacks_chainstate_using_csv(
                                    &mut self.config,
                                    &self.ctx,
                                )
                                .await;
                            }
                        }
                        ObserverEvent::Terminate => {
                            info!(self.ctx.expect_logger(), "Terminating runloop");
                            break;
                        }
                        _ => {}
                    }
                }
                recv(dispatch_outcome_rx) -> msg => {
                    let DispatchOutcome { uuid, chain, result } = match msg {
                        Ok(outcome) => outcome,
                        Err(_) => continue,
                    };
                    if let Err(e) = result {
                        // Exhausted retries or queue overflow: the predicate
                        // never silently stops, it surfaces as Interrupted.
                        error!(
                            self.ctx.expect_logger(),
                            "Delivery failure for {} predicate {}: {}", chain, uuid, e
                        );
                        if let Some(ref mut predicates_db_conn) = self.try_predicates_db_conn() {
                            let key = match chain {
                                Chain::Bitcoin => HookSpecification::bitcoin_key(&uuid),
                                Chain::Stacks => HookSpecification::stacks_key(&uuid),
                            };
                            set_predicate_interrupted_status(
                                format!("dispatch failure: {}", e),
                                &key,
                                predicates_db_conn,
                                &self.ctx,
                            );
                        }
                        let deregister_command = match chain {
                            Chain::Bitcoin => ObserverCommand::DeregisterBitcoinPredicate(uuid),
                            Chain::Stacks => ObserverCommand::DeregisterStacksPredicate(uuid),
                        };
                        let _ = observer_command_tx.send(deregister_command);
                    }
                }
            }
        }
        Ok(())
    }

    fn try_predicates_db_conn(&self) -> Option<Connection> {
        match self.config.http_api {
            PredicatesApi::On(ref config) => open_readwrite_predicates_db_conn(config).ok(),
            PredicatesApi::Off => None,
        }
    }

    fn update_streaming_statuses(&self, report: &PredicateEvaluationReport, chain: Chain) {
        let Some(mut predicates_db_conn) = self.try_predicates_db_conn() else {
            return;
        };
        for (uuid, blocks) in report.predicates_evaluated.iter() {
            let key = match chain {
                Chain::Bitcoin => HookSpecification::bitcoin_key(uuid),
                Chain::Stacks => HookSpecification::stacks_key(uuid),
            };
            let last_evaluated_block_height =
                blocks.iter().map(|b| b.index).max().unwrap_or(0);
            let triggered = report
                .predicates_triggered
                .get(uuid)
                .map(|b| b.len() as u64)
                .unwrap_or(0);
            set_predicate_streaming_status(
                StreamingDataUpdate::Evaluation {
                    number_of_new_blocks_evaluated: blocks.len() as u64,
                    number_of_new_triggers: triggered,
                    last_evaluated_block_height,
                },
                &key,
                &mut predicates_db_conn,
                &self.ctx,
            );
        }
    }

    fn confirm_pending_expirations(
        &self,
        pending_expirations: &mut HashMap<String, (Chain, u64)>,
        tip: u64,
    ) {
        let mut confirmed = vec![];
        for (uuid, (chain, expired_at)) in pending_expirations.iter() {
            if tip.saturating_sub(*expired_at) >= CONFIRMED_SEGMENT_MINIMUM_LENGTH {
                confirmed.push((uuid.clone(), chain.clone()));
            }
        }
        if confirmed.is_empty() {
            return;
        }
        let Some(mut predicates_db_conn) = self.try_predicates_db_conn() else {
            return;
        };
        for (uuid, chain) in confirmed.into_iter() {
            let key = match chain {
                Chain::Bitcoin => HookSpecification::bitcoin_key(&uuid),
                Chain::Stacks => HookSpecification::stacks_key(&uuid),
            };
            set_confirmed_expiration_status(&key, &mut predicates_db_conn, &self.ctx);
            pending_expirations.remove(&uuid);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "info")]
pub enum PredicateStatus {
    New,
    Scanning(ScanningData),
    Streaming(StreamingData),
    UnconfirmedExpiration(ExpiredData),
    ConfirmedExpiration(ExpiredData),
    Interrupted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningData {
    pub number_of_blocks_to_scan: u64,
    pub number_of_blocks_evaluated: u64,
    pub number_of_times_triggered: u64,
    pub last_occurrence: u64,
    pub last_evaluated_block_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingData {
    pub last_occurrence: u64,
    pub last_evaluation: u64,
    pub number_of_blocks_evaluated: u64,
    pub number_of_times_triggered: u64,
    pub last_evaluated_block_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiredData {
    pub number_of_blocks_evaluated: u64,
    pub number_of_times_triggered: u64,
    pub last_occurrence: u64,
    pub last_evaluated_block_height: u64,
    pub expired_at_block_height: u64,
}

pub enum StreamingDataUpdate {
    /// Scan → stream handoff: carry counters over, no new evaluation yet.
    Checkpoint,
    Evaluation {
        number_of_new_blocks_evaluated: u64,
        number_of_new_triggers: u64,
        last_evaluated_block_height: u64,
    },
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn set_predicate_scanning_status(
    predicate_key: &str,
    number_of_blocks_to_scan: u64,
    number_of_blocks_evaluated: u64,
    number_of_times_triggered: u64,
    current_block_height: u64,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let previous_status = retrieve_predicate_status(predicate_key, predicates_db_conn);
    let last_occurrence = match previous_status {
        Some(PredicateStatus::Scanning(data)) => {
            if number_of_times_triggered > data.number_of_times_triggered {
                now_secs()
            } else {
                data.last_occurrence
            }
        }
        _ => {
            if number_of_times_triggered > 0 {
                now_secs()
            } else {
                0
            }
        }
    };

    update_predicate_status(
        predicate_key,
        PredicateStatus::Scanning(ScanningData {
            number_of_blocks_to_scan,
            number_of_blocks_evaluated,
            number_of_times_triggered,
            last_occurrence,
            last_evaluated_block_height: current_block_height,
        }),
        predicates_db_conn,
        ctx,
    );
}

pub fn set_predicate_streaming_status(
    update: StreamingDataUpdate,
    predicate_key: &str,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let previous_status = retrieve_predicate_status(predicate_key, predicates_db_conn);
    let (
        mut number_of_blocks_evaluated,
        mut number_of_times_triggered,
        mut last_occurrence,
        mut last_evaluated_block_height,
    ) = match previous_status {
        Some(PredicateStatus::Scanning(data)) => (
            data.number_of_blocks_evaluated,
            data.number_of_times_triggered,
            data.last_occurrence,
            data.last_evaluated_block_height,
        ),
        Some(PredicateStatus::Streaming(data)) => (
            data.number_of_blocks_evaluated,
            data.number_of_times_triggered,
            data.last_occurrence,
            data.last_evaluated_block_height,
        ),
        _ => (0, 0, 0, 0),
    };

    if let StreamingDataUpdate::Evaluation {
        number_of_new_blocks_evaluated,
        number_of_new_triggers,
        last_evaluated_block_height: new_height,
    } = update
    {
        number_of_blocks_evaluated += number_of_new_blocks_evaluated;
        number_of_times_triggered += number_of_new_triggers;
        if number_of_new_triggers > 0 {
            last_occurrence = now_secs();
        }
        // A rollback legitimately moves this backwards, to the height of the
        // replacement blocks.
        last_evaluated_block_height = new_height;
    }

    update_predicate_status(
        predicate_key,
        PredicateStatus::Streaming(StreamingData {
            last_occurrence,
            last_evaluation: now_secs(),
            number_of_blocks_evaluated,
            number_of_times_triggered,
            last_evaluated_block_height,
        }),
        predicates_db_conn,
        ctx,
    );
}

pub fn set_unconfirmed_expiration_status(
    expired_at_block_height: u64,
    predicate_key: &str,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let previous_status = retrieve_predicate_status(predicate_key, predicates_db_conn);
    let expired_data = match previous_status {
        Some(PredicateStatus::Scanning(data)) => ExpiredData {
            number_of_blocks_evaluated: data.number_of_blocks_evaluated,
            number_of_times_triggered: data.number_of_times_triggered,
            last_occurrence: data.last_occurrence,
            last_evaluated_block_height: data.last_evaluated_block_height,
            expired_at_block_height,
        },
        Some(PredicateStatus::Streaming(data)) => ExpiredData {
            number_of_blocks_evaluated: data.number_of_blocks_evaluated,
            number_of_times_triggered: data.number_of_times_triggered,
            last_occurrence: data.last_occurrence,
            last_evaluated_block_height: data.last_evaluated_block_height,
            expired_at_block_height,
        },
        Some(PredicateStatus::UnconfirmedExpiration(data)) => data,
        _ => ExpiredData {
            number_of_blocks_evaluated: 0,
            number_of_times_triggered: 0,
            last_occurrence: 0,
            last_evaluated_block_height: expired_at_block_height,
            expired_at_block_height,
        },
    };
    update_predicate_status(
        predicate_key,
        PredicateStatus::UnconfirmedExpiration(expired_data),
        predicates_db_conn,
        ctx,
    );
}

pub fn set_confirmed_expiration_status(
    predicate_key: &str,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let previous_status = retrieve_predicate_status(predicate_key, predicates_db_conn);
    match previous_status {
        Some(PredicateStatus::UnconfirmedExpiration(data)) => {
            update_predicate_status(
                predicate_key,
                PredicateStatus::ConfirmedExpiration(data),
                predicates_db_conn,
                ctx,
            );
        }
        _ => {
            warn!(
                ctx.expect_logger(),
                "Attempted to confirm the expiration of a predicate not pending expiration: {}",
                predicate_key
            );
        }
    }
}

pub fn set_predicate_interrupted_status(
    error: String,
    predicate_key: &str,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    update_predicate_status(
        predicate_key,
        PredicateStatus::Interrupted(error),
        predicates_db_conn,
        ctx,
    );
}

fn mark_chain_predicates_as_interrupted(
    chain: &Chain,
    reason: &str,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let pattern = match chain {
        Chain::Bitcoin => HookSpecification::bitcoin_key("*"),
        Chain::Stacks => HookSpecification::stacks_key("*"),
    };
    let keys: Vec<String> = match predicates_db_conn.scan_match::<_, String>(&pattern) {
        Ok(keys) => keys.into_iter().collect(),
        Err(e) => {
            error!(ctx.expect_logger(), "unable to scan predicates: {}", e);
            return;
        }
    };
    for key in keys.into_iter() {
        set_predicate_interrupted_status(reason.to_string(), &key, predicates_db_conn, ctx);
    }
}

pub fn update_predicate_status(
    predicate_key: &str,
    status: PredicateStatus,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let serialized_status = json!(status).to_string();
    if let Err(e) =
        predicates_db_conn.hset::<_, _, _, ()>(predicate_key, "status", &serialized_status)
    {
        error!(ctx.expect_logger(), "Error updating status: {}", e);
    } else {
        debug!(
            ctx.expect_logger(),
            "Updating predicate {predicate_key} status: {serialized_status}"
        );
    }
}

pub fn update_predicate_spec(
    predicate_key: &str,
    spec: &HookSpecification,
    predicates_db_conn: &mut Connection,
    ctx: &Context,
) {
    let serialized_spec = json!(spec).to_string();
    if let Err(e) =
        predicates_db_conn.hset::<_, _, _, ()>(predicate_key, "specification", &serialized_spec)
    {
        error!(ctx.expect_logger(), "Error updating spec: {}", e);
    } else {
        debug!(
            ctx.expect_logger(),
            "Updating predicate {predicate_key} with spec: {serialized_spec}"
        );
    }
}

pub fn retrieve_predicate_status(
    predicate_key: &str,
    predicates_db_conn: &mut Connection,
) -> Option<PredicateStatus> {
    match predicates_db_conn.hget::<_, _, String>(predicate_key.to_string(), "status") {
        Ok(ref payload) => serde_json::from_str(payload).ok(),
        Err(_) => None,
    }
}

pub fn open_readwrite_predicates_db_conn(
    config: &PredicatesApiConfig,
) -> Result<Connection, String> {
    let redis_uri = &config.database_uri;
    let client = redis::Client::open(redis_uri.clone())
        .map_err(|e| format!("unable to connect to db: {}", e))?;
    client
        .get_connection()
        .map_err(|e| format!("unable to connect to db: {}", e))
}

pub fn open_readwrite_predicates_db_conn_or_panic(
    config: &PredicatesApiConfig,
    ctx: &Context,
) -> Connection {
    match open_readwrite_predicates_db_conn(config) {
        Ok(con) => con,
        Err(message) => {
            error!(ctx.expect_logger(), "Redis: {}", message);
            panic!();
        }
    }
}
