mod http;

use crate::dispatcher::{Dispatcher, HookOccurrencePayload};
use crate::hooks::bitcoin::{
    evaluate_bitcoin_hooks_on_chain_event, handle_bitcoin_hook_action, BitcoinHookOccurrence,
    BitcoinHookOccurrencePayload, BitcoinTriggerHook,
};
use crate::hooks::stacks::{
    evaluate_stacks_hooks_on_chain_event, handle_stacks_hook_action, StacksHookOccurrence,
    StacksHookOccurrencePayload, StacksTriggerHook,
};
use crate::hooks::types::{HookRegistry, HookSpecification, HookSpecificationNetworkMap};

use crate::indexer::bitcoin::{
    build_http_client, download_and_parse_block_with_retry, standardize_bitcoin_block,
    BitcoinBlockFullBreakdown,
};
use crate::indexer::{Indexer, IndexerConfig};
use crate::monitoring::{start_serving_prometheus_metrics, PrometheusMonitoring};
use crate::utils::{AbstractBlock, AbstractStacksBlock, Context};

use bitcoincore_rpc::bitcoin::{BlockHash, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use blockhook_types::{
    BitcoinBlockData, BitcoinBlockSignaling, BitcoinChainEvent, BitcoinChainUpdatedWithBlocksData,
    BitcoinChainUpdatedWithReorgData, BitcoinNetwork, BlockIdentifier, BlockchainEvent, Chain,
    StacksBlockData, StacksChainEvent, StacksNetwork, StacksNodeConfig, TransactionIdentifier,
};
use hiro_system_kit;
use hiro_system_kit::slog;
use rocket::config::{self, Config, LogLevel};
use rocket::data::{Limits, ToByteUnit};
use rocket::serde::Deserialize;
use rocket::Shutdown;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
#[cfg(feature = "zeromq")]
use zeromq::{Socket, SocketRecv};

pub const DEFAULT_INGESTION_PORT: u16 = 20445;

#[derive(Debug, Clone)]
pub struct EventObserverConfig {
    pub registry: Option<HookRegistry>,
    pub bitcoin_rpc_proxy_enabled: bool,
    pub ingestion_port: u16,
    pub bitcoind_rpc_username: String,
    pub bitcoind_rpc_password: String,
    pub bitcoind_rpc_url: String,
    pub bitcoin_block_signaling: BitcoinBlockSignaling,
    pub display_logs: bool,
    pub cache_path: String,
    pub bitcoin_network: BitcoinNetwork,
    pub stacks_network: StacksNetwork,
    pub prometheus_monitoring_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EventObserverConfigOverrides {
    pub ingestion_port: Option<u16>,
    pub bitcoind_rpc_username: Option<String>,
    pub bitcoind_rpc_password: Option<String>,
    pub bitcoind_rpc_url: Option<String>,
    pub bitcoind_zmq_url: Option<String>,
    pub stacks_node_rpc_url: Option<String>,
    pub display_logs: Option<bool>,
    pub cache_path: Option<String>,
    pub bitcoin_network: Option<String>,
    pub stacks_network: Option<String>,
}

impl EventObserverConfig {
    pub fn get_bitcoin_config(&self) -> BitcoinConfig {
        BitcoinConfig {
            username: self.bitcoind_rpc_username.clone(),
            password: self.bitcoind_rpc_password.clone(),
            rpc_url: self.bitcoind_rpc_url.clone(),
            network: self.bitcoin_network.clone(),
            bitcoin_block_signaling: self.bitcoin_block_signaling.clone(),
        }
    }

    pub fn get_stacks_node_config(&self) -> &StacksNodeConfig {
        match self.bitcoin_block_signaling {
            BitcoinBlockSignaling::Stacks(ref config) => config,
            _ => unreachable!(),
        }
    }

    pub fn get_registry(&self) -> HookRegistry {
        self.registry.clone().unwrap_or_default()
    }

    pub fn new_using_overrides(
        overrides: Option<&EventObserverConfigOverrides>,
    ) -> Result<EventObserverConfig, String> {
        let bitcoin_network =
            if let Some(network) = overrides.and_then(|c| c.bitcoin_network.as_ref()) {
                BitcoinNetwork::from_str(network)?
            } else {
                BitcoinNetwork::Regtest
            };

        let stacks_network =
            if let Some(network) = overrides.and_then(|c| c.stacks_network.as_ref()) {
                StacksNetwork::from_str(network)?
            } else {
                StacksNetwork::Devnet
            };

        let ingestion_port = overrides
            .and_then(|c| c.ingestion_port)
            .unwrap_or(DEFAULT_INGESTION_PORT);

        let config = EventObserverConfig {
            registry: None,
            bitcoin_rpc_proxy_enabled: false,
            ingestion_port,
            bitcoind_rpc_username: overrides
                .and_then(|c| c.bitcoind_rpc_username.clone())
                .unwrap_or("devnet".to_string()),
            bitcoind_rpc_password: overrides
                .and_then(|c| c.bitcoind_rpc_password.clone())
                .unwrap_or("devnet".to_string()),
            bitcoind_rpc_url: overrides
                .and_then(|c| c.bitcoind_rpc_url.clone())
                .unwrap_or("http://localhost:18443".to_string()),
            bitcoin_block_signaling: overrides
                .and_then(|c| c.bitcoind_zmq_url.as_ref())
                .map(|url| BitcoinBlockSignaling::ZeroMQ(url.clone()))
                .unwrap_or(BitcoinBlockSignaling::Stacks(
                    StacksNodeConfig::default_localhost(ingestion_port),
                )),
            display_logs: overrides.and_then(|c| c.display_logs).unwrap_or(false),
            cache_path: overrides
                .and_then(|c| c.cache_path.clone())
                .unwrap_or("cache".to_string()),
            bitcoin_network,
            stacks_network,
            prometheus_monitoring_port: None,
        };
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// JSONRPC Request
pub struct BitcoinRPCRequest {
    /// The name of the RPC call
    pub method: String,
    /// Parameters to the RPC call
    pub params: serde_json::Value,
    /// Identifier for this Request, which should appear in the response
    pub id: serde_json::Value,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct BitcoinConfig {
    pub username: String,
    pub password: String,
    pub rpc_url: String,
    pub network: BitcoinNetwork,
    pub bitcoin_block_signaling: BitcoinBlockSignaling,
}

#[derive(Debug, Clone)]
pub struct HookStore {
    pub predicates: HookRegistry,
}

impl HookStore {
    pub fn new() -> Self {
        Self {
            predicates: HookRegistry::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ObserverCommand {
    ProcessBitcoinBlock(BitcoinBlockFullBreakdown),
    CacheBitcoinBlock(BitcoinBlockData),
    PropagateBitcoinChainEvent(BlockchainEvent),
    PropagateStacksChainEvent(StacksChainEvent),
    NotifyPoolError(Chain, String),
    RegisterPredicate(HookSpecificationNetworkMap),
    EnablePredicate(HookSpecification),
    DeregisterBitcoinPredicate(String),
    DeregisterStacksPredicate(String),
    NotifyBitcoinTransactionProxied,
    Terminate,
}

#[derive(Clone, Debug)]
pub struct PredicateEvaluationReport {
    pub predicates_evaluated: BTreeMap<String, BTreeSet<BlockIdentifier>>,
    pub predicates_triggered: BTreeMap<String, BTreeSet<BlockIdentifier>>,
    pub predicates_expired: BTreeMap<String, BTreeSet<BlockIdentifier>>,
}

impl PredicateEvaluationReport {
    pub fn new() -> PredicateEvaluationReport {
        PredicateEvaluationReport {
            predicates_evaluated: BTreeMap::new(),
            predicates_triggered: BTreeMap::new(),
            predicates_expired: BTreeMap::new(),
        }
    }

    pub fn track_evaluation(&mut self, uuid: &str, block_identifier: &BlockIdentifier) {
        self.predicates_evaluated
            .entry(uuid.to_string())
            .or_default()
            .insert(block_identifier.clone());
    }

    pub fn track_trigger(&mut self, uuid: &str, blocks: &[&BlockIdentifier]) {
        for block_id in blocks.iter() {
            self.predicates_triggered
                .entry(uuid.to_string())
                .or_default()
                .insert((*block_id).clone());
        }
    }

    pub fn track_expiration(&mut self, uuid: &str, block_identifier: &BlockIdentifier) {
        self.predicates_expired
            .entry(uuid.to_string())
            .or_default()
            .insert(block_identifier.clone());
    }
}

impl Default for PredicateEvaluationReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct PredicateExpirationData {
    pub chain: Chain,
    pub uuid: String,
    pub block_identifier: BlockIdentifier,
}

#[derive(Clone, Debug)]
pub enum ObserverEvent {
    Error(String),
    Fatal(String),
    Info(String),
    BitcoinChainEvent((BitcoinChainEvent, PredicateEvaluationReport)),
    StacksChainEvent((StacksChainEvent, PredicateEvaluationReport)),
    NotifyBitcoinTransactionProxied,
    PredicateRegistered(HookSpecification),
    PredicateDeregistered(HookSpecification),
    PredicateEnabled(HookSpecification),
    PredicateExpired(PredicateExpirationData),
    PoolFatalError(Chain, String),
    BitcoinPredicateTriggered(BitcoinHookOccurrencePayload),
    StacksPredicateTriggered(StacksHookOccurrencePayload),
    PredicatesTriggered(usize),
    Terminate,
}

/// Context shared with the Stacks pool at boot: unconfirmed blocks from the
/// on-disk index reseed the fork tracker, and streaming predicates resume
/// from where they stopped.
#[derive(Debug, Clone, Default)]
pub struct StacksObserverStartupContext {
    pub block_pool_seed: Vec<StacksBlockData>,
    pub last_block_height_appended: u64,
}

pub async fn start_event_observer(
    config: EventObserverConfig,
    observer_commands_tx: Sender<ObserverCommand>,
    observer_commands_rx: Receiver<ObserverCommand>,
    observer_events_tx: Option<crossbeam_channel::Sender<ObserverEvent>>,
    dispatcher: Dispatcher,
    stacks_startup_context: StacksObserverStartupContext,
    ctx: Context,
) -> Result<(), Box<dyn Error>> {
    let indexer_config = IndexerConfig {
        bitcoind_rpc_url: config.bitcoind_rpc_url.clone(),
        bitcoind_rpc_username: config.bitcoind_rpc_username.clone(),
        bitcoind_rpc_password: config.bitcoind_rpc_password.clone(),
        stacks_network: config.stacks_network.clone(),
        bitcoin_network: config.bitcoin_network.clone(),
        bitcoin_block_signaling: config.bitcoin_block_signaling.clone(),
    };

    let mut indexer = Indexer::new(indexer_config.clone());
    indexer.seed_stacks_block_pool(stacks_startup_context.block_pool_seed, &ctx);

    let log_level = if config.display_logs {
        if cfg!(feature = "cli") {
            LogLevel::Critical
        } else {
            LogLevel::Debug
        }
    } else {
        LogLevel::Off
    };

    let ingestion_port = config.ingestion_port;
    let bitcoin_rpc_proxy_enabled = config.bitcoin_rpc_proxy_enabled;
    let bitcoin_config = config.get_bitcoin_config();

    let hook_store = HookStore {
        predicates: config.get_registry(),
    };

    let prometheus_monitoring = PrometheusMonitoring::new();
    prometheus_monitoring.initialize(
        hook_store.predicates.stacks_hooks.len() as u64,
        hook_store.predicates.bitcoin_hooks.len() as u64,
        Some(stacks_startup_context.last_block_height_appended),
    );

    if let Some(port) = config.prometheus_monitoring_port {
        let registry_moved = prometheus_monitoring.registry.clone();
        let ctx_cloned = ctx.clone();
        let _ = std::thread::spawn(move || {
            let _ = hiro_system_kit::nestable_block_on(start_serving_prometheus_metrics(
                port,
                registry_moved,
                ctx_cloned,
            ));
        });
    }

    let indexer_rw_lock = Arc::new(RwLock::new(indexer));
    let background_job_tx_mutex = Arc::new(Mutex::new(observer_commands_tx.clone()));

    let limits = Limits::default().limit("json", 20.megabytes());
    let mut shutdown_config = config::Shutdown::default();
    shutdown_config.ctrlc = false;
    shutdown_config.grace = 0;
    shutdown_config.mercy = 0;

    let ingestion_config = Config {
        port: ingestion_port,
        workers: 3,
        address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        keep_alive: 5,
        temp_dir: std::env::temp_dir().into(),
        log_level,
        cli_colors: false,
        limits,
        shutdown: shutdown_config,
        ..Config::default()
    };

    let mut routes = rocket::routes![
        http::handle_ping,
        http::handle_new_bitcoin_block,
        http::handle_new_stacks_block,
        http::handle_new_microblocks,
        http::handle_stackerdb_chunks,
        http::handle_new_mempool_tx,
        http::handle_drop_mempool_tx,
        http::handle_new_attachement,
        http::handle_mined_block,
        http::handle_mined_microblock,
    ];

    if bitcoin_rpc_proxy_enabled {
        routes.append(&mut routes![http::handle_bitcoin_rpc_call]);
        routes.append(&mut routes![http::handle_bitcoin_wallet_rpc_call]);
    }

    let ctx_cloned = ctx.clone();
    let ignite = rocket::custom(ingestion_config)
        .manage(indexer_rw_lock)
        .manage(background_job_tx_mutex)
        .manage(bitcoin_config)
        .manage(ctx_cloned)
        .manage(prometheus_monitoring.clone())
        .mount("/", routes)
        .ignite()
        .await?;
    let ingestion_shutdown = Some(ignite.shutdown());

    let _ = std::thread::spawn(move || {
        let _ = hiro_system_kit::nestable_block_on(ignite.launch());
    });

    #[cfg(feature = "zeromq")]
    start_zeromq_runloop(&config, observer_commands_tx, &ctx);

    // This loop is used for handling background jobs, emitted by HTTP calls.
    start_observer_commands_handler(
        config,
        hook_store,
        observer_commands_rx,
        observer_events_tx,
        ingestion_shutdown,
        prometheus_monitoring,
        dispatcher,
        ctx,
    )
    .await
}

pub fn get_bitcoin_proof(
    bitcoin_client_rpc: &Client,
    transaction_identifier: &TransactionIdentifier,
    block_identifier: &BlockIdentifier,
) -> Result<String, String> {
    let txid = Txid::from_str(transaction_identifier.get_hash_bytes_str())
        .map_err(|e| format!("unable to build txid {}", e))?;
    let block_hash = BlockHash::from_str(block_identifier.get_hash_bytes_str())
        .map_err(|e| format!("unable to build block_hash {}", e))?;

    match bitcoin_client_rpc.get_tx_out_proof(&[txid], Some(&block_hash)) {
        Ok(proof) => Ok(format!("0x{}", hex::encode(&proof))),
        Err(e) => Err(format!(
            "failed collecting proof for transaction {}: {}",
            transaction_identifier.hash, e
        )),
    }
}

#[allow(unused_variables, unused_imports)]
pub fn start_zeromq_runloop(
    config: &EventObserverConfig,
    observer_commands_tx: Sender<ObserverCommand>,
    ctx: &Context,
) {
    #[cfg(feature = "zeromq")]
    {
        use crate::indexer::bitcoin::BitcoinBlockPool;

        if let BitcoinBlockSignaling::ZeroMQ(ref bitcoind_zmq_url) = config.bitcoin_block_signaling
        {
            let bitcoind_zmq_url = bitcoind_zmq_url.clone();
            let ctx_moved = ctx.clone();
            let bitcoin_config = config.get_bitcoin_config();

            hiro_system_kit::thread_named("Bitcoind zmq listener")
                .spawn(move || {
                    ctx_moved.try_log(|logger| {
                        slog::info!(
                            logger,
                            "Waiting for ZMQ connection acknowledgment from bitcoind"
                        )
                    });

                    let _: Result<(), Box<dyn Error>> =
                        hiro_system_kit::nestable_block_on(async move {
                            let mut socket = zeromq::SubSocket::new();

                            socket
                                .connect(&bitcoind_zmq_url)
                                .await
                                .expect("Failed to connect");

                            socket.subscribe("").await?;
                            ctx_moved.try_log(|logger| {
                                slog::info!(logger, "Waiting for ZMQ messages from bitcoind")
                            });

                            let http_client = build_http_client();
                            let mut bitcoin_blocks_pool = BitcoinBlockPool::new();

                            loop {
                                let message = match socket.recv().await {
                                    Ok(message) => message,
                                    Err(e) => {
                                        ctx_moved.try_log(|logger| {
                                            slog::error!(
                                                logger,
                                                "Unable to receive ZMQ message: {}",
                                                e
                                            )
                                        });
                                        continue;
                                    }
                                };
                                let Some(block_hash_bytes) = message.get(1) else {
                                    continue;
                                };
                                let block_hash = hex::encode(block_hash_bytes.to_vec());

                                let block = match download_and_parse_block_with_retry(
                                    &http_client,
                                    &block_hash,
                                    &bitcoin_config,
                                    &ctx_moved,
                                )
                                .await
                                {
                                    Ok(block) => block,
                                    Err(e) => {
                                        ctx_moved.try_log(|logger| {
                                            slog::warn!(
                                                logger,
                                                "unable to download_and_parse_block: {}",
                                                e
                                            )
                                        });
                                        continue;
                                    }
                                };

                                ctx_moved.try_log(|logger| {
                                    slog::info!(
                                        logger,
                                        "Bitcoin block #{} dispatched for processing",
                                        block.height
                                    )
                                });

                                let header = block.get_block_header();
                                let _ = observer_commands_tx
                                    .send(ObserverCommand::ProcessBitcoinBlock(block));

                                match bitcoin_blocks_pool.process_header(header, &ctx_moved) {
                                    Ok(Some(event)) => {
                                        let _ = observer_commands_tx.send(
                                            ObserverCommand::PropagateBitcoinChainEvent(event),
                                        );
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        let _ = observer_commands_tx.send(
                                            ObserverCommand::NotifyPoolError(Chain::Bitcoin, e),
                                        );
                                    }
                                }
                            }
                        });
                })
                .expect("unable to spawn thread");
        }
    }
}

pub fn gather_proofs<'a>(
    trigger: &BitcoinTriggerHook<'a>,
    proofs: &mut HashMap<&'a TransactionIdentifier, String>,
    config: &EventObserverConfig,
    ctx: &Context,
) {
    let bitcoin_client_rpc = match Client::new(
        &config.bitcoind_rpc_url,
        Auth::UserPass(
            config.bitcoind_rpc_username.to_string(),
            config.bitcoind_rpc_password.to_string(),
        ),
    ) {
        Ok(client) => client,
        Err(e) => {
            ctx.try_log(|logger| slog::error!(logger, "unable to build rpc client: {}", e));
            return;
        }
    };

    for (transactions, block) in trigger.apply.iter() {
        for transaction in transactions.iter() {
            if !proofs.contains_key(&transaction.transaction_identifier) {
                ctx.try_log(|logger| {
                    slog::info!(
                        logger,
                        "Collecting proof for transaction {}",
                        transaction.transaction_identifier.hash
                    )
                });
                match get_bitcoin_proof(
                    &bitcoin_client_rpc,
                    &transaction.transaction_identifier,
                    &block.block_identifier,
                ) {
                    Ok(proof) => {
                        proofs.insert(&transaction.transaction_identifier, proof);
                    }
                    Err(e) => {
                        ctx.try_log(|logger| slog::error!(logger, "{e}"));
                    }
                }
            }
        }
    }
}

/// Caps the matched transactions of a trigger to the predicate's remaining
/// occurrence allowance; everything beyond the cap is dropped from the
/// delivery.
fn trim_bitcoin_trigger_to_allowance(trigger: &mut BitcoinTriggerHook, mut allowance: u64) {
    let mut trimmed_apply = vec![];
    for (transactions, block) in trigger.apply.drain(..) {
        if allowance == 0 {
            break;
        }
        let keep = (allowance as usize).min(transactions.len());
        allowance -= keep as u64;
        let kept: Vec<_> = transactions.into_iter().take(keep).collect();
        if !kept.is_empty() {
            trimmed_apply.push((kept, block));
        }
    }
    trigger.apply = trimmed_apply;
}

fn trim_stacks_trigger_to_allowance(trigger: &mut StacksTriggerHook, mut allowance: u64) {
    let mut trimmed_apply = vec![];
    for (transactions, block) in trigger.apply.drain(..) {
        if allowance == 0 {
            break;
        }
        let keep = (allowance as usize).min(transactions.len());
        allowance -= keep as u64;
        let kept: Vec<_> = transactions.into_iter().take(keep).collect();
        if !kept.is_empty() {
            trimmed_apply.push((kept, block));
        }
    }
    trigger.apply = trimmed_apply;
}

pub async fn start_observer_commands_handler(
    config: EventObserverConfig,
    mut hook_store: HookStore,
    observer_commands_rx: Receiver<ObserverCommand>,
    observer_events_tx: Option<crossbeam_channel::Sender<ObserverEvent>>,
    ingestion_shutdown: Option<Shutdown>,
    prometheus_monitoring: PrometheusMonitoring,
    dispatcher: Dispatcher,
    ctx: Context,
) -> Result<(), Box<dyn Error>> {
    // Total matched transactions delivered per predicate; the counter backs
    // `expire_after_occurrence` and is decremented by rollbacks.
    let mut hooks_occurrences_tracker: HashMap<String, u64> = HashMap::new();
    let networks = (&config.bitcoin_network, &config.stacks_network);
    let mut bitcoin_block_store: HashMap<BlockIdentifier, BitcoinBlockData> = HashMap::new();

    loop {
        let command = match observer_commands_rx.recv() {
            Ok(cmd) => cmd,
            Err(e) => {
                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::Error(format!("Channel error: {:?}", e)));
                }
                continue;
            }
        };
        match command {
            ObserverCommand::Terminate => {
                ctx.try_log(|logger| slog::info!(logger, "Handling Termination command"));
                if let Some(ingestion_shutdown) = ingestion_shutdown {
                    ingestion_shutdown.notify();
                }
                dispatcher.terminate();
                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::Info("Terminating event observer".into()));
                    let _ = tx.send(ObserverEvent::Terminate);
                }
                break;
            }
            ObserverCommand::ProcessBitcoinBlock(mut block_data) => {
                let block_hash = block_data.hash.to_string();
                let http_client = build_http_client();
                let new_block = loop {
                    match standardize_bitcoin_block(
                        block_data.clone(),
                        &config.bitcoin_network,
                        &ctx,
                    ) {
                        Ok(block) => break block,
                        Err((e, retry)) => {
                            ctx.try_log(|logger| {
                                slog::error!(logger, "Error standardizing block: {}", e)
                            });
                            if retry {
                                block_data = match download_and_parse_block_with_retry(
                                    &http_client,
                                    &block_hash,
                                    &config.get_bitcoin_config(),
                                    &ctx,
                                )
                                .await
                                {
                                    Ok(block) => block,
                                    Err(e) => {
                                        ctx.try_log(|logger| {
                                            slog::warn!(
                                                logger,
                                                "unable to download_and_parse_block: {}",
                                                e
                                            )
                                        });
                                        continue;
                                    }
                                };
                            }
                        }
                    };
                };
                prometheus_monitoring.btc_metrics_ingest_block(new_block.block_identifier.index);
                bitcoin_block_store.insert(new_block.block_identifier.clone(), new_block);
            }
            ObserverCommand::CacheBitcoinBlock(block) => {
                bitcoin_block_store.insert(block.block_identifier.clone(), block);
            }
            ObserverCommand::PropagateBitcoinChainEvent(blockchain_event) => {
                ctx.try_log(|logger| {
                    slog::info!(logger, "Handling PropagateBitcoinChainEvent command")
                });
                let mut confirmed_blocks = vec![];

                // Reattach the cached full blocks to the header-level event
                // before evaluation.
                let chain_event = match blockchain_event {
                    BlockchainEvent::BlockchainUpdatedWithHeaders(data) => {
                        let mut new_blocks = vec![];

                        for header in data.new_headers.iter() {
                            match bitcoin_block_store.get(&header.block_identifier) {
                                Some(block) => {
                                    new_blocks.push(block.clone());
                                }
                                None => {
                                    ctx.try_log(|logger| {
                                        slog::error!(
                                            logger,
                                            "Unable to retrieve bitcoin block {}",
                                            header.block_identifier
                                        )
                                    });
                                }
                            }
                        }

                        for header in data.confirmed_headers.iter() {
                            match bitcoin_block_store.remove(&header.block_identifier) {
                                Some(block) => {
                                    confirmed_blocks.push(block);
                                }
                                None => {
                                    ctx.try_log(|logger| {
                                        slog::error!(
                                            logger,
                                            "Unable to retrieve confirmed bitcoin block {}",
                                            header.block_identifier
                                        )
                                    });
                                }
                            }
                        }

                        BitcoinChainEvent::ChainUpdatedWithBlocks(
                            BitcoinChainUpdatedWithBlocksData {
                                new_blocks,
                                confirmed_blocks: confirmed_blocks.clone(),
                            },
                        )
                    }
                    BlockchainEvent::BlockchainUpdatedWithReorg(data) => {
                        let mut blocks_to_apply = vec![];
                        let mut blocks_to_rollback = vec![];

                        for header in data.headers_to_rollback.iter() {
                            match bitcoin_block_store.get(&header.block_identifier) {
                                Some(block) => {
                                    blocks_to_rollback.push(block.clone());
                                }
                                None => {
                                    ctx.try_log(|logger| {
                                        slog::error!(
                                            logger,
                                            "Unable to retrieve bitcoin block {}",
                                            header.block_identifier
                                        )
                                    });
                                }
                            }
                        }

                        for header in data.headers_to_apply.iter() {
                            match bitcoin_block_store.get(&header.block_identifier) {
                                Some(block) => {
                                    blocks_to_apply.push(block.clone());
                                }
                                None => {
                                    ctx.try_log(|logger| {
                                        slog::error!(
                                            logger,
                                            "Unable to retrieve bitcoin block {}",
                                            header.block_identifier
                                        )
                                    });
                                }
                            }
                        }

                        for header in data.confirmed_headers.iter() {
                            match bitcoin_block_store.remove(&header.block_identifier) {
                                Some(block) => {
                                    confirmed_blocks.push(block);
                                }
                                None => {
                                    ctx.try_log(|logger| {
                                        slog::error!(
                                            logger,
                                            "Unable to retrieve confirmed bitcoin block {}",
                                            header.block_identifier
                                        )
                                    });
                                }
                            }
                        }

                        if let Some(highest_tip_block) = blocks_to_apply
                            .iter()
                            .max_by_key(|b| b.block_identifier.index)
                        {
                            prometheus_monitoring.btc_metrics_ingest_reorg(
                                highest_tip_block.timestamp.into(),
                                blocks_to_apply.len() as u64,
                                blocks_to_rollback.len() as u64,
                            );
                        }

                        BitcoinChainEvent::ChainUpdatedWithReorg(BitcoinChainUpdatedWithReorgData {
                            blocks_to_apply,
                            blocks_to_rollback,
                            confirmed_blocks: confirmed_blocks.clone(),
                        })
                    }
                };

                let mut hooks_ids_to_expire = vec![];
                let mut report = PredicateEvaluationReport::new();

                let bitcoin_hooks = hook_store
                    .predicates
                    .bitcoin_hooks
                    .iter()
                    .filter(|p| p.enabled)
                    .collect::<Vec<_>>();
                ctx.try_log(|logger| {
                    slog::info!(
                        logger,
                        "Evaluating {} bitcoin hooks registered",
                        bitcoin_hooks.len()
                    )
                });

                let (predicates_triggered, predicates_evaluated, predicates_expired) =
                    evaluate_bitcoin_hooks_on_chain_event(&chain_event, &bitcoin_hooks, &ctx);
                for (uuid, block_identifier) in predicates_evaluated.into_iter() {
                    report.track_evaluation(uuid, block_identifier);
                }
                for (uuid, block_identifier) in predicates_expired.into_iter() {
                    report.track_expiration(uuid, block_identifier);
                    hooks_ids_to_expire.push((uuid.to_string(), block_identifier.clone()));
                }
                for entry in predicates_triggered.iter() {
                    let blocks_ids = entry
                        .apply
                        .iter()
                        .map(|e| &e.1.block_identifier)
                        .collect::<Vec<&BlockIdentifier>>();
                    report.track_trigger(&entry.hook.uuid, &blocks_ids);
                }

                ctx.try_log(|logger| {
                    slog::info!(
                        logger,
                        "{} bitcoin hooks positive evaluations",
                        predicates_triggered.len()
                    )
                });

                let mut hooks_to_trigger = vec![];

                for mut trigger in predicates_triggered.into_iter() {
                    let tracker = hooks_occurrences_tracker
                        .entry(trigger.hook.uuid.clone())
                        .or_insert(0);
                    let applied: u64 =
                        trigger.apply.iter().map(|(txs, _)| txs.len() as u64).sum();
                    let rolled_back: u64 = trigger
                        .rollback
                        .iter()
                        .map(|(txs, _)| txs.len() as u64)
                        .sum();
                    *tracker = tracker.saturating_sub(rolled_back);

                    match trigger.hook.expire_after_occurrence {
                        Some(limit) if limit > 0 => {
                            let allowance = limit.saturating_sub(*tracker);
                            if allowance == 0 && rolled_back == 0 {
                                continue;
                            }
                            trim_bitcoin_trigger_to_allowance(&mut trigger, allowance);
                            let delivered: u64 =
                                trigger.apply.iter().map(|(txs, _)| txs.len() as u64).sum();
                            *tracker += delivered;
                            if *tracker >= limit {
                                if let Some(block_identifier) = trigger
                                    .apply
                                    .iter()
                                    .map(|(_, b)| &b.block_identifier)
                                    .max_by_key(|b| b.index)
                                {
                                    hooks_ids_to_expire.push((
                                        trigger.hook.uuid.clone(),
                                        (*block_identifier).clone(),
                                    ));
                                }
                            }
                            if !trigger.apply.is_empty() || !trigger.rollback.is_empty() {
                                hooks_to_trigger.push(trigger);
                            }
                        }
                        _ => {
                            *tracker += applied;
                            hooks_to_trigger.push(trigger);
                        }
                    }
                }

                let mut proofs = HashMap::new();
                for trigger in hooks_to_trigger.iter() {
                    if trigger.hook.include_proof {
                        gather_proofs(trigger, &mut proofs, &config, &ctx);
                    }
                }

                ctx.try_log(|logger| {
                    slog::info!(
                        logger,
                        "{} bitcoin hooks will be triggered",
                        hooks_to_trigger.len()
                    )
                });

                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::PredicatesTriggered(hooks_to_trigger.len()));
                }
                for hook_to_trigger in hooks_to_trigger.into_iter() {
                    let hook_uuid = hook_to_trigger.hook.uuid.clone();
                    match handle_bitcoin_hook_action(hook_to_trigger, &proofs) {
                        Err(e) => {
                            ctx.try_log(|logger| {
                                slog::error!(logger, "unable to handle action {}", e)
                            });
                        }
                        Ok(BitcoinHookOccurrence::Http(request, data)) => {
                            dispatcher.send(request, HookOccurrencePayload::Bitcoin(data));
                        }
                        Ok(BitcoinHookOccurrence::File(path, bytes)) => {
                            dispatcher.send_file_append(Chain::Bitcoin, &hook_uuid, path, bytes);
                        }
                        Ok(BitcoinHookOccurrence::Data(payload)) => {
                            if let Some(ref tx) = observer_events_tx {
                                let _ = tx.send(ObserverEvent::BitcoinPredicateTriggered(payload));
                            }
                        }
                    }
                }

                for (hook_uuid, block_identifier) in hooks_ids_to_expire.iter() {
                    expire_bitcoin_hook(
                        hook_uuid.clone(),
                        block_identifier.clone(),
                        &mut hook_store,
                        &observer_events_tx,
                        &prometheus_monitoring,
                        &ctx,
                    );
                }

                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::BitcoinChainEvent((chain_event, report)));
                }
            }
            ObserverCommand::PropagateStacksChainEvent(chain_event) => {
                ctx.try_log(|logger| {
                    slog::info!(logger, "Handling PropagateStacksChainEvent command")
                });
                let mut hooks_ids_to_expire = vec![];
                let mut report = PredicateEvaluationReport::new();

                let stacks_hooks = hook_store
                    .predicates
                    .stacks_hooks
                    .iter()
                    .filter(|p| p.enabled)
                    .collect::<Vec<_>>();
                ctx.try_log(|logger| {
                    slog::info!(
                        logger,
                        "Evaluating {} stacks hooks registered",
                        stacks_hooks.len()
                    )
                });

                match &chain_event {
                    StacksChainEvent::ChainUpdatedWithBlocks(update) => {
                        if let Some(highest_tip_update) = update
                            .new_blocks
                            .iter()
                            .max_by_key(|b| b.block.block_identifier.index)
                        {
                            prometheus_monitoring.stx_metrics_ingest_block(
                                highest_tip_update.block.block_identifier.index,
                            );
                        }
                    }
                    StacksChainEvent::ChainUpdatedWithReorg(update) => {
                        if let Some(highest_tip_update) = update
                            .blocks_to_apply
                            .iter()
                            .max_by_key(|b| b.block.block_identifier.index)
                        {
                            prometheus_monitoring.stx_metrics_ingest_reorg(
                                highest_tip_update.block.timestamp,
                                update.blocks_to_apply.len() as u64,
                                update.blocks_to_rollback.len() as u64,
                            );
                        }
                    }
                    _ => {}
                }

                let (predicates_triggered, predicates_evaluated, predicates_expired) =
                    evaluate_stacks_hooks_on_chain_event(&chain_event, stacks_hooks, &ctx);
                for (uuid, block_identifier) in predicates_evaluated.into_iter() {
                    report.track_evaluation(uuid, block_identifier);
                }
                for (uuid, block_identifier) in predicates_expired.into_iter() {
                    report.track_expiration(uuid, block_identifier);
                    hooks_ids_to_expire.push((uuid.to_string(), block_identifier.clone()));
                }
                for entry in predicates_triggered.iter() {
                    let blocks_ids = entry
                        .apply
                        .iter()
                        .map(|e| e.1.get_identifier())
                        .collect::<Vec<&BlockIdentifier>>();
                    report.track_trigger(&entry.hook.uuid, &blocks_ids);
                }
                ctx.try_log(|logger| {
                    slog::info!(
                        logger,
                        "{} stacks hooks positive evaluations",
                        predicates_triggered.len()
                    )
                });

                let mut hooks_to_trigger = vec![];

                for mut trigger in predicates_triggered.into_iter() {
                    let tracker = hooks_occurrences_tracker
                        .entry(trigger.hook.uuid.clone())
                        .or_insert(0);
                    let applied: u64 =
                        trigger.apply.iter().map(|(txs, _)| txs.len() as u64).sum();
                    let rolled_back: u64 = trigger
                        .rollback
                        .iter()
                        .map(|(txs, _)| txs.len() as u64)
                        .sum();
                    *tracker = tracker.saturating_sub(rolled_back);

                    match trigger.hook.expire_after_occurrence {
                        Some(limit) if limit > 0 => {
                            let allowance = limit.saturating_sub(*tracker);
                            if allowance == 0 && rolled_back == 0 && trigger.chunks.is_empty() {
                                continue;
                            }
                            trim_stacks_trigger_to_allowance(&mut trigger, allowance);
                            let delivered: u64 =
                                trigger.apply.iter().map(|(txs, _)| txs.len() as u64).sum();
                            *tracker += delivered;
                            if *tracker >= limit {
                                if let Some(block_identifier) = trigger
                                    .apply
                                    .iter()
                                    .map(|(_, b)| b.get_identifier())
                                    .max_by_key(|b| b.index)
                                {
                                    hooks_ids_to_expire.push((
                                        trigger.hook.uuid.clone(),
                                        block_identifier.clone(),
                                    ));
                                }
                            }
                            if !trigger.apply.is_empty()
                                || !trigger.rollback.is_empty()
                                || !trigger.chunks.is_empty()
                            {
                                hooks_to_trigger.push(trigger);
                            }
                        }
                        _ => {
                            *tracker += applied;
                            hooks_to_trigger.push(trigger);
                        }
                    }
                }

                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::PredicatesTriggered(hooks_to_trigger.len()));
                }
                let proofs = HashMap::new();
                for hook_to_trigger in hooks_to_trigger.into_iter() {
                    let hook_uuid = hook_to_trigger.hook.uuid.clone();
                    match handle_stacks_hook_action(hook_to_trigger, &proofs, &ctx) {
                        Err(e) => {
                            ctx.try_log(|logger| {
                                slog::error!(logger, "unable to handle action {}", e)
                            });
                        }
                        Ok(StacksHookOccurrence::Http(request, data)) => {
                            dispatcher.send(request, HookOccurrencePayload::Stacks(data));
                        }
                        Ok(StacksHookOccurrence::File(path, bytes)) => {
                            dispatcher.send_file_append(Chain::Stacks, &hook_uuid, path, bytes);
                        }
                        Ok(StacksHookOccurrence::Data(payload)) => {
                            if let Some(ref tx) = observer_events_tx {
                                let _ = tx.send(ObserverEvent::StacksPredicateTriggered(payload));
                            }
                        }
                    }
                }

                for (hook_uuid, block_identifier) in hooks_ids_to_expire.iter() {
                    expire_stacks_hook(
                        hook_uuid.clone(),
                        block_identifier.clone(),
                        &mut hook_store,
                        &observer_events_tx,
                        &prometheus_monitoring,
                        &ctx,
                    );
                }

                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::StacksChainEvent((chain_event, report)));
                }
            }
            ObserverCommand::NotifyPoolError(chain, reason) => {
                ctx.try_log(|logger| {
                    slog::error!(logger, "Fatal {} pool error: {}", chain, reason)
                });
                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::PoolFatalError(chain, reason));
                }
            }
            ObserverCommand::NotifyBitcoinTransactionProxied => {
                ctx.try_log(|logger| {
                    slog::info!(logger, "Handling NotifyBitcoinTransactionProxied command")
                });
                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::NotifyBitcoinTransactionProxied);
                }
            }
            ObserverCommand::RegisterPredicate(spec) => {
                ctx.try_log(|logger| slog::info!(logger, "Handling RegisterPredicate command"));

                let mut spec = match hook_store
                    .predicates
                    .register_full_specification(networks, spec)
                {
                    Ok(spec) => spec,
                    Err(e) => {
                        ctx.try_log(|logger| {
                            slog::error!(logger, "Unable to register new hook spec: {}", e)
                        });
                        if let Some(ref tx) = observer_events_tx {
                            let _ = tx.send(ObserverEvent::Error(format!(
                                "unable to register predicate: {}",
                                e
                            )));
                        }
                        continue;
                    }
                };
                ctx.try_log(|logger| slog::info!(logger, "Registering hook {}", spec.uuid()));
                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::PredicateRegistered(spec.clone()));
                } else {
                    ctx.try_log(|logger| slog::info!(logger, "Enabling Predicate {}", spec.uuid()));
                    hook_store.predicates.enable_specification(&mut spec);
                }

                match spec {
                    HookSpecification::Bitcoin(_) => {
                        prometheus_monitoring.btc_metrics_register_predicate()
                    }
                    HookSpecification::Stacks(_) => {
                        prometheus_monitoring.stx_metrics_register_predicate()
                    }
                };
            }
            ObserverCommand::EnablePredicate(mut spec) => {
                ctx.try_log(|logger| slog::info!(logger, "Enabling Predicate {}", spec.uuid()));
                hook_store.predicates.enable_specification(&mut spec);
                if let Some(ref tx) = observer_events_tx {
                    let _ = tx.send(ObserverEvent::PredicateEnabled(spec));
                }
            }
            ObserverCommand::DeregisterStacksPredicate(hook_uuid) => {
                ctx.try_log(|logger| {
                    slog::info!(logger, "Handling DeregisterStacksPredicate command")
                });
                dispatcher.drain(&hook_uuid);
                hooks_occurrences_tracker.remove(&hook_uuid);
                let hook = hook_store.predicates.deregister_stacks_hook(hook_uuid);
                if let Some(hook) = hook {
                    prometheus_monitoring.stx_metrics_deregister_predicate();
                    if let Some(ref tx) = observer_events_tx {
                        let _ = tx.send(ObserverEvent::PredicateDeregistered(
                            HookSpecification::Stacks(hook),
                        ));
                    }
                }
            }
            ObserverCommand::DeregisterBitcoinPredicate(hook_uuid) => {
                ctx.try_log(|logger| {
                    slog::info!(logger, "Handling DeregisterBitcoinPredicate command")
                });
                dispatcher.drain(&hook_uuid);
                hooks_occurrences_tracker.remove(&hook_uuid);
                let hook = hook_store.predicates.deregister_bitcoin_hook(hook_uuid);
                if let Some(hook) = hook {
                    prometheus_monitoring.btc_metrics_deregister_predicate();
                    if let Some(ref tx) = observer_events_tx {
                        let _ = tx.send(ObserverEvent::PredicateDeregistered(
                            HookSpecification::Bitcoin(hook),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn expire_bitcoin_hook(
    hook_uuid: String,
    block_identifier: BlockIdentifier,
    hook_store: &mut HookStore,
    observer_events_tx: &Option<crossbeam_channel::Sender<ObserverEvent>>,
    _prometheus_monitoring: &PrometheusMonitoring,
    ctx: &Context,
) {
    for spec in hook_store.predicates.bitcoin_hooks.iter_mut() {
        if spec.uuid == hook_uuid && spec.expired_at.is_none() {
            spec.enabled = false;
            spec.expired_at = Some(block_identifier.index);
            ctx.try_log(|logger| {
                slog::info!(logger, "Bitcoin hook {} expired at {}", hook_uuid, block_identifier)
            });
            if let Some(tx) = observer_events_tx {
                let _ = tx.send(ObserverEvent::PredicateExpired(PredicateExpirationData {
                    chain: Chain::Bitcoin,
                    uuid: hook_uuid.clone(),
                    block_identifier: block_identifier.clone(),
                }));
            }
            break;
        }
    }
}

fn expire_stacks_hook(
    hook_uuid: String,
    block_identifier: BlockIdentifier,
    hook_store: &mut HookStore,
    observer_events_tx: &Option<crossbeam_channel::Sender<ObserverEvent>>,
    _prometheus_monitoring: &PrometheusMonitoring,
    ctx: &Context,
) {
    for spec in hook_store.predicates.stacks_hooks.iter_mut() {
        if spec.uuid == hook_uuid && spec.expired_at.is_none() {
            spec.enabled = false;
            spec.expired_at = Some(block_identifier.index);
            ctx.try_log(|logger| {
                slog::info!(logger, "Stacks hook {} expired at {}", hook_uuid, block_identifier)
            });
            if let Some(tx) = observer_events_tx {
                let _ = tx.send(ObserverEvent::PredicateExpired(PredicateExpirationData {
                    chain: Chain::Stacks,
                    uuid: hook_uuid.clone(),
                    block_identifier: block_identifier.clone(),
                }));
            }
            break;
        }
    }
}

#[cfg(test)]
pub mod tests;
