use crate::indexer::bitcoin::{
    build_http_client, download_and_parse_block_with_retry, NewBitcoinBlock,
};
use crate::indexer::stacks::standardize_stacks_marshalled_stackerdb_chunks;
use crate::indexer::Indexer;
use crate::monitoring::PrometheusMonitoring;
use crate::utils::Context;
use blockhook_types::{Chain, StacksChainEvent, StacksChainUpdatedWithStackerDbChunksData};
use hiro_system_kit::slog;
use rocket::serde::json::{json, Json, Value as JsonValue};
use rocket::State;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{BitcoinConfig, BitcoinRPCRequest, ObserverCommand};

#[rocket::get("/ping", format = "application/json")]
pub fn handle_ping(
    ctx: &State<Context>,
    prometheus_monitoring: &State<PrometheusMonitoring>,
) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::info!(logger, "GET /ping"));
    Json(json!({
        "status": 200,
        "result": {
            "bitcoin_tip": prometheus_monitoring.btc_highest_block_ingested.get(),
            "stacks_tip": prometheus_monitoring.stx_highest_block_ingested.get(),
        },
    }))
}

#[post("/new_burn_block", format = "json", data = "<bitcoin_block>")]
pub async fn handle_new_bitcoin_block(
    indexer_rw_lock: &State<Arc<RwLock<Indexer>>>,
    bitcoin_config: &State<BitcoinConfig>,
    bitcoin_block: Json<NewBitcoinBlock>,
    background_job_tx: &State<Arc<Mutex<Sender<ObserverCommand>>>>,
    ctx: &State<Context>,
) -> Json<JsonValue> {
    if bitcoin_config
        .bitcoin_block_signaling
        .should_ignore_bitcoin_block_signaling_through_stacks()
    {
        return Json(json!({
            "status": 200,
            "result": "Ok",
        }));
    }

    ctx.try_log(|logger| slog::info!(logger, "POST /new_burn_block"));
    // Standardize the structure of the block, and identify the kind of update
    // that this new block would imply, taking the reorg window into account.
    let http_client = build_http_client();
    let block_hash = bitcoin_block
        .burn_block_hash
        .strip_prefix("0x")
        .unwrap_or(&bitcoin_block.burn_block_hash);
    let block =
        match download_and_parse_block_with_retry(&http_client, block_hash, bitcoin_config, ctx)
            .await
        {
            Ok(block) => block,
            Err(e) => {
                ctx.try_log(|logger| {
                    slog::warn!(logger, "unable to download_and_parse_block: {}", e)
                });
                return Json(json!({
                    "status": 500,
                    "result": "unable to retrieve_full_block",
                }));
            }
        };

    let header = block.get_block_header();
    match background_job_tx.lock() {
        Ok(tx) => {
            let _ = tx.send(ObserverCommand::ProcessBitcoinBlock(block));
        }
        Err(e) => {
            ctx.try_log(|logger| {
                slog::warn!(logger, "unable to acquire background_job_tx: {}", e)
            });
            return Json(json!({
                "status": 500,
                "result": "Unable to acquire lock",
            }));
        }
    };

    let chain_update = match indexer_rw_lock.inner().write() {
        Ok(mut indexer) => indexer.handle_bitcoin_header(header, ctx),
        Err(e) => {
            ctx.try_log(|logger| {
                slog::warn!(logger, "unable to acquire indexer_rw_lock: {}", e)
            });
            return Json(json!({
                "status": 500,
                "result": "Unable to acquire lock",
            }));
        }
    };

    match chain_update {
        Ok(Some(chain_event)) => {
            match background_job_tx.lock() {
                Ok(tx) => {
                    let _ = tx.send(ObserverCommand::PropagateBitcoinChainEvent(chain_event));
                }
                Err(e) => {
                    ctx.try_log(|logger| {
                        slog::warn!(logger, "unable to acquire background_job_tx: {}", e)
                    });
                    return Json(json!({
                        "status": 500,
                        "result": "Unable to acquire lock",
                    }));
                }
            };
        }
        Ok(None) => {
            ctx.try_log(|logger| slog::info!(logger, "unable to infer chain progress"));
        }
        Err(e) => {
            ctx.try_log(|logger| slog::error!(logger, "unable to handle bitcoin block: {}", e));
            if let Ok(tx) = background_job_tx.lock() {
                let _ = tx.send(ObserverCommand::NotifyPoolError(Chain::Bitcoin, e));
            }
            return Json(json!({
                "status": 500,
                "result": "unable to handle bitcoin block",
            }));
        }
    }

    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post("/new_block", format = "application/json", data = "<marshalled_block>")]
pub fn handle_new_stacks_block(
    indexer_rw_lock: &State<Arc<RwLock<Indexer>>>,
    marshalled_block: Json<JsonValue>,
    background_job_tx: &State<Arc<Mutex<Sender<ObserverCommand>>>>,
    ctx: &State<Context>,
) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::info!(logger, "POST /new_block"));
    // Standardize the structure of the block, and identify the kind of update
    // that this new block would imply, taking the reorg window into account.
    let chain_event = match indexer_rw_lock.inner().write() {
        Ok(mut indexer) => {
            indexer.handle_stacks_marshalled_block(marshalled_block.into_inner(), ctx)
        }
        Err(e) => {
            ctx.try_log(|logger| {
                slog::warn!(logger, "unable to acquire indexer_rw_lock: {}", e)
            });
            return Json(json!({
                "status": 500,
                "result": "Unable to acquire lock",
            }));
        }
    };

    match chain_event {
        Ok(Some(chain_event)) => {
            let background_job_tx = background_job_tx.inner();
            match background_job_tx.lock() {
                Ok(tx) => {
                    let _ = tx.send(ObserverCommand::PropagateStacksChainEvent(chain_event));
                }
                Err(e) => {
                    ctx.try_log(|logger| {
                        slog::warn!(logger, "unable to acquire background_job_tx: {}", e)
                    });
                    return Json(json!({
                        "status": 500,
                        "result": "Unable to acquire lock",
                    }));
                }
            };
        }
        Ok(None) => {
            ctx.try_log(|logger| slog::info!(logger, "unable to infer chain progress"));
        }
        Err(e) => {
            ctx.try_log(|logger| slog::error!(logger, "{}", e));
            if let Ok(tx) = background_job_tx.lock() {
                let _ = tx.send(ObserverCommand::NotifyPoolError(Chain::Stacks, e));
            }
            return Json(json!({
                "status": 500,
                "result": "unable to handle stacks block",
            }));
        }
    }

    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post(
    "/new_microblocks",
    format = "application/json",
    data = "<marshalled_microblock>"
)]
pub fn handle_new_microblocks(
    indexer_rw_lock: &State<Arc<RwLock<Indexer>>>,
    marshalled_microblock: Json<JsonValue>,
    background_job_tx: &State<Arc<Mutex<Sender<ObserverCommand>>>>,
    ctx: &State<Context>,
) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::info!(logger, "POST /new_microblocks"));
    let chain_event = match indexer_rw_lock.inner().write() {
        Ok(mut indexer) => indexer
            .handle_stacks_marshalled_microblock_trail(marshalled_microblock.into_inner(), ctx),
        Err(e) => {
            ctx.try_log(|logger| {
                slog::warn!(logger, "unable to acquire indexer_rw_lock: {}", e)
            });
            return Json(json!({
                "status": 500,
                "result": "Unable to acquire lock",
            }));
        }
    };

    match chain_event {
        Ok(Some(chain_event)) => {
            let background_job_tx = background_job_tx.inner();
            match background_job_tx.lock() {
                Ok(tx) => {
                    let _ = tx.send(ObserverCommand::PropagateStacksChainEvent(chain_event));
                }
                Err(e) => {
                    ctx.try_log(|logger| {
                        slog::warn!(logger, "unable to acquire background_job_tx: {}", e)
                    });
                    return Json(json!({
                        "status": 500,
                        "result": "Unable to acquire lock",
                    }));
                }
            };
        }
        Ok(None) => {
            ctx.try_log(|logger| slog::info!(logger, "unable to infer chain progress"));
        }
        Err(e) => {
            ctx.try_log(|logger| slog::error!(logger, "unable to handle stacks microblock: {}", e));
        }
    }

    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post(
    "/stackerdb_chunks",
    format = "application/json",
    data = "<marshalled_chunks>"
)]
pub fn handle_stackerdb_chunks(
    marshalled_chunks: Json<JsonValue>,
    background_job_tx: &State<Arc<Mutex<Sender<ObserverCommand>>>>,
    ctx: &State<Context>,
) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::info!(logger, "POST /stackerdb_chunks"));
    let received_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let chunks =
        match standardize_stacks_marshalled_stackerdb_chunks(marshalled_chunks.into_inner(), ctx) {
            Ok(chunks) => chunks,
            Err(e) => {
                ctx.try_log(|logger| {
                    slog::error!(logger, "unable to handle stackerdb chunks: {}", e)
                });
                return Json(json!({
                    "status": 500,
                    "result": "unable to handle stackerdb chunks",
                }));
            }
        };

    if !chunks.is_empty() {
        if let Ok(tx) = background_job_tx.lock() {
            let _ = tx.send(ObserverCommand::PropagateStacksChainEvent(
                StacksChainEvent::ChainUpdatedWithStackerDbChunks(
                    StacksChainUpdatedWithStackerDbChunksData {
                        chunks,
                        received_at_ms,
                    },
                ),
            ));
        }
    }

    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

// Mempool admissions are not evaluated; the endpoint only exists so that the
// stacks node's event batch does not error out.
#[post("/new_mempool_tx", format = "application/json", data = "<raw_txs>")]
pub fn handle_new_mempool_tx(raw_txs: Json<Vec<String>>, ctx: &State<Context>) -> Json<JsonValue> {
    ctx.try_log(|logger| {
        slog::debug!(logger, "POST /new_mempool_tx ({} txs)", raw_txs.len())
    });
    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post("/drop_mempool_tx", format = "application/json")]
pub fn handle_drop_mempool_tx(ctx: &State<Context>) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::debug!(logger, "POST /drop_mempool_tx"));
    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post("/attachments/new", format = "application/json")]
pub fn handle_new_attachement(ctx: &State<Context>) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::debug!(logger, "POST /attachments/new"));
    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post("/mined_block", format = "application/json", data = "<payload>")]
pub fn handle_mined_block(payload: Json<JsonValue>, ctx: &State<Context>) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::debug!(logger, "POST /mined_block {:?}", payload));
    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post("/mined_microblock", format = "application/json", data = "<payload>")]
pub fn handle_mined_microblock(payload: Json<JsonValue>, ctx: &State<Context>) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::debug!(logger, "POST /mined_microblock {:?}", payload));
    Json(json!({
        "status": 200,
        "result": "Ok",
    }))
}

#[post("/wallet", format = "application/json", data = "<bitcoin_rpc_call>")]
pub async fn handle_bitcoin_wallet_rpc_call(
    bitcoin_config: &State<BitcoinConfig>,
    bitcoin_rpc_call: Json<BitcoinRPCRequest>,
    ctx: &State<Context>,
) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::info!(logger, "POST /wallet"));

    use base64::encode;
    use reqwest::Client;

    let bitcoin_rpc_call = bitcoin_rpc_call.into_inner().clone();

    let body = rocket::serde::json::serde_json::to_vec(&bitcoin_rpc_call).unwrap_or(vec![]);

    let token = encode(format!(
        "{}:{}",
        bitcoin_config.username, bitcoin_config.password
    ));

    let url = bitcoin_config.rpc_url.to_string();
    let client = Client::new();
    let builder = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Basic {}", token))
        .timeout(std::time::Duration::from_secs(5));

    match builder.body(body).send().await {
        Ok(res) => Json(res.json().await.unwrap_or(json!({ "status": 500 }))),
        Err(_) => Json(json!({
            "status": 500
        })),
    }
}

#[post("/", format = "application/json", data = "<bitcoin_rpc_call>")]
pub async fn handle_bitcoin_rpc_call(
    bitcoin_config: &State<BitcoinConfig>,
    bitcoin_rpc_call: Json<BitcoinRPCRequest>,
    background_job_tx: &State<Arc<Mutex<Sender<ObserverCommand>>>>,
    ctx: &State<Context>,
) -> Json<JsonValue> {
    ctx.try_log(|logger| slog::info!(logger, "POST /"));

    use base64::encode;
    use reqwest::Client;

    let bitcoin_rpc_call = bitcoin_rpc_call.into_inner().clone();
    let method = bitcoin_rpc_call.method.clone();

    let body = rocket::serde::json::serde_json::to_vec(&bitcoin_rpc_call).unwrap_or(vec![]);

    let token = encode(format!(
        "{}:{}",
        bitcoin_config.username, bitcoin_config.password
    ));

    ctx.try_log(|logger| {
        slog::debug!(
            logger,
            "Forwarding {} request to {}",
            method,
            bitcoin_config.rpc_url
        )
    });

    let url = if method == "listunspent" {
        format!("{}/wallet/", bitcoin_config.rpc_url)
    } else {
        bitcoin_config.rpc_url.to_string()
    };

    let client = Client::new();
    let builder = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Basic {}", token))
        .timeout(std::time::Duration::from_secs(5));

    if method == "sendrawtransaction" {
        let background_job_tx = background_job_tx.inner();
        if let Ok(tx) = background_job_tx.lock() {
            let _ = tx.send(ObserverCommand::NotifyBitcoinTransactionProxied);
        };
    }

    match builder.body(body).send().await {
        Ok(res) => {
            let payload = res.json().await.unwrap_or(json!({ "status": 500 }));
            ctx.try_log(|logger| slog::debug!(logger, "Responding with response {:?}", payload));
            Json(payload)
        }
        Err(_) => Json(json!({
            "status": 500
        })),
    }
}
