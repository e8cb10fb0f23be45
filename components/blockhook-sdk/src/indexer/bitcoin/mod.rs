pub mod blocks_pool;

pub use blocks_pool::{BitcoinBlockPool, CONFIRMED_SEGMENT_MINIMUM_LENGTH};

use crate::hooks::types::bitcoin::{get_stacks_canonical_magic_bytes, StacksOpcodes};
use crate::observer::BitcoinConfig;
use crate::utils::Context;
use blockhook_types::bitcoin::{OutPoint, TxIn, TxOut};
use blockhook_types::{
    BitcoinBlockData, BitcoinBlockMetadata, BitcoinNetwork, BitcoinTransactionData,
    BitcoinTransactionMetadata, BlockCommitmentData, BlockHeader, BlockIdentifier,
    KeyRegistrationData, LockSTXData, OrdinalInscriptionRevealData, OrdinalOperation,
    StacksBaseChainOperation, TransactionIdentifier, TransferSTXData,
};
use hiro_system_kit::slog;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
pub struct NewBitcoinBlock {
    pub burn_block_hash: String,
    pub burn_block_height: u64,
    pub reward_slot_holders: Vec<String>,
    pub reward_recipients: Vec<RewardParticipant>,
    pub burn_amount: u64,
}

#[derive(Deserialize)]
pub struct RewardParticipant {
    pub recipient: String,
    pub amt: u64,
}

/// `getblock` verbosity 3 payload: transactions come with their prevouts,
/// which is what makes fee computation possible without a tx index.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinBlockFullBreakdown {
    pub hash: String,
    pub height: usize,
    pub time: usize,
    pub tx: Vec<BitcoinTransactionFullBreakdown>,
    pub confirmations: i64,
    pub previousblockhash: Option<String>,
}

impl BitcoinBlockFullBreakdown {
    pub fn get_block_header(&self) -> BlockHeader {
        let block_identifier = BlockIdentifier {
            index: self.height as u64,
            hash: format!("0x{}", self.hash),
        };
        // The genesis block is its own parent.
        let parent_block_identifier = match self.previousblockhash {
            Some(ref parent_hash) => BlockIdentifier {
                index: (self.height as u64).saturating_sub(1),
                hash: format!("0x{}", parent_hash),
            },
            None => block_identifier.clone(),
        };
        BlockHeader {
            block_identifier,
            parent_block_identifier,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinTransactionFullBreakdown {
    pub txid: String,
    pub vin: Vec<BitcoinTransactionInputFullBreakdown>,
    pub vout: Vec<BitcoinTransactionOutputFullBreakdown>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinTransactionInputFullBreakdown {
    pub sequence: u32,
    pub txid: Option<String>,
    pub vout: Option<u32>,
    pub script_sig: Option<BitcoinTransactionInputScriptSigFullBreakdown>,
    pub txinwitness: Option<Vec<String>>,
    pub prevout: Option<BitcoinTransactionInputPrevoutFullBreakdown>,
}

impl BitcoinTransactionInputFullBreakdown {
    pub fn is_coinbase(&self) -> bool {
        self.txid.is_none()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinTransactionInputScriptSigFullBreakdown {
    pub hex: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinTransactionInputPrevoutFullBreakdown {
    pub height: u64,
    pub value: f64,
}

impl BitcoinTransactionInputPrevoutFullBreakdown {
    pub fn value_in_sats(&self) -> u64 {
        (self.value * 100_000_000.0).round() as u64
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinTransactionOutputFullBreakdown {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: BitcoinTransactionOutputScriptPubKeyFullBreakdown,
}

impl BitcoinTransactionOutputFullBreakdown {
    pub fn value_in_sats(&self) -> u64 {
        (self.value * 100_000_000.0).round() as u64
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BitcoinTransactionOutputScriptPubKeyFullBreakdown {
    pub hex: String,
}

pub fn build_http_client() -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(15 * 60))
        .build()
        .expect("unable to build http client")
}

async fn bitcoind_rpc_call(
    http_client: &HttpClient,
    method: &str,
    params: serde_json::Value,
    bitcoin_config: &BitcoinConfig,
) -> Result<serde_json::Value, String> {
    let body = json!({
        "jsonrpc": "1.0",
        "id": "blockhook",
        "method": method,
        "params": params,
    });
    let response = http_client
        .post(&bitcoin_config.rpc_url)
        .basic_auth(&bitcoin_config.username, Some(&bitcoin_config.password))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("unable to send {} request ({})", method, e))?
        .json::<serde_json::Value>()
        .await
        .map_err(|e| format!("unable to parse {} response ({})", method, e))?;
    if let Some(error) = response.get("error") {
        if !error.is_null() {
            return Err(format!("{} rpc error: {}", method, error));
        }
    }
    response
        .get("result")
        .cloned()
        .ok_or(format!("{} response missing result", method))
}

pub async fn retrieve_block_hash(
    http_client: &HttpClient,
    block_height: &u64,
    bitcoin_config: &BitcoinConfig,
) -> Result<String, String> {
    let result = bitcoind_rpc_call(
        http_client,
        "getblockhash",
        json!([block_height]),
        bitcoin_config,
    )
    .await?;
    serde_json::from_value::<String>(result)
        .map_err(|e| format!("unable to parse getblockhash response ({})", e))
}

pub async fn retrieve_block_hash_with_retry(
    http_client: &HttpClient,
    block_height: &u64,
    bitcoin_config: &BitcoinConfig,
    ctx: &Context,
) -> Result<String, String> {
    let mut errors_count = 0;
    let block_hash = loop {
        match retrieve_block_hash(http_client, block_height, bitcoin_config).await {
            Ok(result) => break result,
            Err(e) => {
                errors_count += 1;
                if errors_count > 3 {
                    return Err(format!(
                        "unable to retrieve block hash #{}: {}",
                        block_height, e
                    ));
                }
                ctx.try_log(|logger| {
                    slog::warn!(
                        logger,
                        "unable to retrieve block hash #{} (attempt #{}), will retry",
                        block_height,
                        errors_count
                    )
                });
                std::thread::sleep(std::time::Duration::from_secs(2));
            }
        }
    };
    Ok(block_hash)
}

pub async fn download_block(
    http_client: &HttpClient,
    block_hash: &str,
    bitcoin_config: &BitcoinConfig,
) -> Result<BitcoinBlockFullBreakdown, String> {
    let result = bitcoind_rpc_call(
        http_client,
        "getblock",
        json!([block_hash, 3]),
        bitcoin_config,
    )
    .await?;
    serde_json::from_value::<BitcoinBlockFullBreakdown>(result)
        .map_err(|e| format!("unable to parse getblock response ({})", e))
}

pub async fn download_and_parse_block_with_retry(
    http_client: &HttpClient,
    block_hash: &str,
    bitcoin_config: &BitcoinConfig,
    ctx: &Context,
) -> Result<BitcoinBlockFullBreakdown, String> {
    let mut errors_count = 0;
    let block = loop {
        match download_block(http_client, block_hash, bitcoin_config).await {
            Ok(result) => break result,
            Err(e) => {
                errors_count += 1;
                if errors_count > 3 {
                    return Err(format!("unable to download block {}: {}", block_hash, e));
                }
                ctx.try_log(|logger| {
                    slog::warn!(
                        logger,
                        "unable to download block {} (attempt #{}), will retry",
                        block_hash,
                        errors_count
                    )
                });
                std::thread::sleep(std::time::Duration::from_secs(2));
            }
        }
    };
    Ok(block)
}

/// Normalizes a raw RPC block into the common shape evaluated by predicates.
/// The boolean in the error indicates whether a retry (with a fresh download)
/// could succeed.
pub fn standardize_bitcoin_block(
    block: BitcoinBlockFullBreakdown,
    network: &BitcoinNetwork,
    ctx: &Context,
) -> Result<BitcoinBlockData, (String, bool)> {
    let mut transactions = vec![];
    let block_height = block.height as u64;
    let expected_magic_bytes = get_stacks_canonical_magic_bytes(network);

    ctx.try_log(|logger| slog::debug!(logger, "Standardizing Bitcoin block {}", block.hash));

    for (tx_index, mut tx) in block.tx.into_iter().enumerate() {
        let txid = tx.txid.to_string();

        let mut inputs = vec![];
        let mut sats_in = 0;
        let mut all_prevouts_known = true;
        for (index, input) in tx.vin.drain(..).enumerate() {
            if input.is_coinbase() {
                all_prevouts_known = false;
                continue;
            }
            let (prevout_value, prevout_height) = match input.prevout {
                Some(ref prevout) => {
                    sats_in += prevout.value_in_sats();
                    (prevout.value_in_sats(), prevout.height)
                }
                None => {
                    all_prevouts_known = false;
                    (0, 0)
                }
            };
            let txin = input.txid.as_ref().ok_or((
                format!("txid missing for input #{} in transaction {}", index, txid),
                true,
            ))?;
            let vout = input.vout.ok_or((
                format!("vout missing for input #{} in transaction {}", index, txid),
                true,
            ))?;
            inputs.push(TxIn {
                previous_output: OutPoint {
                    txid: TransactionIdentifier::new(txin),
                    vout,
                    value: prevout_value,
                    block_height: prevout_height,
                },
                script_sig: format!(
                    "0x{}",
                    input.script_sig.map(|s| s.hex).unwrap_or_default()
                ),
                sequence: input.sequence,
                witness: input
                    .txinwitness
                    .unwrap_or_default()
                    .iter()
                    .map(|w| format!("0x{}", w))
                    .collect::<Vec<_>>(),
            });
        }

        let mut outputs = vec![];
        let mut sats_out = 0;
        for output in tx.vout.drain(..) {
            sats_out += output.value_in_sats();
            outputs.push(TxOut {
                value: output.value_in_sats(),
                script_pubkey: format!("0x{}", output.script_pub_key.hex),
            });
        }

        let mut stacks_operations = vec![];
        if let Some(op) =
            try_parse_stacks_operation(&outputs, &expected_magic_bytes, block_height, ctx)
        {
            stacks_operations.push(op);
        }

        let ordinal_operations = try_parse_ordinal_operations(&txid, &inputs);

        transactions.push(BitcoinTransactionData {
            transaction_identifier: TransactionIdentifier::new(&txid),
            operations: vec![],
            metadata: BitcoinTransactionMetadata {
                fee: if all_prevouts_known {
                    sats_in.saturating_sub(sats_out)
                } else {
                    0
                },
                index: tx_index as u32,
                inputs,
                outputs,
                stacks_operations,
                ordinal_operations,
                proof: None,
            },
        });
    }

    Ok(BitcoinBlockData {
        block_identifier: BlockIdentifier {
            hash: format!("0x{}", block.hash),
            index: block_height,
        },
        parent_block_identifier: match block.previousblockhash {
            Some(ref parent_hash) => BlockIdentifier {
                hash: format!("0x{}", parent_hash),
                index: block_height.saturating_sub(1),
            },
            None => BlockIdentifier {
                hash: format!("0x{}", block.hash),
                index: block_height,
            },
        },
        timestamp: block.time as u32,
        metadata: BitcoinBlockMetadata {
            network: network.clone(),
        },
        transactions,
    })
}

fn try_parse_stacks_operation(
    outputs: &[TxOut],
    expected_magic_bytes: &[u8; 2],
    _block_height: u64,
    ctx: &Context,
) -> Option<StacksBaseChainOperation> {
    let op_return_output = outputs.first()?.get_script_pubkey_bytes();
    // OP_RETURN PUSH_DATA <magic:2> <opcode:1> <payload>. Stacks operations
    // are large enough that mainnet scripts go through OP_PUSHDATA1.
    if op_return_output.len() < 8 {
        return None;
    }
    if op_return_output[0] != 0x6a {
        return None;
    }
    let magic_offset = if op_return_output[1] == 0x4c { 3 } else { 2 };
    if op_return_output[magic_offset] != expected_magic_bytes[0]
        || op_return_output[magic_offset + 1] != expected_magic_bytes[1]
    {
        return None;
    }
    let op_type: StacksOpcodes = match op_return_output[magic_offset + 2].try_into() {
        Ok(op) => op,
        Err(_) => {
            ctx.try_log(|logger| {
                slog::debug!(
                    logger,
                    "Stacks operation parsing - opcode unknown {}",
                    op_return_output[magic_offset + 2]
                )
            });
            return None;
        }
    };
    let payload = &op_return_output[magic_offset + 3..];
    let op = match op_type {
        StacksOpcodes::BlockCommit => {
            if payload.len() < 32 {
                return None;
            }
            StacksBaseChainOperation::BlockCommitted(BlockCommitmentData {
                stacks_block_hash: format!("0x{}", hex::encode(&payload[0..32])),
            })
        }
        StacksOpcodes::KeyRegister => {
            StacksBaseChainOperation::LeaderRegistered(KeyRegistrationData {})
        }
        StacksOpcodes::PreStx => return None,
        StacksOpcodes::TransferStx => {
            if payload.len() < 16 {
                return None;
            }
            StacksBaseChainOperation::StxTransferred(TransferSTXData {
                sender: String::new(),
                recipient: String::new(),
                amount: u128::from_be_bytes(payload[0..16].try_into().ok()?).to_string(),
            })
        }
        StacksOpcodes::StackStx => {
            if payload.len() < 16 {
                return None;
            }
            StacksBaseChainOperation::StxLocked(LockSTXData {
                sender: String::new(),
                amount: u128::from_be_bytes(payload[0..16].try_into().ok()?).to_string(),
                duration: *payload.get(16).unwrap_or(&1) as u64,
            })
        }
    };
    Some(op)
}

// OP_FALSE OP_IF OP_PUSHBYTES_3 "ord", the envelope prelude defined by the
// ordinals protocol.
const ORDINAL_ENVELOPE_PRELUDE: [u8; 6] = [0x00, 0x63, 0x03, 0x6f, 0x72, 0x64];
const OP_ENDIF: u8 = 0x68;

fn try_parse_ordinal_operations(txid: &str, inputs: &[TxIn]) -> Vec<OrdinalOperation> {
    let mut operations = vec![];
    for (input_index, input) in inputs.iter().enumerate() {
        for witness in input.witness.iter() {
            let bytes = match hex::decode(witness.strip_prefix("0x").unwrap_or(witness)) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let Some(envelope_start) = bytes
                .windows(ORDINAL_ENVELOPE_PRELUDE.len())
                .position(|window| window == ORDINAL_ENVELOPE_PRELUDE)
            else {
                continue;
            };
            let envelope = &bytes[envelope_start + ORDINAL_ENVELOPE_PRELUDE.len()..];
            let Some((content_type, content_bytes)) = parse_inscription_envelope(envelope) else {
                continue;
            };
            operations.push(OrdinalOperation::InscriptionRevealed(
                OrdinalInscriptionRevealData {
                    content_bytes: format!("0x{}", hex::encode(&content_bytes)),
                    content_type,
                    content_length: content_bytes.len(),
                    inscription_number: 0,
                    inscription_fee: 0,
                    inscription_output_value: inputs
                        .first()
                        .map(|i| i.previous_output.value)
                        .unwrap_or(0),
                    inscription_id: format!(
                        "{}i{}",
                        txid.strip_prefix("0x").unwrap_or(txid),
                        operations.len()
                    ),
                    inscription_input_index: input_index,
                    inscriber_address: None,
                    ordinal_number: 0,
                    ordinal_block_height: 0,
                    ordinal_offset: 0,
                    satpoint_post_inscription: format!(
                        "{}:0:0",
                        txid.strip_prefix("0x").unwrap_or(txid)
                    ),
                    curse_type: None,
                },
            ));
            break;
        }
    }
    operations
}

/// Minimal walk of the inscription envelope body: tag 0x01 carries the
/// content-type, OP_0 introduces the content pushes, OP_ENDIF closes.
fn parse_inscription_envelope(envelope: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut cursor = 0;
    let mut content_type = "unknown".to_string();
    while cursor < envelope.len() {
        let opcode = envelope[cursor];
        cursor += 1;
        match opcode {
            0x01 => {
                // Field tag: next push is the content-type.
                let len = *envelope.get(cursor)? as usize;
                cursor += 1;
                let bytes = envelope.get(cursor..cursor + len)?;
                content_type = String::from_utf8_lossy(bytes).to_string();
                cursor += len;
            }
            0x00 => {
                // Body separator: concatenate pushes until OP_ENDIF.
                let mut content_bytes = vec![];
                while cursor < envelope.len() && envelope[cursor] != OP_ENDIF {
                    let push = envelope[cursor] as usize;
                    cursor += 1;
                    let (len, data_start) = match push {
                        0x4c => (*envelope.get(cursor)? as usize, cursor + 1),
                        0x4d => {
                            let lo = *envelope.get(cursor)? as usize;
                            let hi = *envelope.get(cursor + 1)? as usize;
                            (lo | (hi << 8), cursor + 2)
                        }
                        len if len <= 0x4b => (len, cursor),
                        _ => return None,
                    };
                    let bytes = envelope.get(data_start..data_start + len)?;
                    content_bytes.extend_from_slice(bytes);
                    cursor = data_start + len;
                }
                return Some((content_type, content_bytes));
            }
            OP_ENDIF => return Some((content_type, vec![])),
            tag => {
                // Unknown field: skip its single push.
                let len = *envelope.get(cursor)? as usize;
                cursor += 1 + len;
                let _ = tag;
            }
        }
    }
    None
}

#[cfg(test)]
pub mod tests;
