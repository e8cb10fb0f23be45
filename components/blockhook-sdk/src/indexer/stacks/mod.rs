pub mod blocks_pool;

pub use blocks_pool::StacksBlockPool;

use crate::indexer::AssetClassCache;
use crate::indexer::IndexerConfig;
use crate::utils::Context;
use blockhook_types::*;
use hiro_system_kit::slog;
use rocket::serde::json::Value as JsonValue;
use rocket::serde::Deserialize;
use stacks_rpc_client::clarity::codec::{StacksTransaction, TransactionAuth, TransactionPayload};
use stacks_rpc_client::clarity::stacks_common::codec::StacksMessageCodec;
use stacks_rpc_client::clarity::vm::types::Value as ClarityValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;

#[derive(Deserialize, Serialize)]
pub struct NewBlock {
    pub block_height: u64,
    pub block_hash: String,
    pub index_block_hash: String,
    pub burn_block_height: u64,
    pub burn_block_hash: String,
    pub parent_block_hash: String,
    pub parent_index_block_hash: String,
    pub parent_microblock: String,
    pub parent_microblock_sequence: u64,
    pub parent_burn_block_hash: String,
    pub parent_burn_block_height: u64,
    pub parent_burn_block_timestamp: i64,
    pub transactions: Vec<NewTransaction>,
    pub events: Vec<NewEvent>,
    pub matured_miner_rewards: Vec<MaturedMinerReward>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenure_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_bitvec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_signature: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_set: Option<NewBlockRewardSet>,
}

#[derive(Deserialize, Serialize)]
pub struct NewBlockRewardSet {
    pub pox_ustx_threshold: Option<String>,
    pub rewarded_addresses: Option<Vec<String>>,
    pub signers: Option<Vec<NewBlockRewardSetSigner>>,
}

#[derive(Deserialize, Serialize)]
pub struct NewBlockRewardSetSigner {
    pub signing_key: String,
    pub weight: u32,
    pub stacked_amt: String,
}

#[derive(Deserialize, Serialize, Default, Clone)]
pub struct NewBlockHeader {
    pub block_height: u64,
    pub index_block_hash: Option<String>,
    pub parent_index_block_hash: Option<String>,
}

#[derive(Deserialize, Serialize)]
pub struct MaturedMinerReward {
    pub from_index_consensus_hash: String,
    pub from_stacks_block_hash: String,
    pub recipient: String,
    pub coinbase_amount: String,
    /// micro-STX amount
    pub tx_fees_anchored: String,
    /// micro-STX amount
    pub tx_fees_streamed_confirmed: String,
    /// micro-STX amount
    pub tx_fees_streamed_produced: String,
}

#[derive(Deserialize, Debug)]
pub struct NewMicroblockTrail {
    pub parent_index_block_hash: String,
    pub burn_block_hash: String,
    pub burn_block_height: u64,
    pub burn_block_timestamp: i64,
    pub transactions: Vec<NewMicroblockTransaction>,
    pub events: Vec<NewEvent>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct NewTransaction {
    pub txid: String,
    pub tx_index: usize,
    pub status: String,
    pub raw_result: String,
    pub raw_tx: String,
    pub execution_cost: Option<StacksTransactionExecutionCost>,
    pub contract_abi: Option<ContractInterface>,
}

#[derive(Deserialize, Debug)]
pub struct NewMicroblockTransaction {
    pub txid: String,
    pub tx_index: usize,
    pub status: String,
    pub raw_result: String,
    pub raw_tx: String,
    pub execution_cost: Option<StacksTransactionExecutionCost>,
    pub microblock_sequence: usize,
    pub microblock_hash: String,
    pub microblock_parent_hash: String,
    pub contract_abi: Option<ContractInterface>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NewEvent {
    pub txid: String,
    pub committed: bool,
    pub event_index: u32,
    #[serde(rename = "type")]
    pub event_type: String,
    pub stx_transfer_event: Option<JsonValue>,
    pub stx_mint_event: Option<JsonValue>,
    pub stx_burn_event: Option<JsonValue>,
    pub stx_lock_event: Option<JsonValue>,
    pub nft_transfer_event: Option<JsonValue>,
    pub nft_mint_event: Option<JsonValue>,
    pub nft_burn_event: Option<JsonValue>,
    pub ft_transfer_event: Option<JsonValue>,
    pub ft_mint_event: Option<JsonValue>,
    pub ft_burn_event: Option<JsonValue>,
    pub data_var_set_event: Option<JsonValue>,
    pub data_map_insert_event: Option<JsonValue>,
    pub data_map_update_event: Option<JsonValue>,
    pub data_map_delete_event: Option<JsonValue>,
    pub contract_event: Option<JsonValue>,
}

macro_rules! decode_event {
    ($source:expr, $data_ty:ty, $variant:path, $index:expr) => {
        if let Some(ref event_data) = $source {
            let data: $data_ty = serde_json::from_value(event_data.clone())
                .map_err(|e| format!("unable to decode event_data {}", e))?;
            return Ok(StacksTransactionEvent::new(
                $variant(data),
                StacksTransactionEventPosition { index: $index },
            ));
        }
    };
}

impl NewEvent {
    pub fn into_hook_event(&self) -> Result<StacksTransactionEvent, String> {
        use StacksTransactionEventPayload as Payload;
        decode_event!(
            self.stx_mint_event,
            STXMintEventData,
            Payload::STXMintEvent,
            self.event_index
        );
        decode_event!(
            self.stx_lock_event,
            STXLockEventData,
            Payload::STXLockEvent,
            self.event_index
        );
        decode_event!(
            self.stx_burn_event,
            STXBurnEventData,
            Payload::STXBurnEvent,
            self.event_index
        );
        decode_event!(
            self.stx_transfer_event,
            STXTransferEventData,
            Payload::STXTransferEvent,
            self.event_index
        );
        decode_event!(
            self.nft_mint_event,
            NFTMintEventData,
            Payload::NFTMintEvent,
            self.event_index
        );
        decode_event!(
            self.nft_burn_event,
            NFTBurnEventData,
            Payload::NFTBurnEvent,
            self.event_index
        );
        decode_event!(
            self.nft_transfer_event,
            NFTTransferEventData,
            Payload::NFTTransferEvent,
            self.event_index
        );
        decode_event!(
            self.ft_mint_event,
            FTMintEventData,
            Payload::FTMintEvent,
            self.event_index
        );
        decode_event!(
            self.ft_burn_event,
            FTBurnEventData,
            Payload::FTBurnEvent,
            self.event_index
        );
        decode_event!(
            self.ft_transfer_event,
            FTTransferEventData,
            Payload::FTTransferEvent,
            self.event_index
        );
        decode_event!(
            self.data_var_set_event,
            DataVarSetEventData,
            Payload::DataVarSetEvent,
            self.event_index
        );
        decode_event!(
            self.data_map_insert_event,
            DataMapInsertEventData,
            Payload::DataMapInsertEvent,
            self.event_index
        );
        decode_event!(
            self.data_map_update_event,
            DataMapUpdateEventData,
            Payload::DataMapUpdateEvent,
            self.event_index
        );
        decode_event!(
            self.data_map_delete_event,
            DataMapDeleteEventData,
            Payload::DataMapDeleteEvent,
            self.event_index
        );
        decode_event!(
            self.contract_event,
            SmartContractEventData,
            Payload::SmartContractEvent,
            self.event_index
        );
        Err("unable to support event type".to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct NewStackerDbChunks {
    pub contract_id: String,
    pub modified_slots: Vec<NewSignerModifiedSlot>,
}

#[derive(Debug, Deserialize)]
pub struct NewSignerModifiedSlot {
    pub sig: String,
    pub data: String,
    pub slot_id: u64,
    pub slot_version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoxInfo {
    pub first_burnchain_block_height: u64,
    pub prepare_phase_block_length: u64,
    pub reward_phase_block_length: u64,
}

impl PoxInfo {
    pub fn default_for_network(network: &StacksNetwork) -> PoxInfo {
        match network {
            StacksNetwork::Mainnet => PoxInfo {
                first_burnchain_block_height: 666050,
                prepare_phase_block_length: 100,
                reward_phase_block_length: 2000,
            },
            StacksNetwork::Testnet => PoxInfo {
                first_burnchain_block_height: 2000000,
                prepare_phase_block_length: 50,
                reward_phase_block_length: 1000,
            },
            _ => PoxInfo {
                first_burnchain_block_height: 100,
                prepare_phase_block_length: 4,
                reward_phase_block_length: 10,
            },
        }
    }
}

pub struct StacksChainContext {
    pub asset_class_map: HashMap<String, AssetClassCache>,
    pub pox_info: PoxInfo,
}

impl StacksChainContext {
    pub fn new(network: &StacksNetwork) -> StacksChainContext {
        StacksChainContext {
            asset_class_map: HashMap::new(),
            pox_info: PoxInfo::default_for_network(network),
        }
    }
}

pub fn get_stacks_currency() -> Currency {
    Currency {
        symbol: "STX".into(),
        decimals: 6,
        metadata: None,
    }
}

pub fn standardize_stacks_serialized_block_header(
    serialized_block: &str,
) -> Result<(BlockIdentifier, BlockIdentifier), String> {
    let mut block_header: NewBlockHeader = serde_json::from_str(serialized_block)
        .map_err(|e| format!("unable to parse stacks block_header {}", e))?;
    let hash = block_header
        .index_block_hash
        .take()
        .ok_or("unable to retrieve index_block_hash".to_string())?;
    let block_identifier = BlockIdentifier {
        hash,
        index: block_header.block_height,
    };
    let parent_hash = block_header
        .parent_index_block_hash
        .take()
        .ok_or("unable to retrieve parent_index_block_hash".to_string())?;
    let parent_block_identifier = BlockIdentifier {
        hash: parent_hash,
        index: block_identifier.index.saturating_sub(1),
    };
    Ok((block_identifier, parent_block_identifier))
}

pub fn standardize_stacks_serialized_block(
    indexer_config: &IndexerConfig,
    serialized_block: &str,
    chain_ctx: &mut StacksChainContext,
    ctx: &Context,
) -> Result<StacksBlockData, String> {
    let mut block: NewBlock = serde_json::from_str(serialized_block)
        .map_err(|e| format!("unable to parse stacks block {}", e))?;
    standardize_stacks_block(indexer_config, &mut block, chain_ctx, ctx)
}

pub fn standardize_stacks_marshalled_block(
    indexer_config: &IndexerConfig,
    marshalled_block: JsonValue,
    chain_ctx: &mut StacksChainContext,
    ctx: &Context,
) -> Result<StacksBlockData, String> {
    let mut block: NewBlock = serde_json::from_value(marshalled_block)
        .map_err(|e| format!("unable to parse stacks block {}", e))?;
    standardize_stacks_block(indexer_config, &mut block, chain_ctx, ctx)
}

pub fn standardize_stacks_block(
    indexer_config: &IndexerConfig,
    block: &mut NewBlock,
    chain_ctx: &mut StacksChainContext,
    ctx: &Context,
) -> Result<StacksBlockData, String> {
    let pox_cycle_length: u64 =
        chain_ctx.pox_info.prepare_phase_block_length + chain_ctx.pox_info.reward_phase_block_length;
    let current_len = u64::saturating_sub(
        block.burn_block_height,
        1 + chain_ctx.pox_info.first_burnchain_block_height,
    );
    let pox_cycle_id: u32 = (current_len / pox_cycle_length).try_into().unwrap_or(0);

    let mut events: HashMap<&String, Vec<&NewEvent>> = HashMap::new();
    for event in block.events.iter() {
        events
            .entry(&event.txid)
            .and_modify(|events| events.push(event))
            .or_insert(vec![event]);
    }

    let mut transactions = vec![];
    for tx in block.transactions.iter() {
        let tx_events = events.remove(&tx.txid).unwrap_or_default();
        let (description, tx_type, fee, nonce, sender, sponsor) =
            match get_tx_description(&tx.raw_tx, &tx_events) {
                Ok(desc) => desc,
                Err(e) => {
                    if tx.status.eq("abort_by_response") {
                        continue;
                    }
                    return Err(format!(
                        "unable to standardize block #{} ({})",
                        block.block_height, e
                    ));
                }
            };
        let events = tx_events
            .iter()
            .map(|e| e.into_hook_event())
            .collect::<Result<Vec<StacksTransactionEvent>, String>>()?;
        let (receipt, operations) = get_standardized_stacks_receipt(
            &tx.txid,
            events,
            &mut chain_ctx.asset_class_map,
            &indexer_config.get_stacks_node_config().rpc_url,
            true,
        );

        transactions.push(StacksTransactionData {
            transaction_identifier: TransactionIdentifier {
                hash: tx.txid.clone(),
            },
            operations,
            metadata: StacksTransactionMetadata {
                success: tx.status == "success",
                result: get_value_description(&tx.raw_result, ctx),
                raw_tx: tx.raw_tx.clone(),
                sender,
                nonce,
                fee,
                sponsor,
                kind: tx_type,
                execution_cost: tx.execution_cost.clone(),
                receipt,
                description,
                position: StacksTransactionPosition::anchor_block(tx.tx_index),
                proof: None,
                contract_abi: tx.contract_abi.clone(),
            },
        });
    }

    let confirm_microblock_identifier = if block.parent_microblock
        == "0x0000000000000000000000000000000000000000000000000000000000000000"
    {
        None
    } else {
        Some(BlockIdentifier {
            index: block.parent_microblock_sequence,
            hash: block.parent_microblock.clone(),
        })
    };

    let block = StacksBlockData {
        block_identifier: BlockIdentifier {
            hash: block.index_block_hash.clone(),
            index: block.block_height,
        },
        parent_block_identifier: BlockIdentifier {
            hash: block.parent_index_block_hash.clone(),
            index: block.block_height.saturating_sub(1),
        },
        timestamp: block.parent_burn_block_timestamp,
        metadata: StacksBlockMetadata {
            bitcoin_anchor_block_identifier: BlockIdentifier {
                hash: block.burn_block_hash.clone(),
                index: block.burn_block_height,
            },
            pox_cycle_index: pox_cycle_id,
            pox_cycle_position: (current_len % pox_cycle_length) as u32,
            pox_cycle_length: pox_cycle_length.try_into().unwrap_or(u32::MAX),
            confirm_microblock_identifier,
            stacks_block_hash: block.block_hash.clone(),
            tenure_height: block.tenure_height,
            block_time: block.block_time,
            signer_bitvec: block.signer_bitvec.clone(),
            signer_signature: block.signer_signature.clone(),
            cycle_number: block.cycle_number,
            reward_set: block.reward_set.as_ref().map(|r| StacksBlockMetadataRewardSet {
                pox_ustx_threshold: r.pox_ustx_threshold.clone(),
                rewarded_addresses: r.rewarded_addresses.clone().unwrap_or_default(),
                signers: r.signers.as_ref().map(|signers| {
                    signers
                        .iter()
                        .map(|s| StacksBlockMetadataRewardSetSigner {
                            signing_key: s.signing_key.clone(),
                            weight: s.weight,
                            stacked_amt: s.stacked_amt.clone(),
                        })
                        .collect()
                }),
            }),
        },
        transactions,
    };
    Ok(block)
}

pub fn standardize_stacks_marshalled_microblock_trail(
    indexer_config: &IndexerConfig,
    marshalled_microblock_trail: JsonValue,
    chain_ctx: &mut StacksChainContext,
    ctx: &Context,
) -> Result<Vec<StacksMicroblockData>, String> {
    let mut microblock_trail: NewMicroblockTrail =
        serde_json::from_value(marshalled_microblock_trail)
            .map_err(|e| format!("unable to parse microblock trail {}", e))?;
    standardize_stacks_microblock_trail(indexer_config, &mut microblock_trail, chain_ctx, ctx)
}

pub fn standardize_stacks_microblock_trail(
    indexer_config: &IndexerConfig,
    microblock_trail: &mut NewMicroblockTrail,
    chain_ctx: &mut StacksChainContext,
    ctx: &Context,
) -> Result<Vec<StacksMicroblockData>, String> {
    let mut events: HashMap<&String, Vec<&NewEvent>> = HashMap::new();
    for event in microblock_trail.events.iter() {
        events
            .entry(&event.txid)
            .and_modify(|events| events.push(event))
            .or_insert(vec![event]);
    }
    let mut microblocks_set: BTreeMap<
        (BlockIdentifier, BlockIdentifier),
        Vec<StacksTransactionData>,
    > = BTreeMap::new();
    for tx in microblock_trail.transactions.iter() {
        let tx_events = events.remove(&tx.txid).unwrap_or_default();
        let (description, tx_type, fee, nonce, sender, sponsor) =
            get_tx_description(&tx.raw_tx, &tx_events)?;

        let events = tx_events
            .iter()
            .map(|e| e.into_hook_event())
            .collect::<Result<Vec<StacksTransactionEvent>, String>>()?;
        let (receipt, operations) = get_standardized_stacks_receipt(
            &tx.txid,
            events,
            &mut chain_ctx.asset_class_map,
            &indexer_config.get_stacks_node_config().rpc_url,
            true,
        );

        let microblock_identifier = BlockIdentifier {
            hash: tx.microblock_hash.clone(),
            index: tx.microblock_sequence as u64,
        };

        let parent_microblock_identifier = if tx.microblock_sequence > 0 {
            BlockIdentifier {
                hash: tx.microblock_parent_hash.clone(),
                index: microblock_identifier.index.saturating_sub(1),
            }
        } else {
            microblock_identifier.clone()
        };

        let transaction = StacksTransactionData {
            transaction_identifier: TransactionIdentifier {
                hash: tx.txid.clone(),
            },
            operations,
            metadata: StacksTransactionMetadata {
                success: tx.status == "success",
                result: get_value_description(&tx.raw_result, ctx),
                raw_tx: tx.raw_tx.clone(),
                sender,
                fee,
                nonce,
                sponsor,
                kind: tx_type,
                execution_cost: tx.execution_cost.clone(),
                receipt,
                description,
                position: StacksTransactionPosition::micro_block(
                    microblock_identifier.clone(),
                    tx.tx_index,
                ),
                proof: None,
                contract_abi: tx.contract_abi.clone(),
            },
        };

        microblocks_set
            .entry((microblock_identifier, parent_microblock_identifier))
            .and_modify(|transactions| transactions.push(transaction.clone()))
            .or_insert(vec![transaction]);
    }

    let mut microblocks = vec![];
    for ((block_identifier, parent_block_identifier), transactions) in microblocks_set.into_iter() {
        microblocks.push(StacksMicroblockData {
            block_identifier,
            parent_block_identifier,
            timestamp: microblock_trail.burn_block_timestamp,
            transactions,
            metadata: StacksMicroblockMetadata {
                anchor_block_identifier: BlockIdentifier {
                    hash: microblock_trail.parent_index_block_hash.clone(),
                    index: 0,
                },
            },
        })
    }
    microblocks.sort_by(|a, b| a.block_identifier.cmp(&b.block_identifier));

    Ok(microblocks)
}

pub fn standardize_stacks_marshalled_stackerdb_chunks(
    marshalled_stackerdb_chunks: JsonValue,
    ctx: &Context,
) -> Result<Vec<StacksStackerDbChunk>, String> {
    let stackerdb_chunks: NewStackerDbChunks =
        serde_json::from_value(marshalled_stackerdb_chunks)
            .map_err(|e| format!("unable to parse stackerdb chunks {}", e))?;
    standardize_stacks_stackerdb_chunks(&stackerdb_chunks, ctx)
}

/// Decodes each modified slot into a typed signer message. Slots carrying
/// messages we cannot decode are dropped with a log line, not an error: one
/// opaque signer does not invalidate the rest of the chunk set.
pub fn standardize_stacks_stackerdb_chunks(
    stackerdb_chunks: &NewStackerDbChunks,
    ctx: &Context,
) -> Result<Vec<StacksStackerDbChunk>, String> {
    let mut chunks = vec![];
    for slot in stackerdb_chunks.modified_slots.iter() {
        let data_bytes = match hex::decode(slot.data.strip_prefix("0x").unwrap_or(&slot.data)) {
            Ok(bytes) => bytes,
            Err(e) => return Err(format!("unable to decode signer slot data: {}", e)),
        };
        let message = match decode_signer_message(&data_bytes) {
            Some(message) => message,
            None => {
                ctx.try_log(|logger| {
                    slog::warn!(
                        logger,
                        "unable to decode signer message in slot {} of {}",
                        slot.slot_id,
                        stackerdb_chunks.contract_id
                    )
                });
                continue;
            }
        };
        chunks.push(StacksStackerDbChunk {
            contract: stackerdb_chunks.contract_id.clone(),
            message,
            sig: format!("0x{}", slot.sig.strip_prefix("0x").unwrap_or(&slot.sig)),
            pubkey: String::new(),
            slot_id: slot.slot_id,
            slot_version: slot.slot_version,
        });
    }
    Ok(chunks)
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, cursor: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.cursor)?;
        self.cursor += 1;
        Some(byte)
    }

    fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.bytes.get(self.cursor..self.cursor + 4)?;
        self.cursor += 4;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }

    fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.bytes.get(self.cursor..self.cursor + 8)?;
        self.cursor += 8;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    fn read_hex(&mut self, len: usize) -> Option<String> {
        let bytes = self.bytes.get(self.cursor..self.cursor + len)?;
        self.cursor += len;
        Some(format!("0x{}", hex::encode(bytes)))
    }

    fn read_string(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.bytes.get(self.cursor..self.cursor + len)?;
        self.cursor += len;
        Some(String::from_utf8_lossy(bytes).to_string())
    }
}

// Message type prefixes used by the signers' stackerdb sessions.
const SIGNER_MESSAGE_BLOCK_PROPOSAL: u8 = 0;
const SIGNER_MESSAGE_BLOCK_RESPONSE: u8 = 1;
const SIGNER_MESSAGE_BLOCK_PUSHED: u8 = 2;
const SIGNER_MESSAGE_MOCK_PROPOSAL: u8 = 3;
const SIGNER_MESSAGE_MOCK_SIGNATURE: u8 = 4;
const SIGNER_MESSAGE_MOCK_BLOCK: u8 = 5;

fn decode_signer_message(bytes: &[u8]) -> Option<StacksSignerMessage> {
    let mut reader = ByteReader::new(bytes);
    let message = match reader.read_u8()? {
        SIGNER_MESSAGE_BLOCK_PROPOSAL => {
            let block = decode_nakamoto_block(&mut reader)?;
            let burn_height = reader.read_u64()?;
            let reward_cycle = reader.read_u64()?;
            StacksSignerMessage::BlockProposal(BlockProposalData {
                block,
                burn_height,
                reward_cycle,
            })
        }
        SIGNER_MESSAGE_BLOCK_RESPONSE => match reader.read_u8()? {
            0 => StacksSignerMessage::BlockResponse(BlockResponseData::Accepted(
                BlockAcceptedResponse {
                    signer_signature_hash: reader.read_hex(32)?,
                    signature: reader.read_hex(65)?,
                },
            )),
            1 => {
                let reason = reader.read_string()?;
                let reason_code = match reader.read_u8()? {
                    0 => BlockRejectReasonCode::ValidationFailed(decode_validation_failure(
                        reader.read_u8()?,
                    )?),
                    1 => BlockRejectReasonCode::ConnectivityIssues,
                    2 => BlockRejectReasonCode::RejectedInPriorRound,
                    3 => BlockRejectReasonCode::NoSortitionView,
                    4 => BlockRejectReasonCode::SortitionViewMismatch,
                    5 => BlockRejectReasonCode::TestingDirective,
                    _ => return None,
                };
                StacksSignerMessage::BlockResponse(BlockResponseData::Rejected(
                    BlockRejectedResponse {
                        reason,
                        reason_code,
                        signer_signature_hash: reader.read_hex(32)?,
                        chain_id: reader.read_u32()?,
                        signature: reader.read_hex(65)?,
                    },
                ))
            }
            _ => return None,
        },
        SIGNER_MESSAGE_BLOCK_PUSHED => {
            let block = decode_nakamoto_block(&mut reader)?;
            StacksSignerMessage::BlockPushed(BlockPushedData { block })
        }
        SIGNER_MESSAGE_MOCK_PROPOSAL => StacksSignerMessage::MockProposal,
        SIGNER_MESSAGE_MOCK_SIGNATURE => StacksSignerMessage::MockSignature,
        SIGNER_MESSAGE_MOCK_BLOCK => StacksSignerMessage::MockBlock,
        _ => return None,
    };
    Some(message)
}

fn decode_validation_failure(code: u8) -> Option<BlockValidationFailedCode> {
    let code = match code {
        0 => BlockValidationFailedCode::BadBlockHash,
        1 => BlockValidationFailedCode::BadTransaction,
        2 => BlockValidationFailedCode::InvalidBlock,
        3 => BlockValidationFailedCode::ChainstateError,
        4 => BlockValidationFailedCode::UnknownParent,
        5 => BlockValidationFailedCode::NonCanonicalTenure,
        6 => BlockValidationFailedCode::NoSuchTenure,
        _ => return None,
    };
    Some(code)
}

fn decode_nakamoto_block(reader: &mut ByteReader) -> Option<NakamotoBlockData> {
    let version = reader.read_u8()?;
    let chain_length = reader.read_u64()?;
    let burn_spent = reader.read_u64()?;
    let consensus_hash = reader.read_hex(20)?;
    let parent_block_id = reader.read_hex(32)?;
    let tx_merkle_root = reader.read_hex(32)?;
    let state_index_root = reader.read_hex(32)?;
    let timestamp = reader.read_u64()?;
    let miner_signature = reader.read_hex(65)?;
    let signature_count = reader.read_u32()?;
    let mut signer_signature = Vec::with_capacity(signature_count.min(4096) as usize);
    for _ in 0..signature_count {
        signer_signature.push(reader.read_hex(65)?);
    }
    let bitvec_len = reader.read_u8()? as usize;
    let pox_treatment = reader.read_hex(bitvec_len.div_ceil(8))?;
    Some(NakamotoBlockData {
        header: NakamotoBlockHeaderData {
            version,
            chain_length,
            burn_spent,
            consensus_hash,
            parent_block_id: parent_block_id.clone(),
            tx_merkle_root,
            state_index_root,
            timestamp,
            miner_signature,
            signer_signature,
            pox_treatment,
        },
        block_hash: parent_block_id.clone(),
        index_block_hash: parent_block_id,
        transactions: vec![],
    })
}

pub fn get_value_description(raw_value: &str, ctx: &Context) -> String {
    let raw_value = match raw_value.strip_prefix("0x") {
        Some(raw_value) => raw_value,
        _ => return raw_value.to_string(),
    };
    let value_bytes = match hex::decode(raw_value) {
        Ok(bytes) => bytes,
        _ => return raw_value.to_string(),
    };

    match ClarityValue::consensus_deserialize(&mut Cursor::new(&value_bytes)) {
        Ok(value) => format!("{}", value),
        Err(e) => {
            ctx.try_log(|logger| {
                slog::error!(logger, "unable to deserialize clarity value {:?}", e)
            });
            raw_value.to_string()
        }
    }
}

pub fn get_tx_description(
    raw_tx: &str,
    tx_events: &Vec<&NewEvent>,
) -> Result<
    (
        String,                // Human readable transaction description
        StacksTransactionKind, // Transaction kind
        u64,                   // Transaction fee
        u64,                   // Transaction nonce
        String,                // Sender's address
        Option<String>,        // Sponsor's address (optional)
    ),
    String,
> {
    let raw_tx = match raw_tx.strip_prefix("0x") {
        Some(raw_tx) => raw_tx,
        _ => return Err("unable to read raw_tx".into()),
    };
    let tx_bytes = match hex::decode(raw_tx) {
        Ok(bytes) => bytes,
        Err(e) => return Err(format!("unable to read raw_tx {}", e)),
    };

    // Stacks transitions operated through Bitcoin transactions are relayed by
    // the node as the byte '0x00' plus the resulting events.
    if tx_bytes.eq(&[0]) {
        if tx_events.is_empty() {
            return Err("received block with transaction '0x00' and no events".to_string());
        };
        for event in tx_events.iter() {
            if let Some(ref event_data) = event.stx_transfer_event {
                let data: STXTransferEventData = serde_json::from_value(event_data.clone())
                    .map_err(|e| format!("unable to decode event_data {}", e))?;
                let description = format!(
                    "transfered: {} µSTX from {} to {} through Bitcoin transaction",
                    data.amount, data.sender, data.recipient
                );
                return Ok((
                    description,
                    StacksTransactionKind::NativeTokenTransfer,
                    0,
                    0,
                    data.sender,
                    None,
                ));
            } else if let Some(ref event_data) = event.stx_lock_event {
                let data: STXLockEventData = serde_json::from_value(event_data.clone())
                    .map_err(|e| format!("unable to decode event_data {}", e))?;
                let description = format!(
                    "stacked: {} µSTX by {} through Bitcoin transaction",
                    data.locked_amount, data.locked_address,
                );
                let tx_type =
                    StacksTransactionKind::BitcoinOp(BitcoinOpData::StackSTX(StackSTXData {
                        locked_amount: data.locked_amount,
                        unlock_height: data.unlock_height,
                        stacking_address: data.locked_address.clone(),
                    }));
                return Ok((description, tx_type, 0, 0, data.locked_address, None));
            }
        }
        return Ok((
            "unsupported transaction".into(),
            StacksTransactionKind::Unsupported,
            0,
            0,
            "".to_string(),
            None,
        ));
    }

    let tx = StacksTransaction::consensus_deserialize(&mut Cursor::new(&tx_bytes))
        .map_err(|e| format!("unable to consensus decode transaction {}", e))?;

    let (fee, nonce, sender, sponsor) = match tx.auth {
        TransactionAuth::Standard(ref conditions) => (
            conditions.tx_fee(),
            conditions.nonce(),
            if tx.is_mainnet() {
                conditions.address_mainnet().to_string()
            } else {
                conditions.address_testnet().to_string()
            },
            None,
        ),
        TransactionAuth::Sponsored(ref sender_conditions, ref sponsor_conditions) => (
            sponsor_conditions.tx_fee(),
            sender_conditions.nonce(),
            if tx.is_mainnet() {
                sender_conditions.address_mainnet().to_string()
            } else {
                sender_conditions.address_testnet().to_string()
            },
            Some(if tx.is_mainnet() {
                sponsor_conditions.address_mainnet().to_string()
            } else {
                sponsor_conditions.address_testnet().to_string()
            }),
        ),
    };

    let (description, tx_type) = match tx.payload {
        TransactionPayload::TokenTransfer(ref addr, ref amount, ref _memo) => (
            format!(
                "transfered: {} µSTX from {} to {}",
                amount,
                tx.origin_address(),
                addr
            ),
            StacksTransactionKind::NativeTokenTransfer,
        ),
        TransactionPayload::ContractCall(ref contract_call) => {
            let formatted_args = contract_call
                .function_args
                .iter()
                .map(|v| format!("{}", v))
                .collect::<Vec<String>>();
            (
                format!(
                    "invoked: {}.{}::{}({})",
                    contract_call.address,
                    contract_call.contract_name,
                    contract_call.function_name,
                    formatted_args.join(", ")
                ),
                StacksTransactionKind::ContractCall(StacksContractCallData {
                    contract_identifier: format!(
                        "{}.{}",
                        contract_call.address, contract_call.contract_name
                    ),
                    method: contract_call.function_name.to_string(),
                    args: formatted_args,
                }),
            )
        }
        TransactionPayload::SmartContract(ref smart_contract, ref _clarity_version) => {
            let contract_identifier = format!("{}.{}", tx.origin_address(), smart_contract.name);
            let data = StacksContractDeploymentData {
                contract_identifier: contract_identifier.clone(),
                code: smart_contract.code_body.to_string(),
            };
            (
                format!("deployed: {}", contract_identifier),
                StacksTransactionKind::ContractDeployment(data),
            )
        }
        TransactionPayload::Coinbase(..) => ("coinbase".to_string(), StacksTransactionKind::Coinbase),
        _ => ("other".to_string(), StacksTransactionKind::Unsupported),
    };
    Ok((description, tx_type, fee, nonce, sender, sponsor))
}

pub fn get_standardized_fungible_currency_from_asset_class_id(
    asset_class_id: &str,
    asset_class_cache: &mut HashMap<String, AssetClassCache>,
    _node_url: &str,
) -> Currency {
    match asset_class_cache.get(asset_class_id) {
        None => {
            // Resolving the symbol and decimals through a read-only contract
            // call is deferred; placeholders keep the hot path synchronous.
            let entry = AssetClassCache {
                symbol: "TOKEN".into(),
                decimals: 6,
            };

            let currency = Currency {
                symbol: entry.symbol.clone(),
                decimals: entry.decimals.into(),
                metadata: Some(CurrencyMetadata {
                    asset_class_identifier: asset_class_id.into(),
                    asset_identifier: None,
                    standard: CurrencyStandard::Sip10,
                }),
            };

            asset_class_cache.insert(asset_class_id.into(), entry);

            currency
        }
        Some(entry) => Currency {
            symbol: entry.symbol.clone(),
            decimals: entry.decimals.into(),
            metadata: Some(CurrencyMetadata {
                asset_class_identifier: asset_class_id.into(),
                asset_identifier: None,
                standard: CurrencyStandard::Sip10,
            }),
        },
    }
}

pub fn get_standardized_non_fungible_currency_from_asset_class_id(
    asset_class_id: &str,
    asset_id: &str,
    _asset_class_cache: &mut HashMap<String, AssetClassCache>,
) -> Currency {
    Currency {
        symbol: asset_class_id.into(),
        decimals: 0,
        metadata: Some(CurrencyMetadata {
            asset_class_identifier: asset_class_id.into(),
            asset_identifier: Some(asset_id.into()),
            standard: CurrencyStandard::Sip09,
        }),
    }
}

pub fn get_standardized_stacks_receipt(
    _txid: &str,
    events: Vec<StacksTransactionEvent>,
    asset_class_cache: &mut HashMap<String, AssetClassCache>,
    node_url: &str,
    include_operations: bool,
) -> (StacksTransactionReceipt, Vec<Operation>) {
    let mut mutated_contracts_radius = HashSet::new();
    let mut mutated_assets_radius = HashSet::new();
    let mut operations = vec![];

    if include_operations {
        let mut operation_id = 0;
        for event in events.iter() {
            match &event.event_payload {
                StacksTransactionEventPayload::STXMintEvent(data) => {
                    if let Ok(value) = data.amount.parse::<u128>() {
                        operations.push(build_operation(
                            &mut operation_id,
                            None,
                            OperationType::Credit,
                            &data.recipient,
                            value,
                            get_stacks_currency(),
                        ));
                    }
                }
                StacksTransactionEventPayload::STXLockEvent(data) => {
                    if let Ok(value) = data.locked_amount.parse::<u128>() {
                        operations.push(build_operation(
                            &mut operation_id,
                            None,
                            OperationType::Lock,
                            &data.locked_address,
                            value,
                            get_stacks_currency(),
                        ));
                    }
                }
                StacksTransactionEventPayload::STXBurnEvent(data) => {
                    if let Ok(value) = data.amount.parse::<u128>() {
                        operations.push(build_operation(
                            &mut operation_id,
                            None,
                            OperationType::Debit,
                            &data.sender,
                            value,
                            get_stacks_currency(),
                        ));
                    }
                }
                StacksTransactionEventPayload::STXTransferEvent(data) => {
                    if let Ok(value) = data.amount.parse::<u128>() {
                        push_transfer_operations(
                            &mut operation_id,
                            &mut operations,
                            &data.sender,
                            &data.recipient,
                            value,
                            get_stacks_currency(),
                        );
                    }
                }
                StacksTransactionEventPayload::NFTMintEvent(data) => {
                    let (asset_class_identifier, contract_identifier) =
                        get_mutated_ids(&data.asset_class_identifier);
                    mutated_assets_radius.insert(asset_class_identifier);
                    mutated_contracts_radius.insert(contract_identifier);

                    let currency = get_standardized_non_fungible_currency_from_asset_class_id(
                        &data.asset_class_identifier,
                        &data.hex_asset_identifier,
                        asset_class_cache,
                    );
                    operations.push(build_operation(
                        &mut operation_id,
                        None,
                        OperationType::Credit,
                        &data.recipient,
                        1,
                        currency,
                    ));
                }
                StacksTransactionEventPayload::NFTBurnEvent(data) => {
                    let (asset_class_identifier, contract_identifier) =
                        get_mutated_ids(&data.asset_class_identifier);
                    mutated_assets_radius.insert(asset_class_identifier);
                    mutated_contracts_radius.insert(contract_identifier);

                    let currency = get_standardized_non_fungible_currency_from_asset_class_id(
                        &data.asset_class_identifier,
                        &data.hex_asset_identifier,
                        asset_class_cache,
                    );
                    operations.push(build_operation(
                        &mut operation_id,
                        None,
                        OperationType::Debit,
                        &data.sender,
                        1,
                        currency,
                    ));
                }
                StacksTransactionEventPayload::NFTTransferEvent(data) => {
                    let (asset_class_identifier, contract_identifier) =
                        get_mutated_ids(&data.asset_class_identifier);
                    mutated_assets_radius.insert(asset_class_identifier);
                    mutated_contracts_radius.insert(contract_identifier);

                    let currency = get_standardized_non_fungible_currency_from_asset_class_id(
                        &data.asset_class_identifier,
                        &data.hex_asset_identifier,
                        asset_class_cache,
                    );
                    push_transfer_operations(
                        &mut operation_id,
                        &mut operations,
                        &data.sender,
                        &data.recipient,
                        1,
                        currency,
                    );
                }
                StacksTransactionEventPayload::FTMintEvent(data) => {
                    let (asset_class_identifier, contract_identifier) =
                        get_mutated_ids(&data.asset_class_identifier);
                    mutated_assets_radius.insert(asset_class_identifier);
                    mutated_contracts_radius.insert(contract_identifier);

                    let currency = get_standardized_fungible_currency_from_asset_class_id(
                        &data.asset_class_identifier,
                        asset_class_cache,
                        node_url,
                    );
                    if let Ok(value) = data.amount.parse::<u128>() {
                        operations.push(build_operation(
                            &mut operation_id,
                            None,
                            OperationType::Credit,
                            &data.recipient,
                            value,
                            currency,
                        ));
                    }
                }
                StacksTransactionEventPayload::FTBurnEvent(data) => {
                    let (asset_class_identifier, contract_identifier) =
                        get_mutated_ids(&data.asset_class_identifier);
                    mutated_assets_radius.insert(asset_class_identifier);
                    mutated_contracts_radius.insert(contract_identifier);

                    let currency = get_standardized_fungible_currency_from_asset_class_id(
                        &data.asset_class_identifier,
                        asset_class_cache,
                        node_url,
                    );
                    if let Ok(value) = data.amount.parse::<u128>() {
                        operations.push(build_operation(
                            &mut operation_id,
                            None,
                            OperationType::Debit,
                            &data.sender,
                            value,
                            currency,
                        ));
                    }
                }
                StacksTransactionEventPayload::FTTransferEvent(data) => {
                    let (asset_class_identifier, contract_identifier) =
                        get_mutated_ids(&data.asset_class_identifier);
                    mutated_assets_radius.insert(asset_class_identifier);
                    mutated_contracts_radius.insert(contract_identifier);

                    let currency = get_standardized_fungible_currency_from_asset_class_id(
                        &data.asset_class_identifier,
                        asset_class_cache,
                        node_url,
                    );
                    if let Ok(value) = data.amount.parse::<u128>() {
                        push_transfer_operations(
                            &mut operation_id,
                            &mut operations,
                            &data.sender,
                            &data.recipient,
                            value,
                            currency,
                        );
                    }
                }
                StacksTransactionEventPayload::DataVarSetEvent(_data) => {}
                StacksTransactionEventPayload::DataMapInsertEvent(_data) => {}
                StacksTransactionEventPayload::DataMapUpdateEvent(_data) => {}
                StacksTransactionEventPayload::DataMapDeleteEvent(_data) => {}
                StacksTransactionEventPayload::SmartContractEvent(data) => {
                    mutated_contracts_radius.insert(data.contract_identifier.clone());
                }
            }
        }
    }

    let receipt =
        StacksTransactionReceipt::new(mutated_contracts_radius, mutated_assets_radius, events);
    (receipt, operations)
}

fn build_operation(
    operation_id: &mut u64,
    related_operations: Option<Vec<OperationIdentifier>>,
    type_: OperationType,
    address: &str,
    value: u128,
    currency: Currency,
) -> Operation {
    let operation = Operation {
        operation_identifier: OperationIdentifier {
            index: *operation_id,
            network_index: None,
        },
        related_operations,
        type_,
        status: Some(OperationStatusKind::Success),
        account: AccountIdentifier {
            address: address.to_string(),
            sub_account: None,
        },
        amount: Some(Amount { value, currency }),
        metadata: None,
    };
    *operation_id += 1;
    operation
}

fn push_transfer_operations(
    operation_id: &mut u64,
    operations: &mut Vec<Operation>,
    sender: &str,
    recipient: &str,
    value: u128,
    currency: Currency,
) {
    let debit_id = *operation_id;
    operations.push(build_operation(
        operation_id,
        Some(vec![OperationIdentifier {
            index: debit_id + 1,
            network_index: None,
        }]),
        OperationType::Debit,
        sender,
        value,
        currency.clone(),
    ));
    operations.push(build_operation(
        operation_id,
        Some(vec![OperationIdentifier {
            index: debit_id,
            network_index: None,
        }]),
        OperationType::Credit,
        recipient,
        value,
        currency,
    ));
}

fn get_mutated_ids(asset_class_id: &str) -> (String, String) {
    let contract_id = asset_class_id.split("::").collect::<Vec<_>>()[0];
    (asset_class_id.into(), contract_id.into())
}

#[cfg(test)]
pub mod tests;
