use super::types::{
    BitcoinHookSpecification, BitcoinPredicateType, DescriptorMatchingRule, ExactMatchingRule,
    HookAction, InputPredicate, MatchingRule, OrdinalOperations, OutputPredicate, StacksOperations,
};
use crate::utils::Context;

use bitcoincore_rpc_json::bitcoin::{address::Payload, Address};
use blockhook_types::{
    BitcoinBlockData, BitcoinChainEvent, BitcoinTransactionData, BlockIdentifier,
    StacksBaseChainOperation, TransactionIdentifier,
};

use hiro_system_kit::slog;

use miniscript::bitcoin::secp256k1::Secp256k1;
use miniscript::Descriptor;

use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value as JsonValue;
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
};

use hex::FromHex;

pub struct BitcoinTriggerHook<'a> {
    pub hook: &'a BitcoinHookSpecification,
    pub apply: Vec<(Vec<&'a BitcoinTransactionData>, &'a BitcoinBlockData)>,
    pub rollback: Vec<(Vec<&'a BitcoinTransactionData>, &'a BitcoinBlockData)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BitcoinTransactionPayload {
    #[serde(flatten)]
    pub block: BitcoinBlockData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BitcoinHookPayload {
    pub uuid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BitcoinHookOccurrencePayload {
    pub apply: Vec<BitcoinTransactionPayload>,
    pub rollback: Vec<BitcoinTransactionPayload>,
    pub chainhook: BitcoinHookPayload,
}

impl BitcoinHookOccurrencePayload {
    pub fn from_trigger(trigger: BitcoinTriggerHook<'_>) -> BitcoinHookOccurrencePayload {
        BitcoinHookOccurrencePayload {
            apply: trigger
                .apply
                .into_iter()
                .map(|(transactions, block)| {
                    let mut block = block.clone();
                    block.transactions = transactions.into_iter().cloned().collect::<Vec<_>>();
                    BitcoinTransactionPayload { block }
                })
                .collect::<Vec<_>>(),
            rollback: trigger
                .rollback
                .into_iter()
                .map(|(transactions, block)| {
                    let mut block = block.clone();
                    block.transactions = transactions.into_iter().cloned().collect::<Vec<_>>();
                    BitcoinTransactionPayload { block }
                })
                .collect::<Vec<_>>(),
            chainhook: BitcoinHookPayload {
                uuid: trigger.hook.uuid.clone(),
            },
        }
    }
}

pub enum BitcoinHookOccurrence {
    Http(RequestBuilder, BitcoinHookOccurrencePayload),
    File(String, Vec<u8>),
    Data(BitcoinHookOccurrencePayload),
}

pub fn evaluate_bitcoin_hooks_on_chain_event<'a>(
    chain_event: &'a BitcoinChainEvent,
    active_hooks: &Vec<&'a BitcoinHookSpecification>,
    ctx: &Context,
) -> (
    Vec<BitcoinTriggerHook<'a>>,
    BTreeMap<&'a str, &'a BlockIdentifier>,
    BTreeMap<&'a str, &'a BlockIdentifier>,
) {
    let mut evaluated_predicates = BTreeMap::new();
    let mut triggered_predicates = vec![];
    let mut expired_predicates = BTreeMap::new();

    match chain_event {
        BitcoinChainEvent::ChainUpdatedWithBlocks(event) => {
            for hook in active_hooks.iter() {
                let mut apply = vec![];
                let rollback = vec![];
                let end_block = hook.end_block.unwrap_or(u64::MAX);

                for block in event.new_blocks.iter() {
                    evaluated_predicates.insert(hook.uuid.as_str(), &block.block_identifier);
                    if end_block >= block.block_identifier.index {
                        let mut hits = vec![];
                        for tx in block.transactions.iter() {
                            if hook.predicate.evaluate_transaction_predicate(tx, ctx) {
                                hits.push(tx);
                            }
                        }
                        if !hits.is_empty() {
                            apply.push((hits, block));
                        }
                    } else {
                        expired_predicates.insert(hook.uuid.as_str(), &block.block_identifier);
                    }
                }

                if !apply.is_empty() {
                    triggered_predicates.push(BitcoinTriggerHook {
                        hook,
                        apply,
                        rollback,
                    })
                }
            }
        }
        BitcoinChainEvent::ChainUpdatedWithReorg(event) => {
            for hook in active_hooks.iter() {
                let mut apply = vec![];
                let mut rollback = vec![];
                let end_block = hook.end_block.unwrap_or(u64::MAX);

                for block in event.blocks_to_rollback.iter() {
                    if end_block >= block.block_identifier.index {
                        let mut hits = vec![];
                        for tx in block.transactions.iter() {
                            if hook.predicate.evaluate_transaction_predicate(tx, ctx) {
                                hits.push(tx);
                            }
                        }
                        if !hits.is_empty() {
                            rollback.push((hits, block));
                        }
                    } else {
                        expired_predicates.insert(hook.uuid.as_str(), &block.block_identifier);
                    }
                }
                for block in event.blocks_to_apply.iter() {
                    evaluated_predicates.insert(hook.uuid.as_str(), &block.block_identifier);
                    if end_block >= block.block_identifier.index {
                        let mut hits = vec![];
                        for tx in block.transactions.iter() {
                            if hook.predicate.evaluate_transaction_predicate(tx, ctx) {
                                hits.push(tx);
                            }
                        }
                        if !hits.is_empty() {
                            apply.push((hits, block));
                        }
                    } else {
                        expired_predicates.insert(hook.uuid.as_str(), &block.block_identifier);
                    }
                }
                if !apply.is_empty() || !rollback.is_empty() {
                    triggered_predicates.push(BitcoinTriggerHook {
                        hook,
                        apply,
                        rollback,
                    })
                }
            }
        }
    }
    (
        triggered_predicates,
        evaluated_predicates,
        expired_predicates,
    )
}

pub fn serialize_bitcoin_payload_to_json<'a>(
    trigger: &BitcoinTriggerHook<'a>,
    proofs: &HashMap<&'a TransactionIdentifier, String>,
) -> JsonValue {
    let predicate_spec = trigger.hook;
    json!({
        "apply": trigger.apply.iter().map(|(transactions, block)| {
            json!({
                "block_identifier": block.block_identifier,
                "parent_block_identifier": block.parent_block_identifier,
                "timestamp": block.timestamp,
                "transactions": serialize_bitcoin_transactions_to_json(predicate_spec, transactions, proofs),
                "metadata": block.metadata,
            })
        }).collect::<Vec<_>>(),
        "rollback": trigger.rollback.iter().map(|(transactions, block)| {
            json!({
                "block_identifier": block.block_identifier,
                "parent_block_identifier": block.parent_block_identifier,
                "timestamp": block.timestamp,
                "transactions": serialize_bitcoin_transactions_to_json(predicate_spec, transactions, proofs),
                "metadata": block.metadata,
            })
        }).collect::<Vec<_>>(),
        "chainhook": {
            "uuid": trigger.hook.uuid,
            "predicate": trigger.hook.predicate,
            "is_streaming_blocks": trigger.hook.enabled
        }
    })
}

pub fn serialize_bitcoin_transactions_to_json<'a>(
    predicate_spec: &BitcoinHookSpecification,
    transactions: &Vec<&BitcoinTransactionData>,
    proofs: &HashMap<&'a TransactionIdentifier, String>,
) -> Vec<JsonValue> {
    transactions
        .iter()
        .map(|transaction| {
            let mut metadata = serde_json::Map::new();

            metadata.insert("fee".into(), json!(transaction.metadata.fee));
            metadata.insert("index".into(), json!(transaction.metadata.index));

            let inputs = if predicate_spec.include_inputs {
                transaction
                    .metadata
                    .inputs
                    .iter()
                    .map(|input| {
                        let witness = if predicate_spec.include_witness {
                            input.witness.clone()
                        } else {
                            vec![]
                        };
                        json!({
                            "previous_output": {
                                "txin": input.previous_output.txid.hash.to_string(),
                                "vout": input.previous_output.vout,
                                "value": input.previous_output.value,
                                "block_height": input.previous_output.block_height,
                            },
                            "script_sig": input.script_sig,
                            "sequence": input.sequence,
                            "witness": witness
                        })
                    })
                    .collect::<Vec<_>>()
            } else {
                vec![]
            };
            metadata.insert("inputs".into(), json!(inputs));

            let outputs = if predicate_spec.include_outputs {
                transaction.metadata.outputs.clone()
            } else {
                vec![]
            };
            metadata.insert("outputs".into(), json!(outputs));

            metadata.insert(
                "stacks_operations".into(),
                json!(transaction.metadata.stacks_operations),
            );
            metadata.insert(
                "ordinal_operations".into(),
                json!(transaction.metadata.ordinal_operations),
            );

            metadata.insert(
                "proof".into(),
                json!(proofs.get(&transaction.transaction_identifier)),
            );
            json!({
                "transaction_identifier": transaction.transaction_identifier,
                "operations": transaction.operations,
                "metadata": metadata
            })
        })
        .collect::<Vec<_>>()
}

pub fn handle_bitcoin_hook_action<'a>(
    trigger: BitcoinTriggerHook<'a>,
    proofs: &HashMap<&'a TransactionIdentifier, String>,
) -> Result<BitcoinHookOccurrence, String> {
    match &trigger.hook.action {
        HookAction::HttpPost(http) => {
            let client = Client::builder()
                .build()
                .map_err(|e| format!("unable to build http client: {}", e))?;
            let host = http.url.to_string();
            let method = Method::POST;
            let body = serde_json::to_vec(&serialize_bitcoin_payload_to_json(&trigger, proofs))
                .map_err(|e| format!("unable to serialize payload {}", e))?;
            let request = client
                .request(method, &host)
                .header("Content-Type", "application/json")
                .header("Authorization", http.authorization_header.clone())
                .body(body);

            let data = BitcoinHookOccurrencePayload::from_trigger(trigger);
            Ok(BitcoinHookOccurrence::Http(request, data))
        }
        HookAction::FileAppend(disk) => {
            let bytes = serde_json::to_vec(&serialize_bitcoin_payload_to_json(&trigger, proofs))
                .map_err(|e| format!("unable to serialize payload {}", e))?;
            Ok(BitcoinHookOccurrence::File(disk.path.to_string(), bytes))
        }
        HookAction::Noop => Ok(BitcoinHookOccurrence::Data(
            BitcoinHookOccurrencePayload::from_trigger(trigger),
        )),
    }
}

struct OpReturn(String);
impl OpReturn {
    fn from_string(hex: &String) -> Result<String, String> {
        // Remove the `0x` prefix if present so that we can call from_hex without errors.
        let hex = hex.strip_prefix("0x").unwrap_or(hex);

        let bytes = Vec::<u8>::from_hex(hex).map_err(|e| format!("not a valid hex: {}", e))?;
        match bytes.as_slice() {
            // An OpReturn is composed by:
            // - OP_RETURN 0x6a
            // - Data length <N> (ignored)
            // - The data
            [0x6a, _, rest @ ..] => Ok(hex::encode(rest)),
            _ => Err(String::from("not an OP_RETURN")),
        }
    }
}

impl BitcoinPredicateType {
    pub fn evaluate_transaction_predicate(
        &self,
        tx: &BitcoinTransactionData,
        ctx: &Context,
    ) -> bool {
        match &self {
            BitcoinPredicateType::Block => true,
            BitcoinPredicateType::Txid(ExactMatchingRule::Equals(txid)) => {
                tx.transaction_identifier.hash.eq(txid)
            }
            BitcoinPredicateType::Outputs(OutputPredicate::OpReturn(rule)) => {
                for output in tx.metadata.outputs.iter() {
                    // opret contains the op_return data section.
                    let opret = match OpReturn::from_string(&output.script_pubkey) {
                        Ok(op) => op,
                        Err(_) => continue,
                    };

                    // encoded_pattern takes a predicate pattern and returns its
                    // lowercase hex representation.
                    fn encoded_pattern(pattern: &str) -> String {
                        if let Some(stripped) = pattern.strip_prefix("0x") {
                            return stripped.to_lowercase();
                        }
                        // Not prefixed: treat the pattern as ASCII.
                        hex::encode(pattern)
                    }

                    let matched = match rule {
                        MatchingRule::StartsWith(pattern) => {
                            opret.starts_with(&encoded_pattern(pattern))
                        }
                        MatchingRule::EndsWith(pattern) => {
                            opret.ends_with(&encoded_pattern(pattern))
                        }
                        MatchingRule::Equals(pattern) => opret.eq(&encoded_pattern(pattern)),
                    };
                    if matched {
                        return true;
                    }
                }
                false
            }
            BitcoinPredicateType::Outputs(OutputPredicate::P2pkh(ExactMatchingRule::Equals(
                encoded_address,
            )))
            | BitcoinPredicateType::Outputs(OutputPredicate::P2sh(ExactMatchingRule::Equals(
                encoded_address,
            ))) => {
                let address = match Address::from_str(encoded_address) {
                    Ok(address) => address.assume_checked(),
                    Err(_) => return false,
                };
                let address_bytes = hex::encode(address.script_pubkey().as_bytes());
                for output in tx.metadata.outputs.iter() {
                    if output.get_script_pubkey_hex() == address_bytes {
                        return true;
                    }
                }
                false
            }
            BitcoinPredicateType::Outputs(OutputPredicate::P2wpkh(ExactMatchingRule::Equals(
                encoded_address,
            )))
            | BitcoinPredicateType::Outputs(OutputPredicate::P2wsh(ExactMatchingRule::Equals(
                encoded_address,
            )))
            | BitcoinPredicateType::Outputs(OutputPredicate::P2tr(ExactMatchingRule::Equals(
                encoded_address,
            ))) => {
                let address = match Address::from_str(encoded_address) {
                    Ok(address) => {
                        let checked_address = address.assume_checked();
                        match checked_address.payload() {
                            Payload::WitnessProgram(_) => checked_address,
                            _ => return false,
                        }
                    }
                    Err(_) => return false,
                };
                let address_bytes = hex::encode(address.script_pubkey().as_bytes());
                for output in tx.metadata.outputs.iter() {
                    if output.get_script_pubkey_hex() == address_bytes {
                        return true;
                    }
                }
                false
            }
            BitcoinPredicateType::Outputs(OutputPredicate::Descriptor(
                DescriptorMatchingRule { expression, range },
            )) => {
                let (sig, ver) = (&Secp256k1::signing_only(), &Secp256k1::verification_only());
                let (desc, _) = match Descriptor::parse_descriptor(sig, expression) {
                    Ok(res) => res,
                    Err(e) => {
                        ctx.try_log(|logger| {
                            slog::error!(logger, "unable to parse descriptor: {}", e)
                        });
                        return false;
                    }
                };

                // Derivable descriptors iterate over the predicate's range, or
                // a default of [0,5]; non-derivable descriptors produce a
                // single address.
                let range = if desc.has_wildcard() {
                    range.unwrap_or([0, 5])
                } else {
                    [0, 1]
                };

                for i in range[0]..range[1] {
                    let derived = match desc.derived_descriptor(ver, i) {
                        Ok(derived) => derived,
                        Err(e) => {
                            ctx.try_log(|logger| {
                                slog::error!(logger, "unable to derive descriptor: {}", e)
                            });
                            return false;
                        }
                    };
                    let script_pubkey = hex::encode(derived.script_pubkey().as_bytes());
                    for (index, output) in tx.metadata.outputs.iter().enumerate() {
                        if output.get_script_pubkey_hex() == script_pubkey {
                            ctx.try_log(|logger| {
                                slog::debug!(
                                    logger,
                                    "Descriptor: matched pubkey {:?} on tx {:?} output {}",
                                    script_pubkey,
                                    tx.transaction_identifier.get_hash_bytes_str(),
                                    index,
                                )
                            });
                            return true;
                        }
                    }
                }

                false
            }
            BitcoinPredicateType::Inputs(InputPredicate::Txid(predicate)) => {
                for input in tx.metadata.inputs.iter() {
                    if input.previous_output.txid.hash.eq(&predicate.txid)
                        && input.previous_output.vout.eq(&predicate.vout)
                    {
                        return true;
                    }
                }
                false
            }
            BitcoinPredicateType::StacksProtocol(StacksOperations::BlockCommitted) => tx
                .metadata
                .stacks_operations
                .iter()
                .any(|op| matches!(op, StacksBaseChainOperation::BlockCommitted(_))),
            BitcoinPredicateType::StacksProtocol(StacksOperations::LeaderRegistered) => tx
                .metadata
                .stacks_operations
                .iter()
                .any(|op| matches!(op, StacksBaseChainOperation::LeaderRegistered(_))),
            BitcoinPredicateType::StacksProtocol(StacksOperations::StxTransferred) => tx
                .metadata
                .stacks_operations
                .iter()
                .any(|op| matches!(op, StacksBaseChainOperation::StxTransferred(_))),
            BitcoinPredicateType::StacksProtocol(StacksOperations::StxLocked) => tx
                .metadata
                .stacks_operations
                .iter()
                .any(|op| matches!(op, StacksBaseChainOperation::StxLocked(_))),
            BitcoinPredicateType::OrdinalsProtocol(OrdinalOperations::InscriptionFeed) => {
                !tx.metadata.ordinal_operations.is_empty()
            }
        }
    }
}

#[cfg(test)]
pub mod tests;
