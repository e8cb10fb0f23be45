use super::*;
use crate::hooks::types::{
    BitcoinHookSpecification, BitcoinPredicateType, ExactMatchingRule, HookAction, HookRegistry,
};
use blockhook_types::{BitcoinBlockMetadata, BitcoinTransactionData, BitcoinTransactionMetadata};

fn bitcoin_hook_with_limit(limit: Option<u64>) -> BitcoinHookSpecification {
    BitcoinHookSpecification {
        uuid: "4ecc-4ecc-435b-9948-d5eeca1c3ce6".to_string(),
        owner_uuid: None,
        name: "test".to_string(),
        network: BitcoinNetwork::Regtest,
        version: 1,
        blocks: None,
        start_block: None,
        end_block: None,
        expire_after_occurrence: limit,
        predicate: BitcoinPredicateType::Txid(ExactMatchingRule::Equals("0x00".to_string())),
        action: HookAction::Noop,
        include_proof: false,
        include_inputs: false,
        include_outputs: false,
        include_witness: false,
        enabled: true,
        expired_at: None,
    }
}

fn bitcoin_block_with_transactions(index: u64, transactions: usize) -> BitcoinBlockData {
    BitcoinBlockData {
        block_identifier: BlockIdentifier {
            index,
            hash: format!("0x{:064x}", index),
        },
        parent_block_identifier: BlockIdentifier {
            index: index - 1,
            hash: format!("0x{:064x}", index - 1),
        },
        timestamp: 0,
        transactions: (0..transactions)
            .map(|i| BitcoinTransactionData {
                transaction_identifier: TransactionIdentifier {
                    hash: format!("0x{:062x}{:02x}", index, i),
                },
                operations: vec![],
                metadata: BitcoinTransactionMetadata {
                    fee: 0,
                    index: i as u32,
                    inputs: vec![],
                    outputs: vec![],
                    stacks_operations: vec![],
                    ordinal_operations: vec![],
                    proof: None,
                },
            })
            .collect(),
        metadata: BitcoinBlockMetadata {
            network: BitcoinNetwork::Regtest,
        },
    }
}

#[test]
fn trigger_trimming_respects_the_occurrence_allowance() {
    let hook = bitcoin_hook_with_limit(Some(5));
    let block_a = bitcoin_block_with_transactions(1, 4);
    let block_b = bitcoin_block_with_transactions(2, 3);

    let mut trigger = BitcoinTriggerHook {
        hook: &hook,
        apply: vec![
            (block_a.transactions.iter().collect(), &block_a),
            (block_b.transactions.iter().collect(), &block_b),
        ],
        rollback: vec![],
    };

    // Allowance of 5: the 4 transactions of the first block fit, the second
    // block is capped at 1.
    trim_bitcoin_trigger_to_allowance(&mut trigger, 5);
    let delivered: usize = trigger.apply.iter().map(|(txs, _)| txs.len()).sum();
    assert_eq!(delivered, 5);
    assert_eq!(trigger.apply.len(), 2);
    assert_eq!(trigger.apply[1].0.len(), 1);
}

#[test]
fn trigger_trimming_with_no_allowance_drops_all_applies() {
    let hook = bitcoin_hook_with_limit(Some(5));
    let block = bitcoin_block_with_transactions(1, 4);
    let mut trigger = BitcoinTriggerHook {
        hook: &hook,
        apply: vec![(block.transactions.iter().collect(), &block)],
        rollback: vec![],
    };
    trim_bitcoin_trigger_to_allowance(&mut trigger, 0);
    assert!(trigger.apply.is_empty());
}

#[test]
fn evaluation_report_deduplicates_blocks_per_predicate() {
    let mut report = PredicateEvaluationReport::new();
    let block = BlockIdentifier {
        index: 1,
        hash: "0x01".to_string(),
    };
    report.track_evaluation("uuid-1", &block);
    report.track_evaluation("uuid-1", &block);
    report.track_trigger("uuid-1", &[&block]);
    assert_eq!(report.predicates_evaluated.get("uuid-1").unwrap().len(), 1);
    assert_eq!(report.predicates_triggered.get("uuid-1").unwrap().len(), 1);
}

#[test]
fn registry_deregistration_is_idempotent() {
    let mut registry = HookRegistry::new();
    registry
        .register_specification(HookSpecification::Bitcoin(bitcoin_hook_with_limit(None)))
        .unwrap();
    assert!(registry
        .deregister_bitcoin_hook("4ecc-4ecc-435b-9948-d5eeca1c3ce6".to_string())
        .is_some());
    assert!(registry
        .deregister_bitcoin_hook("4ecc-4ecc-435b-9948-d5eeca1c3ce6".to_string())
        .is_none());
}
