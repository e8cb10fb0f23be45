use super::stacks::{
    evaluate_stacks_predicate_on_block, evaluate_stacks_predicate_on_transaction,
};
use super::types::{
    BlockIdentifierIndexRule, HookAction, StacksContractCallBasedPredicate,
    StacksContractDeploymentPredicate, StacksFtEventBasedPredicate, StacksHookSpecification,
    StacksPredicate, StacksPrintEventBasedPredicate,
};
use crate::utils::Context;
use blockhook_types::*;
use std::collections::HashSet;
use test_case::test_case;

fn stacks_hook_with_predicate(predicate: StacksPredicate) -> StacksHookSpecification {
    StacksHookSpecification {
        uuid: "c0bd7407-6b63-4c06-94e5-c611005a1ed4".to_string(),
        owner_uuid: None,
        name: "test".to_string(),
        network: StacksNetwork::Devnet,
        version: 1,
        blocks: None,
        start_block: None,
        end_block: None,
        expire_after_occurrence: None,
        capture_all_events: None,
        decode_clarity_values: Some(true),
        include_contract_abi: None,
        predicate,
        action: HookAction::Noop,
        enabled: true,
        expired_at: None,
    }
}

fn stacks_transaction_with_kind(kind: StacksTransactionKind) -> StacksTransactionData {
    StacksTransactionData {
        transaction_identifier: TransactionIdentifier {
            hash: "0xdeadbeef".to_string(),
        },
        operations: vec![],
        metadata: StacksTransactionMetadata {
            success: true,
            raw_tx: "0x00".to_string(),
            result: "(ok true)".to_string(),
            sender: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            nonce: 0,
            fee: 0,
            sponsor: None,
            kind,
            execution_cost: None,
            receipt: StacksTransactionReceipt::new(HashSet::new(), HashSet::new(), vec![]),
            description: String::new(),
            position: StacksTransactionPosition::anchor_block(0),
            proof: None,
            contract_abi: None,
        },
    }
}

fn stacks_transaction_with_events(
    events: Vec<StacksTransactionEventPayload>,
) -> StacksTransactionData {
    let mut tx = stacks_transaction_with_kind(StacksTransactionKind::ContractCall(
        StacksContractCallData {
            contract_identifier: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.monkey-sip09"
                .to_string(),
            method: "withdraw".to_string(),
            args: vec![],
        },
    ));
    tx.metadata.receipt.events = events
        .into_iter()
        .enumerate()
        .map(|(index, event_payload)| {
            StacksTransactionEvent::new(
                event_payload,
                StacksTransactionEventPosition {
                    index: index as u32,
                },
            )
        })
        .collect();
    tx
}

fn print_event(contract_identifier: &str, hex_value: &str) -> StacksTransactionEventPayload {
    StacksTransactionEventPayload::SmartContractEvent(SmartContractEventData {
        contract_identifier: contract_identifier.to_string(),
        topic: "print".to_string(),
        hex_value: hex_value.to_string(),
    })
}

// Consensus-serialized (string-ascii "withdraw-vault").
const WITHDRAW_VAULT_HEX: &str = "0x0d0000000e77697468647261772d7661756c74";
// Consensus-serialized (string-ascii "vaulted").
const VAULTED_HEX: &str = "0x0d000000077661756c746564";

#[test]
fn print_event_regex_honors_word_boundaries() {
    let hook = stacks_hook_with_predicate(StacksPredicate::PrintEvent(
        StacksPrintEventBasedPredicate::MatchesRegex {
            contract_identifier: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.monkey-sip09"
                .to_string(),
            regex: "(?:^|\\W)vault(?:$|\\W)".to_string(),
        },
    ));
    let ctx = Context::empty();

    let matching_tx = stacks_transaction_with_events(vec![print_event(
        "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.monkey-sip09",
        WITHDRAW_VAULT_HEX,
    )]);
    assert!(evaluate_stacks_predicate_on_transaction(
        &matching_tx,
        &hook,
        &ctx
    ));

    // "vaulted" crosses the word boundary: no match.
    let non_matching_tx = stacks_transaction_with_events(vec![print_event(
        "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.monkey-sip09",
        VAULTED_HEX,
    )]);
    assert!(!evaluate_stacks_predicate_on_transaction(
        &non_matching_tx,
        &hook,
        &ctx
    ));
}

#[test]
fn print_event_ignores_other_contracts() {
    let hook = stacks_hook_with_predicate(StacksPredicate::PrintEvent(
        StacksPrintEventBasedPredicate::Contains {
            contract_identifier: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.monkey-sip09"
                .to_string(),
            contains: "vault".to_string(),
        },
    ));
    let tx = stacks_transaction_with_events(vec![print_event(
        "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.another-contract",
        WITHDRAW_VAULT_HEX,
    )]);
    assert!(!evaluate_stacks_predicate_on_transaction(
        &tx,
        &hook,
        &Context::empty()
    ));
}

#[test]
fn contract_call_predicate_only_matches_direct_invocations() {
    let hook = stacks_hook_with_predicate(StacksPredicate::ContractCall(
        StacksContractCallBasedPredicate {
            contract_identifier: "SP000000000000000000002Q6VF78.pox".to_string(),
            method: "stack-stx".to_string(),
        },
    ));
    let ctx = Context::empty();

    let direct_call = stacks_transaction_with_kind(StacksTransactionKind::ContractCall(
        StacksContractCallData {
            contract_identifier: "SP000000000000000000002Q6VF78.pox".to_string(),
            method: "stack-stx".to_string(),
            args: vec![],
        },
    ));
    assert!(evaluate_stacks_predicate_on_transaction(
        &direct_call,
        &hook,
        &ctx
    ));

    // A call into a wrapper contract that itself invokes pox::stack-stx: the
    // stack-stx print/lock events are visible, but the direct invocation is
    // the wrapper, so the predicate does not match.
    let mut indirect_call = stacks_transaction_with_kind(StacksTransactionKind::ContractCall(
        StacksContractCallData {
            contract_identifier: "SP000000000000000000002Q6VF78.stacking-wrapper".to_string(),
            method: "delegate".to_string(),
            args: vec![],
        },
    ));
    indirect_call.metadata.receipt.events = vec![StacksTransactionEvent::new(
        StacksTransactionEventPayload::STXLockEvent(STXLockEventData {
            locked_amount: "1000000".to_string(),
            unlock_height: "2100".to_string(),
            locked_address: "SP000000000000000000002Q6VF78".to_string(),
        }),
        StacksTransactionEventPosition { index: 0 },
    )];
    assert!(!evaluate_stacks_predicate_on_transaction(
        &indirect_call,
        &hook,
        &ctx
    ));
}

#[test_case(vec!["mint"], true, false, false; "mint only")]
#[test_case(vec!["transfer"], false, true, false; "transfer only")]
#[test_case(vec!["burn"], false, false, true; "burn only")]
#[test_case(vec!["mint", "burn"], true, false, true; "mint and burn")]
fn ft_event_predicate_filters_actions(
    actions: Vec<&str>,
    expect_mint: bool,
    expect_transfer: bool,
    expect_burn: bool,
) {
    let asset = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.cbtc-token::cbtc";
    let hook = stacks_hook_with_predicate(StacksPredicate::FtEvent(StacksFtEventBasedPredicate {
        asset_identifier: asset.to_string(),
        actions: actions.iter().map(|a| a.to_string()).collect(),
    }));
    let ctx = Context::empty();

    let mint_tx = stacks_transaction_with_events(vec![
        StacksTransactionEventPayload::FTMintEvent(FTMintEventData {
            asset_class_identifier: asset.to_string(),
            recipient: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            amount: "100".to_string(),
        }),
    ]);
    let transfer_tx = stacks_transaction_with_events(vec![
        StacksTransactionEventPayload::FTTransferEvent(FTTransferEventData {
            asset_class_identifier: asset.to_string(),
            sender: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            recipient: "ST2CY5V39NHDPWSXMW9QDT3HC3GD6Q6XX4CFRK9AG".to_string(),
            amount: "100".to_string(),
        }),
    ]);
    let burn_tx = stacks_transaction_with_events(vec![
        StacksTransactionEventPayload::FTBurnEvent(FTBurnEventData {
            asset_class_identifier: asset.to_string(),
            sender: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            amount: "100".to_string(),
        }),
    ]);

    assert_eq!(
        expect_mint,
        evaluate_stacks_predicate_on_transaction(&mint_tx, &hook, &ctx)
    );
    assert_eq!(
        expect_transfer,
        evaluate_stacks_predicate_on_transaction(&transfer_tx, &hook, &ctx)
    );
    assert_eq!(
        expect_burn,
        evaluate_stacks_predicate_on_transaction(&burn_tx, &hook, &ctx)
    );
}

#[test]
fn ft_event_predicate_requires_matching_asset() {
    let hook = stacks_hook_with_predicate(StacksPredicate::FtEvent(StacksFtEventBasedPredicate {
        asset_identifier: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.cbtc-token::cbtc".to_string(),
        actions: vec!["mint".to_string()],
    }));
    let tx = stacks_transaction_with_events(vec![StacksTransactionEventPayload::FTMintEvent(
        FTMintEventData {
            asset_class_identifier: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.other::other"
                .to_string(),
            recipient: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            amount: "100".to_string(),
        },
    )]);
    assert!(!evaluate_stacks_predicate_on_transaction(
        &tx,
        &hook,
        &Context::empty()
    ));
}

#[test]
fn deployer_predicate_wildcard_matches_any_deployment() {
    let hook = stacks_hook_with_predicate(StacksPredicate::ContractDeployment(
        StacksContractDeploymentPredicate::Deployer("*".to_string()),
    ));
    let tx = stacks_transaction_with_kind(StacksTransactionKind::ContractDeployment(
        StacksContractDeploymentData {
            contract_identifier: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.anything".to_string(),
            code: "(define-public (noop) (ok true))".to_string(),
        },
    ));
    assert!(evaluate_stacks_predicate_on_transaction(
        &tx,
        &hook,
        &Context::empty()
    ));

    let transfer = stacks_transaction_with_kind(StacksTransactionKind::NativeTokenTransfer);
    assert!(!evaluate_stacks_predicate_on_transaction(
        &transfer,
        &hook,
        &Context::empty()
    ));
}

#[test_case(BlockIdentifierIndexRule::Equals(100), 100, true; "equals hit")]
#[test_case(BlockIdentifierIndexRule::Equals(100), 101, false; "equals miss")]
#[test_case(BlockIdentifierIndexRule::HigherThan(100), 101, true; "higher than hit")]
#[test_case(BlockIdentifierIndexRule::HigherThan(100), 100, false; "higher than boundary")]
#[test_case(BlockIdentifierIndexRule::LowerThan(100), 99, true; "lower than hit")]
#[test_case(BlockIdentifierIndexRule::Between(100, 110), 105, true; "between hit")]
#[test_case(BlockIdentifierIndexRule::Between(100, 110), 110, false; "between upper bound excluded")]
fn block_height_predicates_select_whole_blocks(
    rule: BlockIdentifierIndexRule,
    height: u64,
    matches: bool,
) {
    let hook = stacks_hook_with_predicate(StacksPredicate::BlockHeight(rule));
    let block = crate::indexer::tests::helpers::stacks_block(height, 'a', 'a', None);
    assert_eq!(
        matches,
        evaluate_stacks_predicate_on_block(&block, &hook, &Context::empty())
    );
}
