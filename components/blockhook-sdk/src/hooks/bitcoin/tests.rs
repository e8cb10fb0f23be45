use super::super::types::MatchingRule;
use super::*;
use blockhook_types::bitcoin::TxOut;
use blockhook_types::{
    BitcoinTransactionMetadata, OrdinalInscriptionRevealData, OrdinalOperation,
};

use test_case::test_case;

pub fn transaction_with_outputs(outputs: Vec<TxOut>) -> BitcoinTransactionData {
    BitcoinTransactionData {
        transaction_identifier: TransactionIdentifier {
            hash: String::from(""),
        },
        operations: vec![],
        metadata: BitcoinTransactionMetadata {
            fee: 0,
            index: 0,
            proof: None,
            inputs: vec![],
            stacks_operations: vec![],
            ordinal_operations: vec![],
            outputs,
        },
    }
}

#[test_case(
    "0x6affAAAA",
     MatchingRule::Equals(String::from("0xAAAA")),
    true;
    "OpReturn: Equals matches Hex value"
)]
#[test_case(
    "0x60ff0000",
     MatchingRule::Equals(String::from("0x0000")),
    false;
    "OpReturn: Invalid OP_RETURN opcode"
)]
#[test_case(
    "0x6aff012345",
     MatchingRule::Equals(String::from("0x0000")),
    false;
    "OpReturn: Equals does not match Hex value"
)]
#[test_case(
    "0x6aff68656C6C6F",
     MatchingRule::Equals(String::from("hello")),
    true;
    "OpReturn: Equals matches ASCII value"
)]
#[test_case(
    "0x6affAA0000",
     MatchingRule::StartsWith(String::from("0xAA")),
    true;
    "OpReturn: StartsWith matches Hex value"
)]
#[test_case(
    "0x6aff585858", // 0x585858 => XXX
     MatchingRule::StartsWith(String::from("X")),
    true;
    "OpReturn: StartsWith matches ASCII value"
)]
#[test_case(
    "0x6aff0000AA",
     MatchingRule::EndsWith(String::from("0xAA")),
    true;
    "OpReturn: EndsWith matches Hex value"
)]
#[test_case(
    "0x6aff000058",
     MatchingRule::EndsWith(String::from("X")),
    true;
    "OpReturn: EndsWith matches ASCII value"
)]
fn test_script_pubkey_evaluation(script_pubkey: &str, rule: MatchingRule, matches: bool) {
    let predicate = BitcoinPredicateType::Outputs(OutputPredicate::OpReturn(rule));

    let tx = transaction_with_outputs(vec![TxOut {
        value: 0,
        script_pubkey: String::from(script_pubkey),
    }]);

    let ctx = Context {
        logger: None,
        tracer: false,
    };

    assert_eq!(matches, predicate.evaluate_transaction_predicate(&tx, &ctx));
}

#[test]
fn p2wpkh_predicate_matches_the_paying_output() {
    // bcrt1qnxknq3wqtphv7sfwy07m7e4sr6ut9yt6ed99jg decodes to a v0 witness
    // program paying 99ad3045c0586ecf412e23fdbf66b01eb8b29179.
    let predicate = BitcoinPredicateType::Outputs(OutputPredicate::P2wpkh(
        ExactMatchingRule::Equals("bcrt1qnxknq3wqtphv7sfwy07m7e4sr6ut9yt6ed99jg".to_string()),
    ));

    let matching_tx = transaction_with_outputs(vec![TxOut {
        value: 10_000,
        script_pubkey: "0x001499ad3045c0586ecf412e23fdbf66b01eb8b29179".to_string(),
    }]);
    let other_tx = transaction_with_outputs(vec![TxOut {
        value: 10_000,
        script_pubkey: "0x0014000000000000000000000000000000000000dead".to_string(),
    }]);

    let ctx = Context::empty();
    assert!(predicate.evaluate_transaction_predicate(&matching_tx, &ctx));
    assert!(!predicate.evaluate_transaction_predicate(&other_tx, &ctx));
}

#[test]
fn p2wpkh_predicate_rejects_non_witness_addresses() {
    let predicate = BitcoinPredicateType::Outputs(OutputPredicate::P2wpkh(
        // A legacy base58 address is not a witness program.
        ExactMatchingRule::Equals("mxVFsFW5N4mu1HPkxPttorvocvzeZ7KZyk".to_string()),
    ));
    let tx = transaction_with_outputs(vec![TxOut {
        value: 10_000,
        script_pubkey: "0x001499ad3045c0586ecf412e23fdbf66b01eb8b29179".to_string(),
    }]);
    assert!(!predicate.evaluate_transaction_predicate(&tx, &Context::empty()));
}

#[test]
fn txid_predicate_matches_the_canonical_txid() {
    let txid = "0x411e78f4b727fc0a78b86c3fd56da0c741c71339713be81d7528c4015665267b";
    let predicate = BitcoinPredicateType::Txid(ExactMatchingRule::Equals(txid.to_string()));

    let mut tx = transaction_with_outputs(vec![]);
    tx.transaction_identifier = TransactionIdentifier::new(txid);

    let ctx = Context::empty();
    assert!(predicate.evaluate_transaction_predicate(&tx, &ctx));

    tx.transaction_identifier = TransactionIdentifier::new(
        "0x0000000000000000000000000000000000000000000000000000000000000000",
    );
    assert!(!predicate.evaluate_transaction_predicate(&tx, &ctx));
}

#[test]
fn inscription_feed_predicate_requires_ordinal_operations() {
    let predicate = BitcoinPredicateType::OrdinalsProtocol(OrdinalOperations::InscriptionFeed);

    let mut tx = transaction_with_outputs(vec![]);
    let ctx = Context::empty();
    assert!(!predicate.evaluate_transaction_predicate(&tx, &ctx));

    tx.metadata.ordinal_operations = vec![OrdinalOperation::InscriptionRevealed(
        OrdinalInscriptionRevealData {
            content_bytes: "0x48656c6c6f".to_string(),
            content_type: "text/plain".to_string(),
            content_length: 5,
            inscription_number: 0,
            inscription_fee: 0,
            inscription_output_value: 10_000,
            inscription_id: "411e78f4b727fc0a78b86c3fd56da0c741c71339713be81d7528c4015665267bi0"
                .to_string(),
            inscription_input_index: 0,
            inscriber_address: None,
            ordinal_number: 0,
            ordinal_block_height: 0,
            ordinal_offset: 0,
            satpoint_post_inscription:
                "411e78f4b727fc0a78b86c3fd56da0c741c71339713be81d7528c4015665267b:0:0".to_string(),
            curse_type: None,
        },
    )];
    assert!(predicate.evaluate_transaction_predicate(&tx, &ctx));
}
