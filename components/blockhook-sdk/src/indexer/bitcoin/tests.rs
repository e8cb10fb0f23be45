use super::*;
use blockhook_types::bitcoin::{OutPoint, TxIn, TxOut};

fn txin_with_witness(witness: &str) -> TxIn {
    TxIn {
        previous_output: OutPoint {
            txid: TransactionIdentifier::new(
                "0000000000000000000000000000000000000000000000000000000000000001",
            ),
            vout: 0,
            value: 10_000,
            block_height: 1,
        },
        script_sig: "0x".to_string(),
        sequence: 0,
        witness: vec![witness.to_string()],
    }
}

#[test]
fn inscription_envelope_reveals_content_type_and_body() {
    // OP_FALSE OP_IF "ord" | tag 0x01 "text/plain" | OP_0 "Hello" | OP_ENDIF
    let witness = "0x0063036f7264010a746578742f706c61696e000548656c6c6f68";
    let inputs = vec![txin_with_witness(witness)];
    let operations = try_parse_ordinal_operations("0xabcdef", &inputs);
    assert_eq!(operations.len(), 1);
    match &operations[0] {
        OrdinalOperation::InscriptionRevealed(data) => {
            assert_eq!(data.content_type, "text/plain");
            assert_eq!(data.content_bytes, "0x48656c6c6f");
            assert_eq!(data.content_length, 5);
            assert_eq!(data.inscription_id, "abcdefi0");
            assert_eq!(data.inscription_input_index, 0);
        }
        OrdinalOperation::InscriptionTransferred(_) => panic!("expected reveal"),
    }
}

#[test]
fn witness_without_envelope_reveals_nothing() {
    let inputs = vec![txin_with_witness("0xdeadbeef")];
    let operations = try_parse_ordinal_operations("0xabcdef", &inputs);
    assert!(operations.is_empty());
}

#[test]
fn regtest_block_commit_op_return_is_detected() {
    // OP_RETURN OP_PUSHDATA1 <35> "id" '[' <32-byte block hash>
    let stacks_block_hash = "5b1681995f8e568287e0e4f5cbc1d6727dafb5e3a7822a77c69bd04208265aca";
    let script = format!("0x6a4c2369645b{}", stacks_block_hash);
    let outputs = vec![TxOut {
        value: 0,
        script_pubkey: script,
    }];
    let op = try_parse_stacks_operation(&outputs, b"id", 100, &Context::empty())
        .expect("expected stacks operation");
    match op {
        StacksBaseChainOperation::BlockCommitted(data) => {
            assert_eq!(data.stacks_block_hash, format!("0x{}", stacks_block_hash));
        }
        _ => panic!("expected block commit"),
    }
}

#[test]
fn op_return_with_foreign_magic_is_ignored() {
    let script = "0x6a4c2358585b5b1681995f8e568287e0e4f5cbc1d6727dafb5e3a7822a77c69bd04208";
    let outputs = vec![TxOut {
        value: 0,
        script_pubkey: script.to_string(),
    }];
    assert!(try_parse_stacks_operation(&outputs, b"id", 100, &Context::empty()).is_none());
}

#[test]
fn block_breakdown_header_links_to_parent() {
    let block = BitcoinBlockFullBreakdown {
        hash: "210d0d095a75d88fc059cb97f453eee33b1833153fb1f81b9c3c031c26bb106b".to_string(),
        height: 104,
        time: 1666753576,
        tx: vec![],
        confirmations: 1,
        previousblockhash: Some(
            "5d5a4b8113c35f20fb0b69b1fb1ae1b88461ea57e2a2e4c036f97fae70ca1abb".to_string(),
        ),
    };
    let header = block.get_block_header();
    assert_eq!(header.block_identifier.index, 104);
    assert_eq!(header.parent_block_identifier.index, 103);
    assert!(header
        .parent_block_identifier
        .hash
        .starts_with("0x5d5a4b81"));
}
