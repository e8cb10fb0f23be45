use super::*;

#[test]
fn serialized_block_header_standardization_links_parent() {
    let serialized_header = r#"{
        "block_height": 21443,
        "index_block_hash": "0x1b9b5c3e4e783b19888b1b90b9d9c3f15dd7b2ac14e8d6e9b1dbd1f9c2a0ff42",
        "parent_index_block_hash": "0x09f23e4c02a5bcb5a2f5b0f3d1e7cbdbdab4c44e0ba3aee5ac8d8bcd6a5b1b88"
    }"#;
    let (block_identifier, parent_block_identifier) =
        standardize_stacks_serialized_block_header(serialized_header).unwrap();
    assert_eq!(block_identifier.index, 21443);
    assert_eq!(parent_block_identifier.index, 21442);
    assert!(block_identifier.hash.starts_with("0x1b9b5c3e"));
    assert!(parent_block_identifier.hash.starts_with("0x09f23e4c"));
}

#[test]
fn serialized_block_header_without_index_hash_is_rejected() {
    let serialized_header = r#"{ "block_height": 21443 }"#;
    assert!(standardize_stacks_serialized_block_header(serialized_header).is_err());
}

#[test]
fn ft_mint_node_event_decodes_into_typed_event() {
    let event: NewEvent = serde_json::from_value(json!({
        "txid": "0xd6f4e67cfc7b5a3bc1d5f29bcee3e9a8cf9e5e14e0e6d0e1cf1e2f3a4b5c6d7e",
        "committed": true,
        "event_index": 4,
        "type": "ft_mint_event",
        "ft_mint_event": {
            "asset_identifier": "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.cbtc-token::cbtc",
            "recipient": "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM",
            "amount": "100"
        }
    }))
    .unwrap();

    let typed_event = event.into_hook_event().unwrap();
    assert_eq!(typed_event.position.index, 4);
    match typed_event.event_payload {
        StacksTransactionEventPayload::FTMintEvent(data) => {
            assert_eq!(
                data.asset_class_identifier,
                "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM.cbtc-token::cbtc"
            );
            assert_eq!(data.amount, "100");
        }
        _ => panic!("expected ft mint event"),
    }
}

#[test]
fn unknown_node_event_is_rejected() {
    let event: NewEvent = serde_json::from_value(json!({
        "txid": "0xd6f4e67cfc7b5a3bc1d5f29bcee3e9a8cf9e5e14e0e6d0e1cf1e2f3a4b5c6d7e",
        "committed": true,
        "event_index": 0,
        "type": "burnchain_op"
    }))
    .unwrap();
    assert!(event.into_hook_event().is_err());
}

#[test]
fn pox_cycles_are_derived_from_burn_height() {
    let pox_info = PoxInfo::default_for_network(&StacksNetwork::Mainnet);
    assert_eq!(pox_info.first_burnchain_block_height, 666050);
    let cycle_length =
        pox_info.prepare_phase_block_length + pox_info.reward_phase_block_length;
    assert_eq!(cycle_length, 2100);
}

#[test]
fn signer_block_response_accepted_is_decoded() {
    let mut payload = vec![];
    // Message type: block response, accepted.
    payload.push(1);
    payload.push(0);
    // signer_signature_hash.
    payload.extend_from_slice(&[0x11; 32]);
    // signature.
    payload.extend_from_slice(&[0x22; 65]);

    let chunks = NewStackerDbChunks {
        contract_id: "ST000000000000000000002AMW42H.signers-1-1".to_string(),
        modified_slots: vec![NewSignerModifiedSlot {
            sig: "00".to_string(),
            data: hex::encode(payload),
            slot_id: 1,
            slot_version: 3,
        }],
    };
    let decoded = standardize_stacks_stackerdb_chunks(&chunks, &Context::empty()).unwrap();
    assert_eq!(decoded.len(), 1);
    match &decoded[0].message {
        StacksSignerMessage::BlockResponse(BlockResponseData::Accepted(data)) => {
            assert_eq!(data.signer_signature_hash, format!("0x{}", "11".repeat(32)));
            assert_eq!(data.signature, format!("0x{}", "22".repeat(65)));
        }
        _ => panic!("expected accepted block response"),
    }
}

#[test]
fn undecodable_signer_slot_is_dropped_not_fatal() {
    let chunks = NewStackerDbChunks {
        contract_id: "ST000000000000000000002AMW42H.signers-1-1".to_string(),
        modified_slots: vec![NewSignerModifiedSlot {
            sig: "00".to_string(),
            data: "ff".to_string(),
            slot_id: 1,
            slot_version: 3,
        }],
    };
    let decoded = standardize_stacks_stackerdb_chunks(&chunks, &Context::empty()).unwrap();
    assert!(decoded.is_empty());
}
