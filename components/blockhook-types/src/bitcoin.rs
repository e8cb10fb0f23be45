use crate::rosetta::TransactionIdentifier;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: String,
    pub sequence: u32,
    pub witness: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutPoint {
    pub txid: TransactionIdentifier,
    pub vout: u32,
    pub value: u64,
    pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: String,
}

impl TxOut {
    pub fn get_script_pubkey_hex(&self) -> &str {
        self.script_pubkey
            .strip_prefix("0x")
            .unwrap_or(&self.script_pubkey)
    }

    pub fn get_script_pubkey_bytes(&self) -> Vec<u8> {
        hex::decode(self.get_script_pubkey_hex()).unwrap_or_default()
    }
}
