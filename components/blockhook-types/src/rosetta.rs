use crate::bitcoin::{TxIn, TxOut};
use crate::contract_interface::ContractInterface;
use crate::events::StacksTransactionEvent;
use crate::ordinals::OrdinalOperation;
use crate::signers::StacksStackerDbChunk;
use schemars::JsonSchema;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Stacks,
}

impl Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Chain::Bitcoin => write!(f, "bitcoin"),
            Chain::Stacks => write!(f, "stacks"),
        }
    }
}

/// Blocks are identified by the pair (height, hash). Equality compares the
/// pair; ordering uses the height first so identifiers from a single chain of
/// parents sort from base to tip.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Hash, Default)]
pub struct BlockIdentifier {
    pub index: u64,
    pub hash: String,
}

impl BlockIdentifier {
    pub fn get_hash_bytes_str(&self) -> &str {
        self.hash.strip_prefix("0x").unwrap_or(&self.hash)
    }

    pub fn get_hash_bytes(&self) -> Vec<u8> {
        hex::decode(self.get_hash_bytes_str()).unwrap_or_default()
    }
}

impl Display for BlockIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Block #{} ({}...)", self.index, &self.hash[0..12.min(self.hash.len())])
    }
}

impl Ord for BlockIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index, &self.hash).cmp(&(other.index, &other.hash))
    }
}

impl PartialOrd for BlockIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Hash)]
pub struct TransactionIdentifier {
    pub hash: String,
}

impl TransactionIdentifier {
    pub fn new(txid: &str) -> Self {
        let lowercased_txid = txid.to_lowercase();
        Self {
            hash: match lowercased_txid.starts_with("0x") {
                true => lowercased_txid,
                false => format!("0x{}", lowercased_txid),
            },
        }
    }

    pub fn get_hash_bytes_str(&self) -> &str {
        self.hash.strip_prefix("0x").unwrap_or(&self.hash)
    }
}

/// The minimal view of a block that the header-level fork tracker operates on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockHeader {
    pub block_identifier: BlockIdentifier,
    pub parent_block_identifier: BlockIdentifier,
}

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetwork {
    Regtest,
    Testnet,
    Signet,
    Mainnet,
}

impl FromStr for BitcoinNetwork {
    type Err = String;

    fn from_str(network: &str) -> Result<BitcoinNetwork, Self::Err> {
        match network {
            "regtest" => Ok(BitcoinNetwork::Regtest),
            "testnet" => Ok(BitcoinNetwork::Testnet),
            "mainnet" => Ok(BitcoinNetwork::Mainnet),
            "signet" => Ok(BitcoinNetwork::Signet),
            _ => Err(format!(
                "network '{}' unsupported (mainnet, testnet, signet, regtest)",
                network
            )),
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum StacksNetwork {
    Simnet,
    Devnet,
    Testnet,
    Mainnet,
}

impl FromStr for StacksNetwork {
    type Err = String;

    fn from_str(network: &str) -> Result<StacksNetwork, Self::Err> {
        match network {
            "simnet" => Ok(StacksNetwork::Simnet),
            "devnet" => Ok(StacksNetwork::Devnet),
            "testnet" => Ok(StacksNetwork::Testnet),
            "mainnet" => Ok(StacksNetwork::Mainnet),
            _ => Err(format!(
                "network '{}' unsupported (simnet, devnet, testnet, mainnet)",
                network
            )),
        }
    }
}

impl StacksNetwork {
    pub fn is_mainnet(&self) -> bool {
        matches!(self, StacksNetwork::Mainnet)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksNodeConfig {
    pub rpc_url: String,
    pub ingestion_port: u16,
}

impl StacksNodeConfig {
    pub fn default_localhost(ingestion_port: u16) -> StacksNodeConfig {
        StacksNodeConfig {
            rpc_url: crate::DEFAULT_STACKS_NODE_RPC.to_string(),
            ingestion_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum BitcoinBlockSignaling {
    Stacks(StacksNodeConfig),
    ZeroMQ(String),
}

impl BitcoinBlockSignaling {
    pub fn should_ignore_bitcoin_block_signaling_through_stacks(&self) -> bool {
        !matches!(self, BitcoinBlockSignaling::Stacks(_))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BitcoinBlockData {
    pub block_identifier: BlockIdentifier,
    pub parent_block_identifier: BlockIdentifier,
    pub timestamp: u32,
    pub transactions: Vec<BitcoinTransactionData>,
    pub metadata: BitcoinBlockMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BitcoinBlockMetadata {
    pub network: BitcoinNetwork,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BitcoinTransactionData {
    pub transaction_identifier: TransactionIdentifier,
    pub operations: Vec<Operation>,
    pub metadata: BitcoinTransactionMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BitcoinTransactionMetadata {
    pub fee: u64,
    pub index: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub stacks_operations: Vec<StacksBaseChainOperation>,
    pub ordinal_operations: Vec<OrdinalOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StacksBaseChainOperation {
    BlockCommitted(BlockCommitmentData),
    LeaderRegistered(KeyRegistrationData),
    StxTransferred(TransferSTXData),
    StxLocked(LockSTXData),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlockCommitmentData {
    pub stacks_block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct KeyRegistrationData {}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransferSTXData {
    pub sender: String,
    pub recipient: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LockSTXData {
    pub sender: String,
    pub amount: String,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksBlockData {
    pub block_identifier: BlockIdentifier,
    pub parent_block_identifier: BlockIdentifier,
    pub timestamp: i64,
    pub transactions: Vec<StacksTransactionData>,
    pub metadata: StacksBlockMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksBlockMetadata {
    pub bitcoin_anchor_block_identifier: BlockIdentifier,
    pub pox_cycle_index: u32,
    pub pox_cycle_position: u32,
    pub pox_cycle_length: u32,
    pub confirm_microblock_identifier: Option<BlockIdentifier>,
    pub stacks_block_hash: String,
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
    pub reward_set: Option<StacksBlockMetadataRewardSet>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksBlockMetadataRewardSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pox_ustx_threshold: Option<String>,
    pub rewarded_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signers: Option<Vec<StacksBlockMetadataRewardSetSigner>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksBlockMetadataRewardSetSigner {
    pub signing_key: String,
    pub weight: u32,
    pub stacked_amt: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksMicroblockData {
    pub block_identifier: BlockIdentifier,
    pub parent_block_identifier: BlockIdentifier,
    pub timestamp: i64,
    pub transactions: Vec<StacksTransactionData>,
    pub metadata: StacksMicroblockMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksMicroblockMetadata {
    pub anchor_block_identifier: BlockIdentifier,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksTransactionData {
    pub transaction_identifier: TransactionIdentifier,
    pub operations: Vec<Operation>,
    pub metadata: StacksTransactionMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksTransactionMetadata {
    pub success: bool,
    pub raw_tx: String,
    pub result: String,
    pub sender: String,
    pub nonce: u64,
    pub fee: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsor: Option<String>,
    pub kind: StacksTransactionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_cost: Option<StacksTransactionExecutionCost>,
    pub receipt: StacksTransactionReceipt,
    pub description: String,
    pub position: StacksTransactionPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_abi: Option<ContractInterface>,
}

/// Anchor block or microblock. The position is what keeps per-block
/// transaction streams stable for the evaluator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StacksTransactionPosition {
    AnchorBlock { index: usize },
    MicroBlock { micro_block_identifier: BlockIdentifier, index: usize },
}

impl StacksTransactionPosition {
    pub fn anchor_block(index: usize) -> StacksTransactionPosition {
        StacksTransactionPosition::AnchorBlock { index }
    }

    pub fn micro_block(
        micro_block_identifier: BlockIdentifier,
        index: usize,
    ) -> StacksTransactionPosition {
        StacksTransactionPosition::MicroBlock {
            micro_block_identifier,
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum StacksTransactionKind {
    ContractCall(StacksContractCallData),
    ContractDeployment(StacksContractDeploymentData),
    NativeTokenTransfer,
    Coinbase,
    TenureChange,
    BitcoinOp(BitcoinOpData),
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksContractCallData {
    pub contract_identifier: String,
    pub method: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksContractDeploymentData {
    pub contract_identifier: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum BitcoinOpData {
    StackSTX(StackSTXData),
    DelegateStackSTX(DelegateStackSTXData),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StackSTXData {
    pub locked_amount: String,
    pub unlock_height: String,
    pub stacking_address: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DelegateStackSTXData {
    pub stacking_address: String,
    pub amount: String,
    pub delegate: String,
    pub pox_address: Option<String>,
    pub unlock_height: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksTransactionExecutionCost {
    pub write_length: u64,
    pub write_count: u64,
    pub read_length: u64,
    pub read_count: u64,
    pub runtime: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksTransactionReceipt {
    pub mutated_contracts_radius: HashSet<String>,
    pub mutated_assets_radius: HashSet<String>,
    pub contract_calls_stack: HashSet<String>,
    pub events: Vec<StacksTransactionEvent>,
}

impl StacksTransactionReceipt {
    pub fn new(
        mutated_contracts_radius: HashSet<String>,
        mutated_assets_radius: HashSet<String>,
        events: Vec<StacksTransactionEvent>,
    ) -> StacksTransactionReceipt {
        StacksTransactionReceipt {
            mutated_contracts_radius,
            mutated_assets_radius,
            contract_calls_stack: HashSet::new(),
            events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    pub operation_identifier: OperationIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_operations: Option<Vec<OperationIdentifier>>,
    #[serde(rename = "type")]
    pub type_: OperationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatusKind>,
    pub account: AccountIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OperationIdentifier {
    pub index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Credit,
    Debit,
    Lock,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatusKind {
    Success,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccountIdentifier {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Amount {
    pub value: u128,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Currency {
    pub symbol: String,
    pub decimals: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CurrencyMetadata>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CurrencyMetadata {
    pub asset_class_identifier: String,
    pub asset_identifier: Option<String>,
    pub standard: CurrencyStandard,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyStandard {
    Sip09,
    Sip10,
    None,
}

/// Header-level chain transition, emitted by the Bitcoin block pool before
/// full blocks are re-attached by the observer.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockchainEvent {
    BlockchainUpdatedWithHeaders(BlockchainUpdatedWithHeaders),
    BlockchainUpdatedWithReorg(BlockchainUpdatedWithReorg),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockchainUpdatedWithHeaders {
    pub new_headers: Vec<BlockHeader>,
    pub confirmed_headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockchainUpdatedWithReorg {
    pub headers_to_rollback: Vec<BlockHeader>,
    pub headers_to_apply: Vec<BlockHeader>,
    pub confirmed_headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum BitcoinChainEvent {
    ChainUpdatedWithBlocks(BitcoinChainUpdatedWithBlocksData),
    ChainUpdatedWithReorg(BitcoinChainUpdatedWithReorgData),
}

impl BitcoinChainEvent {
    pub fn get_confirmed_blocks(&self) -> &Vec<BitcoinBlockData> {
        match self {
            BitcoinChainEvent::ChainUpdatedWithBlocks(event) => &event.confirmed_blocks,
            BitcoinChainEvent::ChainUpdatedWithReorg(event) => &event.confirmed_blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BitcoinChainUpdatedWithBlocksData {
    pub new_blocks: Vec<BitcoinBlockData>,
    pub confirmed_blocks: Vec<BitcoinBlockData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BitcoinChainUpdatedWithReorgData {
    /// Tip to base order: the first block to leave the canonical chain is the
    /// previous tip.
    pub blocks_to_rollback: Vec<BitcoinBlockData>,
    /// Base to tip order.
    pub blocks_to_apply: Vec<BitcoinBlockData>,
    pub confirmed_blocks: Vec<BitcoinBlockData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksBlockUpdate {
    pub block: StacksBlockData,
    pub parent_microblocks_to_rollback: Vec<StacksMicroblockData>,
    pub parent_microblocks_to_apply: Vec<StacksMicroblockData>,
}

impl StacksBlockUpdate {
    pub fn new(block: StacksBlockData) -> StacksBlockUpdate {
        StacksBlockUpdate {
            block,
            parent_microblocks_to_rollback: vec![],
            parent_microblocks_to_apply: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum StacksChainEvent {
    ChainUpdatedWithBlocks(StacksChainUpdatedWithBlocksData),
    ChainUpdatedWithMicroblocks(StacksChainUpdatedWithMicroblocksData),
    ChainUpdatedWithMicroblocksReorg(StacksChainUpdatedWithMicroblocksReorgData),
    ChainUpdatedWithReorg(StacksChainUpdatedWithReorgData),
    ChainUpdatedWithStackerDbChunks(StacksChainUpdatedWithStackerDbChunksData),
}

impl StacksChainEvent {
    pub fn get_latest_block_identifier(&self) -> Option<&BlockIdentifier> {
        match self {
            StacksChainEvent::ChainUpdatedWithBlocks(event) => event
                .new_blocks
                .iter()
                .max_by_key(|b| b.block.block_identifier.index)
                .map(|b| &b.block.block_identifier),
            StacksChainEvent::ChainUpdatedWithReorg(event) => event
                .blocks_to_apply
                .iter()
                .max_by_key(|b| b.block.block_identifier.index)
                .map(|b| &b.block.block_identifier),
            StacksChainEvent::ChainUpdatedWithMicroblocks(event) => event
                .new_microblocks
                .first()
                .map(|b| &b.metadata.anchor_block_identifier),
            StacksChainEvent::ChainUpdatedWithMicroblocksReorg(event) => event
                .microblocks_to_apply
                .first()
                .map(|b| &b.metadata.anchor_block_identifier),
            StacksChainEvent::ChainUpdatedWithStackerDbChunks(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksChainUpdatedWithBlocksData {
    pub new_blocks: Vec<StacksBlockUpdate>,
    pub confirmed_blocks: Vec<StacksBlockData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksChainUpdatedWithReorgData {
    /// Tip to base order.
    pub blocks_to_rollback: Vec<StacksBlockUpdate>,
    /// Base to tip order.
    pub blocks_to_apply: Vec<StacksBlockUpdate>,
    pub confirmed_blocks: Vec<StacksBlockData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksChainUpdatedWithMicroblocksData {
    pub new_microblocks: Vec<StacksMicroblockData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksChainUpdatedWithMicroblocksReorgData {
    pub microblocks_to_rollback: Vec<StacksMicroblockData>,
    pub microblocks_to_apply: Vec<StacksMicroblockData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StacksChainUpdatedWithStackerDbChunksData {
    pub chunks: Vec<StacksStackerDbChunk>,
    pub received_at_ms: u64,
}
