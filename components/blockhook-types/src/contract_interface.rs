use serde_json::Value as JsonValue;

/// Interface of a deployed clarity contract, forwarded untouched from the
/// stacks node's `contract_abi` field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContractInterface {
    pub functions: Vec<JsonValue>,
    pub variables: Vec<JsonValue>,
    pub maps: Vec<JsonValue>,
    pub fungible_tokens: Vec<JsonValue>,
    pub non_fungible_tokens: Vec<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarity_version: Option<String>,
}
