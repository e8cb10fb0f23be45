pub mod bitcoin;
pub mod stacks;

pub use bitcoin::*;
pub use stacks::*;

use blockhook_types::{BitcoinNetwork, StacksNetwork};
use schemars::JsonSchema;

/// Set of active hooks the observer evaluates on every chain event.
#[derive(Clone, Debug, PartialEq)]
pub struct HookRegistry {
    pub bitcoin_hooks: Vec<BitcoinHookSpecification>,
    pub stacks_hooks: Vec<StacksHookSpecification>,
}

impl HookRegistry {
    pub fn new() -> HookRegistry {
        HookRegistry {
            bitcoin_hooks: vec![],
            stacks_hooks: vec![],
        }
    }

    pub fn is_hook_registered(&self, uuid: &str) -> bool {
        self.bitcoin_hooks.iter().any(|h| h.uuid.eq(uuid))
            || self.stacks_hooks.iter().any(|h| h.uuid.eq(uuid))
    }

    /// Resolves a network-mapped registration document against the running
    /// networks and registers the resulting specification.
    pub fn register_full_specification(
        &mut self,
        networks: (&BitcoinNetwork, &StacksNetwork),
        hook: HookSpecificationNetworkMap,
    ) -> Result<HookSpecification, String> {
        let spec = match hook {
            HookSpecificationNetworkMap::Stacks(hook) => {
                let spec = hook.into_selected_network_specification(networks.1, None)?;
                spec.validate()?;
                self.stacks_hooks.push(spec.clone());
                HookSpecification::Stacks(spec)
            }
            HookSpecificationNetworkMap::Bitcoin(hook) => {
                let spec = hook.into_selected_network_specification(networks.0, None)?;
                spec.validate()?;
                self.bitcoin_hooks.push(spec.clone());
                HookSpecification::Bitcoin(spec)
            }
        };
        Ok(spec)
    }

    pub fn register_specification(&mut self, spec: HookSpecification) -> Result<(), String> {
        match spec {
            HookSpecification::Stacks(spec) => {
                spec.validate()?;
                self.stacks_hooks.push(spec);
            }
            HookSpecification::Bitcoin(spec) => {
                spec.validate()?;
                self.bitcoin_hooks.push(spec);
            }
        };
        Ok(())
    }

    pub fn enable_specification(&mut self, predicate_spec: &mut HookSpecification) {
        match predicate_spec {
            HookSpecification::Stacks(spec_to_enable) => {
                for spec in self.stacks_hooks.iter_mut() {
                    if spec.uuid.eq(&spec_to_enable.uuid) {
                        spec.enabled = true;
                        spec_to_enable.enabled = true;
                        break;
                    }
                }
            }
            HookSpecification::Bitcoin(spec_to_enable) => {
                for spec in self.bitcoin_hooks.iter_mut() {
                    if spec.uuid.eq(&spec_to_enable.uuid) {
                        spec.enabled = true;
                        spec_to_enable.enabled = true;
                        break;
                    }
                }
            }
        };
    }

    pub fn deregister_stacks_hook(&mut self, hook_uuid: String) -> Option<StacksHookSpecification> {
        let mut i = 0;
        while i < self.stacks_hooks.len() {
            if self.stacks_hooks[i].uuid == hook_uuid {
                return Some(self.stacks_hooks.remove(i));
            }
            i += 1;
        }
        None
    }

    pub fn deregister_bitcoin_hook(
        &mut self,
        hook_uuid: String,
    ) -> Option<BitcoinHookSpecification> {
        let mut i = 0;
        while i < self.bitcoin_hooks.len() {
            if self.bitcoin_hooks[i].uuid == hook_uuid {
                return Some(self.bitcoin_hooks.remove(i));
            }
            i += 1;
        }
        None
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "chain")]
pub enum HookSpecification {
    Bitcoin(BitcoinHookSpecification),
    Stacks(StacksHookSpecification),
}

impl HookSpecification {
    /// Glob matching the predicate key on either chain; resolve it with a
    /// key scan.
    pub fn either_stx_or_btc_key(uuid: &str) -> String {
        format!("predicate:*:{}", uuid)
    }

    pub fn stacks_key(uuid: &str) -> String {
        format!("predicate:stacks:{}", uuid)
    }

    pub fn bitcoin_key(uuid: &str) -> String {
        format!("predicate:bitcoin:{}", uuid)
    }

    pub fn key(&self) -> String {
        match self {
            Self::Bitcoin(data) => Self::bitcoin_key(&data.uuid),
            Self::Stacks(data) => Self::stacks_key(&data.uuid),
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            Self::Bitcoin(data) => &data.uuid,
            Self::Stacks(data) => &data.uuid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Bitcoin(data) => &data.name,
            Self::Stacks(data) => &data.name,
        }
    }

    pub fn deserialize_specification(spec: &str) -> Result<HookSpecification, String> {
        let spec: HookSpecification = serde_json::from_str(spec)
            .map_err(|e| format!("unable to deserialize predicate {}", e))?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Bitcoin(data) => data.validate(),
            Self::Stacks(data) => data.validate(),
        }
    }
}

/// Registration document: one predicate, several candidate networks. The
/// running network decides which entry becomes the active specification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "chain")]
pub enum HookSpecificationNetworkMap {
    Bitcoin(BitcoinHookSpecificationNetworkMap),
    Stacks(StacksHookSpecificationNetworkMap),
}

impl HookSpecificationNetworkMap {
    pub fn get_uuid(&self) -> &str {
        match self {
            Self::Bitcoin(data) => &data.uuid,
            Self::Stacks(data) => &data.uuid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Bitcoin(data) => &data.name,
            Self::Stacks(data) => &data.name,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Bitcoin(data) => {
                for (_network, spec) in data.networks.iter() {
                    validate_blocks_range(spec.start_block, spec.end_block)?;
                    spec.action.validate()?;
                }
            }
            Self::Stacks(data) => {
                for (_network, spec) in data.networks.iter() {
                    validate_blocks_range(spec.start_block, spec.end_block)?;
                    spec.action.validate()?;
                    spec.predicate.validate()?;
                }
            }
        }
        Ok(())
    }
}

fn validate_blocks_range(start_block: Option<u64>, end_block: Option<u64>) -> Result<(), String> {
    if let (Some(start_block), Some(end_block)) = (start_block, end_block) {
        if start_block > end_block {
            return Err(
                "Chainhook specification field `end_block` should be greater than `start_block`."
                    .into(),
            );
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    HttpPost(HttpHook),
    FileAppend(FileHook),
    Noop,
}

impl HookAction {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            HookAction::HttpPost(spec) => {
                if !spec.url.starts_with("http://") && !spec.url.starts_with("https://") {
                    return Err(format!(
                        "Hook action field `url` should start with `http://` or `https://`: {}",
                        spec.url
                    ));
                }
            }
            HookAction::FileAppend(spec) => {
                if spec.path.is_empty() {
                    return Err("Hook action field `path` is empty".into());
                }
            }
            HookAction::Noop => {}
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct HttpHook {
    pub url: String,
    pub authorization_header: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FileHook {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchingRule {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExactMatchingRule {
    Equals(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockIdentifierIndexRule {
    Equals(u64),
    HigherThan(u64),
    LowerThan(u64),
    Between(u64, u64),
}
