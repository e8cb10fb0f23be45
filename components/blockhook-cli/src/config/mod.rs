pub mod file;
pub mod generator;

pub use file::ConfigFile;
use file::NetworkConfigMode;

use blockhook_sdk::indexer::IndexerConfig;
use blockhook_sdk::observer::{EventObserverConfig, DEFAULT_INGESTION_PORT};
use blockhook_types::{
    BitcoinBlockSignaling, BitcoinNetwork, StacksNetwork, StacksNodeConfig,
};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

const DEFAULT_MAINNET_STACKS_TSV_ARCHIVE: &str =
    "https://archive.hiro.so/mainnet/stacks-blockchain-api/mainnet-stacks-blockchain-api-latest.gz";
const DEFAULT_TESTNET_STACKS_TSV_ARCHIVE: &str =
    "https://archive.hiro.so/testnet/stacks-blockchain-api/testnet-stacks-blockchain-api-latest.gz";

pub const DEFAULT_CONTROL_PORT: u16 = 20446;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub storage: StorageConfig,
    pub http_api: PredicatesApi,
    pub event_sources: Vec<EventSourceConfig>,
    pub limits: LimitsConfig,
    pub network: IndexerConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageConfig {
    pub working_dir: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PredicatesApi {
    Off,
    On(PredicatesApiConfig),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PredicatesApiConfig {
    pub http_port: u16,
    pub database_uri: String,
    pub display_logs: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MonitoringConfig {
    pub prometheus_monitoring_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventSourceConfig {
    StacksTsvPath(PathConfig),
    StacksTsvUrl(UrlConfig),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PathConfig {
    pub file_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UrlConfig {
    pub file_url: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LimitsConfig {
    pub max_number_of_bitcoin_predicates: usize,
    pub max_number_of_concurrent_bitcoin_scans: usize,
    pub max_number_of_stacks_predicates: usize,
    pub max_number_of_concurrent_stacks_scans: usize,
    pub max_number_of_processing_threads: usize,
    pub max_number_of_networking_threads: usize,
    pub max_caching_memory_size_mb: usize,
}

impl Config {
    pub fn from_file_path(file_path: &str) -> Result<Config, String> {
        let file = File::open(file_path)
            .map_err(|e| format!("unable to read file {}\n{:?}", file_path, e))?;
        let mut file_reader = BufReader::new(file);
        let mut file_buffer = vec![];
        file_reader
            .read_to_end(&mut file_buffer)
            .map_err(|e| format!("unable to read file {}\n{:?}", file_path, e))?;

        let config_file: ConfigFile = match toml::from_slice(&file_buffer) {
            Ok(s) => s,
            Err(e) => {
                return Err(format!("Config file malformatted {}", e));
            }
        };
        Config::from_config_file(config_file)
    }

    pub fn is_http_api_enabled(&self) -> bool {
        matches!(self.http_api, PredicatesApi::On(_))
    }

    pub fn get_event_observer_config(&self) -> EventObserverConfig {
        EventObserverConfig {
            registry: None,
            bitcoin_rpc_proxy_enabled: false,
            ingestion_port: self.network.get_stacks_node_config().ingestion_port,
            bitcoind_rpc_username: self.network.bitcoind_rpc_username.clone(),
            bitcoind_rpc_password: self.network.bitcoind_rpc_password.clone(),
            bitcoind_rpc_url: self.network.bitcoind_rpc_url.clone(),
            bitcoin_block_signaling: self.network.bitcoin_block_signaling.clone(),
            display_logs: false,
            cache_path: self.storage.working_dir.clone(),
            bitcoin_network: self.network.bitcoin_network.clone(),
            stacks_network: self.network.stacks_network.clone(),
            prometheus_monitoring_port: self.monitoring.prometheus_monitoring_port,
        }
    }

    pub fn from_config_file(config_file: ConfigFile) -> Result<Config, String> {
        let (stacks_network, bitcoin_network) = match config_file.network.mode {
            NetworkConfigMode::Devnet => (StacksNetwork::Devnet, BitcoinNetwork::Regtest),
            NetworkConfigMode::Testnet => (StacksNetwork::Testnet, BitcoinNetwork::Testnet),
            NetworkConfigMode::Mainnet => (StacksNetwork::Mainnet, BitcoinNetwork::Mainnet),
            NetworkConfigMode::Signet => (StacksNetwork::Testnet, BitcoinNetwork::Signet),
        };

        let mut event_sources = vec![];
        for source in config_file.event_source.unwrap_or(vec![]).iter_mut() {
            if let Some(dst) = source.tsv_file_path.take() {
                let mut file_path = PathBuf::new();
                file_path.push(dst);
                event_sources.push(EventSourceConfig::StacksTsvPath(PathConfig { file_path }));
                continue;
            }
            if let Some(file_url) = source.tsv_file_url.take() {
                event_sources.push(EventSourceConfig::StacksTsvUrl(UrlConfig { file_url }));
                continue;
            }
        }

        let http_api = match config_file.http_api {
            None => PredicatesApi::Off,
            Some(http_api) => match http_api.disabled {
                Some(true) => PredicatesApi::Off,
                _ => PredicatesApi::On(PredicatesApiConfig {
                    http_port: http_api.http_port.unwrap_or(DEFAULT_CONTROL_PORT),
                    database_uri: http_api
                        .database_uri
                        .unwrap_or("redis://localhost:6379/".to_string()),
                    display_logs: http_api.display_logs.unwrap_or(false),
                }),
            },
        };

        let ingestion_port = config_file
            .network
            .stacks_events_ingestion_port
            .unwrap_or(DEFAULT_INGESTION_PORT);

        let config = Config {
            storage: StorageConfig {
                working_dir: config_file.storage.working_dir.unwrap_or("cache".into()),
            },
            http_api,
            event_sources,
            limits: LimitsConfig {
                max_number_of_stacks_predicates: config_file
                    .limits
                    .max_number_of_stacks_predicates
                    .unwrap_or(100),
                max_number_of_bitcoin_predicates: config_file
                    .limits
                    .max_number_of_bitcoin_predicates
                    .unwrap_or(100),
                max_number_of_concurrent_stacks_scans: config_file
                    .limits
                    .max_number_of_concurrent_stacks_scans
                    .unwrap_or(10),
                max_number_of_concurrent_bitcoin_scans: config_file
                    .limits
                    .max_number_of_concurrent_bitcoin_scans
                    .unwrap_or(10),
                max_number_of_processing_threads: config_file
                    .limits
                    .max_number_of_processing_threads
                    .unwrap_or(16),
                max_number_of_networking_threads: config_file
                    .limits
                    .max_number_of_networking_threads
                    .unwrap_or(16),
                max_caching_memory_size_mb: config_file
                    .limits
                    .max_caching_memory_size_mb
                    .unwrap_or(32000),
            },
            network: IndexerConfig {
                bitcoind_rpc_url: config_file.network.bitcoind_rpc_url.to_string(),
                bitcoind_rpc_username: config_file.network.bitcoind_rpc_username.to_string(),
                bitcoind_rpc_password: config_file.network.bitcoind_rpc_password.to_string(),
                bitcoin_block_signaling: match config_file.network.bitcoind_zmq_url {
                    Some(ref zmq_url) => BitcoinBlockSignaling::ZeroMQ(zmq_url.clone()),
                    None => BitcoinBlockSignaling::Stacks(StacksNodeConfig {
                        rpc_url: config_file
                            .network
                            .stacks_node_rpc_url
                            .unwrap_or(blockhook_types::DEFAULT_STACKS_NODE_RPC.to_string()),
                        ingestion_port,
                    }),
                },
                stacks_network,
                bitcoin_network,
            },
            monitoring: MonitoringConfig {
                prometheus_monitoring_port: config_file
                    .monitoring
                    .and_then(|m| m.prometheus_monitoring_port),
            },
        };
        Ok(config)
    }

    pub fn add_local_stacks_tsv_source(&mut self, file_path: &PathBuf) {
        self.event_sources
            .push(EventSourceConfig::StacksTsvPath(PathConfig {
                file_path: file_path.clone(),
            }));
    }

    pub fn expected_api_database_uri(&self) -> &str {
        &self.expected_api_config().database_uri
    }

    pub fn expected_api_config(&self) -> &PredicatesApiConfig {
        match self.http_api {
            PredicatesApi::On(ref config) => config,
            _ => unreachable!(),
        }
    }

    pub fn expected_cache_path(&self) -> PathBuf {
        let mut destination_path = PathBuf::new();
        destination_path.push(&self.storage.working_dir);
        destination_path
    }

    /// Path where a remote tsv would land once downloaded.
    pub fn expected_local_stacks_tsv_file(&self) -> Result<PathBuf, String> {
        for source in self.event_sources.iter() {
            if let EventSourceConfig::StacksTsvPath(config) = source {
                return Ok(config.file_path.clone());
            }
        }
        let mut destination_path = self.expected_cache_path();
        destination_path.push("stacks-events.tsv");
        Ok(destination_path)
    }

    fn expected_remote_stacks_tsv_base_url(&self) -> Result<&String, String> {
        for source in self.event_sources.iter() {
            if let EventSourceConfig::StacksTsvUrl(config) = source {
                return Ok(&config.file_url);
            }
        }
        Err("expected remote-tsv source".into())
    }

    pub fn expected_remote_stacks_tsv_url(&self) -> Result<&String, String> {
        self.expected_remote_stacks_tsv_base_url()
    }

    pub fn rely_on_remote_stacks_tsv(&self) -> bool {
        self.event_sources
            .iter()
            .any(|s| matches!(s, EventSourceConfig::StacksTsvUrl(_)))
    }

    pub fn should_download_remote_stacks_tsv(&self) -> bool {
        let mut rely_on_remote_tsv = false;
        let mut remote_tsv_present_locally = false;
        for source in self.event_sources.iter() {
            if let EventSourceConfig::StacksTsvUrl(_config) = source {
                rely_on_remote_tsv = true;
            }
            if let EventSourceConfig::StacksTsvPath(_config) = source {
                remote_tsv_present_locally = true;
            }
        }
        rely_on_remote_tsv && !remote_tsv_present_locally
    }

    pub fn default(
        devnet: bool,
        testnet: bool,
        mainnet: bool,
        config_path: &Option<String>,
    ) -> Result<Config, String> {
        let config = match (devnet, testnet, mainnet, config_path) {
            (true, false, false, _) => Config::devnet_default(),
            (false, true, false, _) => Config::testnet_default(),
            (false, false, true, _) => Config::mainnet_default(),
            (false, false, false, Some(config_path)) => Config::from_file_path(config_path)?,
            _ => Err("Invalid combination of arguments".to_string())?,
        };
        Ok(config)
    }

    pub fn devnet_default() -> Config {
        Config {
            storage: StorageConfig {
                working_dir: default_cache_path(),
            },
            http_api: PredicatesApi::Off,
            event_sources: vec![],
            limits: LimitsConfig {
                max_number_of_bitcoin_predicates: 100,
                max_number_of_concurrent_bitcoin_scans: 100,
                max_number_of_stacks_predicates: 50,
                max_number_of_concurrent_stacks_scans: 10,
                max_number_of_processing_threads: 16,
                max_number_of_networking_threads: 16,
                max_caching_memory_size_mb: 32000,
            },
            network: IndexerConfig {
                bitcoind_rpc_url: "http://0.0.0.0:18443".into(),
                bitcoind_rpc_username: "devnet".into(),
                bitcoind_rpc_password: "devnet".into(),
                bitcoin_block_signaling: BitcoinBlockSignaling::Stacks(
                    StacksNodeConfig::default_localhost(DEFAULT_INGESTION_PORT),
                ),
                stacks_network: StacksNetwork::Devnet,
                bitcoin_network: BitcoinNetwork::Regtest,
            },
            monitoring: MonitoringConfig {
                prometheus_monitoring_port: None,
            },
        }
    }

    pub fn testnet_default() -> Config {
        let mut config = Config::devnet_default();
        config.event_sources = vec![EventSourceConfig::StacksTsvUrl(UrlConfig {
            file_url: DEFAULT_TESTNET_STACKS_TSV_ARCHIVE.into(),
        })];
        config.limits.max_number_of_bitcoin_predicates = 10;
        config.limits.max_number_of_stacks_predicates = 10;
        config.network = IndexerConfig {
            bitcoind_rpc_url: "http://0.0.0.0:18332".into(),
            bitcoind_rpc_username: "devnet".into(),
            bitcoind_rpc_password: "devnet".into(),
            bitcoin_block_signaling: BitcoinBlockSignaling::Stacks(
                StacksNodeConfig::default_localhost(DEFAULT_INGESTION_PORT),
            ),
            stacks_network: StacksNetwork::Testnet,
            bitcoin_network: BitcoinNetwork::Testnet,
        };
        config
    }

    pub fn mainnet_default() -> Config {
        let mut config = Config::devnet_default();
        config.event_sources = vec![EventSourceConfig::StacksTsvUrl(UrlConfig {
            file_url: DEFAULT_MAINNET_STACKS_TSV_ARCHIVE.into(),
        })];
        config.limits.max_number_of_bitcoin_predicates = 10;
        config.limits.max_number_of_stacks_predicates = 10;
        config.network = IndexerConfig {
            bitcoind_rpc_url: "http://0.0.0.0:8332".into(),
            bitcoind_rpc_username: "devnet".into(),
            bitcoind_rpc_password: "devnet".into(),
            bitcoin_block_signaling: BitcoinBlockSignaling::Stacks(
                StacksNodeConfig::default_localhost(DEFAULT_INGESTION_PORT),
            ),
            stacks_network: StacksNetwork::Mainnet,
            bitcoin_network: BitcoinNetwork::Mainnet,
        };
        config
    }
}

pub fn default_cache_path() -> String {
    let mut cache_path = std::env::current_dir().expect("unable to get current dir");
    cache_path.push("cache");
    format!("{}", cache_path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_sample_file_is_accepted() {
        let config_file: ConfigFile =
            toml::from_str(&generator::generate_config(&NetworkConfigMode::Mainnet)).unwrap();
        let config = Config::from_config_file(config_file).unwrap();
        assert_eq!(config.network.stacks_network, StacksNetwork::Mainnet);
        assert_eq!(config.network.bitcoin_network, BitcoinNetwork::Mainnet);
        // The sample ships with the http api commented out.
        assert!(!config.is_http_api_enabled());
        assert!(config.rely_on_remote_stacks_tsv());
    }
}
