use crate::config::file::NetworkConfigMode;
use crate::config::generator::generate_config;
use crate::config::Config;
use crate::scan::bitcoin::scan_bitcoin_chainstate_via_rpc_using_predicate;
use crate::scan::stacks::{
    consolidate_local_stacks_chainstate_using_csv, scan_stacks_chainstate_via_rocksdb_using_predicate,
};
use crate::service::http_api::document_predicate_api_server;
use crate::service::Service;
use crate::storage::open_readonly_stacks_db_conn;

use blockhook_sdk::dispatcher::Dispatcher;
use blockhook_sdk::hooks::types::{
    BitcoinHookNetworkSpecification, BitcoinHookSpecificationNetworkMap, BitcoinPredicateType,
    FileHook, HookAction, HookSpecificationNetworkMap, OrdinalOperations,
    StacksHookNetworkSpecification, StacksHookSpecificationNetworkMap, StacksPredicate,
    StacksPrintEventBasedPredicate,
};
use blockhook_sdk::utils::Context;
use blockhook_types::{BitcoinNetwork, StacksNetwork};
use clap::{Parser, Subcommand};
use hiro_system_kit;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Generate and test predicates
    #[clap(subcommand)]
    Predicates(PredicatesCommand),
    /// Generate configuration files
    #[clap(subcommand)]
    Config(ConfigCommand),
    /// Run a service streaming blocks and evaluating registered predicates
    #[clap(subcommand)]
    Service(ServiceCommand),
    /// Generate documentation
    #[clap(subcommand)]
    Docs(DocsCommand),
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
#[clap(bin_name = "predicate", aliases = &["predicate"])]
enum PredicatesCommand {
    /// Generate new predicate
    #[clap(name = "new", bin_name = "new", aliases = &["generate"])]
    New(NewPredicate),
    /// Scan blocks (one-off) from specified network and apply provided predicate
    #[clap(name = "scan", bin_name = "scan")]
    Scan(ScanPredicate),
    /// Check given predicate
    #[clap(name = "check", bin_name = "check")]
    Check(CheckPredicate),
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
#[clap(bin_name = "config", aliases = &["config"])]
enum ConfigCommand {
    /// Generate new config
    #[clap(name = "new", bin_name = "new", aliases = &["generate"])]
    New(NewConfig),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct NewConfig {
    /// Target Devnet network
    #[clap(
        long = "devnet",
        conflicts_with = "testnet",
        conflicts_with = "mainnet"
    )]
    pub devnet: bool,
    /// Target Testnet network
    #[clap(
        long = "testnet",
        conflicts_with = "devnet",
        conflicts_with = "mainnet"
    )]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(
        long = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "devnet"
    )]
    pub mainnet: bool,
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct NewPredicate {
    /// Predicate's name
    pub name: String,
    /// Generate a Bitcoin predicate
    #[clap(long = "bitcoin", conflicts_with = "stacks")]
    pub bitcoin: bool,
    /// Generate a Stacks predicate
    #[clap(long = "stacks", conflicts_with = "bitcoin")]
    pub stacks: bool,
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct ScanPredicate {
    /// Predicate spec file to scan (json format)
    pub predicate_path: String,
    /// Target Testnet network
    #[clap(long = "testnet", conflicts_with = "mainnet")]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(long = "mainnet", conflicts_with = "testnet")]
    pub mainnet: bool,
    /// Load config file path
    #[clap(
        long = "config-path",
        conflicts_with = "mainnet",
        conflicts_with = "testnet"
    )]
    pub config_path: Option<String>,
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct CheckPredicate {
    /// Predicate spec file to check (json format)
    pub predicate_path: String,
    /// Target Testnet network
    #[clap(long = "testnet", conflicts_with = "mainnet")]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(long = "mainnet", conflicts_with = "testnet")]
    pub mainnet: bool,
    /// Load config file path
    #[clap(
        long = "config-path",
        conflicts_with = "mainnet",
        conflicts_with = "testnet"
    )]
    pub config_path: Option<String>,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum ServiceCommand {
    /// Start blockhook
    #[clap(name = "start", bin_name = "start")]
    Start(StartCommand),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct StartCommand {
    /// Target Devnet network
    #[clap(
        long = "devnet",
        conflicts_with = "testnet",
        conflicts_with = "mainnet"
    )]
    pub devnet: bool,
    /// Target Testnet network
    #[clap(
        long = "testnet",
        conflicts_with = "devnet",
        conflicts_with = "mainnet"
    )]
    pub testnet: bool,
    /// Target Mainnet network
    #[clap(
        long = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "devnet"
    )]
    pub mainnet: bool,
    /// Load config file path
    #[clap(
        long = "config-path",
        conflicts_with = "mainnet",
        conflicts_with = "testnet",
        conflicts_with = "devnet"
    )]
    pub config_path: Option<String>,
    /// Specify relative path of the predicates (json format) to evaluate
    #[clap(long = "predicate-path")]
    pub predicates_paths: Vec<String>,
    /// Start REST API for managing predicates
    #[clap(long = "start-http-api")]
    pub start_http_api: bool,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum DocsCommand {
    /// Generate new documentation for the predicate registration API.
    #[clap(subcommand)]
    #[clap(name = "api")]
    Api(ApiDocsCommand),
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum ApiDocsCommand {
    /// Generate documentation for the predicate registration API.
    #[clap(name = "new", bin_name = "new", aliases = &["generate"])]
    Generate,
}

pub fn main() {
    let logger = hiro_system_kit::log::setup_logger();
    let _guard = hiro_system_kit::log::setup_global_logger(logger.clone());
    let ctx = Context {
        logger: Some(logger),
        tracer: false,
    };

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    };

    match hiro_system_kit::nestable_block_on(handle_command(opts, ctx.clone())) {
        Err(e) => {
            error!(ctx.expect_logger(), "{e}");
            std::thread::sleep(std::time::Duration::from_millis(500));
            process::exit(1);
        }
        Ok(_) => {}
    }
}

async fn handle_command(opts: Opts, ctx: Context) -> Result<(), String> {
    match opts.command {
        Command::Service(subcmd) => match subcmd {
            ServiceCommand::Start(cmd) => {
                let mut config =
                    Config::default(cmd.devnet, cmd.testnet, cmd.mainnet, &cmd.config_path)?;
                if cmd.start_http_api && !config.is_http_api_enabled() {
                    config.http_api = crate::config::PredicatesApi::On(
                        crate::config::PredicatesApiConfig {
                            http_port: crate::config::DEFAULT_CONTROL_PORT,
                            database_uri: "redis://localhost:6379/".to_string(),
                            display_logs: false,
                        },
                    );
                }

                let predicates = cmd
                    .predicates_paths
                    .iter()
                    .map(|p| load_predicate_from_path(p))
                    .collect::<Result<Vec<HookSpecificationNetworkMap>, _>>()?;

                info!(ctx.expect_logger(), "Starting service...",);

                let mut service = Service::new(config, ctx);
                return service.run(predicates).await;
            }
        },
        Command::Config(subcmd) => match subcmd {
            ConfigCommand::New(cmd) => {
                use std::fs::File;
                use std::io::Write;
                let mode = match (cmd.devnet, cmd.testnet, cmd.mainnet) {
                    (true, false, false) => NetworkConfigMode::Devnet,
                    (false, true, false) => NetworkConfigMode::Testnet,
                    (false, false, true) => NetworkConfigMode::Mainnet,
                    _ => return Err("Invalid combination of arguments".to_string()),
                };
                let config_content = generate_config(&mode);
                let mut file_path = PathBuf::new();
                file_path.push("Blockhook.toml");
                let mut file = File::create(&file_path)
                    .map_err(|e| format!("unable to open file {}\n{}", file_path.display(), e))?;
                file.write_all(config_content.as_bytes())
                    .map_err(|e| format!("unable to write file {}\n{}", file_path.display(), e))?;
                println!("Created file Blockhook.toml");
            }
        },
        Command::Predicates(subcmd) => match subcmd {
            PredicatesCommand::New(cmd) => {
                use uuid::Uuid;

                let id = Uuid::new_v4();

                let predicate = match (cmd.stacks, cmd.bitcoin) {
                    (true, false) => {
                        let mut networks = BTreeMap::new();

                        networks.insert(StacksNetwork::Testnet, StacksHookNetworkSpecification {
                            start_block: Some(34239),
                            end_block: None,
                            blocks: None,
                            predicate: StacksPredicate::PrintEvent(StacksPrintEventBasedPredicate::Contains {
                                contract_identifier: "ST1SVA0SST0EDT4MFYGWGP6GNSXMMQJDVP1G8QTTC.arkadiko-freddie-v1-1".into(),
                                contains: "vault".into(),
                            }),
                            expire_after_occurrence: None,
                            capture_all_events: None,
                            decode_clarity_values: None,
                            include_contract_abi: None,
                            action: HookAction::FileAppend(FileHook {
                                path: "arkadiko.txt".into()
                            })
                        });

                        networks.insert(StacksNetwork::Mainnet, StacksHookNetworkSpecification {
                            start_block: Some(34239),
                            end_block: None,
                            blocks: None,
                            predicate: StacksPredicate::PrintEvent(StacksPrintEventBasedPredicate::Contains {
                                contract_identifier: "SP2C2YFP12AJZB4MABJBAJ55XECVS7E4PMMZ89YZR.arkadiko-freddie-v1-1".into(),
                                contains: "vault".into(),
                            }),
                            expire_after_occurrence: None,
                            capture_all_events: None,
                            decode_clarity_values: None,
                            include_contract_abi: None,
                            action: HookAction::FileAppend(FileHook {
                                path: "arkadiko.txt".into()
                            })
                        });

                        HookSpecificationNetworkMap::Stacks(StacksHookSpecificationNetworkMap {
                            uuid: id.to_string(),
                            owner_uuid: None,
                            name: cmd.name,
                            version: 1,
                            networks,
                        })
                    }
                    (false, true) => {
                        let mut networks = BTreeMap::new();

                        networks.insert(
                            BitcoinNetwork::Mainnet,
                            BitcoinHookNetworkSpecification {
                                start_block: Some(767430),
                                end_block: None,
                                blocks: None,
                                expire_after_occurrence: None,
                                predicate: BitcoinPredicateType::OrdinalsProtocol(
                                    OrdinalOperations::InscriptionFeed,
                                ),
                                include_proof: None,
                                include_inputs: None,
                                include_outputs: None,
                                include_witness: None,
                                action: HookAction::FileAppend(FileHook {
                                    path: "ordinals.txt".into(),
                                }),
                            },
                        );

                        HookSpecificationNetworkMap::Bitcoin(BitcoinHookSpecificationNetworkMap {
                            uuid: id.to_string(),
                            owner_uuid: None,
                            name: cmd.name,
                            version: 1,
                            networks,
                        })
                    }
                    _ => {
                        return Err("command `predicates new` should either be called with --stacks or --bitcoin".into());
                    }
                };

                let file_name = format!("{}.json", predicate.name().to_lowercase());
                let content = serde_json::to_string_pretty(&predicate)
                    .map_err(|e| format!("unable to serialize predicate: {}", e))?;
                let mut file_path = PathBuf::new();
                file_path.push(&file_name);
                blockhook_sdk::utils::write_file_content_at_path(&file_path, content.as_bytes())?;
                println!("Created file {}", file_name);
            }
            PredicatesCommand::Scan(cmd) => {
                let mut config =
                    Config::default(false, cmd.testnet, cmd.mainnet, &cmd.config_path)?;
                let predicate = load_predicate_from_path(&cmd.predicate_path)?;

                let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
                let dispatcher = Dispatcher::start(
                    config
                        .limits
                        .max_number_of_processing_threads
                        .min(config.limits.max_number_of_networking_threads),
                    outcome_tx,
                    &ctx,
                );
                let moved_ctx = ctx.clone();
                let _ = hiro_system_kit::thread_named("Dispatch outcomes").spawn(move || {
                    while let Ok(outcome) = outcome_rx.recv() {
                        if let Err(e) = outcome.result {
                            error!(
                                moved_ctx.expect_logger(),
                                "dispatch failure for {} predicate {}: {}",
                                outcome.chain,
                                outcome.uuid,
                                e
                            );
                        }
                    }
                });

                match predicate {
                    HookSpecificationNetworkMap::Stacks(predicate) => {
                        let predicate_spec = match predicate.into_selected_network_specification(
                            &config.network.stacks_network,
                            Some(true),
                        ) {
                            Ok(predicate) => predicate,
                            Err(e) => {
                                return Err(format!(
                                    "Specification missing for network {:?}: {e}",
                                    config.network.stacks_network
                                ));
                            }
                        };

                        // Seed the block index if an archive is reachable.
                        if config.rely_on_remote_stacks_tsv() {
                            consolidate_local_stacks_chainstate_using_csv(&mut config, &ctx)
                                .await?;
                        }
                        let stacks_db_conn =
                            open_readonly_stacks_db_conn(&config.expected_cache_path(), &ctx)?;
                        let _ = scan_stacks_chainstate_via_rocksdb_using_predicate(
                            &predicate_spec,
                            None,
                            &stacks_db_conn,
                            &dispatcher,
                            &config,
                            None,
                            &ctx,
                        )
                        .await?;
                    }
                    HookSpecificationNetworkMap::Bitcoin(predicate) => {
                        let predicate_spec = match predicate.into_selected_network_specification(
                            &config.network.bitcoin_network,
                            Some(true),
                        ) {
                            Ok(predicate) => predicate,
                            Err(e) => {
                                return Err(format!(
                                    "Specification missing for network {:?}: {e}",
                                    config.network.bitcoin_network
                                ));
                            }
                        };

                        let _ = scan_bitcoin_chainstate_via_rpc_using_predicate(
                            &predicate_spec,
                            None,
                            &dispatcher,
                            &config,
                            None,
                            &ctx,
                        )
                        .await?;
                    }
                }
                dispatcher.terminate();
            }
            PredicatesCommand::Check(cmd) => {
                let config = Config::default(false, cmd.testnet, cmd.mainnet, &cmd.config_path)?;
                let predicate: HookSpecificationNetworkMap =
                    load_predicate_from_path(&cmd.predicate_path)?;

                match predicate {
                    HookSpecificationNetworkMap::Stacks(predicate) => {
                        let _ = predicate.into_selected_network_specification(
                            &config.network.stacks_network,
                            None,
                        )?;
                    }
                    HookSpecificationNetworkMap::Bitcoin(predicate) => {
                        let _ = predicate.into_selected_network_specification(
                            &config.network.bitcoin_network,
                            None,
                        )?;
                    }
                }
                println!("✔️ Predicate {} successfully checked", cmd.predicate_path);
            }
        },
        Command::Docs(subcmd) => match subcmd {
            DocsCommand::Api(api_docs_cmd) => match api_docs_cmd {
                ApiDocsCommand::Generate => {
                    use std::fs::File;
                    use std::io::Write;
                    let spec = document_predicate_api_server()
                        .map_err(|e| format!("unable to generate API docs: {}", e))?;
                    let mut file_path = PathBuf::new();
                    file_path.push("openapi.json");
                    let mut file = File::create(&file_path).map_err(|e| {
                        format!("unable to open file {}\n{}", file_path.display(), e)
                    })?;
                    file.write_all(spec.as_bytes()).map_err(|e| {
                        format!("unable to write file {}\n{}", file_path.display(), e)
                    })?;
                    println!("Created file openapi.json");
                }
            },
        },
    }
    Ok(())
}

pub fn load_predicate_from_path(
    predicate_path: &str,
) -> Result<HookSpecificationNetworkMap, String> {
    let file = File::open(predicate_path)
        .map_err(|e| format!("unable to read file {}\n{:?}", predicate_path, e))?;
    let mut file_reader = BufReader::new(file);
    let mut file_buffer = vec![];
    file_reader
        .read_to_end(&mut file_buffer)
        .map_err(|e| format!("unable to read file {}\n{:?}", predicate_path, e))?;
    let predicate: HookSpecificationNetworkMap = serde_json::from_slice(&file_buffer)
        .map_err(|e| format!("unable to parse json file {}\n{:?}", predicate_path, e))?;
    Ok(predicate)
}
