use super::file::NetworkConfigMode;

pub fn generate_config(mode: &NetworkConfigMode) -> String {
    let network = mode.as_str();
    let conf = format!(
        r#"[storage]
working_dir = "blockhook"

# The http API allows you to register / deregister
# predicates dynamically.
# This is disabled by default.
#
# [http_api]
# http_port = 20456
# database_uri = "redis://localhost:6379/"

[network]
mode = "{network}"
bitcoind_rpc_url = "http://localhost:8332"
bitcoind_rpc_username = "devnet"
bitcoind_rpc_password = "devnet"
# Bitcoin block events can be received by watching a
# block file appended by bitcoind, or by observing
# the Stacks node, which is the default choice.
# To use ZeroMQ instead:
# bitcoind_zmq_url = "tcp://0.0.0.0:18543"
stacks_node_rpc_url = "http://localhost:20443"
stacks_events_ingestion_port = 20455

[limits]
max_number_of_bitcoin_predicates = 100
max_number_of_concurrent_bitcoin_scans = 100
max_number_of_stacks_predicates = 10
max_number_of_concurrent_stacks_scans = 10
max_number_of_processing_threads = 16
max_number_of_networking_threads = 16
max_caching_memory_size_mb = 32000

# Disable the events archive seeding by removing
# the following section.
[[event_source]]
tsv_file_url = "https://archive.hiro.so/{network}/stacks-blockchain-api/{network}-stacks-blockchain-api-latest.gz"

# The prometheus endpoint is disabled by default.
#
# [monitoring]
# prometheus_monitoring_port = 20457
"#,
        network = network,
    );
    conf
}
