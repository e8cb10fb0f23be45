#[macro_use]
extern crate rocket;

extern crate serde;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate serde_json;

pub extern crate bitcoincore_rpc;
pub extern crate bitcoincore_rpc_json;
pub extern crate stacks_rpc_client;

pub use bitcoincore_rpc::bitcoin;
pub use blockhook_types as types;

pub mod dispatcher;
pub mod hooks;
pub mod indexer;
pub mod monitoring;
pub mod observer;
pub mod utils;
