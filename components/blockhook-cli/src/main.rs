#[macro_use]
extern crate hiro_system_kit;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate serde_json;

#[macro_use]
extern crate rocket;

pub mod archive;
pub mod cli;
pub mod config;
pub mod scan;
pub mod service;
pub mod storage;

fn main() {
    cli::main();
}
