use std::{
    collections::{BTreeSet, VecDeque},
    fs::{self, OpenOptions},
    io::{Read, Write},
    path::PathBuf,
};

use blockhook_types::{
    BitcoinBlockData, BlockHeader, BlockIdentifier, StacksBlockData, StacksMicroblockData,
    StacksTransactionData,
};
use hiro_system_kit::slog::{self, Logger};
use reqwest::RequestBuilder;
use serde_json::Value as JsonValue;

/// Logger plus tracing toggle, cloned into every long-lived component. A
/// `None` logger silences the component entirely, which the tests rely on.
#[derive(Clone)]
pub struct Context {
    pub logger: Option<Logger>,
    pub tracer: bool,
}

impl Context {
    pub fn empty() -> Context {
        Context {
            logger: None,
            tracer: false,
        }
    }

    pub fn try_log<F: FnOnce(&Logger)>(&self, closure: F) {
        match self.logger {
            Some(ref logger) => closure(logger),
            None => {}
        }
    }

    pub fn expect_logger(&self) -> &Logger {
        self.logger.as_ref().expect("logger not instantiated")
    }
}

/// Parent-link view of a block: the only thing the fork trackers need to
/// know about any of the block shapes.
pub trait AbstractBlock {
    fn get_identifier(&self) -> &BlockIdentifier;
    fn get_parent_identifier(&self) -> &BlockIdentifier;
    fn get_header(&self) -> BlockHeader {
        BlockHeader {
            block_identifier: self.get_identifier().clone(),
            parent_block_identifier: self.get_parent_identifier().clone(),
        }
    }
}

// Every tracked shape names its links the same way, so one macro covers
// headers, anchored blocks and microblocks alike.
macro_rules! impl_abstract_block {
    ($($block_type:ty),+ $(,)?) => {
        $(impl AbstractBlock for $block_type {
            fn get_identifier(&self) -> &BlockIdentifier {
                &self.block_identifier
            }

            fn get_parent_identifier(&self) -> &BlockIdentifier {
                &self.parent_block_identifier
            }
        })+
    };
}

impl_abstract_block!(
    BlockHeader,
    BitcoinBlockData,
    StacksBlockData,
    StacksMicroblockData,
);

/// Evaluator-facing view of anything carrying Stacks transactions. The
/// predicate evaluator walks anchored blocks and microblocks through this
/// single lens.
pub trait AbstractStacksBlock: AbstractBlock {
    fn get_transactions(&self) -> &Vec<StacksTransactionData>;
    fn get_timestamp(&self) -> i64;
    fn get_serialized_metadata(&self) -> JsonValue;
}

macro_rules! impl_abstract_stacks_block {
    ($($block_type:ty),+ $(,)?) => {
        $(impl AbstractStacksBlock for $block_type {
            fn get_transactions(&self) -> &Vec<StacksTransactionData> {
                &self.transactions
            }

            fn get_timestamp(&self) -> i64 {
                self.timestamp
            }

            fn get_serialized_metadata(&self) -> JsonValue {
                json!(self.metadata)
            }
        })+
    };
}

impl_abstract_stacks_block!(StacksBlockData, StacksMicroblockData);

/// Sends the request, retrying 5xx and transport errors with a doubling
/// backoff. 4xx responses are the receiver's problem and are not retried.
pub async fn send_request(
    request_builder: RequestBuilder,
    attempts_max: u16,
    attempts_interval_sec: u16,
    ctx: &Context,
) -> Result<(), String> {
    let mut retry = 0;
    let mut backoff_sec = attempts_interval_sec as u64;
    loop {
        let request_builder = match request_builder.try_clone() {
            Some(rb) => rb,
            None => {
                ctx.try_log(|logger| slog::warn!(logger, "unable to clone request builder"));
                return Err("internal server error: unable to clone request builder".to_string());
            }
        };
        let err_msg = match request_builder.send().await {
            Ok(res) => {
                let status = res.status();
                if status.is_success() {
                    ctx.try_log(|logger| slog::info!(logger, "Trigger {} successful", res.url()));
                    return Ok(());
                } else if status.is_client_error() {
                    let msg = format!("Trigger {} rejected with status {}", res.url(), status);
                    ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
                    return Ok(());
                } else {
                    retry += 1;
                    let err_msg = format!("Trigger {} failed with status {}", res.url(), status);
                    ctx.try_log(|logger| slog::warn!(logger, "{}", err_msg));
                    err_msg
                }
            }
            Err(e) => {
                retry += 1;
                let err_msg = format!("unable to send request {}", e);
                ctx.try_log(|logger| slog::warn!(logger, "{}", err_msg));
                err_msg
            }
        };
        if retry >= attempts_max {
            let msg = format!(
                "unable to send request after {} retries. most recent error: {}",
                attempts_max, err_msg
            );
            ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
            return Err(msg);
        }
        tokio::time::sleep(std::time::Duration::from_secs(backoff_sec)).await;
        backoff_sec = (backoff_sec * 2).min(60);
    }
}

pub fn file_append(path: String, bytes: Vec<u8>, ctx: &Context) -> Result<(), String> {
    let mut file_path = match std::env::current_dir() {
        Err(e) => {
            let msg = format!("unable to retrieve current_dir {}", e);
            ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
            return Err(msg);
        }
        Ok(p) => p,
    };
    file_path.push(path);
    if !file_path.exists() {
        if let Err(e) = std::fs::File::create(&file_path) {
            let msg = format!("unable to create file {}: {}", file_path.display(), e);
            ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
            return Err(msg);
        }
    }

    let mut file = match OpenOptions::new().append(true).open(&file_path) {
        Err(e) => {
            let msg = format!("unable to open file {}", e);
            ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
            return Err(msg);
        }
        Ok(p) => p,
    };

    let utf8 = match String::from_utf8(bytes) {
        Ok(string) => string,
        Err(e) => {
            let msg = format!("unable to serialize bytes as utf8 string {}", e);
            ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
            return Err(msg);
        }
    };

    if let Err(e) = writeln!(file, "{}", utf8) {
        let msg = format!("unable to write file {}", e);
        ctx.try_log(|logger| slog::warn!(logger, "{}", msg));
        return Err(msg);
    }

    file.flush()
        .map_err(|e| format!("unable to flush file {}", e))?;

    Ok(())
}

pub const MAX_BLOCK_HEIGHTS_ENTRIES: u64 = 1_000_000;

pub enum BlockHeights {
    BlockRange(u64, u64),
    Blocks(Vec<u64>),
}

#[derive(Debug, PartialEq)]
pub enum BlockHeightsError {
    ExceedsMaxEntries(u64, u64),
    StartLargerThanEnd,
}

impl BlockHeights {
    pub fn get_sorted_entries(&self) -> Result<VecDeque<u64>, BlockHeightsError> {
        let mut entries = VecDeque::new();
        match &self {
            BlockHeights::BlockRange(start, end) => {
                if start > end {
                    return Err(BlockHeightsError::StartLargerThanEnd);
                }
                if end - start > MAX_BLOCK_HEIGHTS_ENTRIES {
                    return Err(BlockHeightsError::ExceedsMaxEntries(
                        MAX_BLOCK_HEIGHTS_ENTRIES,
                        end - start,
                    ));
                }
                for i in *start..=*end {
                    entries.push_back(i);
                }
            }
            BlockHeights::Blocks(heights) => {
                if heights.len() as u64 > MAX_BLOCK_HEIGHTS_ENTRIES {
                    return Err(BlockHeightsError::ExceedsMaxEntries(
                        MAX_BLOCK_HEIGHTS_ENTRIES,
                        heights.len() as u64,
                    ));
                }
                let unique_sorted_entries: BTreeSet<u64> = heights.iter().copied().collect();
                for entry in unique_sorted_entries.into_iter() {
                    entries.push_back(entry)
                }
            }
        }
        Ok(entries)
    }
}

pub fn read_file_content_at_path(file_path: &PathBuf) -> Result<Vec<u8>, String> {
    use std::fs::File;
    use std::io::BufReader;

    let file = File::open(file_path.clone())
        .map_err(|e| format!("unable to read file {}\n{:?}", file_path.display(), e))?;
    let mut file_reader = BufReader::new(file);
    let mut file_buffer = vec![];
    file_reader
        .read_to_end(&mut file_buffer)
        .map_err(|e| format!("unable to read file {}\n{:?}", file_path.display(), e))?;
    Ok(file_buffer)
}

pub fn write_file_content_at_path(file_path: &PathBuf, content: &[u8]) -> Result<(), String> {
    use std::fs::File;
    let mut parent_directory = file_path.clone();
    parent_directory.pop();
    fs::create_dir_all(&parent_directory).map_err(|e| {
        format!(
            "unable to create parent directory {}\n{}",
            parent_directory.display(),
            e
        )
    })?;
    let mut file = File::create(file_path)
        .map_err(|e| format!("unable to open file {}\n{}", file_path.display(), e))?;
    file.write_all(content)
        .map_err(|e| format!("unable to write file {}\n{}", file_path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_heights_range_entries_are_inclusive() {
        let range = BlockHeights::BlockRange(0, 10);
        let mut entries = range.get_sorted_entries().unwrap();

        let mut cursor = 0;
        while let Some(entry) = entries.pop_front() {
            assert_eq!(entry, cursor);
            cursor += 1;
        }
        assert_eq!(11, cursor);
    }

    #[test]
    fn block_heights_blocks_entries_are_deduplicated_and_sorted() {
        let range = BlockHeights::Blocks(vec![0, 3, 5, 6, 6, 10, 9]);
        let expected = [0, 3, 5, 6, 9, 10];
        let entries = range.get_sorted_entries().unwrap();

        for (entry, expectation) in entries.iter().zip(expected) {
            assert_eq!(*entry, expectation);
        }
    }

    #[test]
    fn block_heights_inverted_range_is_rejected() {
        let range = BlockHeights::BlockRange(10, 0);
        assert_eq!(
            range.get_sorted_entries().unwrap_err(),
            BlockHeightsError::StartLargerThanEnd
        );
    }
}
