use crate::service::ScanningData;
use blockhook_sdk::utils::{BlockHeights, BlockHeightsError};
use std::collections::VecDeque;

#[derive(Debug, PartialEq)]
pub enum PredicateScanResult {
    ChainTipReached,
    Expired,
    Deregistered,
}

pub fn get_block_heights_to_scan(
    blocks: &Option<Vec<u64>>,
    start_block: &Option<u64>,
    end_block: &Option<u64>,
    chain_tip: &u64,
    unfinished_scan_data: &Option<ScanningData>,
) -> Result<Option<VecDeque<u64>>, String> {
    let block_heights_to_scan = if let Some(ref blocks) = blocks {
        match BlockHeights::Blocks(blocks.clone()).get_sorted_entries() {
            Ok(heights) => Some(heights),
            Err(e) => match e {
                BlockHeightsError::ExceedsMaxEntries(max, specified) => {
                    return Err(format!("Predicate specification exceeds max number of blocks to scan. Maximum: {}, Attempted: {}", max, specified));
                }
                BlockHeightsError::StartLargerThanEnd => {
                    // This code path should not be reachable.
                    return Err(
                        "Predicate specification field `end_block` should be greater than `start_block`."
                            .into(),
                    );
                }
            },
        }
    } else {
        // A checkpointed scan resumes from the block after the last one
        // evaluated.
        let start_block = match &unfinished_scan_data {
            Some(scan_data) => scan_data.last_evaluated_block_height.saturating_add(1),
            None => start_block.unwrap_or(0),
        };

        let end_block = if let Some(end_block) = end_block {
            if &start_block > end_block {
                return Ok(None);
            }
            end_block
        } else {
            chain_tip
        };
        if &start_block > end_block {
            return Ok(None);
        }
        match BlockHeights::BlockRange(start_block, *end_block).get_sorted_entries() {
            Ok(heights) => Some(heights),
            Err(e) => match e {
                BlockHeightsError::ExceedsMaxEntries(max, specified) => {
                    return Err(format!("Predicate specification exceeds max number of blocks to scan. Maximum: {}, Attempted: {}", max, specified));
                }
                BlockHeightsError::StartLargerThanEnd => {
                    return Err(
                        "Predicate specification field `end_block` should be greater than `start_block`."
                            .into(),
                    );
                }
            },
        }
    };
    Ok(block_heights_to_scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_block_past_tip_yields_no_scan() {
        let heights = get_block_heights_to_scan(&None, &Some(200), &None, &100, &None).unwrap();
        assert!(heights.is_none());
    }

    #[test]
    fn end_block_equal_to_start_block_yields_exactly_one_block() {
        let heights = get_block_heights_to_scan(&None, &Some(100), &Some(100), &150, &None)
            .unwrap()
            .unwrap();
        assert_eq!(heights.len(), 1);
        assert_eq!(heights.front(), Some(&100));
    }

    #[test]
    fn unfinished_scan_resumes_after_checkpoint() {
        let scan_data = ScanningData {
            number_of_blocks_to_scan: 100,
            number_of_blocks_evaluated: 50,
            number_of_times_triggered: 1,
            last_occurrence: 0,
            last_evaluated_block_height: 149,
        };
        let heights = get_block_heights_to_scan(&None, &Some(100), &Some(200), &500, &Some(scan_data))
            .unwrap()
            .unwrap();
        assert_eq!(heights.front(), Some(&150));
        assert_eq!(heights.back(), Some(&200));
    }

    #[test]
    fn explicit_blocks_override_the_range() {
        let heights = get_block_heights_to_scan(
            &Some(vec![12, 8, 8, 42]),
            &Some(0),
            &Some(100),
            &100,
            &None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(heights, VecDeque::from(vec![8, 12, 42]));
    }
}
