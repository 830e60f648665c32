//! Selection of compaction jobs.
//!
//! Candidates are bucketed by compaction window (on the block's start time)
//! and level, so merges combine blocks covering the same slice of time that
//! have been through the same number of generations. Within a bucket, blocks
//! are taken in id order until the combined size cap is hit; a job needs at
//! least two inputs to be worth running.

use data_types::BlockMeta;

use crate::CompactorConfig;

/// One planned merge.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionJob {
    /// Input block metas, in block-id order.
    pub inputs: Vec<BlockMeta>,
}

impl CompactionJob {
    /// Level of the output block.
    pub fn output_level(&self) -> u32 {
        self.inputs
            .iter()
            .map(|m| m.compaction_level)
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// Bucket `blocks` into jobs under `config`'s limits.
pub fn plan_jobs(mut blocks: Vec<BlockMeta>, config: &CompactorConfig) -> Vec<CompactionJob> {
    let window_secs = config.compaction_window.as_secs().max(1) as i64;

    blocks.retain(|m| m.compaction_level < config.max_compaction_level);
    blocks.sort_by_key(|m| {
        (
            m.start.timestamp_millis().div_euclid(window_secs * 1000),
            m.compaction_level,
            m.block_id,
        )
    });

    let mut jobs = Vec::new();
    let mut current: Vec<BlockMeta> = Vec::new();
    let mut current_bytes = 0u64;
    let mut current_key = None;

    for meta in blocks {
        let key = (
            meta.start.timestamp_millis().div_euclid(window_secs * 1000),
            meta.compaction_level,
        );
        let fits = current_bytes + meta.size_bytes <= config.max_compacted_block_bytes;
        if Some(key) != current_key || !fits {
            if current.len() >= 2 {
                jobs.push(CompactionJob {
                    inputs: std::mem::take(&mut current),
                });
            } else {
                current.clear();
            }
            current_bytes = 0;
            current_key = Some(key);
        }
        current_bytes += meta.size_bytes;
        current.push(meta);
    }
    if current.len() >= 2 {
        jobs.push(CompactionJob { inputs: current });
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{BlockId, BlockVersion, DataEncoding, TenantId};
    use std::time::Duration;
    use tracedb_time::Time;

    fn meta(start_secs: i64, level: u32, size: u64, seq: i64) -> BlockMeta {
        BlockMeta {
            version: BlockVersion::V1,
            block_id: BlockId::new_at(Time::from_timestamp_millis(seq * 1000)),
            tenant: TenantId::new("t").unwrap(),
            start: Time::from_timestamp_millis(start_secs * 1000),
            end: Time::from_timestamp_millis(start_secs * 1000 + 500),
            total_objects: 1,
            size_bytes: size,
            compaction_level: level,
            encoding: DataEncoding::default(),
            data_checksum: 0,
            bloom_shard_count: 1,
        }
    }

    fn config() -> CompactorConfig {
        CompactorConfig {
            compaction_window: Duration::from_secs(3600),
            max_compacted_block_bytes: 100,
            max_compaction_level: 4,
            ..Default::default()
        }
    }

    #[test]
    fn groups_same_window_and_level() {
        let jobs = plan_jobs(
            vec![
                meta(0, 0, 10, 1),
                meta(10, 0, 10, 2),
                // Different window.
                meta(4000, 0, 10, 3),
                meta(4010, 0, 10, 4),
                // Different level, same window as the first pair.
                meta(20, 1, 10, 5),
            ],
            &config(),
        );

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].inputs.len(), 2);
        assert_eq!(jobs[0].output_level(), 1);
        assert_eq!(jobs[1].inputs.len(), 2);
    }

    #[test]
    fn respects_size_cap() {
        let jobs = plan_jobs(
            vec![
                meta(0, 0, 60, 1),
                meta(1, 0, 60, 2),
                meta(2, 0, 30, 3),
                meta(3, 0, 30, 4),
            ],
            &config(),
        );

        // 60+60 busts the 100-byte cap, so the first job closes at one
        // block (dropped, needs >= 2) and the rest pack together.
        assert_eq!(jobs.len(), 1);
        let sum: u64 = jobs[0].inputs.iter().map(|m| m.size_bytes).sum();
        assert!(sum <= 100);
    }

    #[test]
    fn singletons_and_max_level_are_left_alone() {
        let jobs = plan_jobs(vec![meta(0, 0, 10, 1)], &config());
        assert!(jobs.is_empty());

        let jobs = plan_jobs(
            vec![meta(0, 4, 10, 1), meta(1, 4, 10, 2)],
            &config(),
        );
        assert!(jobs.is_empty(), "max-level blocks must not be recompacted");
    }
}
