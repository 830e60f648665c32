//! Sharded bloom filter over the trace ids of one block.
//!
//! The filter is split into fixed-size shards so readers can fetch and check
//! a single shard per lookup, capping memory no matter how large the block
//! grew. A trace id is assigned to exactly one shard by hash, then set /
//! probed within that shard's bit array via double hashing.
//!
//! Guarantee: zero false negatives for any id inserted. The false-positive
//! rate follows the configured target as long as the object-count estimate
//! given to the builder is not wildly below the real count.

use data_types::TraceId;

use crate::{BlockConfig, Error, Result};

const SHARD_HEADER_LEN: usize = 2;
const SHARD_VERSION: u8 = 1;

fn fnv1a(seed: u64, data: &[u8]) -> u64 {
    let mut hash = seed;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn hash_pair(id: TraceId) -> (u64, u64) {
    (
        fnv1a(0xcbf2_9ce4_8422_2325, id.as_bytes()),
        fnv1a(0x84222325_cbf29ce4, id.as_bytes()) | 1,
    )
}

/// Which shard of `shard_count` the id belongs to.
pub(crate) fn shard_for(id: TraceId, shard_count: u32) -> u32 {
    (hash_pair(id).0 % u64::from(shard_count)) as u32
}

/// Builder accumulating ids while a block is written.
#[derive(Debug)]
pub struct ShardedBloomBuilder {
    shards: Vec<Vec<u8>>,
    k: u32,
}

impl ShardedBloomBuilder {
    /// Size the filter for roughly `expected_objects` ids under `config`.
    pub fn new(config: &BlockConfig, expected_objects: u64) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let bits_per_entry = -config.bloom_fp.ln() / (ln2 * ln2);
        let total_bits = (expected_objects.max(1) as f64 * bits_per_entry).ceil();
        let shard_bits = (config.bloom_shard_size_bytes * 8) as f64;
        let shard_count = (total_bits / shard_bits).ceil().max(1.) as u32;
        let k = ((bits_per_entry * ln2).round().max(1.) as u32).min(255);

        Self {
            shards: vec![vec![0u8; config.bloom_shard_size_bytes]; shard_count as usize],
            k,
        }
    }

    /// Number of shards the filter was sized to.
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Record `id` in its shard.
    pub fn insert(&mut self, id: TraceId) {
        let (h1, h2) = hash_pair(id);
        let shard_count = self.shards.len() as u64;
        let shard = &mut self.shards[(h1 % shard_count) as usize];
        let bits = (shard.len() * 8) as u64;
        for i in 0..u64::from(self.k) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bits;
            shard[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Serialise every shard to its on-disk form, consuming the builder.
    pub fn into_shard_objects(self) -> Vec<Vec<u8>> {
        let k = self.k;
        self.shards
            .into_iter()
            .map(|bits| {
                let mut out = Vec::with_capacity(SHARD_HEADER_LEN + bits.len());
                out.push(SHARD_VERSION);
                out.push(k as u8);
                out.extend_from_slice(&bits);
                out
            })
            .collect()
    }
}

/// One deserialised bloom shard.
#[derive(Debug, Clone)]
pub(crate) struct BloomShard {
    k: u32,
    bits: bytes::Bytes,
}

impl BloomShard {
    pub(crate) fn decode(raw: bytes::Bytes, block_id: data_types::BlockId) -> Result<Self> {
        if raw.len() <= SHARD_HEADER_LEN {
            return Err(Error::CorruptBlock {
                block_id,
                reason: format!("bloom shard too short: {} bytes", raw.len()),
            });
        }
        if raw[0] != SHARD_VERSION {
            return Err(Error::CorruptBlock {
                block_id,
                reason: format!("unknown bloom shard version {}", raw[0]),
            });
        }
        let k = u32::from(raw[1]);
        Ok(Self {
            k,
            bits: raw.slice(SHARD_HEADER_LEN..),
        })
    }

    /// Whether `id` may be present. `false` is definitive.
    pub(crate) fn maybe_contains(&self, id: TraceId) -> bool {
        let (h1, h2) = hash_pair(id);
        let bits = (self.bits.len() * 8) as u64;
        (0..u64::from(self.k)).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bits;
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }
}
