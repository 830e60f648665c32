//! Block identifiers and block metadata.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracedb_time::Time;
use uuid::Uuid;

use crate::{DataEncoding, TenantId};

/// Identifier of a backend block.
///
/// Shaped like a v4 UUID, but the high 48 bits carry the block's creation
/// time in milliseconds. Because ids compare lexicographically by their
/// bytes, a range of block ids is also a range of creation times, which is
/// what lets search shard the block space by id and prune by time at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(Uuid);

impl BlockId {
    /// The smallest block id; start of the full range.
    pub const ZERO: Self = Self(Uuid::from_u128(0));

    /// The largest block id; end of the full range.
    pub const MAX: Self = Self(Uuid::from_u128(u128::MAX));

    /// Mint a fresh id for a block created at `at`.
    ///
    /// The low 80 bits are random, with the usual version / variant bits set
    /// so the id still parses as a v4-shaped UUID.
    pub fn new_at(at: Time) -> Self {
        let mut bytes = *Uuid::new_v4().as_bytes();

        let millis = at.timestamp_millis().max(0) as u64;
        let ts = millis.to_be_bytes();
        bytes[..6].copy_from_slice(&ts[2..8]);

        // Restore version 4 + RFC 4122 variant over the random remainder.
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        Self(Uuid::from_bytes(bytes))
    }

    /// The creation time encoded in the id's high 48 bits.
    pub fn creation_time(&self) -> Time {
        let b = self.0.as_bytes();
        let mut ts = [0u8; 8];
        ts[2..8].copy_from_slice(&b[..6]);
        Time::from_timestamp_millis(u64::from_be_bytes(ts) as i64)
    }

    /// Interpret as a big-endian 128 bit integer, for range arithmetic.
    pub const fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// Construct from a big-endian 128 bit integer.
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    /// The underlying UUID.
    pub const fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for BlockId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl serde::Serialize for BlockId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for BlockId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(Uuid::deserialize(deserializer)?))
    }
}

/// On-disk layout revision of a block.
///
/// Readers resolve this tag from the meta record to a per-version reader
/// implementation before touching any other object of the block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
pub enum BlockVersion {
    /// The only layout currently written.
    #[default]
    #[serde(rename = "v1")]
    V1,
}

/// The meta record of a block: the one object whose presence makes the block
/// visible to readers, always written last.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockMeta {
    /// Layout revision.
    pub version: BlockVersion,

    /// Block identifier; encodes the creation time in its high bits.
    pub block_id: BlockId,

    /// Owning tenant.
    pub tenant: TenantId,

    /// Earliest span start covered by the block.
    pub start: Time,

    /// Latest span end covered by the block.
    pub end: Time,

    /// Number of trace records stored.
    pub total_objects: u64,

    /// Size of the data section in bytes.
    pub size_bytes: u64,

    /// How many merge generations this block has been through.
    pub compaction_level: u32,

    /// Encoding tag of the span payloads inside.
    pub encoding: DataEncoding,

    /// CRC32 of the data section.
    pub data_checksum: u32,

    /// Number of bloom filter shards written for this block.
    pub bloom_shard_count: u32,
}

/// Marker written next to a block's meta when compaction has superseded it.
///
/// The block stays readable until the grace period ends so in-flight queries
/// against the old block list can finish.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompactedBlockMeta {
    /// The superseded block.
    pub block_id: BlockId,

    /// When the compaction that replaced it completed.
    pub compacted_at: Time,
}
