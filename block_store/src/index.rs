//! The page index: a sorted array of fixed-width entries.
//!
//! Each entry is `[16 byte first trace id][u64 LE data offset][u32 LE page
//! length]`. Entries are sorted by first trace id, and because records
//! within pages are sorted too, a binary search over the entries locates the
//! single candidate page for any lookup key.

use byteorder::{ByteOrder, LittleEndian};
use data_types::{BlockId, TraceId, TRACE_ID_LEN};

use crate::{Error, Result};

pub(crate) const INDEX_ENTRY_LEN: usize = TRACE_ID_LEN + 8 + 4;

/// One page's entry in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// First trace id stored in the page.
    pub first_trace_id: TraceId,

    /// Byte offset of the page within the data object.
    pub offset: u64,

    /// Length of the page in bytes.
    pub length: u32,
}

/// The decoded index of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    pub(crate) entries: Vec<IndexEntry>,
}

impl BlockIndex {
    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.entries.len()
    }

    /// All entries in order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// The entry of the one page that may contain `trace_id`, if any.
    pub fn locate(&self, trace_id: TraceId) -> Option<IndexEntry> {
        // First page whose first id is > the key; the candidate page is its
        // predecessor.
        let after = self
            .entries
            .partition_point(|e| e.first_trace_id <= trace_id);
        after.checked_sub(1).map(|i| self.entries[i])
    }
}

pub(crate) fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * INDEX_ENTRY_LEN);
    for e in entries {
        out.extend_from_slice(e.first_trace_id.as_bytes());
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, e.offset);
        out.extend_from_slice(&buf);
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, e.length);
        out.extend_from_slice(&buf);
    }
    out
}

pub(crate) fn decode_index(raw: &[u8], block_id: BlockId) -> Result<BlockIndex> {
    if raw.len() % INDEX_ENTRY_LEN != 0 {
        return Err(Error::CorruptBlock {
            block_id,
            reason: format!("index length {} not a multiple of entry size", raw.len()),
        });
    }

    let mut entries = Vec::with_capacity(raw.len() / INDEX_ENTRY_LEN);
    let mut previous: Option<TraceId> = None;
    for chunk in raw.chunks_exact(INDEX_ENTRY_LEN) {
        let mut id = [0u8; TRACE_ID_LEN];
        id.copy_from_slice(&chunk[..TRACE_ID_LEN]);
        let first_trace_id = TraceId::from_bytes(id);

        if let Some(prev) = previous {
            if first_trace_id < prev {
                return Err(Error::CorruptBlock {
                    block_id,
                    reason: format!("index not sorted: {first_trace_id} after {prev}"),
                });
            }
        }
        previous = Some(first_trace_id);

        entries.push(IndexEntry {
            first_trace_id,
            offset: LittleEndian::read_u64(&chunk[TRACE_ID_LEN..TRACE_ID_LEN + 8]),
            length: LittleEndian::read_u32(&chunk[TRACE_ID_LEN + 8..]),
        });
    }
    Ok(BlockIndex { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracedb_time::Time;

    fn id(b: u8) -> TraceId {
        TraceId::from_bytes([b; 16])
    }

    fn index(firsts: &[u8]) -> BlockIndex {
        BlockIndex {
            entries: firsts
                .iter()
                .enumerate()
                .map(|(i, b)| IndexEntry {
                    first_trace_id: id(*b),
                    offset: i as u64 * 100,
                    length: 100,
                })
                .collect(),
        }
    }

    #[test]
    fn locate_picks_the_covering_page() {
        let idx = index(&[10, 20, 30]);

        // Before the first page: no candidate.
        assert_eq!(idx.locate(id(5)), None);

        // Exact firsts and interior keys.
        assert_eq!(idx.locate(id(10)).unwrap().offset, 0);
        assert_eq!(idx.locate(id(15)).unwrap().offset, 0);
        assert_eq!(idx.locate(id(20)).unwrap().offset, 100);
        assert_eq!(idx.locate(id(99)).unwrap().offset, 200);
    }

    #[test]
    fn codec_round_trip_and_monotonicity_check() {
        let idx = index(&[1, 2, 3]);
        let raw = encode_index(&idx.entries);
        let block_id = BlockId::new_at(Time::from_timestamp_millis(0));
        assert_eq!(decode_index(&raw, block_id).unwrap(), idx);

        let unsorted = encode_index(&index(&[3, 1]).entries);
        assert!(matches!(
            decode_index(&unsorted, block_id).unwrap_err(),
            Error::CorruptBlock { .. }
        ));
    }
}
