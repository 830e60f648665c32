//! The backend block format: how finalised trace data is laid out in object
//! storage, written, and read back.
//!
//! A block is four kinds of object under `<tenant>/<block id>/`:
//!
//! ```text
//! meta.json      the one object whose presence makes the block visible
//! data           sorted (trace id, object bytes) records grouped into pages
//! index          (first trace id, offset, length) per page, sorted
//! bloom-<n>      sharded bloom filter over the trace ids
//! ```
//!
//! Writers move through `OPEN → APPENDING → FLUSHING → COMPLETE` and only
//! the COMPLETE state is observable: `meta.json` is uploaded strictly after
//! everything else, and readers that find no meta treat the block as absent.
//! Orphaned partial uploads are reclaimed by the [`sweep`] task.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

mod backend;
mod bloom;
mod index;
mod iter;
mod page;
mod read;
mod sweep;
mod trace_object;
mod version;
mod write;

pub use backend::{
    block_object_paths, delete_block, list_blocks, list_tenants, mark_compacted,
    read_compacted_marker, read_meta, BlockObjectPaths, TenantBlockList,
};
pub use bloom::ShardedBloomBuilder;
pub use index::{BlockIndex, IndexEntry};
pub use iter::{BlockIterator, PrefetchIterator, TraceIterator};
pub use read::BackendBlock;
pub use sweep::sweep_orphans;
pub use trace_object::TraceObject;
pub use version::block_reader;
pub use write::{AppendTracker, BlockWrite};

use data_types::{BlockId, ClassifiedError, FailureDomain, TraceId};
use thiserror::Error;

/// Per-page compression applied to the record region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageCodec {
    /// Records stored as-is.
    None,
    /// Records compressed with snappy.
    #[default]
    Snappy,
}

impl PageCodec {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Snappy => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Snappy),
            _ => None,
        }
    }
}

/// Block format tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    /// Target uncompressed size of one data page.
    pub index_page_size_bytes: usize,

    /// Desired bloom filter false-positive rate, in `(0, 1)`.
    pub bloom_fp: f64,

    /// Size of one bloom shard's bit array in bytes.
    pub bloom_shard_size_bytes: usize,

    /// Compression applied to data pages.
    pub page_codec: PageCodec,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            index_page_size_bytes: 256 * 1024,
            bloom_fp: 0.01,
            bloom_shard_size_bytes: 100 * 1024,
            page_codec: PageCodec::default(),
        }
    }
}

impl BlockConfig {
    /// Reject unusable configurations.
    pub fn validate(&self) -> Result<()> {
        if !(self.bloom_fp > 0. && self.bloom_fp < 1.) {
            return Err(Error::InvalidConfig {
                reason: format!("bloom false-positive rate {} not in (0, 1)", self.bloom_fp),
            });
        }
        if self.index_page_size_bytes == 0 || self.bloom_shard_size_bytes == 0 {
            return Err(Error::InvalidConfig {
                reason: "page and bloom shard sizes must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Errors for the block store.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is internally inconsistent.
    #[error("invalid block config: {reason}")]
    InvalidConfig {
        /// Human-readable reason.
        reason: String,
    },

    /// The backing object store failed.
    #[error("object store error: {source}")]
    ObjectStore {
        /// Underlying error.
        #[from]
        source: object_store::Error,
    },

    /// Records must be appended in ascending trace-id order.
    #[error("append out of order in block {block_id}: {trace_id} after {previous}")]
    OutOfOrderAppend {
        /// Block being written.
        block_id: BlockId,
        /// The offending id.
        trace_id: TraceId,
        /// The id written before it.
        previous: TraceId,
    },

    /// An empty block cannot be completed.
    #[error("block {block_id} has no records to complete")]
    EmptyBlock {
        /// Block being written.
        block_id: BlockId,
    },

    /// Streaming the data section into the backend failed.
    #[error("data upload for block {block_id} failed: {source}")]
    DataUpload {
        /// Block being written.
        block_id: BlockId,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Stored bytes failed structural or checksum validation.
    #[error("corrupt block {block_id}: {reason}")]
    CorruptBlock {
        /// Block being read.
        block_id: BlockId,
        /// What failed.
        reason: String,
    },

    /// A meta object failed to serialise or parse.
    #[error("block meta codec error for {block_id}: {source}")]
    MetaCodec {
        /// Block concerned.
        block_id: BlockId,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// The iterator was already closed.
    #[error("iterator used after close")]
    IteratorClosed,
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::InvalidConfig { .. }
            | Self::OutOfOrderAppend { .. }
            | Self::EmptyBlock { .. }
            | Self::IteratorClosed => FailureDomain::Validation,
            Self::ObjectStore { .. } | Self::DataUpload { .. } => FailureDomain::Transient,
            Self::CorruptBlock { .. } | Self::MetaCodec { .. } => FailureDomain::Corruption,
        }
    }
}

/// A specialised `Result` for block store errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Convenient alias: all block store entry points take a dynamic object
/// store handle.
pub type DynObjectStore = dyn object_store::ObjectStore;
