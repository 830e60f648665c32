//! The tracedb ingester.
//!
//! ## Write path
//!
//! A pushed span is appended to the tenant's write-ahead log (and fsynced)
//! before it joins its trace in the in-memory head block; only then is the
//! push acknowledged, so an acknowledged span survives a crash of this
//! instance and is reconstructed by WAL replay on restart.
//!
//! ## Block lifecycle
//!
//! ```text
//! live head block ──freeze──▶ completing block ──upload──▶ backend block
//!        │                          │                           │
//!        │  WAL rotated here        │  WAL segments deleted     │
//!        ▼                          ▼  after meta upload        ▼
//!   readable                    readable                 readable (querier)
//! ```
//!
//! Every freeze empties the head entirely and rotates the WAL, so the
//! segments closed since the previous freeze cover exactly the frozen
//! traces. That alignment is what makes WAL truncation safe: a completing
//! block deletes precisely its own segments, and only after its meta record
//! is durable in the backend.
//!
//! ## Reordering
//!
//! Within one trace on one instance, span order is arrival order. Across
//! replicas no order is defined; readers treat the span set as unordered and
//! deduplicate by span bytes.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

mod codec;
mod flusher;
mod head;
mod ingester;
mod replay;
mod tenant;

pub use crate::ingester::Ingester;

use std::{path::PathBuf, time::Duration};

use data_types::{ClassifiedError, FailureDomain};
use thiserror::Error;

/// Ingester tuning knobs.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Directory holding the WAL and the persisted ring tokens.
    pub wal_dir: PathBuf,

    /// A head block whose newest write is older than this is cut even if
    /// small; the traces in it have gone quiet.
    pub trace_idle_period: Duration,

    /// A head block at or beyond this many payload bytes is cut.
    pub max_block_bytes: usize,

    /// A head block older than this is cut.
    pub max_block_duration: Duration,

    /// How long a cut block may sit before its upload starts.
    pub complete_block_timeout: Duration,

    /// Cadence of the flusher's trigger evaluation.
    pub flush_check_period: Duration,

    /// Concurrent pushes accepted before shedding load.
    pub max_queue_depth: usize,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            trace_idle_period: Duration::from_secs(10),
            max_block_bytes: 500 * 1024 * 1024,
            max_block_duration: Duration::from_secs(30 * 60),
            complete_block_timeout: Duration::from_secs(15 * 60),
            flush_check_period: Duration::from_secs(10),
            max_queue_depth: 1024,
        }
    }
}

/// Errors for the ingester crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Appending to the WAL failed; durability cannot be guaranteed.
    #[error("wal append failed: {source}")]
    Wal {
        /// Underlying error.
        #[from]
        source: wal::Error,
    },

    /// Too many pushes in flight.
    #[error("ingester at capacity: {inflight} pushes in flight")]
    OverCapacity {
        /// Current depth.
        inflight: usize,
    },

    /// The instance is not (or no longer) accepting writes.
    #[error("ingester is not active")]
    NotActive,

    /// Building or uploading a block failed.
    #[error("block upload failed: {source}")]
    Block {
        /// Underlying error.
        #[from]
        source: block_store::Error,
    },

    /// Updating the ring failed.
    #[error("ring update failed: {source}")]
    Ring {
        /// Underlying error.
        #[from]
        source: ring::Error,
    },

    /// A replayed WAL record could not be decoded.
    #[error("wal replay failed: {source}")]
    Replay {
        /// Underlying error.
        source: wal::Error,
    },
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::Wal { source } | Self::Replay { source } => source.domain(),
            Self::OverCapacity { .. } => FailureDomain::Capacity,
            Self::NotActive => FailureDomain::Transient,
            Self::Block { source } => source.domain(),
            Self::Ring { source } => source.domain(),
        }
    }
}

/// A specialised `Result` for ingester errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
