//! The querier and its query-frontend.
//!
//! Trace lookups fan out to the ingesters still holding recent data (via the
//! ring) and to every backend block whose id range may cover the trace, then
//! merge and deduplicate the span sets. Search is sharded by block-id range
//! (block ids are time-prefixed, so id ranges partition time too), evaluated
//! against the per-trace attributes stored in blocks and the attribute cache
//! on ingesters, merged, and cached in a small LRU keyed by the normalised
//! query.
//!
//! Partial failures do not fail a query: unreachable ingesters and
//! unreadable blocks are counted in the response metrics and the rest of the
//! result is returned.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

mod blocklist;
mod cache;
mod client;
mod querier;

pub use client::{ClientError, IngesterQueryClient, QueryClientPool};
pub use querier::{
    Querier, QueryMetrics, QueryMode, SearchMetrics, SearchResponse, TraceLookupRequest,
    TraceQueryResult,
};

use std::time::Duration;

use data_types::{ClassifiedError, FailureDomain};
use thiserror::Error;

/// Querier tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct QuerierConfig {
    /// How long a polled tenant block list may be served before a refresh.
    pub blocklist_poll_period: Duration,

    /// Prefetch depth for block scans during search.
    pub prefetch_buffer: usize,

    /// How many block-id sub-ranges a search fans out over.
    pub search_shards: usize,

    /// Capacity of the search response cache.
    pub response_cache_entries: usize,
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            blocklist_poll_period: Duration::from_secs(300),
            prefetch_buffer: 1000,
            search_shards: 4,
            response_cache_entries: 128,
        }
    }
}

/// Errors for the querier crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The ring could not provide a readable replication set.
    #[error(transparent)]
    Ring(#[from] ring::Error),

    /// Listing or reading blocks failed outright (per-block read failures
    /// are reported in metrics instead).
    #[error(transparent)]
    Block(#[from] block_store::Error),
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::Ring(e) => e.domain(),
            Self::Block(e) => e.domain(),
        }
    }
}

/// A specialised `Result` for querier errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;
