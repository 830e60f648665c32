//! Dispatch from the meta's layout tag to a concrete reader.
//!
//! Only one layout exists today, but every reader resolves through this seam
//! so introducing a second layout changes nothing outside this module.

use std::sync::Arc;

use data_types::{BlockMeta, BlockVersion};

use crate::{read::BackendBlock, DynObjectStore};

/// Build the reader matching `meta.version`.
pub fn block_reader(store: Arc<DynObjectStore>, meta: BlockMeta) -> BackendBlock {
    match meta.version {
        BlockVersion::V1 => BackendBlock::from_meta(store, meta),
    }
}
