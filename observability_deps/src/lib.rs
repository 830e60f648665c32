//! Holds a single pinned version of the tracing facade for the rest of the
//! workspace, so that every crate emits events through the same `tracing`
//! version and upgrades happen in one place.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]

pub use tracing;
