//! Write-ahead log for tracedb ingesters.
//!
//! The log is a directory tree of per-tenant, append-only segment files:
//!
//! ```text
//! <root>/
//!   tokens.json              ring tokens, persisted for rejoin
//!   <tenant>/
//!     0000000000.wal
//!     0000000001.wal         <- open segment
//! ```
//!
//! Every record is fsynced before [`TenantWal::append`] returns, so a write
//! acknowledged by an ingester survives a crash of that ingester and is
//! reconstructed by replaying the segments on startup.
//!
//! Segments are rotated when the ingester freezes a head block, so the set of
//! segments covering a block is deletable as a unit once the block has been
//! durably uploaded to the backend.

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
mod segment;
mod tokens;

pub use segment::{ClosedSegment, SegmentId, SegmentReader, WalRecord};
pub use tokens::{load_tokens, store_tokens};

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use data_types::{ClassifiedError, FailureDomain, TenantId, TraceId};
use observability_deps::tracing::info;
use snafu::{ResultExt, Snafu};

use crate::segment::OpenSegmentFile;

/// Upper bound on a single record's compressed length; anything larger read
/// back from disk is treated as corruption rather than allocated.
pub(crate) const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Errors for the WAL crate.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unable to create wal directory {}: {source}", path.display()))]
    UnableToCreateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to read wal directory {}: {source}", path.display()))]
    UnableToReadDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to create segment file {}: {source}", path.display()))]
    UnableToCreateSegment {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to open segment file {}: {source}", path.display()))]
    UnableToOpenSegment {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to write to segment file {}: {source}", path.display()))]
    UnableToWriteSegment {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to fsync segment file {}: {source}", path.display()))]
    UnableToSyncSegment {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to read segment file {}: {source}", path.display()))]
    UnableToReadSegment {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to delete segment file {}: {source}", path.display()))]
    UnableToDeleteSegment {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("segment {id} does not exist"))]
    SegmentNotFound { id: SegmentId },

    #[snafu(display("unable to compress record: {source}"))]
    UnableToCompressRecord { source: snap::Error },

    #[snafu(display(
        "corrupt record in segment {segment} at offset {offset}: {reason}"
    ))]
    CorruptRecord {
        segment: SegmentId,
        offset: u64,
        reason: String,
    },

    #[snafu(display("unable to read ring tokens from {}: {source}", path.display()))]
    UnableToReadTokens {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("unable to persist ring tokens to {}: {source}", path.display()))]
    UnableToWriteTokens {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("malformed tokens file {}: {source}", path.display()))]
    MalformedTokens {
        source: serde_json::Error,
        path: PathBuf,
    },
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::CorruptRecord { .. } | Self::MalformedTokens { .. } => FailureDomain::Corruption,
            // A WAL that cannot write or sync cannot guarantee durability;
            // the owning ingester must self-report unhealthy.
            _ => FailureDomain::Fatal,
        }
    }
}

/// A specialised `Result` for WAL errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Summary of a single durable append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// The segment the record went into.
    pub segment_id: SegmentId,

    /// Size of the segment after the append.
    pub total_bytes: u64,

    /// Bytes this append added to the segment.
    pub bytes_written: u64,
}

/// The write-ahead log over all tenants of one ingester.
#[derive(Debug)]
pub struct Wal {
    root: PathBuf,
    tenants: parking_lot::Mutex<BTreeMap<TenantId, Arc<TenantWal>>>,
}

impl Wal {
    /// Open (or create) the WAL rooted at `root`, scanning any tenant
    /// directories and segment files left by a previous process.
    ///
    /// Pre-existing segments are all treated as closed: the process that had
    /// them open is gone, so effectively they are.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .context(UnableToCreateDirSnafu { path: root.clone() })?;

        let wal = Self {
            root: root.clone(),
            tenants: Default::default(),
        };

        let mut dir = tokio::fs::read_dir(&root)
            .await
            .context(UnableToReadDirSnafu { path: root.clone() })?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context(UnableToReadDirSnafu { path: root.clone() })?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(tenant) = TenantId::new(&name) else {
                continue;
            };

            let tenant_wal = TenantWal::open(entry.path(), tenant.clone()).await?;
            info!(
                tenant = %tenant,
                closed_segments = tenant_wal.closed_segments().len(),
                "recovered tenant wal"
            );
            wal.tenants.lock().insert(tenant, Arc::new(tenant_wal));
        }

        Ok(wal)
    }

    /// The directory this WAL lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tenants that currently have WAL state.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.tenants.lock().keys().cloned().collect()
    }

    /// The per-tenant WAL for `tenant`, creating its directory and an open
    /// segment if it does not exist yet.
    pub async fn for_tenant(&self, tenant: &TenantId) -> Result<Arc<TenantWal>> {
        if let Some(t) = self.tenants.lock().get(tenant) {
            return Ok(Arc::clone(t));
        }

        let dir = self.root.join(tenant.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .context(UnableToCreateDirSnafu { path: dir.clone() })?;
        let tenant_wal = Arc::new(TenantWal::open(dir, tenant.clone()).await?);

        let mut tenants = self.tenants.lock();
        // A concurrent caller may have won the race.
        Ok(Arc::clone(
            tenants
                .entry(tenant.clone())
                .or_insert_with(|| Arc::clone(&tenant_wal)),
        ))
    }
}

/// The WAL of a single tenant: one open segment accepting appends plus the
/// closed segments not yet released by a block upload.
#[derive(Debug)]
pub struct TenantWal {
    tenant: TenantId,
    dir: PathBuf,

    /// Appends and rotations are serialised per tenant.
    open: tokio::sync::Mutex<OpenSegmentFile>,

    closed: parking_lot::Mutex<Vec<ClosedSegment>>,
}

impl TenantWal {
    async fn open(dir: PathBuf, tenant: TenantId) -> Result<Self> {
        let mut closed = segment::scan_dir(&dir).await?;
        closed.sort_by_key(|s| s.id());

        let next_id = closed
            .last()
            .map(|s| s.id().next())
            .unwrap_or(SegmentId::new(0));
        let open = OpenSegmentFile::create(&dir, next_id).await?;

        Ok(Self {
            tenant,
            dir,
            open: tokio::sync::Mutex::new(open),
            closed: parking_lot::Mutex::new(closed),
        })
    }

    /// The tenant this WAL belongs to.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Append one record and fsync the segment before returning.
    pub async fn append(&self, trace_id: TraceId, payload: &[u8]) -> Result<WriteSummary> {
        let encoded = codec::encode_record(trace_id, payload)?;
        let mut open = self.open.lock().await;
        open.write_all_sync(&encoded).await
    }

    /// Close the open segment and start a new one. Returns the now-closed
    /// segment.
    pub async fn rotate(&self) -> Result<ClosedSegment> {
        let mut open = self.open.lock().await;
        let next = OpenSegmentFile::create(&self.dir, open.id().next()).await?;
        let closed = std::mem::replace(&mut *open, next).close();
        self.closed.lock().push(closed.clone());
        Ok(closed)
    }

    /// Closed segments in creation order.
    pub fn closed_segments(&self) -> Vec<ClosedSegment> {
        self.closed.lock().clone()
    }

    /// Open a sequential reader over one closed segment.
    pub async fn reader_for_segment(&self, id: SegmentId) -> Result<SegmentReader> {
        let segment = self
            .closed
            .lock()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(Error::SegmentNotFound { id })?;
        SegmentReader::open(segment).await
    }

    /// Delete a closed segment from disk. Called once the data it covers has
    /// been durably uploaded inside a completed block.
    pub async fn delete(&self, id: SegmentId) -> Result<()> {
        let segment = self
            .closed
            .lock()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(Error::SegmentNotFound { id })?;

        tokio::fs::remove_file(segment.path())
            .await
            .context(UnableToDeleteSegmentSnafu {
                path: segment.path().to_owned(),
            })?;
        self.closed.lock().retain(|s| s.id() != id);
        Ok(())
    }
}
