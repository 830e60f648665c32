//! The compactor: merges small backend blocks into fewer, larger,
//! higher-level ones, collapsing duplicate traces on the way, and enforces
//! retention.
//!
//! Ownership across a fleet of compactors is arbitrated by a second ring
//! keyed by tenant id: a compactor only plans work for tenants whose hash it
//! owns, so at most one instance works a tenant at a time. A failed
//! compaction is harmless: inputs are only marked compacted after the output
//! block's meta record is durable, and a retried job mints a fresh output
//! block id, so a stale half-written output is never referenced.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

mod compact;
mod plan;
mod retention;

pub use compact::compact_job;
pub use plan::{plan_jobs, CompactionJob};

use std::{sync::Arc, time::Duration};

use block_store::DynObjectStore;
use data_types::{ClassifiedError, FailureDomain, TenantId};
use observability_deps::tracing::{info, warn};
use ring::{hash_tenant, Operation, Ring};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracedb_time::TimeProvider;

/// Compactor tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CompactorConfig {
    /// Blocks whose start times fall in the same window are candidates for
    /// merging together.
    pub compaction_window: Duration,

    /// Combined input size cap for one compaction job.
    pub max_compacted_block_bytes: u64,

    /// Blocks past this level are left alone.
    pub max_compaction_level: u32,

    /// Absolute retention: a block whose end is older is deleted outright.
    pub block_retention: Duration,

    /// Grace period during which a superseded block stays readable before
    /// hard deletion.
    pub compacted_block_retention: Duration,

    /// Cadence of the compaction loop.
    pub compaction_cycle: Duration,

    /// Prefetch depth for each input block iterator.
    pub prefetch_buffer: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            compaction_window: Duration::from_secs(3600),
            max_compacted_block_bytes: 50 * 1024 * 1024 * 1024,
            max_compaction_level: 8,
            block_retention: Duration::from_secs(14 * 24 * 3600),
            compacted_block_retention: Duration::from_secs(3600),
            compaction_cycle: Duration::from_secs(30),
            prefetch_buffer: 1000,
        }
    }
}

/// Errors for the compactor crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading or writing blocks failed.
    #[error(transparent)]
    Block(#[from] block_store::Error),

    /// Consulting the compactor ring failed.
    #[error(transparent)]
    Ring(#[from] ring::Error),

    /// A job's inputs disagree on payload encoding.
    #[error("compaction inputs disagree on encoding: {a} vs {b}")]
    MixedEncodings {
        /// One input's tag.
        a: String,
        /// The conflicting tag.
        b: String,
    },
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::Block(e) => e.domain(),
            Self::Ring(e) => e.domain(),
            Self::MixedEncodings { .. } => FailureDomain::Validation,
        }
    }
}

/// A specialised `Result` for compactor errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One compactor instance.
#[derive(Debug)]
pub struct Compactor {
    store: Arc<DynObjectStore>,
    config: CompactorConfig,
    block_config: block_store::BlockConfig,
    time: Arc<dyn TimeProvider>,

    /// Tenant-ownership ring and this instance's id in it. `None` means a
    /// single-instance deployment that owns every tenant.
    ownership: Option<(Arc<Ring>, String)>,
}

impl Compactor {
    /// Construct a compactor.
    pub fn new(
        store: Arc<DynObjectStore>,
        config: CompactorConfig,
        block_config: block_store::BlockConfig,
        time: Arc<dyn TimeProvider>,
        ownership: Option<(Arc<Ring>, String)>,
    ) -> Self {
        Self {
            store,
            config,
            block_config,
            time,
            ownership,
        }
    }

    /// Run compaction cycles until cancelled, backing off when a whole cycle
    /// fails (e.g. the backend listing is down).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = backoff::Backoff::new(&backoff::BackoffConfig::default());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.time.sleep(self.config.compaction_cycle) => {}
            }
            match self.cycle().await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    warn!(error = %e, "compaction cycle failed; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff.next()) => {}
                    }
                }
            }
        }
    }

    fn owns(&self, tenant: &TenantId) -> Result<bool> {
        match &self.ownership {
            None => Ok(true),
            Some((ring, instance_id)) => {
                let owner = ring.owner(hash_tenant(tenant), Operation::Write)?;
                Ok(owner.id == *instance_id)
            }
        }
    }

    /// One pass over all owned tenants: retention first, then merge jobs.
    pub async fn cycle(&self) -> Result<()> {
        let tenants = block_store::list_tenants(Arc::clone(&self.store)).await?;
        for tenant in tenants {
            match self.owns(&tenant) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(%tenant, error = %e, "ownership check failed; skipping tenant");
                    continue;
                }
            }
            if let Err(e) = self.compact_tenant(&tenant).await {
                warn!(%tenant, error = %e, "tenant compaction failed");
            }
        }
        Ok(())
    }

    async fn compact_tenant(&self, tenant: &TenantId) -> Result<()> {
        let now = self.time.now();

        retention::apply(
            Arc::clone(&self.store),
            tenant,
            now,
            self.config.block_retention,
            self.config.compacted_block_retention,
        )
        .await?;

        let list = block_store::list_blocks(Arc::clone(&self.store), tenant).await?;
        let jobs = plan::plan_jobs(list.live.values().cloned().collect(), &self.config);
        for job in jobs {
            let output = compact::compact_job(
                Arc::clone(&self.store),
                tenant,
                job,
                self.block_config,
                self.config.prefetch_buffer,
                &*self.time,
            )
            .await?;
            info!(
                %tenant,
                block_id = %output.block_id,
                level = output.compaction_level,
                objects = output.total_objects,
                "compaction job finished"
            );
        }
        Ok(())
    }
}
