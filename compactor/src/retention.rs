//! Retention enforcement: absolute expiry and the post-compaction grace
//! period.

use std::{sync::Arc, time::Duration};

use block_store::{delete_block, list_blocks, sweep_orphans, DynObjectStore};
use data_types::TenantId;
use observability_deps::tracing::info;
use tracedb_time::Time;

use crate::Result;

/// Apply retention to one tenant:
///
/// - live blocks whose `end` is older than `block_retention` are deleted
///   outright, bypassing compaction;
/// - superseded blocks past `compacted_block_retention` are hard-deleted;
/// - orphaned objects with no meta and older than the grace period are
///   swept.
pub(crate) async fn apply(
    store: Arc<DynObjectStore>,
    tenant: &TenantId,
    now: Time,
    block_retention: Duration,
    compacted_block_retention: Duration,
) -> Result<()> {
    let list = list_blocks(Arc::clone(&store), tenant).await?;

    if let Some(cutoff) = now.checked_sub(block_retention) {
        for (block_id, meta) in &list.live {
            if meta.end < cutoff {
                delete_block(Arc::clone(&store), tenant, *block_id).await?;
                info!(%tenant, %block_id, "deleted block past retention");
            }
        }
    }

    if let Some(cutoff) = now.checked_sub(compacted_block_retention) {
        for (block_id, marker) in &list.compacted {
            if marker.compacted_at < cutoff {
                delete_block(Arc::clone(&store), tenant, *block_id).await?;
                info!(%tenant, %block_id, "hard-deleted compacted block");
            }
        }
    }

    sweep_orphans(store, tenant, now, compacted_block_retention).await?;
    Ok(())
}
