//! Object naming and the tenant block listing.
//!
//! All objects of a block live under `<tenant>/<block id>/`. The meta object
//! is written last by block writers and deleted first by compaction cleanup,
//! so its presence is the single source of truth for block visibility.

use std::{collections::BTreeMap, sync::Arc};

use data_types::{BlockId, BlockMeta, CompactedBlockMeta, TenantId};
use futures::TryStreamExt;
use object_store::path::Path;
use observability_deps::tracing::warn;
use tracedb_time::Time;

use crate::{DynObjectStore, Error, Result};

pub(crate) const META_OBJECT: &str = "meta.json";
pub(crate) const COMPACTED_META_OBJECT: &str = "meta.compacted.json";
pub(crate) const DATA_OBJECT: &str = "data";
pub(crate) const INDEX_OBJECT: &str = "index";

/// The object paths of one block.
#[derive(Debug, Clone)]
pub struct BlockObjectPaths {
    prefix: Path,

    /// `<tenant>/<block id>/meta.json`
    pub meta: Path,

    /// `<tenant>/<block id>/meta.compacted.json`
    pub compacted_meta: Path,

    /// `<tenant>/<block id>/data`
    pub data: Path,

    /// `<tenant>/<block id>/index`
    pub index: Path,
}

impl BlockObjectPaths {
    /// `<tenant>/<block id>/bloom-<shard>`
    pub fn bloom(&self, shard: u32) -> Path {
        self.prefix.child(format!("bloom-{shard}"))
    }
}

/// Compute the object paths of a block.
pub fn block_object_paths(tenant: &TenantId, block_id: BlockId) -> BlockObjectPaths {
    let prefix = Path::from(tenant.as_str()).child(block_id.to_string());
    BlockObjectPaths {
        meta: prefix.child(META_OBJECT),
        compacted_meta: prefix.child(COMPACTED_META_OBJECT),
        data: prefix.child(DATA_OBJECT),
        index: prefix.child(INDEX_OBJECT),
        prefix,
    }
}

/// Read a block's meta record. `Ok(None)` means the block is invisible:
/// either never completed or already cleaned up.
pub async fn read_meta(
    store: &DynObjectStore,
    tenant: &TenantId,
    block_id: BlockId,
) -> Result<Option<BlockMeta>> {
    let paths = block_object_paths(tenant, block_id);
    let raw = match store.get(&paths.meta).await {
        Ok(r) => r.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let meta =
        serde_json::from_slice(&raw).map_err(|source| Error::MetaCodec { block_id, source })?;
    Ok(Some(meta))
}

pub(crate) async fn write_meta(store: &DynObjectStore, meta: &BlockMeta) -> Result<()> {
    let paths = block_object_paths(&meta.tenant, meta.block_id);
    let raw = serde_json::to_vec_pretty(meta).map_err(|source| Error::MetaCodec {
        block_id: meta.block_id,
        source,
    })?;
    store.put(&paths.meta, raw.into()).await?;
    Ok(())
}

/// Supersede a block after compaction: write the compacted marker, then
/// remove the meta object so new block lists no longer see it. The data
/// stays readable through already-opened readers until hard deletion.
pub async fn mark_compacted(
    store: &DynObjectStore,
    tenant: &TenantId,
    block_id: BlockId,
    now: Time,
) -> Result<()> {
    let paths = block_object_paths(tenant, block_id);
    let marker = CompactedBlockMeta {
        block_id,
        compacted_at: now,
    };
    let raw = serde_json::to_vec_pretty(&marker).map_err(|source| Error::MetaCodec {
        block_id,
        source,
    })?;
    store.put(&paths.compacted_meta, raw.into()).await?;
    match store.delete(&paths.meta).await {
        Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read a block's compacted marker, if present.
pub async fn read_compacted_marker(
    store: &DynObjectStore,
    tenant: &TenantId,
    block_id: BlockId,
) -> Result<Option<CompactedBlockMeta>> {
    let paths = block_object_paths(tenant, block_id);
    let raw = match store.get(&paths.compacted_meta).await {
        Ok(r) => r.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let marker =
        serde_json::from_slice(&raw).map_err(|source| Error::MetaCodec { block_id, source })?;
    Ok(Some(marker))
}

/// Everything currently known about one tenant's blocks in the backend.
#[derive(Debug, Clone, Default)]
pub struct TenantBlockList {
    /// Live blocks, keyed by id (and therefore sorted by creation time).
    pub live: BTreeMap<BlockId, BlockMeta>,

    /// Superseded blocks still within their grace period.
    pub compacted: BTreeMap<BlockId, CompactedBlockMeta>,
}

/// Build the block list of `tenant` by listing and reading meta objects.
///
/// Blocks whose meta fails to parse are skipped with a warning; a corrupt
/// meta makes a block invisible, exactly like a missing one.
pub async fn list_blocks(store: Arc<DynObjectStore>, tenant: &TenantId) -> Result<TenantBlockList> {
    let prefix = Path::from(tenant.as_str());
    let listing = store.list_with_delimiter(Some(&prefix)).await?;

    let mut out = TenantBlockList::default();
    for block_prefix in listing.common_prefixes {
        let Some(name) = block_prefix.parts().last() else {
            continue;
        };
        let Ok(block_id) = name.as_ref().parse::<BlockId>() else {
            continue;
        };

        match read_meta(&*store, tenant, block_id).await {
            Ok(Some(meta)) => {
                out.live.insert(block_id, meta);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%tenant, %block_id, error=%e, "skipping block with unreadable meta");
                continue;
            }
        }

        match read_compacted_marker(&*store, tenant, block_id).await {
            Ok(Some(marker)) => {
                out.compacted.insert(block_id, marker);
            }
            Ok(None) => {
                // In-flight upload or sweep candidate; invisible either way.
            }
            Err(e) => {
                warn!(%tenant, %block_id, error=%e, "skipping unreadable compacted marker");
            }
        }
    }
    Ok(out)
}

/// List all tenants that have at least one object in the backend.
pub async fn list_tenants(store: Arc<DynObjectStore>) -> Result<Vec<TenantId>> {
    let listing = store.list_with_delimiter(None).await?;
    let mut tenants = Vec::new();
    for prefix in listing.common_prefixes {
        if let Some(name) = prefix.parts().last() {
            if let Ok(tenant) = TenantId::new(name.as_ref()) {
                tenants.push(tenant);
            }
        }
    }
    Ok(tenants)
}

/// Delete every object of a block, the meta objects first so readers racing
/// with the deletion see a consistently absent block.
pub async fn delete_block(
    store: Arc<DynObjectStore>,
    tenant: &TenantId,
    block_id: BlockId,
) -> Result<()> {
    let dir = Path::from(tenant.as_str()).child(block_id.to_string());

    let paths = block_object_paths(tenant, block_id);
    for meta_path in [&paths.meta, &paths.compacted_meta] {
        match store.delete(meta_path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let objects: Vec<_> = store.list(Some(&dir)).await?.try_collect().await?;
    for object in objects {
        match store.delete(&object.location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
