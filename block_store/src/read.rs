//! Reading one block from the backend.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use data_types::{BlockMeta, TenantId, TraceId};

use crate::{
    backend::{self, BlockObjectPaths},
    bloom::{shard_for, BloomShard},
    index::{decode_index, BlockIndex},
    iter::BlockIterator,
    page, DynObjectStore, Result,
};

/// Read handle over one completed block.
///
/// The index and bloom shards are fetched lazily and cached for the lifetime
/// of the handle, so a handle held across many lookups fetches each auxiliary
/// object at most once. Lookups read at most one data page.
#[derive(Debug)]
pub struct BackendBlock {
    store: Arc<DynObjectStore>,
    meta: BlockMeta,
    paths: BlockObjectPaths,
    index: tokio::sync::OnceCell<Arc<BlockIndex>>,
    bloom_shards: tokio::sync::Mutex<HashMap<u32, Arc<BloomShard>>>,
}

impl BackendBlock {
    /// Open the block `block_id` of `tenant`, reading its meta record.
    /// `Ok(None)` means the block is not visible.
    pub async fn open(
        store: Arc<DynObjectStore>,
        tenant: &TenantId,
        block_id: data_types::BlockId,
    ) -> Result<Option<Self>> {
        let Some(meta) = backend::read_meta(&*store, tenant, block_id).await? else {
            return Ok(None);
        };
        Ok(Some(Self::from_meta(store, meta)))
    }

    /// Build a handle from an already-fetched meta record (e.g. out of a
    /// polled block list).
    pub fn from_meta(store: Arc<DynObjectStore>, meta: BlockMeta) -> Self {
        let paths = backend::block_object_paths(&meta.tenant, meta.block_id);
        Self {
            store,
            meta,
            paths,
            index: Default::default(),
            bloom_shards: Default::default(),
        }
    }

    /// The block's meta record.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    async fn index(&self) -> Result<Arc<BlockIndex>> {
        self.index
            .get_or_try_init(|| async {
                let raw = self.store.get(&self.paths.index).await?.bytes().await?;
                Ok(Arc::new(decode_index(&raw, self.meta.block_id)?))
            })
            .await
            .map(Arc::clone)
    }

    async fn bloom_shard(&self, shard: u32) -> Result<Arc<BloomShard>> {
        let mut shards = self.bloom_shards.lock().await;
        if let Some(s) = shards.get(&shard) {
            return Ok(Arc::clone(s));
        }
        let raw = self
            .store
            .get(&self.paths.bloom(shard))
            .await?
            .bytes()
            .await?;
        let decoded = Arc::new(BloomShard::decode(raw, self.meta.block_id)?);
        shards.insert(shard, Arc::clone(&decoded));
        Ok(decoded)
    }

    /// Look up one trace's object bytes.
    ///
    /// Consults the bloom shard first: a negative answer short-circuits
    /// without touching the index or any data page.
    pub async fn find_trace(&self, trace_id: TraceId) -> Result<Option<Bytes>> {
        let shard = shard_for(trace_id, self.meta.bloom_shard_count);
        if !self.bloom_shard(shard).await?.maybe_contains(trace_id) {
            return Ok(None);
        }

        let index = self.index().await?;
        let Some(entry) = index.locate(trace_id) else {
            return Ok(None);
        };

        let start = entry.offset as usize;
        let raw = self
            .store
            .get_range(&self.paths.data, start..start + entry.length as usize)
            .await?;
        let records = page::decode_page(&raw, self.meta.block_id)?;

        Ok(records
            .binary_search_by(|(id, _)| id.cmp(&trace_id))
            .ok()
            .map(|i| records[i].1.clone()))
    }

    /// Sequential iterator over every record in the block.
    pub async fn iter(&self) -> Result<BlockIterator> {
        let index = self.index().await?;
        Ok(BlockIterator::new(
            Arc::clone(&self.store),
            self.paths.data.clone(),
            self.meta.block_id,
            index,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        iter::TraceIterator, trace_object::TraceObject, write::BlockWrite, BlockConfig,
    };
    use data_types::{BlockId, DataEncoding, TraceAttributes};
    use object_store::memory::InMemory;
    use tracedb_time::Time;

    fn id(n: u8) -> TraceId {
        TraceId::from_bytes([n; 16])
    }

    fn tenant() -> TenantId {
        TenantId::new("single-tenant").unwrap()
    }

    fn object(n: u8) -> Bytes {
        TraceObject {
            attributes: TraceAttributes {
                root_service_name: "svc".into(),
                root_span_name: "op".into(),
                start_unix_nanos: u64::from(n),
                end_unix_nanos: u64::from(n) + 1,
                error: false,
                tags: vec![],
            },
            encoding: DataEncoding::default(),
            spans: vec![Bytes::from(vec![n; 32])],
        }
        .encode()
    }

    async fn build_block(store: Arc<DynObjectStore>, ids: &[u8]) -> BlockMeta {
        let config = BlockConfig {
            // Small pages force a multi-page block.
            index_page_size_bytes: 128,
            ..Default::default()
        };
        let mut write = BlockWrite::new(
            Arc::clone(&store),
            tenant(),
            BlockId::new_at(Time::from_timestamp_millis(1_000)),
            config,
            DataEncoding::default(),
            0,
            ids.len() as u64,
        )
        .await
        .unwrap();
        for n in ids {
            write.append(id(*n), object(*n)).await.unwrap();
        }
        write
            .complete(
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(1_000),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn finds_present_traces_and_rejects_absent_ones() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let meta = build_block(Arc::clone(&store), &[1, 3, 5, 7, 9]).await;
        let block = BackendBlock::from_meta(Arc::clone(&store), meta);

        for n in [1u8, 3, 5, 7, 9] {
            let bytes = block.find_trace(id(n)).await.unwrap().unwrap();
            assert_eq!(bytes, object(n));
        }
        for n in [0u8, 2, 8, 200] {
            assert!(block.find_trace(id(n)).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn iterates_in_trace_id_order() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let meta = build_block(Arc::clone(&store), &[2, 4, 6, 8]).await;
        let block = BackendBlock::from_meta(store, meta);

        let mut it = block.iter().await.unwrap();
        let mut seen = Vec::new();
        while let Some((trace_id, _)) = it.next().await.unwrap() {
            seen.push(trace_id);
        }
        assert_eq!(seen, vec![id(2), id(4), id(6), id(8)]);
    }

    #[tokio::test]
    async fn open_returns_none_for_invisible_blocks() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let missing = BackendBlock::open(
            store,
            &tenant(),
            BlockId::new_at(Time::from_timestamp_millis(0)),
        )
        .await
        .unwrap();
        assert!(missing.is_none());
    }
}
