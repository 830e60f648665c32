//! The block writer state machine.
//!
//! `OPEN → APPENDING → FLUSHING → COMPLETE`. Data pages stream to the
//! backend through a multipart upload while records are appended; the index,
//! bloom shards and finally the meta record are uploaded by
//! [`BlockWrite::complete`]. A crash at any point before the meta upload
//! leaves only invisible objects behind, later reclaimed by the sweeper.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use data_types::{BlockId, BlockMeta, BlockVersion, DataEncoding, TenantId, TraceId};
use object_store::MultipartId;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracedb_time::Time;

use crate::{
    backend::{self, BlockObjectPaths},
    bloom::ShardedBloomBuilder,
    index::{encode_index, IndexEntry},
    page, BlockConfig, DynObjectStore, Error, Result,
};

/// Progress of an in-flight block write, for observability and retry
/// decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendTracker {
    /// Records appended so far.
    pub objects: u64,

    /// Data bytes handed to the backend so far (whole pages only).
    pub bytes_flushed: u64,

    /// Pages handed to the backend so far.
    pub pages_flushed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Open,
    Appending,
    Flushing,
    Complete,
}

/// Writer for one block. See the module docs for the state machine.
pub struct BlockWrite {
    store: Arc<DynObjectStore>,
    paths: BlockObjectPaths,
    tenant: TenantId,
    block_id: BlockId,
    config: BlockConfig,
    encoding: DataEncoding,
    compaction_level: u32,

    state: WriteState,
    multipart_id: MultipartId,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,

    page_records: Vec<(TraceId, Bytes)>,
    page_bytes: usize,
    index_entries: Vec<IndexEntry>,
    bloom: ShardedBloomBuilder,
    crc: crc32fast::Hasher,
    data_offset: u64,
    tracker: AppendTracker,
    last_id: Option<TraceId>,
}

impl fmt::Debug for BlockWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockWrite")
            .field("tenant", &self.tenant)
            .field("block_id", &self.block_id)
            .field("state", &self.state)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl BlockWrite {
    /// Open a writer for a new block.
    ///
    /// `expected_objects` sizes the bloom filter; an upper bound (such as
    /// the record count of the head block or the summed counts of compaction
    /// inputs) is the right value.
    pub async fn new(
        store: Arc<DynObjectStore>,
        tenant: TenantId,
        block_id: BlockId,
        config: BlockConfig,
        encoding: DataEncoding,
        compaction_level: u32,
        expected_objects: u64,
    ) -> Result<Self> {
        config.validate()?;
        let paths = backend::block_object_paths(&tenant, block_id);
        let (multipart_id, writer) = store.put_multipart(&paths.data).await?;

        Ok(Self {
            store,
            paths,
            tenant,
            block_id,
            bloom: ShardedBloomBuilder::new(&config, expected_objects),
            config,
            encoding,
            compaction_level,
            state: WriteState::Open,
            multipart_id,
            writer: Some(writer),
            page_records: Vec::new(),
            page_bytes: 0,
            index_entries: Vec::new(),
            crc: crc32fast::Hasher::new(),
            data_offset: 0,
            tracker: AppendTracker::default(),
            last_id: None,
        })
    }

    /// The id of the block being written.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Current progress.
    pub fn tracker(&self) -> AppendTracker {
        self.tracker
    }

    /// Append one record. Ids must arrive in strictly ascending order; the
    /// caller merges duplicates before appending.
    pub async fn append(&mut self, trace_id: TraceId, object: Bytes) -> Result<AppendTracker> {
        debug_assert!(matches!(
            self.state,
            WriteState::Open | WriteState::Appending
        ));
        if let Some(previous) = self.last_id {
            if trace_id <= previous {
                return Err(Error::OutOfOrderAppend {
                    block_id: self.block_id,
                    trace_id,
                    previous,
                });
            }
        }
        self.state = WriteState::Appending;
        self.last_id = Some(trace_id);
        self.bloom.insert(trace_id);

        self.page_bytes += object.len() + data_types::TRACE_ID_LEN + 8;
        self.page_records.push((trace_id, object));
        self.tracker.objects += 1;

        if self.page_bytes >= self.config.index_page_size_bytes {
            self.flush_page().await?;
        }
        Ok(self.tracker)
    }

    async fn flush_page(&mut self) -> Result<()> {
        if self.page_records.is_empty() {
            return Ok(());
        }

        let encoded = page::encode_page(&self.page_records, self.config.page_codec)?;
        let writer = self.writer.as_mut().expect("writer present before flush");
        writer
            .write_all(&encoded)
            .await
            .map_err(|source| Error::DataUpload {
                block_id: self.block_id,
                source,
            })?;

        self.crc.update(&encoded);
        self.index_entries.push(IndexEntry {
            first_trace_id: self.page_records[0].0,
            offset: self.data_offset,
            length: encoded.len() as u32,
        });
        self.data_offset += encoded.len() as u64;
        self.tracker.bytes_flushed = self.data_offset;
        self.tracker.pages_flushed += 1;

        self.page_records.clear();
        self.page_bytes = 0;
        Ok(())
    }

    /// Finish the block: flush the trailing page, finalise the data upload,
    /// then upload index, bloom shards and, last of all, the meta record.
    ///
    /// `start`/`end` is the span time range the block covers, computed by
    /// the caller from the records it appended.
    pub async fn complete(mut self, start: Time, end: Time) -> Result<BlockMeta> {
        if self.tracker.objects == 0 {
            let block_id = self.block_id;
            self.abort().await?;
            return Err(Error::EmptyBlock { block_id });
        }

        self.flush_page().await?;
        self.state = WriteState::Flushing;

        let mut writer = self.writer.take().expect("writer present at complete");
        writer
            .shutdown()
            .await
            .map_err(|source| Error::DataUpload {
                block_id: self.block_id,
                source,
            })?;

        self.store
            .put(&self.paths.index, encode_index(&self.index_entries).into())
            .await?;

        let shard_count = self.bloom.shard_count();
        for (shard, object) in std::mem::replace(
            &mut self.bloom,
            ShardedBloomBuilder::new(&self.config, 1),
        )
        .into_shard_objects()
        .into_iter()
        .enumerate()
        {
            self.store
                .put(&self.paths.bloom(shard as u32), object.into())
                .await?;
        }

        let meta = BlockMeta {
            version: BlockVersion::V1,
            block_id: self.block_id,
            tenant: self.tenant.clone(),
            start,
            end,
            total_objects: self.tracker.objects,
            size_bytes: self.data_offset,
            compaction_level: self.compaction_level,
            encoding: self.encoding.clone(),
            data_checksum: self.crc.clone().finalize(),
            bloom_shard_count: shard_count,
        };
        backend::write_meta(&*self.store, &meta).await?;

        self.state = WriteState::Complete;
        Ok(meta)
    }

    /// Abandon the write, aborting the in-flight data upload. Any objects
    /// already uploaded stay invisible (no meta) until swept.
    pub async fn abort(mut self) -> Result<()> {
        drop(self.writer.take());
        self.store
            .abort_multipart(&self.paths.data, &self.multipart_id)
            .await?;
        self.state = WriteState::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::read_meta;
    use object_store::{memory::InMemory, ObjectStore};

    fn id(n: u8) -> TraceId {
        TraceId::from_bytes([n; 16])
    }

    fn tenant() -> TenantId {
        TenantId::new("single-tenant").unwrap()
    }

    async fn writer(store: Arc<DynObjectStore>, config: BlockConfig) -> BlockWrite {
        BlockWrite::new(
            store,
            tenant(),
            BlockId::new_at(Time::from_timestamp_millis(1_000)),
            config,
            DataEncoding::default(),
            0,
            16,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn completes_with_meta_last() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let mut write = writer(Arc::clone(&store), BlockConfig::default()).await;

        write.append(id(1), Bytes::from_static(b"a")).await.unwrap();
        write.append(id(2), Bytes::from_static(b"b")).await.unwrap();

        let block_id = write.block_id();
        // Not yet visible: no meta object until complete.
        assert!(read_meta(&*store, &tenant(), block_id)
            .await
            .unwrap()
            .is_none());

        let meta = write
            .complete(
                Time::from_timestamp_nanos(10),
                Time::from_timestamp_nanos(20),
            )
            .await
            .unwrap();
        assert_eq!(meta.total_objects, 2);
        assert_eq!(meta.compaction_level, 0);
        assert!(meta.bloom_shard_count >= 1);

        let read_back = read_meta(&*store, &tenant(), block_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_back, meta);
    }

    #[tokio::test]
    async fn rejects_out_of_order_appends() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let mut write = writer(store, BlockConfig::default()).await;

        write.append(id(5), Bytes::from_static(b"a")).await.unwrap();
        let err = write
            .append(id(5), Bytes::from_static(b"dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrderAppend { .. }));
        let err = write
            .append(id(3), Bytes::from_static(b"lower"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrderAppend { .. }));
    }

    #[tokio::test]
    async fn small_pages_produce_multiple_index_entries() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let config = BlockConfig {
            index_page_size_bytes: 64,
            ..Default::default()
        };
        let mut write = writer(Arc::clone(&store), config).await;

        for n in 1..=8 {
            write
                .append(id(n), Bytes::from(vec![n; 64]))
                .await
                .unwrap();
        }
        // Every record exceeds the page target on its own, so each append
        // flushed a page.
        let tracker = write.tracker();
        assert_eq!(tracker.pages_flushed, 8, "got {tracker:?}");

        let meta = write
            .complete(
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(1),
            )
            .await
            .unwrap();
        assert_eq!(meta.total_objects, 8);

        // Index object exists and parses with one entry per page.
        let paths = backend::block_object_paths(&tenant(), meta.block_id);
        let raw = store.get(&paths.index).await.unwrap().bytes().await.unwrap();
        let index = crate::index::decode_index(&raw, meta.block_id).unwrap();
        assert_eq!(index.page_count(), 8);
    }

    #[tokio::test]
    async fn empty_block_cannot_complete() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let write = writer(store, BlockConfig::default()).await;
        let err = write
            .complete(
                Time::from_timestamp_nanos(0),
                Time::from_timestamp_nanos(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyBlock { .. }));
    }
}
