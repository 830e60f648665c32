//! The ingester itself: lifecycle, write path and the read interface it
//! exposes to queriers.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use block_store::{BlockConfig, BlockWrite, DynObjectStore};
use bytes::Bytes;
use data_types::{
    BlockId, BlockMeta, SearchQuery, SpanBatch, TenantId, TraceId, TraceSummary,
};
use hashbrown::HashMap;
use observability_deps::tracing::{info, warn};
use ring::{LifecyclerHandle, RingKv};
use tokio_util::sync::CancellationToken;
use tracedb_time::{Time, TimeProvider};
use wal::Wal;

use crate::{
    flusher,
    head::FrozenBlock,
    replay,
    tenant::TenantShard,
    Error, IngesterConfig, Result,
};

/// One ingester instance.
///
/// Constructed via [`Ingester::start`], which replays the WAL and joins the
/// ring before accepting writes. All methods take `&self`; the instance is
/// shared behind an `Arc`.
#[derive(Debug)]
pub struct Ingester {
    config: IngesterConfig,
    block_config: BlockConfig,
    time: Arc<dyn TimeProvider>,
    store: Arc<DynObjectStore>,
    wal: Arc<Wal>,

    tenants: parking_lot::Mutex<HashMap<TenantId, Arc<TenantShard>>>,
    lifecycler: tokio::sync::Mutex<Option<LifecyclerHandle>>,
    inflight: Arc<tokio::sync::Semaphore>,
    active: AtomicBool,
    cancel: CancellationToken,
    flusher_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Ingester {
    /// Bring up an ingester: open the WAL, rejoin the ring with persisted
    /// tokens, replay existing segments, then go ACTIVE and start the
    /// flusher.
    pub async fn start(
        config: IngesterConfig,
        block_config: BlockConfig,
        identity: ring::Lifecycler,
        ring_config: ring::RingConfig,
        kv: Arc<dyn RingKv>,
        store: Arc<DynObjectStore>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Arc<Self>> {
        block_config.validate()?;
        let wal = Arc::new(Wal::new(config.wal_dir.clone()).await?);

        let tokens = wal::load_tokens(wal.root()).await?;
        let lifecycler = identity
            .register(kv, ring_config, tokens, Arc::clone(&time))
            .await?;
        wal::store_tokens(wal.root(), lifecycler.tokens()).await?;

        let max_queue_depth = config.max_queue_depth;
        let ingester = Arc::new(Self {
            config,
            block_config,
            time,
            store,
            wal,
            tenants: Default::default(),
            lifecycler: tokio::sync::Mutex::new(Some(lifecycler)),
            inflight: Arc::new(tokio::sync::Semaphore::new(max_queue_depth)),
            active: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            flusher_task: Default::default(),
        });

        // Replay before going ACTIVE: reads served from here must include
        // everything previously acknowledged.
        let now = ingester.time.now();
        for tenant in ingester.wal.tenants() {
            let shard = ingester.shard(&tenant).await?;
            replay::replay_tenant(&shard, now).await?;
        }

        {
            let lifecycler = ingester.lifecycler.lock().await;
            lifecycler
                .as_ref()
                .expect("lifecycler present at startup")
                .set_active()
                .await?;
        }
        ingester.active.store(true, Ordering::SeqCst);
        info!("ingester active");

        let task = tokio::spawn(flusher::run(
            Arc::clone(&ingester),
            ingester.cancel.clone(),
        ));
        *ingester.flusher_task.lock() = Some(task);

        Ok(ingester)
    }

    pub(crate) fn config(&self) -> &IngesterConfig {
        &self.config
    }

    pub(crate) fn time(&self) -> &Arc<dyn TimeProvider> {
        &self.time
    }

    /// Whether the instance is ACTIVE and serving.
    pub fn ready(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn shard(&self, tenant: &TenantId) -> Result<Arc<TenantShard>> {
        if let Some(shard) = self.tenants.lock().get(tenant) {
            return Ok(Arc::clone(shard));
        }
        let tenant_wal = self.wal.for_tenant(tenant).await?;
        let shard = Arc::new(TenantShard::new(
            tenant.clone(),
            tenant_wal,
            Default::default(),
        ));
        let mut tenants = self.tenants.lock();
        Ok(Arc::clone(
            tenants
                .entry(tenant.clone())
                .or_insert_with(|| Arc::clone(&shard)),
        ))
    }

    fn shards(&self) -> Vec<Arc<TenantShard>> {
        self.tenants.lock().values().cloned().collect()
    }

    /// Accept one batch: WAL-first append of every span, acknowledged only
    /// once all records are fsynced.
    pub async fn push(&self, batch: SpanBatch) -> Result<()> {
        if !self.ready() {
            return Err(Error::NotActive);
        }
        let _permit =
            self.inflight
                .try_acquire()
                .map_err(|_| Error::OverCapacity {
                    inflight: self.config.max_queue_depth,
                })?;

        let shard = self.shard(&batch.tenant).await?;
        let now = self.time.now();
        for span in &batch.spans {
            if let Err(e) = shard.append(span, &batch.encoding, now).await {
                // A WAL that cannot persist makes this instance unsafe to
                // write to; surface that in the ring before failing the
                // push.
                warn!(error = %e, "wal append failed; reporting unhealthy");
                self.report_unhealthy().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Span payloads of `trace_id` across the head block and all frozen
    /// blocks still held here.
    pub async fn find_trace_by_id(&self, tenant: &TenantId, trace_id: TraceId) -> Vec<Bytes> {
        match self.tenants.lock().get(tenant) {
            Some(shard) => shard.find_trace(trace_id),
            None => Vec::new(),
        }
    }

    /// Search recent (un-uploaded) traces via the attribute cache.
    pub async fn search_recent(&self, tenant: &TenantId, query: &SearchQuery) -> Vec<TraceSummary> {
        match self.tenants.lock().get(tenant) {
            Some(shard) => shard.search(query),
            None => Vec::new(),
        }
    }

    /// Distinct tag keys in recent traces.
    pub async fn tag_names(&self, tenant: &TenantId) -> Vec<String> {
        match self.tenants.lock().get(tenant) {
            Some(shard) => shard.tag_names(),
            None => Vec::new(),
        }
    }

    /// Distinct values of one tag key in recent traces.
    pub async fn tag_values(&self, tenant: &TenantId, key: &str) -> Vec<String> {
        match self.tenants.lock().get(tenant) {
            Some(shard) => shard.tag_values(key),
            None => Vec::new(),
        }
    }

    /// Force-cut every head block and upload everything immediately.
    pub async fn flush(&self) -> Result<()> {
        self.flush_cycle(true).await
    }

    /// Drain and leave: stop taking writes, upload all held data, then
    /// deregister from the ring.
    pub async fn shutdown(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);

        {
            let lifecycler = self.lifecycler.lock().await;
            if let Some(handle) = lifecycler.as_ref() {
                handle.begin_leave().await?;
            }
        }

        self.flush_cycle(true).await?;

        self.cancel.cancel();
        if let Some(task) = self.flusher_task.lock().take() {
            let _ = task.await;
        }

        if let Some(handle) = self.lifecycler.lock().await.take() {
            handle.deregister().await?;
        }
        info!("ingester shut down");
        Ok(())
    }

    async fn report_unhealthy(&self) {
        self.active.store(false, Ordering::SeqCst);
        let lifecycler = self.lifecycler.lock().await;
        if let Some(handle) = lifecycler.as_ref() {
            if let Err(e) = handle.set_unhealthy().await {
                warn!(error = %e, "failed to mark instance unhealthy in ring");
            }
        }
    }

    /// One freeze / upload pass over all tenants. With `force`, cut
    /// non-empty heads regardless of triggers and upload without waiting for
    /// the completion timeout.
    pub(crate) async fn flush_cycle(&self, force: bool) -> Result<()> {
        let now = self.time.now();
        let mut first_error = None;

        for shard in self.shards() {
            match shard.maybe_freeze(&self.config, now, force).await {
                Ok(Some(frozen)) => {
                    info!(
                        tenant = %shard.tenant,
                        records = frozen.records.len(),
                        bytes = frozen.bytes,
                        "head block cut"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tenant = %shard.tenant, error = %e, "head block cut failed");
                    first_error.get_or_insert(e);
                    continue;
                }
            }

            for frozen in shard.frozen_due(now, self.config.complete_block_timeout, force) {
                match self.upload_block(&shard, &frozen).await {
                    Ok(meta) => {
                        info!(
                            tenant = %shard.tenant,
                            block_id = %meta.block_id,
                            objects = meta.total_objects,
                            "block uploaded"
                        );
                    }
                    Err(e) => {
                        warn!(
                            tenant = %shard.tenant,
                            error = %e,
                            "block upload failed; kept for retry"
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn upload_block(
        &self,
        shard: &Arc<TenantShard>,
        frozen: &Arc<FrozenBlock>,
    ) -> Result<BlockMeta> {
        let block_id = BlockId::new_at(self.time.now());
        let mut write = BlockWrite::new(
            Arc::clone(&self.store),
            shard.tenant.clone(),
            block_id,
            self.block_config,
            frozen.encoding.clone(),
            0,
            frozen.records.len() as u64,
        )
        .await?;

        for (trace_id, object, _) in &frozen.records {
            write.append(*trace_id, object.clone()).await?;
        }

        let meta = write
            .complete(
                Time::from_timestamp_nanos(frozen.start_unix_nanos as i64),
                Time::from_timestamp_nanos(frozen.end_unix_nanos as i64),
            )
            .await?;

        // Only now is the data durable under a visible meta record; the WAL
        // segments covering it may go.
        shard.release_frozen(frozen).await?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{DataEncoding, SpanAttributes, SpanBuffer};
    use object_store::memory::InMemory;
    use ring::{MemKv, RingConfig};
    use std::time::Duration;
    use tracedb_time::MockProvider;

    fn tenant() -> TenantId {
        TenantId::new("single-tenant").unwrap()
    }

    fn id(n: u16) -> TraceId {
        let mut bytes = [0u8; 16];
        bytes[14..].copy_from_slice(&n.to_be_bytes());
        TraceId::from_bytes(bytes)
    }

    fn span(trace: u16, payload: Vec<u8>, start: u64) -> SpanBuffer {
        SpanBuffer {
            trace_id: id(trace),
            payload: payload.into(),
            attributes: SpanAttributes {
                service_name: "cart".into(),
                span_name: "checkout".into(),
                start_unix_nanos: start,
                duration_nanos: 700_000_000,
                error: false,
                tags: vec![("cluster".into(), "eu".into())],
            },
        }
    }

    fn batch(spans: Vec<SpanBuffer>) -> SpanBatch {
        SpanBatch {
            tenant: tenant(),
            encoding: DataEncoding::default(),
            spans,
        }
    }

    struct Fixture {
        store: Arc<DynObjectStore>,
        kv: Arc<MemKv>,
        time: Arc<MockProvider>,
        wal_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemory::new()),
                kv: MemKv::new(),
                time: Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000_000))),
                wal_dir: test_helpers::tmp_dir().unwrap(),
            }
        }

        async fn start(&self, config: IngesterConfig) -> Arc<Ingester> {
            let config = IngesterConfig {
                wal_dir: self.wal_dir.path().to_owned(),
                ..config
            };
            Ingester::start(
                config,
                BlockConfig::default(),
                ring::Lifecycler {
                    instance_id: "ingester-0".into(),
                    addr: "ingester-0:9095".into(),
                    zone: "zone-a".into(),
                },
                RingConfig {
                    replication_factor: 1,
                    tenant_shard_size: 1,
                    tokens_per_instance: 8,
                    ..Default::default()
                },
                Arc::clone(&self.kv) as _,
                Arc::clone(&self.store),
                Arc::clone(&self.time) as _,
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn cut_on_size_starts_a_fresh_head() {
        let fixture = Fixture::new();
        let ingester = fixture
            .start(IngesterConfig {
                max_block_bytes: 1024 * 1024,
                trace_idle_period: Duration::from_secs(3600),
                max_block_duration: Duration::from_secs(3600),
                ..Default::default()
            })
            .await;

        // 256 spans of 4 KiB fill the 1 MiB head exactly.
        for n in 0..256u16 {
            ingester
                .push(batch(vec![span(n, vec![0u8; 4096], u64::from(n) + 1)]))
                .await
                .unwrap();
        }
        ingester.flush_cycle(false).await.unwrap();

        // The head was cut; the 257th span lands in a fresh head.
        ingester
            .push(batch(vec![span(256, vec![0u8; 4096], 300)]))
            .await
            .unwrap();

        let shard = ingester.shard(&tenant()).await.unwrap();
        assert_eq!(shard.head.read().traces.len(), 1);
        assert!(shard.head.read().traces.contains_key(&id(256)));
    }

    #[tokio::test]
    async fn flush_uploads_block_and_truncates_wal() {
        let fixture = Fixture::new();
        let ingester = fixture.start(IngesterConfig::default()).await;

        ingester
            .push(batch(vec![
                span(1, b"hello".to_vec(), 100),
                span(2, b"world".to_vec(), 200),
            ]))
            .await
            .unwrap();

        // Readable from memory before the flush.
        assert_eq!(
            ingester.find_trace_by_id(&tenant(), id(1)).await,
            vec![bytes::Bytes::from_static(b"hello")]
        );

        ingester.flush().await.unwrap();

        // One live block in the backend covering both traces.
        let blocks = block_store::list_blocks(Arc::clone(&fixture.store), &tenant())
            .await
            .unwrap();
        assert_eq!(blocks.live.len(), 1);
        let meta = blocks.live.values().next().unwrap();
        assert_eq!(meta.total_objects, 2);
        assert_eq!(meta.compaction_level, 0);

        // WAL segments covering the flushed data are gone.
        let shard = ingester.shard(&tenant()).await.unwrap();
        assert!(shard.wal.closed_segments().is_empty());
        // And the frozen block has been dropped from memory.
        assert!(shard.frozen.read().is_empty());
    }

    #[tokio::test]
    async fn replay_restores_acknowledged_spans() {
        let fixture = Fixture::new();
        {
            let ingester = fixture.start(IngesterConfig::default()).await;
            ingester
                .push(batch(vec![span(7, b"survives".to_vec(), 100)]))
                .await
                .unwrap();
            // No flush, no clean shutdown: simulate a crash by dropping.
        }

        let restarted = fixture.start(IngesterConfig::default()).await;
        assert_eq!(
            restarted.find_trace_by_id(&tenant(), id(7)).await,
            vec![bytes::Bytes::from_static(b"survives")]
        );
    }

    #[tokio::test]
    async fn search_recent_matches_attribute_cache() {
        let fixture = Fixture::new();
        let ingester = fixture.start(IngesterConfig::default()).await;

        ingester
            .push(batch(vec![span(1, b"a".to_vec(), 100)]))
            .await
            .unwrap();

        let query = SearchQuery {
            tags: vec![("service.name".into(), "cart".into())],
            min_duration_ms: Some(500),
            max_duration_ms: None,
            limit: 10,
        };
        let hits = ingester.search_recent(&tenant(), &query).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].root_service_name, "cart");
        assert_eq!(hits[0].duration_ms, 700);

        let none = SearchQuery {
            tags: vec![("service.name".into(), "front".into())],
            min_duration_ms: None,
            max_duration_ms: None,
            limit: 10,
        };
        assert!(ingester.search_recent(&tenant(), &none).await.is_empty());

        assert_eq!(
            ingester.tag_names(&tenant()).await,
            vec!["cluster".to_owned()]
        );
        assert_eq!(
            ingester.tag_values(&tenant(), "cluster").await,
            vec!["eu".to_owned()]
        );
    }

    #[tokio::test]
    async fn shutdown_drains_and_deregisters() {
        let fixture = Fixture::new();
        let ingester = fixture.start(IngesterConfig::default()).await;

        ingester
            .push(batch(vec![span(1, b"x".to_vec(), 100)]))
            .await
            .unwrap();
        ingester.shutdown().await.unwrap();

        // Data made it to the backend.
        let blocks = block_store::list_blocks(Arc::clone(&fixture.store), &tenant())
            .await
            .unwrap();
        assert_eq!(blocks.live.len(), 1);

        // The instance is gone from the ring and refuses writes.
        assert!(fixture
            .kv
            .get()
            .await
            .unwrap()
            .value
            .instances
            .is_empty());
        assert!(matches!(
            ingester.push(batch(vec![span(2, b"y".to_vec(), 1)])).await,
            Err(Error::NotActive)
        ));
    }

    #[tokio::test]
    async fn over_capacity_is_retryable() {
        let fixture = Fixture::new();
        let ingester = fixture
            .start(IngesterConfig {
                max_queue_depth: 0,
                ..Default::default()
            })
            .await;

        let err = ingester
            .push(batch(vec![span(1, b"x".to_vec(), 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OverCapacity { .. }));
        use data_types::ClassifiedError;
        assert!(err.is_retryable());
    }
}
