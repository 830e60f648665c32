//! Scatter-gather lookup and search.

use std::sync::Arc;

use block_store::{block_reader, DynObjectStore, PrefetchIterator, TraceIterator, TraceObject};
use bytes::Bytes;
use data_types::{
    BlockId, BlockMeta, SearchQuery, TenantId, TraceId, TraceSummary,
};
use futures::future::join_all;
use hashbrown::HashSet;
use observability_deps::tracing::{debug, warn};
use ring::{hash_trace_key, Operation, Ring};
use tracedb_time::TimeProvider;

use crate::{
    blocklist::BlockListCache, cache::LruCache, QuerierConfig, QueryClientPool, Result,
};

/// Which stores a trace lookup consults. `All` is the default; the narrower
/// modes exist for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Only the ingesters' recent data.
    Ingesters,
    /// Only backend blocks.
    Blocks,
    /// Both.
    #[default]
    All,
}

/// Parameters of one trace lookup.
#[derive(Debug, Clone, Copy)]
pub struct TraceLookupRequest {
    /// Lower bound (inclusive) of the block-id range to consult.
    pub block_start: BlockId,

    /// Upper bound (inclusive) of the block-id range to consult.
    pub block_end: BlockId,

    /// Which stores to consult.
    pub mode: QueryMode,
}

impl Default for TraceLookupRequest {
    fn default() -> Self {
        Self {
            block_start: BlockId::ZERO,
            block_end: BlockId::MAX,
            mode: QueryMode::All,
        }
    }
}

/// Observability counters returned with a trace lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    /// Ingesters asked.
    pub ingesters_queried: usize,

    /// Ingesters that failed or were unreachable.
    pub failed_ingesters: usize,

    /// Backend blocks consulted (meta within range).
    pub inspected_blocks: usize,

    /// Blocks whose read failed; the result may be partial.
    pub failed_blocks: usize,
}

/// A merged, deduplicated trace.
#[derive(Debug, Clone)]
pub struct TraceQueryResult {
    /// Span payloads, deduplicated by exact bytes, in first-seen order.
    pub spans: Vec<Bytes>,

    /// What the lookup touched.
    pub metrics: QueryMetrics,
}

/// Observability counters returned with a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchMetrics {
    /// Backend blocks scanned.
    pub inspected_blocks: usize,

    /// Blocks whose scan failed.
    pub failed_blocks: usize,

    /// Trace records evaluated against the predicates.
    pub inspected_traces: usize,

    /// Ingesters that failed or were unreachable.
    pub failed_ingesters: usize,
}

/// A search result page.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    /// Matching summaries, most recent first, truncated to the query limit.
    pub traces: Vec<TraceSummary>,

    /// What the search touched. Zeroed for cached responses.
    pub metrics: SearchMetrics,

    /// Whether the response was served from the frontend cache.
    pub cached: bool,
}

/// One querier instance (the query-frontend logic is the `search` entry
/// point of the same struct).
#[derive(Debug)]
pub struct Querier {
    ring: Arc<Ring>,
    pool: Arc<dyn QueryClientPool>,
    config: QuerierConfig,
    time: Arc<dyn TimeProvider>,
    blocklists: BlockListCache,
    store: Arc<DynObjectStore>,
    search_cache: parking_lot::Mutex<LruCache<String, Vec<TraceSummary>>>,
}

impl Querier {
    /// Construct a querier.
    pub fn new(
        store: Arc<DynObjectStore>,
        ring: Arc<Ring>,
        pool: Arc<dyn QueryClientPool>,
        config: QuerierConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            ring,
            pool,
            blocklists: BlockListCache::new(
                Arc::clone(&store),
                config.blocklist_poll_period,
                Arc::clone(&time),
            ),
            time,
            store,
            search_cache: parking_lot::Mutex::new(LruCache::new(config.response_cache_entries)),
            config,
        }
    }

    /// Look up one trace, merging ingester and backend results.
    pub async fn find_trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: TraceId,
        request: TraceLookupRequest,
    ) -> Result<TraceQueryResult> {
        let mut metrics = QueryMetrics::default();
        let mut spans: Vec<Bytes> = Vec::new();
        let mut seen: HashSet<Bytes> = HashSet::new();

        if matches!(request.mode, QueryMode::Ingesters | QueryMode::All) {
            match self.ring.get(hash_trace_key(tenant, trace_id), Operation::Read) {
                Ok(set) => {
                    metrics.ingesters_queried = set.instances.len();
                    let lookups = set.instances.iter().map(|instance| {
                        let client = self.pool.client_for(instance);
                        let tenant = tenant.clone();
                        async move { client.find_trace_by_id(&tenant, trace_id).await }
                    });
                    for (instance, outcome) in set.instances.iter().zip(join_all(lookups).await) {
                        match outcome {
                            Ok(found) => {
                                for span in found {
                                    if seen.insert(span.clone()) {
                                        spans.push(span);
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(instance = %instance.id, error = %e, "ingester lookup failed");
                                metrics.failed_ingesters += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    // No readable replication set is a partial failure: the
                    // backend may still hold the trace.
                    warn!(error = %e, "no readable ingester set for lookup");
                    metrics.failed_ingesters += 1;
                }
            }
        }

        if matches!(request.mode, QueryMode::Blocks | QueryMode::All) {
            let list = self.blocklists.get(tenant).await?;
            let candidates: Vec<&BlockMeta> = list
                .live
                .range(request.block_start..=request.block_end)
                .map(|(_, meta)| meta)
                .collect();
            metrics.inspected_blocks = candidates.len();

            let reads = candidates.iter().map(|meta| {
                let reader = block_reader(Arc::clone(&self.store), (*meta).clone());
                async move { (reader.meta().block_id, reader.find_trace(trace_id).await) }
            });
            for (block_id, outcome) in join_all(reads).await {
                match outcome {
                    Ok(None) => {}
                    Ok(Some(raw)) => match TraceObject::decode(&raw, block_id) {
                        Ok(object) => {
                            for span in object.spans {
                                if seen.insert(span.clone()) {
                                    spans.push(span);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(%block_id, error = %e, "block record undecodable");
                            metrics.failed_blocks += 1;
                        }
                    },
                    Err(e) => {
                        warn!(%block_id, error = %e, "block lookup failed");
                        metrics.failed_blocks += 1;
                    }
                }
            }
        }

        debug!(%trace_id, spans = spans.len(), ?metrics, "trace lookup finished");
        Ok(TraceQueryResult { spans, metrics })
    }

    /// Search one tenant. Frontend behaviour: consult the response cache,
    /// fan sub-searches out over block-id shards and the live ingesters,
    /// merge, sort by descending start time, truncate.
    pub async fn search(&self, tenant: &TenantId, query: &SearchQuery) -> Result<SearchResponse> {
        let cache_key = format!("{tenant}/{}", query.normalized());
        if let Some(traces) = self.search_cache.lock().get(&cache_key) {
            return Ok(SearchResponse {
                traces,
                metrics: SearchMetrics::default(),
                cached: true,
            });
        }

        let mut metrics = SearchMetrics::default();
        let mut merged: Vec<TraceSummary> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Live data: every read-eligible ingester may hold matching traces.
        let now_eligible = self.read_eligible_ingesters();
        let recents = now_eligible.iter().map(|instance| {
            let client = self.pool.client_for(instance);
            let tenant = tenant.clone();
            let query = query.clone();
            async move { client.search_recent(&tenant, &query).await }
        });
        for (instance, outcome) in now_eligible.iter().zip(join_all(recents).await) {
            match outcome {
                Ok(found) => {
                    for summary in found {
                        if seen.insert(summary.trace_id.clone()) {
                            merged.push(summary);
                        }
                    }
                }
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "ingester search failed");
                    metrics.failed_ingesters += 1;
                }
            }
        }

        // Backend data, sharded by block-id range.
        let list = self.blocklists.get(tenant).await?;
        let shards = shard_ranges(self.config.search_shards);
        let scans = shards.iter().map(|(lo, hi)| {
            let metas: Vec<BlockMeta> = list
                .live
                .range(*lo..=*hi)
                .map(|(_, meta)| meta.clone())
                .collect();
            self.search_shard(metas, query)
        });
        for (traces, shard_metrics) in join_all(scans).await {
            metrics.inspected_blocks += shard_metrics.inspected_blocks;
            metrics.failed_blocks += shard_metrics.failed_blocks;
            metrics.inspected_traces += shard_metrics.inspected_traces;
            for summary in traces {
                if seen.insert(summary.trace_id.clone()) {
                    merged.push(summary);
                }
            }
        }

        merged.sort_by(|a, b| b.start_unix_nanos.cmp(&a.start_unix_nanos));
        merged.truncate(query.limit);

        self.search_cache
            .lock()
            .put(cache_key, merged.clone());

        Ok(SearchResponse {
            traces: merged,
            metrics,
            cached: false,
        })
    }

    /// Distinct tag keys across the live ingesters.
    pub async fn tag_names(&self, tenant: &TenantId) -> Result<Vec<String>> {
        let instances = self.read_eligible_ingesters();
        let calls = instances.iter().map(|instance| {
            let client = self.pool.client_for(instance);
            let tenant = tenant.clone();
            async move { client.tag_names(&tenant).await }
        });
        let mut names = std::collections::BTreeSet::new();
        for outcome in join_all(calls).await.into_iter().flatten() {
            names.extend(outcome);
        }
        Ok(names.into_iter().collect())
    }

    /// Distinct values of one tag key across the live ingesters.
    pub async fn tag_values(&self, tenant: &TenantId, key: &str) -> Result<Vec<String>> {
        let instances = self.read_eligible_ingesters();
        let calls = instances.iter().map(|instance| {
            let client = self.pool.client_for(instance);
            let tenant = tenant.clone();
            let key = key.to_owned();
            async move { client.tag_values(&tenant, &key).await }
        });
        let mut values = std::collections::BTreeSet::new();
        for outcome in join_all(calls).await.into_iter().flatten() {
            values.extend(outcome);
        }
        Ok(values.into_iter().collect())
    }

    fn read_eligible_ingesters(&self) -> Vec<ring::InstanceDesc> {
        // An unreadable ring yields an empty fan-out rather than a failed
        // search; blocks still answer.
        let members = match self.ring.members() {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "ring unavailable; skipping ingester fan-out");
                return Vec::new();
            }
        };
        let now = self.time.now();
        let heartbeat_timeout = self.ring.config().heartbeat_timeout;
        members
            .into_iter()
            .filter(|i| i.is_eligible(Operation::Read, now, heartbeat_timeout))
            .collect()
    }

    async fn search_shard(
        &self,
        metas: Vec<BlockMeta>,
        query: &SearchQuery,
    ) -> (Vec<TraceSummary>, SearchMetrics) {
        let mut metrics = SearchMetrics::default();
        let mut out = Vec::new();

        for meta in metas {
            metrics.inspected_blocks += 1;
            let block_id = meta.block_id;
            let reader = block_reader(Arc::clone(&self.store), meta);
            let iter = match reader.iter().await {
                Ok(iter) => iter,
                Err(e) => {
                    warn!(%block_id, error = %e, "block scan failed to open");
                    metrics.failed_blocks += 1;
                    continue;
                }
            };
            let mut iter = PrefetchIterator::new(Box::new(iter), self.config.prefetch_buffer);

            loop {
                match iter.next().await {
                    Ok(Some((trace_id, raw))) => {
                        metrics.inspected_traces += 1;
                        match TraceObject::decode_summary(&raw, block_id) {
                            Ok((attributes, _)) => {
                                if query.matches(&attributes) {
                                    out.push(TraceSummary::from_attributes(trace_id, &attributes));
                                    if out.len() >= query.limit {
                                        iter.close().await;
                                        return (out, metrics);
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(%block_id, error = %e, "record summary undecodable");
                                metrics.failed_blocks += 1;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%block_id, error = %e, "block scan failed");
                        metrics.failed_blocks += 1;
                        break;
                    }
                }
            }
            iter.close().await;
        }
        (out, metrics)
    }
}

/// Split the whole block-id space into `n` contiguous, inclusive ranges.
fn shard_ranges(n: usize) -> Vec<(BlockId, BlockId)> {
    let n = n.max(1) as u128;
    let step = u128::MAX / n;
    (0..n)
        .map(|i| {
            let lo = if i == 0 { 0 } else { i * step + 1 };
            let hi = if i == n - 1 { u128::MAX } else { (i + 1) * step };
            (BlockId::from_u128(lo), BlockId::from_u128(hi))
        })
        .collect()
}
