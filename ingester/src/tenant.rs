//! Per-tenant state: the head block, frozen blocks awaiting upload, and the
//! tenant's WAL handle.

use std::sync::Arc;

use bytes::Bytes;
use data_types::{DataEncoding, SearchQuery, SpanBuffer, TenantId, TraceId, TraceSummary};
use parking_lot::RwLock;
use tracedb_time::Time;

use crate::{
    codec,
    head::{FrozenBlock, HeadBlock},
    IngesterConfig, Result,
};

/// All in-memory and WAL state of one tenant on this instance.
///
/// Structure changes (freezing the head, removing an uploaded block) take
/// the write side of the relevant lock; span appends only touch the head
/// lock briefly. WAL appends serialise on the WAL's own per-tenant mutex.
#[derive(Debug)]
pub(crate) struct TenantShard {
    pub(crate) tenant: TenantId,
    pub(crate) wal: Arc<wal::TenantWal>,
    pub(crate) head: RwLock<HeadBlock>,
    pub(crate) frozen: RwLock<Vec<Arc<FrozenBlock>>>,
}

impl TenantShard {
    pub(crate) fn new(tenant: TenantId, wal: Arc<wal::TenantWal>, encoding: DataEncoding) -> Self {
        Self {
            tenant,
            wal,
            head: RwLock::new(HeadBlock::new(encoding)),
            frozen: RwLock::new(Vec::new()),
        }
    }

    /// Append one span: WAL first (fsynced), then the head block.
    pub(crate) async fn append(
        &self,
        span: &SpanBuffer,
        encoding: &DataEncoding,
        now: Time,
    ) -> Result<()> {
        let entry = codec::encode_span_entry(&span.payload, &span.attributes, encoding);
        self.wal.append(span.trace_id, &entry).await?;
        let mut head = self.head.write();
        head.encoding = encoding.clone();
        head.append(span.trace_id, span.payload.clone(), &span.attributes, now);
        Ok(())
    }

    /// Restore one span into the head without touching the WAL; used by
    /// replay, where the record is already durable.
    pub(crate) fn restore(
        &self,
        trace_id: TraceId,
        payload: Bytes,
        attributes: &data_types::SpanAttributes,
        now: Time,
    ) {
        self.head.write().append(trace_id, payload, attributes, now);
    }

    /// Freeze the head block if a cut trigger fires (or unconditionally with
    /// `force`), rotating the WAL so the frozen block owns its segments.
    pub(crate) async fn maybe_freeze(
        &self,
        config: &IngesterConfig,
        now: Time,
        force: bool,
    ) -> Result<Option<Arc<FrozenBlock>>> {
        {
            let head = self.head.read();
            let due = force
                || head.should_cut(
                    now,
                    config.trace_idle_period,
                    config.max_block_bytes,
                    config.max_block_duration,
                );
            if !due || head.is_empty() {
                return Ok(None);
            }
        }

        // Rotate first: everything in the head is in segments that are
        // closed after this call, and new writes land in the fresh open
        // segment, owned by the next freeze. Segments already owned by an
        // earlier frozen block still awaiting upload are excluded.
        self.wal.rotate().await?;
        let owned: std::collections::HashSet<wal::SegmentId> = self
            .frozen
            .read()
            .iter()
            .flat_map(|b| b.segments.iter().copied())
            .collect();
        let segments = self
            .wal
            .closed_segments()
            .iter()
            .map(|s| s.id())
            .filter(|id| !owned.contains(id))
            .collect::<Vec<_>>();

        let frozen = {
            let mut head = self.head.write();
            let encoding = head.encoding.clone();
            let taken = std::mem::replace(&mut *head, HeadBlock::new(encoding));
            Arc::new(FrozenBlock::from_head(taken, segments, now))
        };
        self.frozen.write().push(Arc::clone(&frozen));
        Ok(Some(frozen))
    }

    /// Drop an uploaded frozen block and delete the WAL segments it owned.
    pub(crate) async fn release_frozen(&self, block: &Arc<FrozenBlock>) -> Result<()> {
        for segment in &block.segments {
            match self.wal.delete(*segment).await {
                Ok(()) => {}
                // Another freeze may share an ancestor segment list after a
                // replay; a segment already gone is fine.
                Err(wal::Error::SegmentNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.frozen.write().retain(|b| !Arc::ptr_eq(b, block));
        Ok(())
    }

    /// Span payloads of `trace_id` across the head and frozen blocks.
    pub(crate) fn find_trace(&self, trace_id: TraceId) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(trace) = self.head.read().traces.get(&trace_id) {
            out.extend(trace.spans.iter().cloned());
        }
        for frozen in &*self.frozen.read() {
            if let Some(spans) = frozen.find(trace_id) {
                out.extend(spans);
            }
        }
        out
    }

    /// Evaluate a search over the attribute rollups of everything still on
    /// this instance.
    pub(crate) fn search(&self, query: &SearchQuery) -> Vec<TraceSummary> {
        let mut out = Vec::new();
        {
            let head = self.head.read();
            for (trace_id, trace) in &head.traces {
                if query.matches(&trace.attributes) {
                    out.push(TraceSummary::from_attributes(*trace_id, &trace.attributes));
                }
                if out.len() >= query.limit {
                    return out;
                }
            }
        }
        for frozen in &*self.frozen.read() {
            for (trace_id, _, attributes) in &frozen.records {
                if query.matches(attributes) {
                    out.push(TraceSummary::from_attributes(*trace_id, attributes));
                }
                if out.len() >= query.limit {
                    return out;
                }
            }
        }
        out
    }

    /// Distinct tag keys seen in live data.
    pub(crate) fn tag_names(&self) -> Vec<String> {
        let mut names = std::collections::BTreeSet::new();
        for trace in self.head.read().traces.values() {
            for (k, _) in &trace.attributes.tags {
                names.insert(k.clone());
            }
        }
        for frozen in &*self.frozen.read() {
            for (_, _, attributes) in &frozen.records {
                for (k, _) in &attributes.tags {
                    names.insert(k.clone());
                }
            }
        }
        names.into_iter().collect()
    }

    /// Distinct values of tag `key` seen in live data.
    pub(crate) fn tag_values(&self, key: &str) -> Vec<String> {
        let mut values = std::collections::BTreeSet::new();
        let collect = |attrs: &data_types::TraceAttributes, values: &mut std::collections::BTreeSet<String>| {
            for (k, v) in &attrs.tags {
                if k.eq_ignore_ascii_case(key) {
                    values.insert(v.clone());
                }
            }
        };
        for trace in self.head.read().traces.values() {
            collect(&trace.attributes, &mut values);
        }
        for frozen in &*self.frozen.read() {
            for (_, _, attributes) in &frozen.records {
                collect(attributes, &mut values);
            }
        }
        values.into_iter().collect()
    }

    /// Frozen blocks whose completion timeout has elapsed at `now`.
    pub(crate) fn frozen_due(&self, now: Time, timeout: std::time::Duration, force: bool) -> Vec<Arc<FrozenBlock>> {
        self.frozen
            .read()
            .iter()
            .filter(|b| force || now.absolute_difference(b.cut_at) >= timeout)
            .map(Arc::clone)
            .collect()
    }
}
