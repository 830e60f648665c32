//! The in-memory head block: the mutable accumulation of live traces.

use bytes::Bytes;
use data_types::{DataEncoding, SpanAttributes, TraceAttributes, TraceId};
use hashbrown::HashMap;
use tracedb_time::Time;

/// One live trace in the head block.
#[derive(Debug, Clone)]
pub(crate) struct LiveTrace {
    /// Raw span payloads in arrival order.
    pub(crate) spans: Vec<Bytes>,

    /// Attribute rollup maintained as spans arrive.
    pub(crate) attributes: TraceAttributes,

    /// Payload bytes held for this trace.
    pub(crate) bytes: usize,
}

/// The head block of one tenant.
#[derive(Debug)]
pub(crate) struct HeadBlock {
    pub(crate) traces: HashMap<TraceId, LiveTrace>,
    pub(crate) encoding: DataEncoding,
    pub(crate) bytes: usize,
    pub(crate) first_write: Option<Time>,
    pub(crate) last_write: Option<Time>,
}

impl HeadBlock {
    pub(crate) fn new(encoding: DataEncoding) -> Self {
        Self {
            traces: HashMap::new(),
            encoding,
            bytes: 0,
            first_write: None,
            last_write: None,
        }
    }

    /// Append one span to its trace.
    pub(crate) fn append(
        &mut self,
        trace_id: TraceId,
        payload: Bytes,
        attributes: &SpanAttributes,
        now: Time,
    ) {
        let size = payload.len();
        let trace = self.traces.entry(trace_id).or_insert_with(|| LiveTrace {
            spans: Vec::new(),
            attributes: TraceAttributes::default(),
            bytes: 0,
        });
        trace.attributes.merge_span(attributes);
        trace.spans.push(payload);
        trace.bytes += size;

        self.bytes += size;
        self.first_write.get_or_insert(now);
        self.last_write = Some(now);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Whether any cut trigger fires at `now`.
    pub(crate) fn should_cut(
        &self,
        now: Time,
        trace_idle_period: std::time::Duration,
        max_block_bytes: usize,
        max_block_duration: std::time::Duration,
    ) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.bytes >= max_block_bytes {
            return true;
        }
        if let Some(first) = self.first_write {
            if now.absolute_difference(first) > max_block_duration {
                return true;
            }
        }
        if let Some(last) = self.last_write {
            if now.absolute_difference(last) > trace_idle_period {
                return true;
            }
        }
        false
    }
}

/// A frozen head block: immutable, sorted, awaiting upload.
#[derive(Debug)]
pub(crate) struct FrozenBlock {
    /// Records sorted by trace id: `(id, encoded trace object, rollup)`.
    pub(crate) records: Vec<(TraceId, Bytes, TraceAttributes)>,

    /// Encoding tag shared by the records.
    pub(crate) encoding: DataEncoding,

    /// WAL segments covering exactly these traces; deletable once the block
    /// meta is durable in the backend.
    pub(crate) segments: Vec<wal::SegmentId>,

    /// When the freeze happened; the upload starts after the completion
    /// timeout elapses.
    pub(crate) cut_at: Time,

    /// Span time range covered, as unix nanos.
    pub(crate) start_unix_nanos: u64,
    pub(crate) end_unix_nanos: u64,

    /// Total payload bytes, for logging.
    pub(crate) bytes: usize,
}

impl FrozenBlock {
    /// Freeze `head`: sort its traces by id and encode each as a trace
    /// object.
    pub(crate) fn from_head(head: HeadBlock, segments: Vec<wal::SegmentId>, cut_at: Time) -> Self {
        let encoding = head.encoding.clone();
        let bytes = head.bytes;

        let mut start = u64::MAX;
        let mut end = 0u64;
        let mut records: Vec<(TraceId, Bytes, TraceAttributes)> = head
            .traces
            .into_iter()
            .map(|(id, trace)| {
                start = start.min(trace.attributes.start_unix_nanos);
                end = end.max(trace.attributes.end_unix_nanos);
                let object = block_store::TraceObject {
                    attributes: trace.attributes.clone(),
                    encoding: encoding.clone(),
                    spans: trace.spans,
                }
                .encode();
                (id, object, trace.attributes)
            })
            .collect();
        records.sort_by_key(|(id, _, _)| *id);

        Self {
            records,
            encoding,
            segments,
            cut_at,
            start_unix_nanos: if start == u64::MAX { 0 } else { start },
            end_unix_nanos: end,
            bytes,
        }
    }

    /// Span payloads of `trace_id`, if stored here.
    pub(crate) fn find(&self, trace_id: TraceId) -> Option<Vec<Bytes>> {
        let i = self
            .records
            .binary_search_by(|(id, _, _)| id.cmp(&trace_id))
            .ok()?;
        let object = block_store::TraceObject::decode(
            &self.records[i].1,
            data_types::BlockId::ZERO,
        )
        .ok()?;
        Some(object.spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn span_attrs(start: u64) -> SpanAttributes {
        SpanAttributes {
            service_name: "svc".into(),
            span_name: "op".into(),
            start_unix_nanos: start,
            duration_nanos: 1_000,
            error: false,
            tags: vec![],
        }
    }

    fn id(n: u8) -> TraceId {
        TraceId::from_bytes([n; 16])
    }

    #[test]
    fn cut_triggers() {
        let idle = Duration::from_secs(10);
        let max_bytes = 100;
        let max_age = Duration::from_secs(60);

        let t0 = Time::from_timestamp_millis(0);
        let mut head = HeadBlock::new(DataEncoding::default());
        assert!(!head.should_cut(t0, idle, max_bytes, max_age));

        head.append(id(1), Bytes::from_static(b"x"), &span_attrs(1), t0);

        // Nothing fires immediately.
        assert!(!head.should_cut(t0, idle, max_bytes, max_age));

        // Idle trigger.
        assert!(head.should_cut(t0 + Duration::from_secs(11), idle, max_bytes, max_age));

        // Size trigger.
        head.append(id(1), Bytes::from(vec![0u8; 128]), &span_attrs(2), t0);
        assert!(head.should_cut(t0, idle, max_bytes, max_age));

        // Age trigger fires even with recent writes.
        let mut head = HeadBlock::new(DataEncoding::default());
        head.append(id(1), Bytes::from_static(b"x"), &span_attrs(1), t0);
        let later = t0 + Duration::from_secs(61);
        head.append(id(1), Bytes::from_static(b"y"), &span_attrs(2), later);
        assert!(head.should_cut(later, idle, max_bytes, max_age));
    }

    #[test]
    fn freeze_sorts_and_merges_per_trace() {
        let t0 = Time::from_timestamp_millis(0);
        let mut head = HeadBlock::new(DataEncoding::default());
        head.append(id(9), Bytes::from_static(b"late"), &span_attrs(500), t0);
        head.append(id(3), Bytes::from_static(b"a"), &span_attrs(100), t0);
        head.append(id(3), Bytes::from_static(b"b"), &span_attrs(200), t0);

        let frozen = FrozenBlock::from_head(head, vec![], t0);
        let ids: Vec<_> = frozen.records.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![id(3), id(9)]);

        assert_eq!(
            frozen.find(id(3)).unwrap(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        assert_eq!(frozen.start_unix_nanos, 100);
        assert_eq!(frozen.end_unix_nanos, 500 + 1_000);
        assert!(frozen.find(id(4)).is_none());
    }
}
