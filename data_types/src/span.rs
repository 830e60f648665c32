//! Span batches and the pre-extracted attributes that travel with them.

use bytes::Bytes;

use crate::{DataEncoding, TenantId, TraceId};

/// Attributes a receiver shim extracts from a span before handing it to the
/// core. The core never decodes `payload` bytes; search predicates are
/// evaluated against these fields only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanAttributes {
    /// Name of the service the span belongs to.
    pub service_name: String,

    /// Operation name of the span.
    pub span_name: String,

    /// Span start, nanoseconds since the unix epoch.
    pub start_unix_nanos: u64,

    /// Span duration in nanoseconds.
    pub duration_nanos: u64,

    /// Whether the span carries an error status.
    pub error: bool,

    /// Flat `key=value` attribute pairs from the span and its process.
    pub tags: Vec<(String, String)>,
}

impl SpanAttributes {
    /// Span end, nanoseconds since the unix epoch (saturating).
    pub fn end_unix_nanos(&self) -> u64 {
        self.start_unix_nanos.saturating_add(self.duration_nanos)
    }
}

/// A single span: an opaque payload plus the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBuffer {
    /// The trace this span belongs to.
    pub trace_id: TraceId,

    /// The encoded span bytes. Opaque to the core.
    pub payload: Bytes,

    /// Pre-extracted attributes used for search.
    pub attributes: SpanAttributes,
}

impl SpanBuffer {
    /// Approximate in-memory / on-wire size of this span.
    pub fn size(&self) -> usize {
        self.payload.len()
            + self.attributes.service_name.len()
            + self.attributes.span_name.len()
            + self
                .attributes
                .tags
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A batch of spans pushed by one caller. Spans in a batch may belong to
/// different traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBatch {
    /// Tenant the batch belongs to.
    pub tenant: TenantId,

    /// How `payload` bytes are encoded.
    pub encoding: DataEncoding,

    /// The spans.
    pub spans: Vec<SpanBuffer>,
}

impl SpanBatch {
    /// Total payload bytes across all spans.
    pub fn total_bytes(&self) -> usize {
        self.spans.iter().map(|s| s.size()).sum()
    }

    /// Number of spans in the batch.
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }
}

/// Rolled-up attributes for one trace, maintained incrementally as spans
/// arrive and stored alongside the trace bytes in blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceAttributes {
    /// Service name of the earliest-starting span observed so far.
    pub root_service_name: String,

    /// Operation name of the earliest-starting span observed so far.
    pub root_span_name: String,

    /// Earliest span start, nanoseconds since the unix epoch.
    pub start_unix_nanos: u64,

    /// Latest span end, nanoseconds since the unix epoch.
    pub end_unix_nanos: u64,

    /// Whether any span carried an error status.
    pub error: bool,

    /// Union of all span tag pairs, sorted and deduplicated.
    pub tags: Vec<(String, String)>,
}

impl TraceAttributes {
    /// Fold one span's attributes into the rollup.
    pub fn merge_span(&mut self, span: &SpanAttributes) {
        let first = self.start_unix_nanos == 0 && self.end_unix_nanos == 0;
        if first || span.start_unix_nanos < self.start_unix_nanos {
            self.start_unix_nanos = span.start_unix_nanos;
            self.root_service_name = span.service_name.clone();
            self.root_span_name = span.span_name.clone();
        }
        self.end_unix_nanos = self.end_unix_nanos.max(span.end_unix_nanos());
        self.error |= span.error;
        for pair in &span.tags {
            if let Err(at) = self.tags.binary_search(pair) {
                self.tags.insert(at, pair.clone());
            }
        }
    }

    /// Fold another rollup into this one. The earliest root wins, matching
    /// the per-span merge order-independently.
    pub fn merge(&mut self, other: &TraceAttributes) {
        let first = self.start_unix_nanos == 0 && self.end_unix_nanos == 0;
        if first || other.start_unix_nanos < self.start_unix_nanos {
            self.start_unix_nanos = other.start_unix_nanos;
            self.root_service_name = other.root_service_name.clone();
            self.root_span_name = other.root_span_name.clone();
        }
        self.end_unix_nanos = self.end_unix_nanos.max(other.end_unix_nanos);
        self.error |= other.error;
        for pair in &other.tags {
            if let Err(at) = self.tags.binary_search(pair) {
                self.tags.insert(at, pair.clone());
            }
        }
    }

    /// Trace duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.end_unix_nanos.saturating_sub(self.start_unix_nanos) / 1_000_000
    }
}

/// A search result row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TraceSummary {
    /// Hex trace id.
    pub trace_id: String,

    /// Root span's service name.
    pub root_service_name: String,

    /// Root span's operation name.
    pub root_span_name: String,

    /// Trace start, nanoseconds since the unix epoch.
    pub start_unix_nanos: u64,

    /// Trace duration in milliseconds.
    pub duration_ms: u64,
}

impl TraceSummary {
    /// Build a summary row from a trace id and its attribute rollup.
    pub fn from_attributes(trace_id: TraceId, attrs: &TraceAttributes) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            root_service_name: attrs.root_service_name.clone(),
            root_span_name: attrs.root_span_name.clone(),
            start_unix_nanos: attrs.start_unix_nanos,
            duration_ms: attrs.duration_ms(),
        }
    }
}
