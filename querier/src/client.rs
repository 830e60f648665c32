//! The read-path seam between queriers and ingesters.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{SearchQuery, TenantId, TraceId, TraceSummary};
use ring::InstanceDesc;
use thiserror::Error;

/// Failure querying one ingester. Always treated as partial: the rest of
/// the scatter-gather proceeds.
#[derive(Debug, Error)]
#[error("ingester query failed: {reason}")]
pub struct ClientError {
    /// Human-readable reason.
    pub reason: String,
}

/// The read interface one ingester exposes to queriers.
#[async_trait]
pub trait IngesterQueryClient: Send + Sync + fmt::Debug {
    /// Span payloads of `trace_id` still held in memory or in frozen blocks
    /// on the ingester.
    async fn find_trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: TraceId,
    ) -> Result<Vec<Bytes>, ClientError>;

    /// Search the ingester's recent-trace attribute cache.
    async fn search_recent(
        &self,
        tenant: &TenantId,
        query: &SearchQuery,
    ) -> Result<Vec<TraceSummary>, ClientError>;

    /// Distinct tag keys in recent traces.
    async fn tag_names(&self, tenant: &TenantId) -> Result<Vec<String>, ClientError>;

    /// Distinct values of one tag key in recent traces.
    async fn tag_values(&self, tenant: &TenantId, key: &str)
        -> Result<Vec<String>, ClientError>;
}

/// Resolves ring entries to dialable query clients.
pub trait QueryClientPool: Send + Sync + fmt::Debug {
    /// The client for `instance`.
    fn client_for(&self, instance: &InstanceDesc) -> Arc<dyn IngesterQueryClient>;
}
