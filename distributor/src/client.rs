//! The outbound seam between the distributor and ingesters.
//!
//! Real deployments dial ingesters over the wire through a shim that
//! implements [`IngesterClient`]; tests (and single-process deployments)
//! wire the ingester in directly. The distributor only ever sees the trait.

use std::{collections::VecDeque, fmt, sync::Arc};

use async_trait::async_trait;
use data_types::SpanBatch;
use hashbrown::HashMap;
use ring::InstanceDesc;
use thiserror::Error;

/// Failure pushing one batch to one ingester.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The ingester could not be reached or died mid-request.
    #[error("ingester unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason.
        reason: String,
    },

    /// The ingester is shedding load; retry after backoff.
    #[error("ingester over capacity: {reason}")]
    OverCapacity {
        /// Human-readable reason.
        reason: String,
    },

    /// The ingester rejected the batch outright.
    #[error("ingester rejected batch: {reason}")]
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
}

/// One dialable ingester.
#[async_trait]
pub trait IngesterClient: Send + Sync + fmt::Debug {
    /// Push a batch of spans; returning `Ok` means the ingester has the
    /// records durable in its WAL.
    async fn push(&self, batch: SpanBatch) -> Result<(), ClientError>;
}

/// Resolves ring entries to dialable clients.
pub trait ClientPool: Send + Sync + fmt::Debug {
    /// The client for `instance`. Implementations typically cache
    /// connections keyed by `instance.addr`.
    fn client_for(&self, instance: &InstanceDesc) -> Arc<dyn IngesterClient>;
}

#[derive(Debug, Default)]
struct MockClientState {
    calls: Vec<SpanBatch>,
    fail_next: VecDeque<()>,
}

/// Test double recording pushed batches, with scriptable failures.
#[derive(Debug, Default)]
pub struct MockIngesterClient {
    state: parking_lot::Mutex<MockClientState>,
}

impl MockIngesterClient {
    /// Batches pushed so far.
    pub fn calls(&self) -> Vec<SpanBatch> {
        self.state.lock().calls.clone()
    }

    /// Make the next `n` pushes fail as unavailable.
    pub fn fail_next(&self, n: usize) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.fail_next.push_back(());
        }
    }
}

#[async_trait]
impl IngesterClient for MockIngesterClient {
    async fn push(&self, batch: SpanBatch) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.fail_next.pop_front().is_some() {
            return Err(ClientError::Unavailable {
                reason: "scripted failure".into(),
            });
        }
        state.calls.push(batch);
        Ok(())
    }
}

/// [`ClientPool`] over a fixed set of [`MockIngesterClient`]s.
#[derive(Debug, Default)]
pub struct MockClientPool {
    clients: parking_lot::Mutex<HashMap<String, Arc<MockIngesterClient>>>,
}

impl MockClientPool {
    /// Register the client for `instance_id`.
    pub fn add(&self, instance_id: String, client: MockIngesterClient) {
        self.clients.lock().insert(instance_id, Arc::new(client));
    }

    /// The registered client for `instance_id`.
    ///
    /// # Panics
    ///
    /// If no client was registered under that id.
    pub fn client(&self, instance_id: &str) -> Arc<MockIngesterClient> {
        Arc::clone(
            self.clients
                .lock()
                .get(instance_id)
                .expect("no mock client registered for instance"),
        )
    }
}

impl ClientPool for MockClientPool {
    fn client_for(&self, instance: &InstanceDesc) -> Arc<dyn IngesterClient> {
        self.client(&instance.id)
    }
}
