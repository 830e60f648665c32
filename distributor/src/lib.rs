//! The distributor: entry point of the write path.
//!
//! A span batch is validated, rate limited, grouped by trace id, and
//! mirrored to the replication set the ring selects for each trace. One
//! outbound request per ingester carries all spans destined for it. The
//! batch is acknowledged only once every trace in it has reached its write
//! quorum within the configured timeout; anything less surfaces as a
//! retryable error carrying the failing instances.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

mod client;
mod limiter;

pub use client::{ClientError, ClientPool, IngesterClient, MockClientPool, MockIngesterClient};

use std::{sync::Arc, time::Duration};

use data_types::{ClassifiedError, FailureDomain, SpanBatch, TenantId, TraceId};
use futures::future::join_all;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};
use ring::{hash_trace_key, Operation, Ring};
use thiserror::Error;
use tracedb_time::TimeProvider;

use crate::limiter::TenantLimiter;

/// Distributor tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DistributorConfig {
    /// Largest cumulative payload a single trace may contribute per batch.
    pub max_bytes_per_trace: usize,

    /// Deadline for collecting write acknowledgements for one batch.
    pub write_timeout: Duration,

    /// Sustained per-tenant ingest rate, bytes per second.
    pub rate_bytes_per_sec: usize,

    /// Token bucket burst size, bytes.
    pub rate_burst_bytes: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_trace: 5 * 1024 * 1024,
            write_timeout: Duration::from_secs(5),
            rate_bytes_per_sec: 15 * 1024 * 1024,
            rate_burst_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Errors returned by [`Distributor::push`].
#[derive(Debug, Error)]
pub enum Error {
    /// A single trace in the batch exceeds the per-trace byte limit.
    #[error("trace {trace_id} carries {bytes} bytes, above the {limit} byte limit")]
    TraceTooLarge {
        /// The offending trace.
        trace_id: TraceId,
        /// Bytes the trace contributed to the batch.
        bytes: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The tenant is over its ingest rate.
    #[error("tenant {tenant} exceeds its ingest rate limit")]
    RateLimited {
        /// The tenant concerned.
        tenant: TenantId,
    },

    /// The ring could not provide a writable replication set.
    #[error(transparent)]
    Ring(#[from] ring::Error),

    /// Not enough replicas acknowledged within the deadline.
    #[error(
        "quorum unmet: trace {trace_id} acknowledged by {acked} of {required} required replicas \
         (failing: {failing:?})"
    )]
    QuorumUnmet {
        /// A trace that missed its quorum (the first encountered).
        trace_id: TraceId,
        /// Acknowledgements received for it.
        acked: usize,
        /// Acknowledgements required.
        required: usize,
        /// Instances that failed or timed out, for the caller's backoff
        /// bookkeeping.
        failing: Vec<String>,
    },
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::TraceTooLarge { .. } => FailureDomain::Validation,
            Self::RateLimited { .. } => FailureDomain::Capacity,
            Self::Ring(e) => e.domain(),
            Self::QuorumUnmet { .. } => FailureDomain::Transient,
        }
    }
}

/// A specialised `Result` for distributor errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Routes validated span batches to their owning ingesters.
#[derive(Debug)]
pub struct Distributor {
    ring: Arc<Ring>,
    pool: Arc<dyn ClientPool>,
    config: DistributorConfig,
    limiter: TenantLimiter,
}

impl Distributor {
    /// Construct a distributor over `ring`, dialling ingesters through
    /// `pool`.
    pub fn new(
        ring: Arc<Ring>,
        pool: Arc<dyn ClientPool>,
        config: DistributorConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let limiter = TenantLimiter::new(
            config.rate_bytes_per_sec as f64,
            config.rate_burst_bytes as f64,
            time,
        );
        Self {
            ring,
            pool,
            config,
            limiter,
        }
    }

    /// Push one batch with quorum-write semantics.
    pub async fn push(&self, batch: SpanBatch) -> Result<()> {
        if batch.spans.is_empty() {
            return Ok(());
        }
        let tenant = batch.tenant.clone();

        // Validate per-trace size before consuming rate budget.
        let mut per_trace_bytes: HashMap<TraceId, usize> = HashMap::new();
        for span in &batch.spans {
            *per_trace_bytes.entry(span.trace_id).or_default() += span.size();
        }
        for (trace_id, bytes) in &per_trace_bytes {
            if *bytes > self.config.max_bytes_per_trace {
                return Err(Error::TraceTooLarge {
                    trace_id: *trace_id,
                    bytes: *bytes,
                    limit: self.config.max_bytes_per_trace,
                });
            }
        }

        if !self.limiter.try_consume(&tenant, batch.total_bytes()) {
            return Err(Error::RateLimited { tenant });
        }

        // Resolve each trace's replication set, and build one outbound batch
        // per ingester carrying all spans destined for it.
        let mut trace_replicas: HashMap<TraceId, (Vec<String>, usize)> = HashMap::new();
        let mut per_instance: HashMap<String, (ring::InstanceDesc, SpanBatch)> = HashMap::new();

        for span in batch.spans {
            let key = hash_trace_key(&tenant, span.trace_id);
            let (replicas, _) = match trace_replicas.entry(span.trace_id) {
                hashbrown::hash_map::Entry::Occupied(e) => e.into_mut(),
                hashbrown::hash_map::Entry::Vacant(e) => {
                    let set = self.ring.get(key, Operation::Write)?;
                    let ids = set.instances.iter().map(|i| i.id.clone()).collect();
                    for instance in &set.instances {
                        per_instance
                            .entry(instance.id.clone())
                            .or_insert_with(|| {
                                (
                                    instance.clone(),
                                    SpanBatch {
                                        tenant: tenant.clone(),
                                        encoding: batch.encoding.clone(),
                                        spans: Vec::new(),
                                    },
                                )
                            });
                    }
                    e.insert((ids, set.quorum))
                }
            };
            for instance_id in replicas.clone() {
                per_instance
                    .get_mut(&instance_id)
                    .expect("replica batch initialised above")
                    .1
                    .spans
                    .push(span.clone());
            }
        }

        // Fan out concurrently, each request bounded by the write timeout.
        let mut requests = Vec::with_capacity(per_instance.len());
        let mut instance_ids = Vec::with_capacity(per_instance.len());
        for (instance_id, (instance, outbound)) in per_instance {
            let client = self.pool.client_for(&instance);
            let timeout = self.config.write_timeout;
            instance_ids.push(instance_id);
            requests.push(async move {
                match tokio::time::timeout(timeout, client.push(outbound)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("write timeout".to_owned()),
                }
            });
        }

        let outcomes = join_all(requests).await;
        let mut acked: std::collections::HashSet<&str> = Default::default();
        let mut failing = Vec::new();
        for (instance_id, outcome) in instance_ids.iter().zip(&outcomes) {
            match outcome {
                Ok(()) => {
                    acked.insert(instance_id.as_str());
                }
                Err(reason) => {
                    warn!(instance = %instance_id, %reason, "ingester write failed");
                    failing.push(instance_id.clone());
                }
            }
        }

        // Every trace must have reached its quorum. The quorum requirement
        // is derived from the replication factor, never from however many
        // replicas happened to be reachable.
        for (trace_id, (replicas, required)) in &trace_replicas {
            let got = replicas
                .iter()
                .filter(|r| acked.contains(r.as_str()))
                .count();
            if got < *required {
                return Err(Error::QuorumUnmet {
                    trace_id: *trace_id,
                    acked: got,
                    required: *required,
                    failing,
                });
            }
        }

        debug!(
            tenant = %tenant,
            traces = trace_replicas.len(),
            ingesters = instance_ids.len(),
            "batch acknowledged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use data_types::{DataEncoding, SpanAttributes, SpanBuffer};
    use ring::{Lifecycler, MemKv, RingConfig};
    use tracedb_time::{MockProvider, Time};

    fn tenant() -> TenantId {
        TenantId::new("single-tenant").unwrap()
    }

    fn span(trace: u8, payload: &str) -> SpanBuffer {
        SpanBuffer {
            trace_id: TraceId::from_bytes([trace; 16]),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            attributes: SpanAttributes::default(),
        }
    }

    fn batch(spans: Vec<SpanBuffer>) -> SpanBatch {
        SpanBatch {
            tenant: tenant(),
            encoding: DataEncoding::default(),
            spans,
        }
    }

    struct Cluster {
        ring: Arc<Ring>,
        pool: Arc<MockClientPool>,
        time: Arc<MockProvider>,
        // Held so the instances keep their ring entries for the test's
        // duration.
        _handles: Vec<ring::LifecyclerHandle>,
    }

    async fn cluster(n: usize, replication_factor: usize) -> Cluster {
        let kv = MemKv::new();
        let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let config = RingConfig {
            replication_factor,
            tenant_shard_size: replication_factor,
            tokens_per_instance: 8,
            ..Default::default()
        };

        let pool = Arc::new(MockClientPool::default());
        let mut handles = Vec::new();
        for i in 0..n {
            let handle = Lifecycler {
                instance_id: format!("ingester-{i}"),
                addr: format!("ingester-{i}:9095"),
                zone: "zone-a".into(),
            }
            .register(Arc::clone(&kv) as _, config, None, Arc::clone(&time) as _)
            .await
            .unwrap();
            handle.set_active().await.unwrap();
            pool.add(format!("ingester-{i}"), MockIngesterClient::default());
            handles.push(handle);
        }

        let ring = Ring::new(kv, config, Arc::clone(&time) as _).await.unwrap();
        ring.refresh().await.unwrap();
        Cluster {
            ring,
            pool,
            time,
            _handles: handles,
        }
    }

    #[tokio::test]
    async fn replicates_to_full_replication_set() {
        let c = cluster(3, 3).await;
        let distributor = Distributor::new(
            Arc::clone(&c.ring),
            Arc::clone(&c.pool) as _,
            DistributorConfig::default(),
            Arc::clone(&c.time) as _,
        );

        distributor
            .push(batch(vec![span(1, "a"), span(1, "b"), span(2, "c")]))
            .await
            .unwrap();

        // With R = 3 and 3 ingesters, every ingester saw both traces.
        for i in 0..3 {
            let calls = c.pool.client(&format!("ingester-{i}")).calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].spans.len(), 3);
        }
    }

    #[tokio::test]
    async fn one_failing_replica_is_tolerated() {
        let c = cluster(3, 3).await;
        c.pool.client("ingester-1").fail_next(1);

        let distributor = Distributor::new(
            Arc::clone(&c.ring),
            Arc::clone(&c.pool) as _,
            DistributorConfig::default(),
            Arc::clone(&c.time) as _,
        );

        // Quorum for R=3 is 2; one failure still acknowledges.
        distributor.push(batch(vec![span(1, "a")])).await.unwrap();
    }

    #[tokio::test]
    async fn two_failing_replicas_surface_as_retryable() {
        let c = cluster(3, 3).await;
        c.pool.client("ingester-0").fail_next(1);
        c.pool.client("ingester-1").fail_next(1);

        let distributor = Distributor::new(
            Arc::clone(&c.ring),
            Arc::clone(&c.pool) as _,
            DistributorConfig::default(),
            Arc::clone(&c.time) as _,
        );

        let err = distributor.push(batch(vec![span(1, "a")])).await.unwrap_err();
        assert_matches::assert_matches!(
            &err,
            Error::QuorumUnmet { acked: 1, required: 2, failing, .. } => {
                assert_eq!(failing.len(), 2);
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn oversized_trace_is_rejected_without_sending() {
        let c = cluster(3, 3).await;
        let config = DistributorConfig {
            max_bytes_per_trace: 8,
            ..Default::default()
        };
        let distributor = Distributor::new(
            Arc::clone(&c.ring),
            Arc::clone(&c.pool) as _,
            config,
            Arc::clone(&c.time) as _,
        );

        let err = distributor
            .push(batch(vec![span(1, "four"), span(1, "chars and more")]))
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, Error::TraceTooLarge { .. });
        assert!(!err.is_retryable());
        assert!(c.pool.client("ingester-0").calls().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_applies_per_tenant() {
        let c = cluster(3, 3).await;
        let config = DistributorConfig {
            rate_bytes_per_sec: 10,
            rate_burst_bytes: 10,
            ..Default::default()
        };
        let distributor = Distributor::new(
            Arc::clone(&c.ring),
            Arc::clone(&c.pool) as _,
            config,
            Arc::clone(&c.time) as _,
        );

        distributor
            .push(batch(vec![span(1, "0123456789")]))
            .await
            .unwrap();
        let err = distributor
            .push(batch(vec![span(2, "x")]))
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, Error::RateLimited { .. });

        // Refill after a second of simulated time.
        c.time.inc(Duration::from_secs(1));
        distributor.push(batch(vec![span(2, "x")])).await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_mid_request_does_not_downgrade_quorum() {
        // R=3 but only 2 instances are up: the ring still yields a set with
        // quorum 2, and if one of those 2 fails the push must error.
        let c = cluster(2, 3).await;
        c.pool.client("ingester-1").fail_next(1);

        let distributor = Distributor::new(
            Arc::clone(&c.ring),
            Arc::clone(&c.pool) as _,
            DistributorConfig::default(),
            Arc::clone(&c.time) as _,
        );

        let err = distributor.push(batch(vec![span(1, "a")])).await.unwrap_err();
        assert_matches::assert_matches!(err, Error::QuorumUnmet { acked: 1, required: 2, .. });
    }
}
