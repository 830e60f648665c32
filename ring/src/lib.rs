//! Consistent-hash membership ring.
//!
//! Every participating instance owns a set of random `u32` tokens. A key is
//! hashed onto the same `u32` space and its replicas are the instances owning
//! the next R distinct tokens clockwise from the hash. Membership lives in a
//! shared key-value document ([`RingKv`]); each instance writes only its own
//! entry, so concurrent updates conflict only at the CAS level, never
//! semantically.
//!
//! Two rings run in a deployment: the ingester ring keyed by
//! `hash(tenant ++ trace id)` for write/read routing, and the compactor ring
//! keyed by `hash(tenant)` for single-owner job scheduling. Both use this
//! crate; the key function is the caller's.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs
)]

mod kv;
mod lifecycler;
mod ring;
mod state;

pub use kv::{KvError, MemKv, RingKv, Versioned};
pub use lifecycler::{Lifecycler, LifecyclerHandle};
pub use ring::{hash_tenant, hash_trace_key, quorum, Operation, ReplicationSet, Ring};
pub use state::{InstanceDesc, InstanceState, RingDesc};

use std::time::Duration;

use data_types::{ClassifiedError, FailureDomain};
use thiserror::Error;

/// Ring tuning knobs. One instance of this config is shared by the read view
/// ([`Ring`]) and the writer ([`Lifecycler`]).
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// How many instances each key is replicated to.
    pub replication_factor: usize,

    /// How many instances a single tenant's writes may spread over. Must be
    /// at least `replication_factor`.
    pub tenant_shard_size: usize,

    /// Number of tokens each instance claims on first join.
    pub tokens_per_instance: usize,

    /// How often an instance refreshes its own heartbeat.
    pub heartbeat_period: Duration,

    /// Heartbeats older than this mark an instance unhealthy.
    pub heartbeat_timeout: Duration,

    /// Unhealthy entries older than this are removed from the ring and their
    /// tokens released.
    pub autoforget_unhealthy: Duration,

    /// A locally cached ring older than this makes the instance refuse to
    /// serve rather than route on stale ownership.
    pub staleness_limit: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            tenant_shard_size: 3,
            tokens_per_instance: 128,
            heartbeat_period: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            autoforget_unhealthy: Duration::from_secs(600),
            staleness_limit: Duration::from_secs(120),
        }
    }
}

impl RingConfig {
    /// Reject configurations that cannot satisfy their own replication
    /// contract.
    pub fn validate(&self) -> Result<(), Error> {
        if self.replication_factor == 0 {
            return Err(Error::InvalidConfig {
                reason: "replication factor must be at least 1".into(),
            });
        }
        if self.tenant_shard_size < self.replication_factor {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "tenant shard size {} is below replication factor {}",
                    self.tenant_shard_size, self.replication_factor
                ),
            });
        }
        if self.tokens_per_instance == 0 {
            return Err(Error::InvalidConfig {
                reason: "tokens per instance must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Errors for ring operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is internally inconsistent.
    #[error("invalid ring config: {reason}")]
    InvalidConfig {
        /// Human-readable reason.
        reason: String,
    },

    /// Not enough healthy owners to satisfy the quorum for a key.
    #[error("need at least {required} healthy instances for key, found {healthy}")]
    NoQuorum {
        /// Healthy owners found.
        healthy: usize,
        /// Required owner count.
        required: usize,
    },

    /// The ring is empty; nothing has registered yet.
    #[error("ring is empty")]
    EmptyRing,

    /// The cached ring exceeded the staleness limit and the KV store is
    /// unreachable.
    #[error("cached ring is {age_secs}s old, beyond the staleness limit")]
    StaleRing {
        /// Age of the cache in seconds.
        age_secs: u64,
    },

    /// The backing key-value store failed.
    #[error("ring kv store error: {source}")]
    Kv {
        /// Underlying error.
        #[from]
        source: KvError,
    },
}

impl ClassifiedError for Error {
    fn domain(&self) -> FailureDomain {
        match self {
            Self::InvalidConfig { .. } => FailureDomain::Validation,
            Self::NoQuorum { .. } | Self::EmptyRing | Self::Kv { .. } => FailureDomain::Transient,
            Self::StaleRing { .. } => FailureDomain::Fatal,
        }
    }
}

/// A specialised `Result` for ring errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Callback boundary for components that need to react to membership
/// changes.
///
/// The ring only ever holds this opaque trait object, never a concrete
/// subscriber type, which keeps the dependency arrow pointing from the
/// subscriber to the ring.
pub trait RingObserver: Send + Sync + 'static {
    /// Invoked with the new descriptor after every observed change.
    fn ring_updated(&self, desc: &RingDesc);
}
