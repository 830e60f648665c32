//! The read view of the ring: key hashing and replica selection.

use std::{collections::HashSet, sync::Arc};

use data_types::{TenantId, TraceId};
use observability_deps::tracing::{debug, warn};
use tracedb_time::{Time, TimeProvider};

use crate::{
    kv::RingKv,
    state::{InstanceDesc, RingDesc},
    Error, Result, RingConfig, RingObserver,
};

/// What the caller intends to do with the replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Routing a write; only ACTIVE instances qualify.
    Write,
    /// Routing a read; LEAVING instances still hold data and qualify too.
    Read,
}

/// Position of a trace key on the ring.
pub fn hash_trace_key(tenant: &TenantId, trace_id: TraceId) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(tenant.as_str().as_bytes());
    hasher.update(trace_id.as_bytes());
    hasher.finalize()
}

/// Position of a tenant on the (compactor) ring.
pub fn hash_tenant(tenant: &TenantId) -> u32 {
    crc32fast::hash(tenant.as_str().as_bytes())
}

/// The number of replica acknowledgements a write needs, and the number of
/// agreeing replicas a read may rely on.
pub fn quorum(replication_factor: usize) -> usize {
    replication_factor / 2 + 1
}

/// The replicas selected for one key.
#[derive(Debug, Clone)]
pub struct ReplicationSet {
    /// Eligible instances in ring-successor order. At least `quorum` long,
    /// at most the replication factor.
    pub instances: Vec<InstanceDesc>,

    /// Acknowledgements required for success.
    pub quorum: usize,
}

impl ReplicationSet {
    /// How many of the selected instances may fail while the operation still
    /// succeeds.
    pub fn max_failures(&self) -> usize {
        self.instances.len().saturating_sub(self.quorum)
    }
}

#[derive(Debug)]
struct Cached {
    desc: RingDesc,
    version: u64,
    fetched: Time,
}

/// A cached, periodically refreshed view of the membership document.
///
/// `get` and `members` serve from the local cache and never touch the KV
/// store; a background task refreshes the cache on every KV change
/// notification and on a heartbeat-period timer. If refreshing fails for
/// longer than the staleness limit the view refuses to answer rather than
/// route on ownership that may have moved.
pub struct Ring {
    kv: Arc<dyn RingKv>,
    config: RingConfig,
    time: Arc<dyn TimeProvider>,
    cache: parking_lot::RwLock<Cached>,
    observers: parking_lot::Mutex<Vec<Arc<dyn RingObserver>>>,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("observers", &self.observers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Ring {
    /// Build a view over `kv` and start its background refresh task.
    pub async fn new(
        kv: Arc<dyn RingKv>,
        config: RingConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let initial = kv.get().await?;
        let ring = Arc::new(Self {
            kv,
            config,
            cache: parking_lot::RwLock::new(Cached {
                desc: initial.value,
                version: initial.version,
                fetched: time.now(),
            }),
            time,
            observers: Default::default(),
        });

        tokio::spawn(refresh_loop(Arc::downgrade(&ring)));
        Ok(ring)
    }

    /// The config this view was built with.
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Register an observer invoked after every observed descriptor change.
    pub fn observe(&self, observer: Arc<dyn RingObserver>) {
        self.observers.lock().push(observer);
    }

    /// Re-read the descriptor from the KV store immediately.
    pub async fn refresh(&self) -> Result<()> {
        let latest = self.kv.get().await?;
        let changed = {
            let mut cache = self.cache.write();
            let changed = latest.version != cache.version;
            cache.desc = latest.value.clone();
            cache.version = latest.version;
            cache.fetched = self.time.now();
            changed
        };
        if changed {
            debug!(version = latest.version, "ring descriptor changed");
            let observers = self.observers.lock().clone();
            for observer in &observers {
                observer.ring_updated(&latest.value);
            }
        }
        Ok(())
    }

    /// All current entries.
    pub fn members(&self) -> Result<Vec<InstanceDesc>> {
        self.check_freshness()?;
        Ok(self.cache.read().desc.instances.values().cloned().collect())
    }

    /// Select the replicas for `key`.
    ///
    /// Walks the token ring clockwise from `key`, collecting distinct
    /// instances eligible for `op`, until the replication factor is reached
    /// or the ring is exhausted. Fails if fewer than the quorum are found.
    pub fn get(&self, key: u32, op: Operation) -> Result<ReplicationSet> {
        self.check_freshness()?;

        let cache = self.cache.read();
        let now = self.time.now();
        let replication_factor = self.config.replication_factor;
        let required = quorum(replication_factor);

        let index = cache.desc.token_index();
        if index.is_empty() {
            return Err(Error::EmptyRing);
        }

        let start = index.partition_point(|(token, _)| *token < key);
        let mut seen: HashSet<&str> = HashSet::new();
        let mut selected: Vec<InstanceDesc> = Vec::with_capacity(replication_factor);

        for i in 0..index.len() {
            let (_, instance_id) = index[(start + i) % index.len()];
            if !seen.insert(instance_id) {
                continue;
            }
            let instance = &cache.desc.instances[instance_id];
            if instance.is_eligible(op, now, self.config.heartbeat_timeout) {
                selected.push(instance.clone());
                if selected.len() == replication_factor {
                    break;
                }
            }
        }

        if selected.len() < required {
            return Err(Error::NoQuorum {
                healthy: selected.len(),
                required,
            });
        }

        Ok(ReplicationSet {
            instances: selected,
            quorum: required,
        })
    }

    /// The single owner of `key`: its first eligible successor. Used by the
    /// compactor ring, where exactly one instance may work a tenant window.
    pub fn owner(&self, key: u32, op: Operation) -> Result<InstanceDesc> {
        let set = self.get(key, op)?;
        Ok(set
            .instances
            .into_iter()
            .next()
            .expect("non-empty replication set"))
    }

    fn check_freshness(&self) -> Result<()> {
        let fetched = self.cache.read().fetched;
        let age = self.time.now().absolute_difference(fetched);
        if age > self.config.staleness_limit {
            return Err(Error::StaleRing {
                age_secs: age.as_secs(),
            });
        }
        Ok(())
    }
}

async fn refresh_loop(ring: std::sync::Weak<Ring>) {
    let mut rx = match ring.upgrade() {
        Some(r) => r.kv.subscribe(),
        None => return,
    };

    loop {
        let Some(ring) = ring.upgrade() else { return };
        let period = ring.config.heartbeat_period;
        let sleep = ring.time.sleep(period);
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // KV dropped its notifier; fall back to polling only.
                    ring.time.sleep(period).await;
                }
            }
            _ = sleep => {}
        }
        if let Err(e) = ring.refresh().await {
            warn!(error=%e, "ring refresh failed; serving from cache");
        }
        drop(ring);
    }
}
