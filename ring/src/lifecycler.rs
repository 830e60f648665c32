//! The write side of ring membership: one instance managing its own entry.

use std::{collections::BTreeSet, sync::Arc};

use backoff::{Backoff, BackoffConfig};
use observability_deps::tracing::{info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracedb_time::TimeProvider;

use crate::{
    kv::{self, RingKv},
    state::{InstanceDesc, InstanceState},
    Result, RingConfig,
};

/// Identity of the local instance as published in the ring.
#[derive(Debug, Clone)]
pub struct Lifecycler {
    /// Unique instance id.
    pub instance_id: String,

    /// Dialable address of this instance.
    pub addr: String,

    /// Failure zone label.
    pub zone: String,
}

impl Lifecycler {
    /// Register this instance in the ring in state
    /// [`InstanceState::Joining`], claiming `tokens` (or a fresh random set),
    /// and start the heartbeat task.
    ///
    /// The caller transitions to ACTIVE via [`LifecyclerHandle::set_active`]
    /// once it has finished replaying its WAL.
    pub async fn register(
        self,
        kv: Arc<dyn RingKv>,
        config: RingConfig,
        tokens: Option<Vec<u32>>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<LifecyclerHandle> {
        config.validate()?;

        let tokens = match tokens {
            Some(t) => {
                let mut t = t;
                t.sort_unstable();
                t.dedup();
                t
            }
            None => generate_tokens(config.tokens_per_instance),
        };

        let entry = InstanceDesc {
            id: self.instance_id.clone(),
            addr: self.addr.clone(),
            zone: self.zone.clone(),
            state: InstanceState::Joining,
            tokens: tokens.clone(),
            heartbeat: time.now(),
        };

        kv::update(&*kv, |desc| {
            desc.instances.insert(entry.id.clone(), entry.clone());
        })
        .await?;
        info!(
            instance = %self.instance_id,
            tokens = tokens.len(),
            "registered in ring"
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(
            Arc::clone(&kv),
            self.instance_id.clone(),
            config,
            Arc::clone(&time),
            cancel.clone(),
        ));

        Ok(LifecyclerHandle {
            kv,
            instance_id: self.instance_id,
            tokens,
            time,
            cancel,
            task: Some(task),
        })
    }
}

fn generate_tokens(n: usize) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut tokens = BTreeSet::new();
    while tokens.len() < n {
        tokens.insert(rng.gen::<u32>());
    }
    tokens.into_iter().collect()
}

/// Handle over this instance's ring entry. Dropping the handle stops the
/// heartbeat task but leaves the entry in place (it will eventually be
/// auto-forgotten); call [`LifecyclerHandle::deregister`] for a clean exit.
#[derive(Debug)]
pub struct LifecyclerHandle {
    kv: Arc<dyn RingKv>,
    instance_id: String,
    tokens: Vec<u32>,
    time: Arc<dyn TimeProvider>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl LifecyclerHandle {
    /// The tokens this instance owns, for persisting alongside the WAL.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// The registered instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Transition JOINING → ACTIVE; the instance starts taking writes.
    pub async fn set_active(&self) -> Result<()> {
        self.set_state(InstanceState::Active).await
    }

    /// Transition to LEAVING; writes stop routing here, reads continue.
    pub async fn begin_leave(&self) -> Result<()> {
        self.set_state(InstanceState::Leaving).await
    }

    /// Mark this instance unhealthy in the ring, e.g. after a fatal local
    /// fault such as a failed WAL write.
    pub async fn set_unhealthy(&self) -> Result<()> {
        self.set_state(InstanceState::Unhealthy).await
    }

    async fn set_state(&self, state: InstanceState) -> Result<()> {
        let now = self.time.now();
        kv::update(&*self.kv, |desc| {
            if let Some(me) = desc.instances.get_mut(&self.instance_id) {
                me.state = state;
                me.heartbeat = now;
            }
        })
        .await?;
        info!(instance = %self.instance_id, ?state, "ring state transition");
        Ok(())
    }

    /// Remove this instance from the ring and stop heartbeating, releasing
    /// its tokens.
    pub async fn deregister(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        kv::update(&*self.kv, |desc| {
            desc.instances.remove(&self.instance_id);
        })
        .await?;
        info!(instance = %self.instance_id, "deregistered from ring");
        Ok(())
    }
}

impl Drop for LifecyclerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn heartbeat_loop(
    kv: Arc<dyn RingKv>,
    instance_id: String,
    config: RingConfig,
    time: Arc<dyn TimeProvider>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(&BackoffConfig::default());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = time.sleep(config.heartbeat_period) => {}
        }

        let now = time.now();
        let cutoff = now.checked_sub(config.autoforget_unhealthy);
        let result = kv::update(&*kv, |desc| {
            if let Some(me) = desc.instances.get_mut(&instance_id) {
                me.heartbeat = now;
            }
            // Release the tokens of entries that stopped heartbeating long
            // ago; their owner is not coming back to do it.
            if let Some(cutoff) = cutoff {
                desc.instances
                    .retain(|id, i| *id == instance_id || i.heartbeat >= cutoff);
            }
        })
        .await;

        match result {
            Ok(_) => backoff.reset(),
            Err(e) => {
                // Heartbeat writes are deferred while the KV store is down;
                // the read path separately enforces the staleness limit.
                warn!(error=%e, instance=%instance_id, "heartbeat deferred");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff.next()) => {}
                }
            }
        }
    }
}
