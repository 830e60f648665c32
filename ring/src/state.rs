//! The shared ring descriptor and its per-instance entries.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use tracedb_time::Time;

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Registered, not yet holding tokens.
    Pending,
    /// Holding tokens, replaying WAL; not yet serving.
    Joining,
    /// Serving reads and writes.
    Active,
    /// Draining; still serving reads.
    Leaving,
    /// Explicitly marked unable to serve.
    Unhealthy,
}

/// One instance's entry in the ring descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDesc {
    /// Unique instance identifier.
    pub id: String,

    /// Network address clients dial for this instance.
    pub addr: String,

    /// Failure zone label. Carried for operators; placement is not
    /// zone-aware.
    pub zone: String,

    /// Lifecycle state.
    pub state: InstanceState,

    /// Sorted tokens owned by the instance.
    pub tokens: Vec<u32>,

    /// Last heartbeat the instance wrote for itself.
    pub heartbeat: Time,
}

impl InstanceDesc {
    /// Whether the entry's heartbeat is recent enough to be trusted at
    /// `now`.
    pub fn is_heartbeat_fresh(&self, now: Time, heartbeat_timeout: Duration) -> bool {
        match now.checked_sub(heartbeat_timeout) {
            Some(cutoff) => self.heartbeat >= cutoff,
            None => true,
        }
    }

    /// Whether this instance may serve the given operation at `now`.
    pub fn is_eligible(
        &self,
        op: crate::Operation,
        now: Time,
        heartbeat_timeout: Duration,
    ) -> bool {
        if !self.is_heartbeat_fresh(now, heartbeat_timeout) {
            return false;
        }
        match op {
            crate::Operation::Write => self.state == InstanceState::Active,
            crate::Operation::Read => {
                matches!(self.state, InstanceState::Active | InstanceState::Leaving)
            }
        }
    }
}

/// The full membership document stored in the KV store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingDesc {
    /// All registered instances, keyed by instance id.
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    /// All `(token, instance id)` pairs, sorted by token.
    ///
    /// Token collisions across instances are resolved by instance id order;
    /// with 32-bit random tokens they are rare enough that the bias does not
    /// matter, only determinism does.
    pub fn token_index(&self) -> Vec<(u32, &str)> {
        let mut index: Vec<(u32, &str)> = self
            .instances
            .values()
            .flat_map(|i| i.tokens.iter().map(move |t| (*t, i.id.as_str())))
            .collect();
        index.sort();
        index
    }

    /// Entries whose heartbeat is older than `cutoff`.
    pub fn expired_instances(&self, cutoff: Time) -> Vec<String> {
        self.instances
            .values()
            .filter(|i| i.heartbeat < cutoff)
            .map(|i| i.id.clone())
            .collect()
    }
}
