//! Key-value backing store for the ring descriptor.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::state::RingDesc;

/// Errors from the ring KV store.
#[derive(Debug, Error)]
pub enum KvError {
    /// A compare-and-swap lost the race; re-read and retry.
    #[error("ring document changed concurrently (expected version {expected})")]
    CasFailed {
        /// The version the caller tried to replace.
        expected: u64,
    },

    /// The store could not be reached.
    #[error("ring kv store unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason.
        reason: String,
    },
}

/// A value plus the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The value.
    pub value: T,

    /// Monotonic document version; `0` for the never-written document.
    pub version: u64,
}

/// Storage of the single ring descriptor document.
///
/// Implementations provide read-modify-write via optimistic concurrency:
/// writers read a [`Versioned`] snapshot, mutate, and [`RingKv::cas`] with
/// the snapshot's version.
#[async_trait]
pub trait RingKv: std::fmt::Debug + Send + Sync + 'static {
    /// Read the current descriptor.
    async fn get(&self) -> Result<Versioned<RingDesc>, KvError>;

    /// Replace the descriptor iff its version is still `expected_version`.
    /// Returns the new version.
    async fn cas(&self, expected_version: u64, desc: RingDesc) -> Result<u64, KvError>;

    /// A receiver notified (with the new version) after every successful
    /// write.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-process [`RingKv`] shared by all instances of a test cluster via
/// `Arc`.
#[derive(Debug)]
pub struct MemKv {
    state: parking_lot::Mutex<Versioned<RingDesc>>,
    tx: watch::Sender<u64>,
    unavailable: AtomicBool,
}

impl Default for MemKv {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            state: parking_lot::Mutex::new(Versioned {
                value: RingDesc::default(),
                version: 0,
            }),
            tx,
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemKv {
    /// A fresh empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the store being down (`true`) or back up (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable {
                reason: "simulated outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RingKv for MemKv {
    async fn get(&self) -> Result<Versioned<RingDesc>, KvError> {
        self.check_available()?;
        Ok(self.state.lock().clone())
    }

    async fn cas(&self, expected_version: u64, desc: RingDesc) -> Result<u64, KvError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.version != expected_version {
            return Err(KvError::CasFailed {
                expected: expected_version,
            });
        }
        state.version += 1;
        state.value = desc;
        let version = state.version;
        drop(state);
        self.tx.send_replace(version);
        Ok(version)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Read-modify-write helper: applies `mutate` to the latest descriptor until
/// a CAS succeeds or the store reports itself unavailable.
pub(crate) async fn update<F>(kv: &dyn RingKv, mut mutate: F) -> Result<RingDesc, KvError>
where
    F: FnMut(&mut RingDesc),
{
    loop {
        let Versioned { mut value, version } = kv.get().await?;
        mutate(&mut value);
        match kv.cas(version, value.clone()).await {
            Ok(_) => return Ok(value),
            Err(KvError::CasFailed { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}
