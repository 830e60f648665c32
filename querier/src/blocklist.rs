//! The polled per-tenant block list.
//!
//! Queriers between polls serve from the cached list; the bounded staleness
//! this introduces on the backend path is part of the contract (freshness is
//! the ingesters' job).

use std::{sync::Arc, time::Duration};

use block_store::{list_blocks, DynObjectStore, TenantBlockList};
use data_types::TenantId;
use hashbrown::HashMap;
use tracedb_time::{Time, TimeProvider};

use crate::Result;

#[derive(Debug)]
pub(crate) struct BlockListCache {
    store: Arc<DynObjectStore>,
    poll_period: Duration,
    time: Arc<dyn TimeProvider>,
    lists: tokio::sync::Mutex<HashMap<TenantId, (Time, Arc<TenantBlockList>)>>,
}

impl BlockListCache {
    pub(crate) fn new(
        store: Arc<DynObjectStore>,
        poll_period: Duration,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            poll_period,
            time,
            lists: Default::default(),
        }
    }

    /// The tenant's block list, refreshed when older than the poll period.
    pub(crate) async fn get(&self, tenant: &TenantId) -> Result<Arc<TenantBlockList>> {
        let now = self.time.now();
        let mut lists = self.lists.lock().await;
        if let Some((fetched, list)) = lists.get(tenant) {
            if now.absolute_difference(*fetched) < self.poll_period {
                return Ok(Arc::clone(list));
            }
        }

        let fresh = Arc::new(list_blocks(Arc::clone(&self.store), tenant).await?);
        lists.insert(tenant.clone(), (now, Arc::clone(&fresh)));
        Ok(fresh)
    }
}
