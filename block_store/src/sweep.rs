//! Reclaims orphaned block objects.
//!
//! A crash between streaming data pages and uploading the meta record leaves
//! data / index / bloom objects behind that no reader will ever observe. The
//! sweeper deletes the objects of any block directory that has neither a
//! meta record nor a compacted marker once every object in it is older than
//! the grace period, so a writer still working towards its meta upload is
//! never raced.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use data_types::TenantId;
use futures::TryStreamExt;
use object_store::{path::Path, ObjectMeta};
use observability_deps::tracing::info;
use tracedb_time::Time;

use crate::{
    backend::{COMPACTED_META_OBJECT, META_OBJECT},
    DynObjectStore, Result,
};

/// Sweep one tenant's prefix, deleting orphaned block objects older than
/// `grace`. Returns the number of objects deleted.
pub async fn sweep_orphans(
    store: Arc<DynObjectStore>,
    tenant: &TenantId,
    now: Time,
    grace: Duration,
) -> Result<usize> {
    let prefix = Path::from(tenant.as_str());
    let objects: Vec<ObjectMeta> = store.list(Some(&prefix)).await?.try_collect().await?;

    // Group objects by block directory and remember whether any meta-like
    // object anchors the directory.
    let mut dirs: BTreeMap<String, (bool, Vec<ObjectMeta>)> = BTreeMap::new();
    for object in objects {
        let parts: Vec<_> = object.location.parts().collect();
        if parts.len() != 3 {
            continue;
        }
        let dir = format!("{}/{}", parts[0].as_ref(), parts[1].as_ref());
        let name = parts[2].as_ref().to_owned();

        let entry = dirs.entry(dir).or_default();
        entry.0 |= name == META_OBJECT || name == COMPACTED_META_OBJECT;
        entry.1.push(object);
    }

    let cutoff = match now.checked_sub(grace) {
        Some(c) => c.date_time(),
        None => return Ok(0),
    };

    let mut deleted = 0;
    for (dir, (anchored, objects)) in dirs {
        if anchored {
            continue;
        }
        if objects.iter().any(|o| o.last_modified > cutoff) {
            // Possibly a live upload; leave it for a later sweep.
            continue;
        }
        for object in objects {
            match store.delete(&object.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => deleted += 1,
                Err(e) => return Err(e.into()),
            }
        }
        info!(%tenant, block_dir = %dir, "swept orphaned block objects");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::{memory::InMemory, ObjectStore};

    fn tenant() -> TenantId {
        TenantId::new("single-tenant").unwrap()
    }

    #[tokio::test]
    async fn sweeps_unanchored_dirs_only() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());

        // A complete block and an orphaned one.
        let complete = Path::from("single-tenant/0000-complete");
        let orphan = Path::from("single-tenant/0000-orphan");
        store
            .put(&complete.child(META_OBJECT), b"{}".as_ref().into())
            .await
            .unwrap();
        store
            .put(&complete.child("data"), b"d".as_ref().into())
            .await
            .unwrap();
        store
            .put(&orphan.child("data"), b"d".as_ref().into())
            .await
            .unwrap();
        store
            .put(&orphan.child("index"), b"i".as_ref().into())
            .await
            .unwrap();

        // Objects were written "now"; a sweep far in the future sees them as
        // long past the grace period.
        let far_future = Time::from_date_time(chrono_now() + chrono::Duration::hours(24));
        let deleted = sweep_orphans(
            Arc::clone(&store),
            &tenant(),
            far_future,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(deleted, 2);

        // The anchored block is untouched.
        assert!(store.get(&complete.child("data")).await.is_ok());
        assert!(store.get(&orphan.child("data")).await.is_err());
    }

    #[tokio::test]
    async fn fresh_objects_survive_the_sweep() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let orphan = Path::from("single-tenant/0000-orphan");
        store
            .put(&orphan.child("data"), b"d".as_ref().into())
            .await
            .unwrap();

        let now = Time::from_date_time(chrono_now());
        let deleted = sweep_orphans(store, &tenant(), now, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}
