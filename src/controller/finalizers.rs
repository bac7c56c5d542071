//! Finalizer handling
//!
//! A controller that provisions state outside the object it reconciles (the
//! sync controller's seed copies) adds its finalizer before the first write
//! to that state and removes it only after cleanup has finished. The store
//! keeps the object around, marked with a deletion timestamp, until then.
//!
//! Finalizer writes patch the whole list, so they carry the version token of
//! the copy they were computed from. A concurrent change makes them fail with
//! `Conflict`, and the next reconcile recomputes from a fresh read.

use kube::ResourceExt;
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::store::{ObjectKey, ObjectStore, StoreObject};

/// Finalizer protecting seed copies of a ClusterBackupStorageLocation
pub const SEED_CLEANUP_FINALIZER: &str = "fleetplane.io/cleanup-seed-backup-storage-locations";

pub fn has_finalizer<K: StoreObject>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// A deletion timestamp means deletion was requested and finalizers are
/// holding the object
pub fn is_being_deleted<K: StoreObject>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

fn finalizer_patch<K: StoreObject>(obj: &K, finalizers: Vec<String>) -> serde_json::Value {
    json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    })
}

/// Add `finalizer` unless present; returns the stored object
pub async fn add_finalizer<K, S>(store: &S, obj: &K, finalizer: &str) -> Result<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
{
    if has_finalizer(obj, finalizer) {
        return Ok(obj.clone());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());

    let key = ObjectKey::from_object(obj);
    let updated = store.patch(&key, &finalizer_patch(obj, finalizers)).await?;
    info!("Added finalizer {} to {} {}", finalizer, K::kind(&()), key);
    Ok(updated)
}

/// Remove `finalizer`; once the list is empty a deleting object is gone
pub async fn remove_finalizer<K, S>(store: &S, obj: &K, finalizer: &str) -> Result<()>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();

    let key = ObjectKey::from_object(obj);
    match store.patch(&key, &finalizer_patch(obj, finalizers)).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    info!("Removed finalizer {} from {} {}", finalizer, K::kind(&()), key);
    Ok(())
}
