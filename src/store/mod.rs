//! Object store access
//!
//! Controllers never talk to `kube::Api` directly. They go through the
//! [`ObjectStore`] trait so the same reconcile code runs against a live
//! cluster ([`KubeStore`]) and against the in-memory store used by tests
//! ([`MemoryStore`]). Both enforce optimistic concurrency on the
//! `metadata.resourceVersion` token.

mod dynamic;
mod kube_store;
pub mod memory;
mod patch;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub use dynamic::{DynamicStore, KubeDynamicStore, MemoryDynamicStore};
pub use kube_store::{KubeStore, FIELD_MANAGER};
pub use memory::MemoryStore;
pub use patch::merge_patch_diff;

/// Identity of an object: namespace (absent for cluster-scoped kinds) and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Bounds shared by every typed object the stores handle
pub trait StoreObject:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Typed access to one kind in one cluster
#[async_trait]
pub trait ObjectStore<K: StoreObject>: Send + Sync {
    /// Fetch by key; fails with `NotFound` when absent
    async fn get(&self, key: &ObjectKey) -> Result<K>;

    /// List objects, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    /// Create; the store assigns UID and version token
    async fn create(&self, obj: &K) -> Result<K>;

    /// Full update of spec and metadata; `Conflict` on a stale version token
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Write only the status sub-resource; `Conflict` on a stale version token
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// JSON merge patch; optimistic when the patch carries a resourceVersion
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K>;

    /// Request deletion; objects with finalizers only get a deletion timestamp
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Stream of objects touched by any change, including deletions
    fn watch(&self) -> BoxStream<'static, Result<K>>;

    /// `get` that maps `NotFound` to `None`
    async fn get_opt(&self, key: &ObjectKey) -> Result<Option<K>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        assert_eq!(
            ObjectKey::namespaced("kube-system", "coredns").to_string(),
            "kube-system/coredns"
        );
        assert_eq!(
            ObjectKey::cluster_scoped("csi.example.com").to_string(),
            "csi.example.com"
        );
    }
}
