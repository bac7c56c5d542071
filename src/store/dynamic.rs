//! Untyped object access keyed by group/version/kind
//!
//! Migrations look at arbitrary addon objects (Deployments, RBAC bindings,
//! CSIDrivers) whose kinds are only known from the rendered manifest, so
//! they go through this trait instead of the typed [`super::ObjectStore`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;

use super::ObjectKey;
use crate::error::{Error, Result};
use crate::unstructured::Unstructured;

#[async_trait]
pub trait DynamicStore: Send + Sync {
    /// Fetch an object; `NotFound` when absent
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<Unstructured>;

    /// Delete an object; `NotFound` when absent
    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<()>;
}

fn gvk_label(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Kube-backed dynamic access. Plural names are derived from the kind.
#[derive(Clone)]
pub struct KubeDynamicStore {
    client: Client,
}

impl KubeDynamicStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        match key.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn map_err(gvk: &GroupVersionKind, key: &ObjectKey, e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(gvk_label(gvk), key),
        _ => Error::KubeError(e),
    }
}

#[async_trait]
impl DynamicStore for KubeDynamicStore {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<Unstructured> {
        let obj = self
            .api(gvk, key)
            .get(&key.name)
            .await
            .map_err(|e| map_err(gvk, key, e))?;
        Unstructured::from_object(&obj)
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<()> {
        self.api(gvk, key)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| map_err(gvk, key, e))?;
        Ok(())
    }
}

/// In-memory dynamic store for tests; remembers what was deleted
#[derive(Default)]
pub struct MemoryDynamicStore {
    objects: Mutex<BTreeMap<(String, ObjectKey), Unstructured>>,
    deleted: Mutex<Vec<(String, ObjectKey)>>,
}

impl MemoryDynamicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object under the group/version/kind and key it declares
    pub fn insert(&self, obj: Unstructured) -> Result<()> {
        let gvk = obj.gvk()?;
        let key = ObjectKey {
            namespace: obj.namespace()?.map(String::from),
            name: obj.name()?.to_string(),
        };
        self.objects
            .lock()
            .expect("dynamic store poisoned")
            .insert((gvk_label(&gvk), key), obj);
        Ok(())
    }

    /// Objects deleted so far, as `group/version/Kind` plus key
    pub fn deleted(&self) -> Vec<(String, ObjectKey)> {
        self.deleted.lock().expect("dynamic store poisoned").clone()
    }

    pub fn contains(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> bool {
        self.objects
            .lock()
            .expect("dynamic store poisoned")
            .contains_key(&(gvk_label(gvk), key.clone()))
    }
}

#[async_trait]
impl DynamicStore for MemoryDynamicStore {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<Unstructured> {
        tokio::task::yield_now().await;
        self.objects
            .lock()
            .expect("dynamic store poisoned")
            .get(&(gvk_label(gvk), key.clone()))
            .cloned()
            .ok_or_else(|| Error::not_found(gvk_label(gvk), key))
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<()> {
        tokio::task::yield_now().await;
        let id = (gvk_label(gvk), key.clone());
        let removed = self
            .objects
            .lock()
            .expect("dynamic store poisoned")
            .remove(&id);
        match removed {
            Some(_) => {
                self.deleted.lock().expect("dynamic store poisoned").push(id);
                Ok(())
            }
            None => Err(Error::not_found(gvk_label(gvk), key)),
        }
    }
}
