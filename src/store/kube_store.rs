//! `ObjectStore` backed by a Kubernetes API server

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde_json::Value;

use super::{ObjectKey, ObjectStore, StoreObject};
use crate::error::{Error, Result};

/// Field manager used for every write the controllers issue
pub const FIELD_MANAGER: &str = "fleetplane-operator";

pub struct KubeStore<K> {
    client: Client,
    /// Restricts list and watch; `None` means all namespaces
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: None,
            _kind: PhantomData,
        }
    }

    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: Some(namespace.to_string()),
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn key_api(&self, key: &ObjectKey) -> Result<Api<K>> {
        match key.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced(self.client.clone(), ns)),
            None => Err(Error::ConfigError(format!(
                "{} {} is namespaced but the key has no namespace",
                K::kind(&()),
                key
            ))),
        }
    }
}

/// Map API status codes onto the store error taxonomy
fn map_err<K: Resource<DynamicType = ()>>(key: &ObjectKey, e: kube::Error) -> Error {
    if let kube::Error::Api(resp) = &e {
        match resp.code {
            404 => return Error::not_found(K::kind(&()), key),
            409 if resp.reason == "AlreadyExists" => {
                return Error::AlreadyExists {
                    kind: K::kind(&()).to_string(),
                    key: key.to_string(),
                }
            }
            409 => return Error::conflict(K::kind(&()), key),
            _ => {}
        }
    }
    Error::KubeError(e)
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.key_api(key)?
            .get(&key.name)
            .await
            .map_err(|e| map_err::<K>(key, e))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::from_object(obj);
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.uid = None;
        meta.resource_version = None;
        meta.creation_timestamp = None;
        self.key_api(&key)?
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_err::<K>(&key, e))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::from_object(obj);
        self.key_api(&key)?
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_err::<K>(&key, e))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::from_object(obj);
        let data = serde_json::to_vec(obj)?;
        self.key_api(&key)?
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| map_err::<K>(&key, e))
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        self.key_api(key)?
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| map_err::<K>(key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.key_api(key)?
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_err::<K>(key, e))?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<K>> {
        touched(watcher(self.api(None), watcher::Config::default()))
    }
}

/// Objects applied or deleted on a watch. Every error is passed on and
/// followed by a backoff before the watch is polled again.
fn touched<K, S>(events: S) -> BoxStream<'static, Result<K>>
where
    K: Send + 'static,
    S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    events
        .default_backoff()
        .touched_objects()
        .map_err(Error::from)
        .boxed()
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}
