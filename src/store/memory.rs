//! In-memory `ObjectStore`
//!
//! Behaves like a single API server for one kind: version tokens are bumped
//! on every write and checked on updates, UIDs are assigned per store, the
//! status sub-resource is only written through `replace_status`, and objects
//! carrying finalizers are marked for deletion instead of removed. Every
//! write is broadcast to watchers.
//!
//! Each operation yields to the scheduler before touching state, so
//! concurrent callers interleave the way they would against a real server.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{ObjectKey, ObjectStore, StoreObject};
use crate::error::{Error, Result};

const EVENT_BUFFER: usize = 1024;

pub struct MemoryStore<K> {
    cluster: String,
    state: Mutex<State<K>>,
    events: broadcast::Sender<K>,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    uids: u64,
    injected_conflicts: usize,
    writes: usize,
}

fn kind<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

fn status_of<K: StoreObject>(obj: &K) -> Result<Value> {
    Ok(serde_json::to_value(obj)?
        .get("status")
        .cloned()
        .unwrap_or(Value::Null))
}

fn spec_of<K: StoreObject>(obj: &K) -> Result<Value> {
    Ok(serde_json::to_value(obj)?
        .get("spec")
        .cloned()
        .unwrap_or(Value::Null))
}

fn with_status<K: StoreObject>(obj: &K, status: Value) -> Result<K> {
    let mut value = serde_json::to_value(obj)?;
    if let Value::Object(map) = &mut value {
        if status.is_null() {
            map.remove("status");
        } else {
            map.insert("status".to_string(), status);
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Carry the fields clients cannot change from the stored copy
fn keep_server_fields<K: StoreObject>(existing: &K, updated: &mut K) {
    let old = existing.meta();
    let meta = updated.meta_mut();
    meta.uid = old.uid.clone();
    meta.creation_timestamp = old.creation_timestamp.clone();
    meta.deletion_timestamp = old.deletion_timestamp.clone();
    meta.generation = old.generation;
}

impl<K: StoreObject> MemoryStore<K> {
    /// Empty store; `cluster` prefixes the UIDs it assigns
    pub fn new(cluster: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            cluster: cluster.to_string(),
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                uids: 0,
                injected_conflicts: 0,
                writes: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().expect("memory store poisoned")
    }

    /// Store an object as-is, keeping a UID it already carries
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.lock();
        state.version += 1;
        let version = state.version.to_string();
        if obj.meta().uid.is_none() {
            state.uids += 1;
            obj.meta_mut().uid = Some(format!("{}-{:08}", self.cluster, state.uids));
        }
        obj.meta_mut().resource_version = Some(version);
        state.objects.insert(ObjectKey::from_object(&obj), obj.clone());
        let _ = self.events.send(obj.clone());
        obj
    }

    /// Current stored copy without going through the async API
    pub fn snapshot(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// Make the next `n` version-checked writes fail as if another writer won
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().injected_conflicts = n;
    }

    /// Number of successful writes since creation
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, state: &State<K>, key: &ObjectKey) -> Result<K> {
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(kind::<K>(), key))
    }

    /// Fail on a stale token, or on an injected conflict. An injected
    /// conflict bumps the stored version so a retry has to re-read.
    fn check_version(
        &self,
        state: &mut State<K>,
        key: &ObjectKey,
        presented: Option<&str>,
    ) -> Result<()> {
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            state.version += 1;
            let version = state.version.to_string();
            if let Some(obj) = state.objects.get_mut(key) {
                obj.meta_mut().resource_version = Some(version);
            }
            return Err(Error::conflict(kind::<K>(), key));
        }
        let current = state
            .objects
            .get(key)
            .and_then(|o| o.meta().resource_version.clone());
        match presented {
            Some(token) if Some(token) != current.as_deref() => {
                Err(Error::conflict(kind::<K>(), key))
            }
            _ => Ok(()),
        }
    }

    /// Persist a write, removing the object once it is deleting and has no
    /// finalizers left
    fn commit(&self, state: &mut State<K>, key: ObjectKey, mut obj: K) -> K {
        state.version += 1;
        state.writes += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
        let meta = obj.meta();
        let finalizers_empty = meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if meta.deletion_timestamp.is_some() && finalizers_empty {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, obj.clone());
        }
        let _ = self.events.send(obj.clone());
        obj
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        tokio::task::yield_now().await;
        let state = self.lock();
        self.existing(&state, key)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        tokio::task::yield_now().await;
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        tokio::task::yield_now().await;
        let key = ObjectKey::from_object(obj);
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: kind::<K>(),
                key: key.to_string(),
            });
        }
        state.uids += 1;
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(format!("{}-{:08}", self.cluster, state.uids));
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);
        Ok(self.commit(&mut state, key, created))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        tokio::task::yield_now().await;
        let key = ObjectKey::from_object(obj);
        let mut state = self.lock();
        let existing = self.existing(&state, &key)?;
        self.check_version(&mut state, &key, obj.meta().resource_version.as_deref())?;

        let mut updated = with_status(obj, status_of(&existing)?)?;
        keep_server_fields(&existing, &mut updated);
        if spec_of(&existing)? != spec_of(&updated)? {
            updated.meta_mut().generation = Some(existing.meta().generation.unwrap_or(0) + 1);
        }
        Ok(self.commit(&mut state, key, updated))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        tokio::task::yield_now().await;
        let key = ObjectKey::from_object(obj);
        let mut state = self.lock();
        let existing = self.existing(&state, &key)?;
        self.check_version(&mut state, &key, obj.meta().resource_version.as_deref())?;

        let updated = with_status(&existing, status_of(obj)?)?;
        Ok(self.commit(&mut state, key, updated))
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let existing = self.existing(&state, key)?;
        let presented = patch
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(Value::as_str);
        if presented.is_some() {
            self.check_version(&mut state, key, presented)?;
        }

        let mut value = serde_json::to_value(&existing)?;
        json_patch::merge(&mut value, patch);
        let patched: K = serde_json::from_value(value)?;
        let mut updated = with_status(&patched, status_of(&existing)?)?;
        keep_server_fields(&existing, &mut updated);
        if spec_of(&existing)? != spec_of(&updated)? {
            updated.meta_mut().generation = Some(existing.meta().generation.unwrap_or(0) + 1);
        }
        Ok(self.commit(&mut state, key.clone(), updated))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let mut existing = self.existing(&state, key)?;
        if existing.meta().deletion_timestamp.is_some() {
            return Ok(());
        }
        existing.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        self.commit(&mut state, key.clone(), existing);
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<K>> {
        let rx = self.events.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(obj) => return Some((Ok(obj), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
