//! Conflict-retry updates
//!
//! Every write a controller issues goes through one of these helpers. Each
//! attempt re-reads the object, applies the mutation to the fresh copy and
//! writes it back with the version token it was read at. A `Conflict` means
//! another writer got in between, so the helper backs off and starts over
//! from a new read. Mutations must therefore be pure functions of the object
//! they are handed.
//!
//! A mutation that leaves the object unchanged issues no write at all, which
//! is what keeps repeated reconciles free of side effects.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::ResourceExt;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{merge_patch_diff, ObjectKey, ObjectStore, StoreObject};

/// Backoff between conflicting attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts before the last conflict is returned (0 = retry forever)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// Running attempt counter and delay for one retry loop
struct Backoff<'a> {
    config: &'a RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl<'a> Backoff<'a> {
    fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            delay: config.initial_delay,
        }
    }

    /// Count a conflict; the jittered delay to sleep, or `None` when the
    /// attempts are used up
    fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts {
            return None;
        }
        // 0.5x to 1.5x of the current delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        Some(jittered)
    }

    /// Sleep before the next attempt, or hand the conflict back
    async fn retry_or_fail(&mut self, key: &ObjectKey, err: Error) -> Result<()> {
        if !err.is_conflict() {
            return Err(err);
        }
        match self.next_delay() {
            Some(delay) => {
                debug!(
                    %key,
                    attempt = self.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflict, retrying from a fresh read"
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => {
                warn!(%key, attempts = self.attempt, "Giving up after repeated write conflicts");
                Err(err)
            }
        }
    }
}

fn section(obj: &Value, name: &str) -> Value {
    obj.get(name).cloned().unwrap_or(Value::Null)
}

/// Read-modify-write of spec and metadata with a full replace
pub async fn update_with_retry<K, S, F>(
    store: &S,
    key: &ObjectKey,
    config: &RetryConfig,
    mut mutate: F,
) -> Result<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    let mut backoff = Backoff::new(config);
    loop {
        let current = store.get(key).await?;
        let mut desired = current.clone();
        mutate(&mut desired)?;
        if serde_json::to_value(&desired)? == serde_json::to_value(&current)? {
            return Ok(current);
        }
        match store.replace(&desired).await {
            Ok(written) => return Ok(written),
            Err(e) => backoff.retry_or_fail(key, e).await?,
        }
    }
}

/// Reconcile-then-patch: compute the desired copy, then send only the fields
/// that differ from the read, pinned to its version token
pub async fn patch_with_retry<K, S, F>(
    store: &S,
    key: &ObjectKey,
    config: &RetryConfig,
    mut mutate: F,
) -> Result<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    let mut backoff = Backoff::new(config);
    loop {
        let current = store.get(key).await?;
        let mut desired = current.clone();
        mutate(&mut desired)?;

        let before = serde_json::to_value(&current)?;
        let mut after = serde_json::to_value(&desired)?;
        // status goes through its own sub-resource
        if let Value::Object(map) = &mut after {
            match before.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        let mut patch = merge_patch_diff(&before, &after);
        if patch.as_object().map_or(true, |m| m.is_empty()) {
            return Ok(current);
        }
        json_patch::merge(
            &mut patch,
            &json!({"metadata": {"resourceVersion": current.resource_version()}}),
        );

        match store.patch(key, &patch).await {
            Ok(written) => return Ok(written),
            Err(e) => backoff.retry_or_fail(key, e).await?,
        }
    }
}

/// Read-modify-write of the status sub-resource
pub async fn update_status_with_retry<K, S, F>(
    store: &S,
    key: &ObjectKey,
    config: &RetryConfig,
    mut mutate: F,
) -> Result<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
    F: FnMut(&mut K) -> Result<()> + Send,
{
    let mut backoff = Backoff::new(config);
    loop {
        let current = store.get(key).await?;
        let mut desired = current.clone();
        mutate(&mut desired)?;
        let unchanged = section(&serde_json::to_value(&desired)?, "status")
            == section(&serde_json::to_value(&current)?, "status");
        if unchanged {
            return Ok(current);
        }
        match store.replace_status(&desired).await {
            Ok(written) => return Ok(written),
            Err(e) => backoff.retry_or_fail(key, e).await?,
        }
    }
}

/// Make sure `labels` are set on the object, leaving other labels alone
pub async fn ensure_labels<K, S>(
    store: &S,
    key: &ObjectKey,
    config: &RetryConfig,
    labels: &BTreeMap<String, String>,
) -> Result<K>
where
    K: StoreObject,
    S: ObjectStore<K> + ?Sized,
{
    patch_with_retry(store, key, config, |obj: &mut K| {
        let current = obj.labels_mut();
        for (k, v) in labels {
            current.insert(k.clone(), v.clone());
        }
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([("team".to_string(), "fleet".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn set_data(cm: &mut ConfigMap, k: &str, v: &str) {
        cm.data
            .get_or_insert_with(BTreeMap::new)
            .insert(k.to_string(), v.to_string());
    }

    #[tokio::test]
    async fn test_unchanged_mutation_skips_write() {
        let store = MemoryStore::new("test");
        let created = store.create(&config_map()).await.unwrap();
        let key = ObjectKey::from_object(&created);
        let writes = store.writes();

        update_with_retry(&store, &key, &fast(), |_cm: &mut ConfigMap| Ok(()))
            .await
            .unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_retries_through_injected_conflicts() {
        let store = MemoryStore::new("test");
        let created = store.create(&config_map()).await.unwrap();
        let key = ObjectKey::from_object(&created);
        store.inject_conflicts(3);

        let written = update_with_retry(&store, &key, &fast(), |cm: &mut ConfigMap| {
            set_data(cm, "region", "eu");
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(written.data.unwrap()["region"], "eu");
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_max_attempts() {
        let store = MemoryStore::new("test");
        let created = store.create(&config_map()).await.unwrap();
        let key = ObjectKey::from_object(&created);
        store.inject_conflicts(5);

        let config = RetryConfig {
            max_attempts: 2,
            ..fast()
        };
        let err = update_with_retry(&store, &key, &config, |cm: &mut ConfigMap| {
            set_data(cm, "region", "eu");
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_mutation_error_is_not_retried() {
        let store = MemoryStore::new("test");
        let created = store.create(&config_map()).await.unwrap();
        let key = ObjectKey::from_object(&created);

        let mut calls = 0;
        let err = update_with_retry(&store, &key, &fast(), |_cm: &mut ConfigMap| {
            calls += 1;
            Err(Error::field("data.region", "unsupported"))
        })
        .await
        .unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_updates_both_land() {
        let store = Arc::new(MemoryStore::new("test"));
        let created = store.create(&config_map()).await.unwrap();
        let key = ObjectKey::from_object(&created);

        let mut tasks = Vec::new();
        for field in ["alpha", "beta"] {
            let store = Arc::clone(&store);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                update_with_retry(&*store, &key, &fast(), move |cm: &mut ConfigMap| {
                    set_data(cm, field, "set");
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let data = store.get(&key).await.unwrap().data.unwrap();
        assert_eq!(data.get("alpha").map(String::as_str), Some("set"));
        assert_eq!(data.get("beta").map(String::as_str), Some("set"));
    }

    #[tokio::test]
    async fn test_ensure_labels_keeps_foreign_labels() {
        let store = MemoryStore::new("test");
        let created = store.create(&config_map()).await.unwrap();
        let key = ObjectKey::from_object(&created);

        let wanted = BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            "fleetplane".to_string(),
        )]);
        let written: ConfigMap = ensure_labels(&store, &key, &fast(), &wanted).await.unwrap();
        let labels = written.metadata.labels.unwrap();
        assert_eq!(labels["team"], "fleet");
        assert_eq!(labels["app.kubernetes.io/managed-by"], "fleetplane");

        let writes = store.writes();
        let _: ConfigMap = ensure_labels(&store, &key, &fast(), &wanted).await.unwrap();
        assert_eq!(store.writes(), writes);
    }
}
