//! Master to seed replication of ClusterBackupStorageLocations
//!
//! The master cluster holds the canonical locations. Every seed gets a copy
//! with the same spec and labels, a copy of the referenced credential secret
//! and the master's observed status. Deleting the master object removes the
//! seed copies before the cleanup finalizer is released.
//!
//! A seed may be registered against the same API server as the master. Its
//! "copy" is then the master object itself, which is detected by comparing
//! UIDs: they are assigned once per cluster, so equal non-empty UIDs can only
//! mean the same physical object. Such seeds are skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::conditions::{
    remove_condition, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_SEEDS_SYNCED, REASON_ALL_SEEDS_SYNCED, REASON_INVALID_SPEC,
    REASON_SEED_SYNC_FAILED,
};
use super::engine::{own_key, periodic_list, Action, Controller, Reconciler};
use super::events::{EventRecorder, EventType};
use super::finalizers::{
    add_finalizer, has_finalizer, is_being_deleted, remove_finalizer, SEED_CLEANUP_FINALIZER,
};
use super::queue::QueueBackoff;
use super::updater::{patch_with_retry, update_status_with_retry, RetryConfig};
use crate::crd::{
    is_paused, ClusterBackupStorageLocation, ClusterBackupStorageLocationStatus,
    SecretKeySelector, SyncPhase, MANAGED_BY_LABEL,
};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore};

pub const CONTROLLER_NAME: &str = "cbsl-sync";

/// Value of the managed-by label on every object written into a seed
pub const MANAGED_BY: &str = "fleetplane";

/// One replication target
#[derive(Clone)]
pub struct SeedCluster {
    pub name: String,
    pub locations: Arc<dyn ObjectStore<ClusterBackupStorageLocation>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
}

impl SeedCluster {
    pub fn new(
        name: &str,
        locations: Arc<dyn ObjectStore<ClusterBackupStorageLocation>>,
        secrets: Arc<dyn ObjectStore<Secret>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            locations,
            secrets,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Only replicate master objects from this namespace
    pub namespace: Option<String>,
    /// Full re-list of the master, catching secret changes that fire no
    /// event on the location itself
    pub resync_period: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period: Duration::from_secs(300),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SeedOutcome {
    Synced,
    /// The seed's copy is the master object itself
    SameObject,
}

fn same_uid(a: Option<String>, b: Option<String>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if !a.is_empty() && a == b)
}

fn seed_labels(source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = source.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

fn location_copy(master: &ClusterBackupStorageLocation) -> ClusterBackupStorageLocation {
    let mut copy = ClusterBackupStorageLocation::new(&master.name_any(), master.spec.clone());
    copy.metadata.namespace = master.namespace();
    copy.metadata.labels = Some(seed_labels(master.labels()));
    copy
}

fn secret_copy(source: &Secret) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: source.metadata.namespace.clone(),
            labels: Some(seed_labels(source.labels())),
            ..Default::default()
        },
        data: source.data.clone(),
        type_: source.type_.clone(),
        ..Default::default()
    }
}

/// Status as it should appear on seed copies: the master's observed state
/// without its own replication bookkeeping
fn replicated_status(
    master: &ClusterBackupStorageLocation,
) -> Option<ClusterBackupStorageLocationStatus> {
    let mut status = master.status.clone()?;
    status.sync_phase = None;
    remove_condition(&mut status.conditions, CONDITION_TYPE_SEEDS_SYNCED);
    if status == ClusterBackupStorageLocationStatus::default() {
        None
    } else {
        Some(status)
    }
}

/// Watch predicate restricting events to the configured namespace
fn in_scope(
    namespace: Option<String>,
) -> impl Fn(&ClusterBackupStorageLocation) -> bool + Send + Sync + 'static {
    move |obj| namespace.is_none() || obj.namespace() == namespace
}

pub struct CbslSyncController {
    master: Arc<dyn ObjectStore<ClusterBackupStorageLocation>>,
    master_secrets: Arc<dyn ObjectStore<Secret>>,
    seeds: Vec<SeedCluster>,
    events: Arc<dyn EventRecorder>,
    options: SyncOptions,
}

impl CbslSyncController {
    pub fn new(
        master: Arc<dyn ObjectStore<ClusterBackupStorageLocation>>,
        master_secrets: Arc<dyn ObjectStore<Secret>>,
        seeds: Vec<SeedCluster>,
        events: Arc<dyn EventRecorder>,
        options: SyncOptions,
    ) -> Self {
        Self {
            master,
            master_secrets,
            seeds,
            events,
            options,
        }
    }

    /// Controller fed by master events, every seed's copies (mapped back to
    /// the master key of the same name) and the periodic resync
    pub fn controller(self: Arc<Self>, workers: usize, backoff: QueueBackoff) -> Controller<Self> {
        let namespace = self.options.namespace.clone();
        let resync = periodic_list(
            Arc::clone(&self.master),
            namespace.clone(),
            self.options.resync_period,
        );

        let mut controller = Controller::new(Arc::clone(&self), workers, backoff)
            .watches_with(self.master.watch(), in_scope(namespace.clone()), own_key)
            .watches_with(resync, in_scope(namespace.clone()), own_key);
        for seed in &self.seeds {
            controller = controller.watches_with(
                seed.locations.watch(),
                in_scope(namespace.clone()),
                own_key,
            );
        }
        controller
    }

    async fn sync_seed(
        &self,
        seed: &SeedCluster,
        master: &ClusterBackupStorageLocation,
    ) -> Result<SeedOutcome> {
        let key = ObjectKey::from_object(master);
        let existing = seed.locations.get_opt(&key).await?;

        match existing {
            Some(copy) if same_uid(copy.uid(), master.uid()) => {
                debug!(seed = %seed.name, "Seed copy is the master object, skipping");
                return Ok(SeedOutcome::SameObject);
            }
            Some(_) => {
                patch_with_retry(
                    &*seed.locations,
                    &key,
                    &self.options.retry,
                    |copy: &mut ClusterBackupStorageLocation| {
                        copy.spec = master.spec.clone();
                        *copy.labels_mut() = seed_labels(master.labels());
                        Ok(())
                    },
                )
                .await?;
            }
            None => {
                seed.locations.create(&location_copy(master)).await?;
                info!(seed = %seed.name, "Created seed copy");
            }
        }

        if let Some(credential) = &master.spec.credential {
            self.sync_secret(seed, master, credential).await?;
        }

        let copy = seed.locations.get(&key).await?;
        let status = replicated_status(master);
        if copy.status != status {
            update_status_with_retry(
                &*seed.locations,
                &key,
                &self.options.retry,
                |copy: &mut ClusterBackupStorageLocation| {
                    copy.status = status.clone();
                    Ok(())
                },
            )
            .await?;
            debug!(seed = %seed.name, "Pushed status to seed copy");
        }
        Ok(SeedOutcome::Synced)
    }

    async fn sync_secret(
        &self,
        seed: &SeedCluster,
        master: &ClusterBackupStorageLocation,
        credential: &SecretKeySelector,
    ) -> Result<()> {
        let key = ObjectKey {
            namespace: master.namespace(),
            name: credential.name.clone(),
        };
        let source = self
            .master_secrets
            .get_opt(&key)
            .await?
            .ok_or_else(|| Error::MissingSecret {
                key: key.to_string(),
            })?;

        match seed.secrets.get_opt(&key).await? {
            Some(copy) if same_uid(copy.uid(), source.uid()) => {
                debug!(
                    seed = %seed.name,
                    secret = %key,
                    "Seed secret is the source secret, skipping"
                );
            }
            Some(_) => {
                patch_with_retry(&*seed.secrets, &key, &self.options.retry, |copy: &mut Secret| {
                    copy.data = source.data.clone();
                    copy.type_ = source.type_.clone();
                    *copy.labels_mut() = seed_labels(source.labels());
                    Ok(())
                })
                .await?;
            }
            None => {
                seed.secrets.create(&secret_copy(&source)).await?;
                info!(seed = %seed.name, secret = %key, "Copied credential secret");
            }
        }
        Ok(())
    }

    async fn delete_seed_copy(
        &self,
        seed: &SeedCluster,
        master: &ClusterBackupStorageLocation,
    ) -> Result<()> {
        let key = ObjectKey::from_object(master);
        let Some(copy) = seed.locations.get_opt(&key).await? else {
            return Ok(());
        };
        if same_uid(copy.uid(), master.uid()) {
            return Ok(());
        }
        match seed.locations.delete(&key).await {
            Ok(()) => {
                info!(seed = %seed.name, "Deleted seed copy");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove every seed copy, then release the finalizer. A seed that
    /// cannot be cleaned keeps the finalizer in place for the next pass.
    async fn cleanup(&self, master: ClusterBackupStorageLocation) -> Result<Action> {
        if !has_finalizer(&master, SEED_CLEANUP_FINALIZER) {
            return Ok(Action::await_change());
        }
        let key = ObjectKey::from_object(&master);
        let master = match self.write_phase(&key, SyncPhase::Cleaning).await {
            Ok(updated) => updated,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => {
                warn!("Failed to mark location as cleaning: {}", e);
                master
            }
        };

        let mut failures = Vec::new();
        for seed in &self.seeds {
            if let Err(e) = self.delete_seed_copy(seed, &master).await {
                warn!(seed = %seed.name, "Failed to delete seed copy: {}", e);
                failures.push((seed.name.clone(), e));
            }
        }
        if !failures.is_empty() {
            return Err(Error::PartialSync {
                total: self.seeds.len(),
                failures,
            });
        }

        remove_finalizer(&*self.master, &master, SEED_CLEANUP_FINALIZER).await?;
        info!("Seed copies removed");
        Ok(Action::await_change())
    }

    async fn write_phase(
        &self,
        key: &ObjectKey,
        phase: SyncPhase,
    ) -> Result<ClusterBackupStorageLocation> {
        update_status_with_retry(
            &*self.master,
            key,
            &self.options.retry,
            |m: &mut ClusterBackupStorageLocation| {
                m.status.get_or_insert_with(Default::default).sync_phase = Some(phase);
                Ok(())
            },
        )
        .await
    }

    async fn set_sync_status(
        &self,
        key: &ObjectKey,
        phase: Option<SyncPhase>,
        status: &str,
        reason: &str,
        message: &str,
    ) {
        let result = update_status_with_retry(
            &*self.master,
            key,
            &self.options.retry,
            |m: &mut ClusterBackupStorageLocation| {
                let st = m.status.get_or_insert_with(Default::default);
                if phase.is_some() {
                    st.sync_phase = phase;
                }
                set_condition(
                    &mut st.conditions,
                    CONDITION_TYPE_SEEDS_SYNCED,
                    status,
                    reason,
                    message,
                );
                Ok(())
            },
        )
        .await;
        if let Err(e) = result {
            if !e.is_not_found() {
                warn!(%key, "Failed to update SeedsSynced condition: {}", e);
            }
        }
    }

    async fn warn_event(&self, master: &ClusterBackupStorageLocation, reason: &str, message: &str) {
        if let Err(e) = self
            .events
            .record(&master.object_ref(&()), EventType::Warning, reason, message)
            .await
        {
            warn!("Failed to record event: {}", e);
        }
    }
}

#[async_trait]
impl Reconciler for CbslSyncController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self, cancel), fields(name = %key.name, namespace = ?key.namespace))]
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action> {
        let Some(master) = self.master.get_opt(key).await? else {
            return Ok(Action::await_change());
        };
        // pausing never blocks deletion
        if is_being_deleted(&master) {
            return self.cleanup(master).await;
        }
        if is_paused(&master.metadata) {
            debug!("Location is paused, skipping");
            return Ok(Action::await_change());
        }

        if let Err(e) = master.spec.validate() {
            let message = e.to_string();
            self.set_sync_status(key, None, CONDITION_STATUS_FALSE, REASON_INVALID_SPEC, &message)
                .await;
            self.warn_event(&master, REASON_INVALID_SPEC, &message).await;
            return Err(e);
        }

        let master = add_finalizer(&*self.master, &master, SEED_CLEANUP_FINALIZER).await?;

        let total = self.seeds.len();
        let mut synced = 0usize;
        let mut failures = Vec::new();
        for seed in &self.seeds {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.sync_seed(seed, &master).await {
                Ok(SeedOutcome::Synced) => {
                    synced += 1;
                    if synced == 1 && master.sync_phase() == SyncPhase::Pending {
                        if let Err(e) = self.write_phase(key, SyncPhase::Syncing).await {
                            warn!("Failed to mark location as syncing: {}", e);
                        }
                    }
                }
                Ok(SeedOutcome::SameObject) => {}
                Err(e) => {
                    warn!(seed = %seed.name, "Failed to sync seed: {}", e);
                    #[cfg(feature = "metrics")]
                    super::metrics::inc_seed_sync_failure(&seed.name);
                    failures.push((seed.name.clone(), e));
                }
            }
        }

        if failures.is_empty() {
            let message = format!("replicated to {synced} of {total} seed(s)");
            self.set_sync_status(
                key,
                Some(SyncPhase::Synced),
                CONDITION_STATUS_TRUE,
                REASON_ALL_SEEDS_SYNCED,
                &message,
            )
            .await;
            info!(synced, total, "Location in sync");
            return Ok(Action::await_change());
        }

        let err = Error::PartialSync { total, failures };
        let message = err.to_string();
        self.set_sync_status(
            key,
            Some(SyncPhase::PartiallyFailed),
            CONDITION_STATUS_FALSE,
            REASON_SEED_SYNC_FAILED,
            &message,
        )
        .await;
        self.warn_event(&master, REASON_SEED_SYNC_FAILED, &message).await;
        Err(err)
    }
}
