//! Unit tests for the ClusterBackupStorageLocation sync controller

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::cbsl_sync::{CbslSyncController, SeedCluster, SyncOptions, MANAGED_BY};
use super::conditions::{is_condition_true, CONDITION_TYPE_SEEDS_SYNCED};
use super::engine::Reconciler;
use super::events::MemoryEventRecorder;
use super::finalizers::{has_finalizer, SEED_CLEANUP_FINALIZER};
use super::updater::RetryConfig;
use crate::crd::{
    BackupStorageLocationPhase, ClusterBackupStorageLocation, ClusterBackupStorageLocationSpec,
    ClusterBackupStorageLocationStatus, ObjectStorageLocation, SecretKeySelector, SyncPhase,
    MANAGED_BY_LABEL, PAUSED_ANNOTATION, PROJECT_ID_LABEL,
};
use crate::error::{Error, Result};
use crate::store::{MemoryStore, ObjectKey, ObjectStore};

const NAMESPACE: &str = "fleetplane-system";

type Locations = MemoryStore<ClusterBackupStorageLocation>;
type Secrets = MemoryStore<Secret>;

/// A seed whose API server cannot be reached
struct Unreachable;

fn unreachable() -> Error {
    Error::Timeout {
        what: "seed API server".to_string(),
        seconds: 10,
    }
}

#[async_trait]
impl<K: crate::store::StoreObject> ObjectStore<K> for Unreachable {
    async fn get(&self, _key: &ObjectKey) -> Result<K> {
        Err(unreachable())
    }
    async fn list(&self, _namespace: Option<&str>) -> Result<Vec<K>> {
        Err(unreachable())
    }
    async fn create(&self, _obj: &K) -> Result<K> {
        Err(unreachable())
    }
    async fn replace(&self, _obj: &K) -> Result<K> {
        Err(unreachable())
    }
    async fn replace_status(&self, _obj: &K) -> Result<K> {
        Err(unreachable())
    }
    async fn patch(&self, _key: &ObjectKey, _patch: &Value) -> Result<K> {
        Err(unreachable())
    }
    async fn delete(&self, _key: &ObjectKey) -> Result<()> {
        Err(unreachable())
    }
    fn watch(&self) -> BoxStream<'static, Result<K>> {
        stream::empty().boxed()
    }
}

struct Fixture {
    master: Arc<Locations>,
    master_secrets: Arc<Secrets>,
    seed: Arc<Locations>,
    seed_secrets: Arc<Secrets>,
    events: Arc<MemoryEventRecorder>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            master: Arc::new(MemoryStore::new("master")),
            master_secrets: Arc::new(MemoryStore::new("master")),
            seed: Arc::new(MemoryStore::new("seed-eu")),
            seed_secrets: Arc::new(MemoryStore::new("seed-eu")),
            events: Arc::new(MemoryEventRecorder::new()),
        }
    }

    fn seed(&self) -> SeedCluster {
        SeedCluster::new("seed-eu", self.seed.clone(), self.seed_secrets.clone())
    }

    fn controller(&self, seeds: Vec<SeedCluster>) -> CbslSyncController {
        CbslSyncController::new(
            self.master.clone(),
            self.master_secrets.clone(),
            seeds,
            self.events.clone(),
            SyncOptions {
                retry: RetryConfig::with_max_attempts(3),
                ..Default::default()
            },
        )
    }
}

fn location(name: &str) -> ClusterBackupStorageLocation {
    let mut cbsl = ClusterBackupStorageLocation::new(
        name,
        ClusterBackupStorageLocationSpec {
            provider: "aws".to_string(),
            object_storage: ObjectStorageLocation {
                bucket: "fleet-backups".to_string(),
                prefix: Some("eu".to_string()),
                ca_cert: None,
            },
            credential: Some(SecretKeySelector {
                name: "backup-credentials".to_string(),
                key: "cloud".to_string(),
            }),
            ..Default::default()
        },
    );
    cbsl.metadata.namespace = Some(NAMESPACE.to_string());
    cbsl.metadata.labels = Some(BTreeMap::from([(
        PROJECT_ID_LABEL.to_string(),
        "proj-1".to_string(),
    )]));
    cbsl
}

fn credentials() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("backup-credentials".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "cloud".to_string(),
            ByteString(b"[default]\naws_access_key_id=AKIA".to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced(NAMESPACE, name)
}

#[tokio::test]
async fn test_creates_seed_copy_and_secret() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();

    let controller = fx.controller(vec![fx.seed()]);
    controller
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap();

    let copy = fx.seed.snapshot(&key("primary")).expect("seed copy");
    assert_eq!(copy.spec, location("primary").spec);
    assert_eq!(copy.labels()[PROJECT_ID_LABEL], "proj-1");
    assert_eq!(copy.labels()[MANAGED_BY_LABEL], MANAGED_BY);

    let secret = fx
        .seed_secrets
        .snapshot(&key("backup-credentials"))
        .expect("seed secret");
    assert_eq!(secret.data, credentials().data);

    let master = fx.master.snapshot(&key("primary")).unwrap();
    assert!(has_finalizer(&master, SEED_CLEANUP_FINALIZER));
    assert_eq!(master.sync_phase(), SyncPhase::Synced);
    let status = master.status.unwrap();
    assert!(is_condition_true(&status.conditions, CONDITION_TYPE_SEEDS_SYNCED));
}

#[tokio::test]
async fn test_second_reconcile_writes_nothing() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();
    let controller = fx.controller(vec![fx.seed()]);
    let cancel = CancellationToken::new();

    controller.reconcile(&key("primary"), &cancel).await.unwrap();
    let master_writes = fx.master.writes();
    let seed_writes = fx.seed.writes();
    let secret_writes = fx.seed_secrets.writes();
    let first = fx.seed.snapshot(&key("primary")).unwrap();

    controller.reconcile(&key("primary"), &cancel).await.unwrap();
    assert_eq!(fx.master.writes(), master_writes);
    assert_eq!(fx.seed.writes(), seed_writes);
    assert_eq!(fx.seed_secrets.writes(), secret_writes);
    let second = fx.seed.snapshot(&key("primary")).unwrap();
    assert_eq!(second.metadata.resource_version, first.metadata.resource_version);
}

#[tokio::test]
async fn test_spec_change_is_patched_into_seed() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();
    let controller = fx.controller(vec![fx.seed()]);
    let cancel = CancellationToken::new();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();

    let mut master = fx.master.get(&key("primary")).await.unwrap();
    master.spec.object_storage.bucket = "fleet-backups-v2".to_string();
    fx.master.replace(&master).await.unwrap();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();

    let copy = fx.seed.snapshot(&key("primary")).unwrap();
    assert_eq!(copy.spec.object_storage.bucket, "fleet-backups-v2");
}

#[tokio::test]
async fn test_label_removed_on_master_is_removed_from_seed() {
    let fx = Fixture::new();
    let mut labeled = location("primary");
    labeled.labels_mut().insert("team".to_string(), "storage".to_string());
    fx.master.create(&labeled).await.unwrap();
    let mut secret = credentials();
    secret.labels_mut().insert("team".to_string(), "storage".to_string());
    fx.master_secrets.create(&secret).await.unwrap();
    let controller = fx.controller(vec![fx.seed()]);
    let cancel = CancellationToken::new();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();
    assert_eq!(fx.seed.snapshot(&key("primary")).unwrap().labels()["team"], "storage");

    let mut master = fx.master.get(&key("primary")).await.unwrap();
    master.labels_mut().remove("team");
    fx.master.replace(&master).await.unwrap();
    let mut source = fx.master_secrets.get(&key("backup-credentials")).await.unwrap();
    source.labels_mut().remove("team");
    fx.master_secrets.replace(&source).await.unwrap();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();

    let copy = fx.seed.snapshot(&key("primary")).unwrap();
    assert_eq!(
        copy.labels(),
        &BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (PROJECT_ID_LABEL.to_string(), "proj-1".to_string()),
        ])
    );
    let seed_secret = fx.seed_secrets.snapshot(&key("backup-credentials")).unwrap();
    assert!(!seed_secret.labels().contains_key("team"));
    assert_eq!(seed_secret.labels()[MANAGED_BY_LABEL], MANAGED_BY);
}

#[tokio::test]
async fn test_same_uid_copy_is_left_alone() {
    let fx = Fixture::new();
    let master = fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();

    // same object seen through a second registration of the master cluster
    let mut alias = master.clone();
    alias.spec.object_storage.bucket = "diverged".to_string();
    fx.seed.insert(alias);
    let writes = fx.seed.writes();

    let controller = fx.controller(vec![fx.seed()]);
    controller
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap();

    let copy = fx.seed.snapshot(&key("primary")).unwrap();
    assert_eq!(copy.spec.object_storage.bucket, "diverged");
    assert_eq!(fx.seed.writes(), writes);
    assert!(fx.seed_secrets.is_empty());
}

#[tokio::test]
async fn test_seed_sharing_the_master_store_converges() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();

    let aliased = SeedCluster::new("master-as-seed", fx.master.clone(), fx.master_secrets.clone());
    let controller = fx.controller(vec![aliased, fx.seed()]);
    let cancel = CancellationToken::new();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();
    let writes = fx.master.writes();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();

    assert_eq!(fx.master.writes(), writes);
    assert_eq!(fx.master.len(), 1);
    assert!(fx.seed.snapshot(&key("primary")).is_some());
}

#[tokio::test]
async fn test_status_is_pushed_without_sync_bookkeeping() {
    let fx = Fixture::new();
    let created = fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();

    let mut observed = created.clone();
    observed.status = Some(ClusterBackupStorageLocationStatus {
        phase: Some(BackupStorageLocationPhase::Available),
        last_validation_time: Some("2026-10-01T00:00:00Z".to_string()),
        ..Default::default()
    });
    fx.master.replace_status(&observed).await.unwrap();

    let controller = fx.controller(vec![fx.seed()]);
    controller
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap();

    let status = fx.seed.snapshot(&key("primary")).unwrap().status.unwrap();
    assert_eq!(status.phase, Some(BackupStorageLocationPhase::Available));
    assert_eq!(status.sync_phase, None);
    assert!(status.conditions.is_empty());
}

#[tokio::test]
async fn test_one_failing_seed_does_not_block_others() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();

    let broken = SeedCluster::new("seed-us", Arc::new(Unreachable), Arc::new(Unreachable));
    let controller = fx.controller(vec![broken, fx.seed()]);
    let err = controller
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::PartialSync { total, failures } => {
            assert_eq!(total, 2);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "seed-us");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(fx.seed.snapshot(&key("primary")).is_some());

    let master = fx.master.snapshot(&key("primary")).unwrap();
    assert_eq!(master.sync_phase(), SyncPhase::PartiallyFailed);
    let warnings = fx.events.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, "SeedSyncFailed");
    assert!(warnings[0].message.contains("seed-us"));
}

#[tokio::test]
async fn test_missing_secret_is_reported() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();

    let controller = fx.controller(vec![fx.seed()]);
    let err = controller
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("backup-credentials"));
    match err {
        Error::PartialSync { failures, .. } => {
            assert!(matches!(failures[0].1, Error::MissingSecret { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_deletion_cleans_seeds_before_releasing_finalizer() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();
    let controller = fx.controller(vec![fx.seed()]);
    let cancel = CancellationToken::new();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();

    fx.master.delete(&key("primary")).await.unwrap();
    let held = fx.master.snapshot(&key("primary")).expect("finalizer holds object");
    assert!(held.metadata.deletion_timestamp.is_some());
    assert!(fx.seed.snapshot(&key("primary")).is_some());

    controller.reconcile(&key("primary"), &cancel).await.unwrap();
    assert!(fx.seed.snapshot(&key("primary")).is_none());
    assert!(fx.master.snapshot(&key("primary")).is_none());
}

#[tokio::test]
async fn test_failed_cleanup_keeps_finalizer() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();
    let cancel = CancellationToken::new();
    fx.controller(vec![fx.seed()])
        .reconcile(&key("primary"), &cancel)
        .await
        .unwrap();

    fx.master.delete(&key("primary")).await.unwrap();
    let broken = SeedCluster::new("seed-us", Arc::new(Unreachable), Arc::new(Unreachable));
    let err = fx
        .controller(vec![broken])
        .reconcile(&key("primary"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartialSync { .. }));

    let held = fx.master.snapshot(&key("primary")).unwrap();
    assert!(has_finalizer(&held, SEED_CLEANUP_FINALIZER));
    assert_eq!(held.sync_phase(), SyncPhase::Cleaning);
}

#[tokio::test]
async fn test_paused_location_is_skipped() {
    let fx = Fixture::new();
    let mut paused = location("primary");
    paused.metadata.annotations = Some(BTreeMap::from([(
        PAUSED_ANNOTATION.to_string(),
        "true".to_string(),
    )]));
    fx.master.create(&paused).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();

    fx.controller(vec![fx.seed()])
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(fx.seed.is_empty());
    let master = fx.master.snapshot(&key("primary")).unwrap();
    assert!(!has_finalizer(&master, SEED_CLEANUP_FINALIZER));
}

#[tokio::test]
async fn test_paused_location_is_still_cleaned_up_on_delete() {
    let fx = Fixture::new();
    fx.master.create(&location("primary")).await.unwrap();
    fx.master_secrets.create(&credentials()).await.unwrap();
    let controller = fx.controller(vec![fx.seed()]);
    let cancel = CancellationToken::new();
    controller.reconcile(&key("primary"), &cancel).await.unwrap();

    let mut master = fx.master.get(&key("primary")).await.unwrap();
    master
        .annotations_mut()
        .insert(PAUSED_ANNOTATION.to_string(), "true".to_string());
    fx.master.replace(&master).await.unwrap();
    fx.master.delete(&key("primary")).await.unwrap();

    controller.reconcile(&key("primary"), &cancel).await.unwrap();
    assert!(fx.seed.snapshot(&key("primary")).is_none());
    assert!(fx.master.snapshot(&key("primary")).is_none());
}

#[tokio::test]
async fn test_invalid_spec_is_terminal() {
    let fx = Fixture::new();
    let mut invalid = location("primary");
    invalid.spec.object_storage.bucket = String::new();
    fx.master.create(&invalid).await.unwrap();

    let err = fx
        .controller(vec![fx.seed()])
        .reconcile(&key("primary"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_terminal());
    assert!(fx.seed.is_empty());
    assert_eq!(fx.events.warnings()[0].reason, "InvalidSpec");
}

#[tokio::test]
async fn test_missing_master_is_converged() {
    let fx = Fixture::new();
    fx.controller(vec![fx.seed()])
        .reconcile(&key("gone"), &CancellationToken::new())
        .await
        .unwrap();
}
