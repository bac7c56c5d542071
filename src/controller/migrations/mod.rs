//! Addon migrations
//!
//! The addon pipeline renders a manifest and applies it to a user cluster.
//! Some changes between addon versions cannot be applied in place because
//! the API server rejects updates to immutable fields. Migrations run around
//! the apply and remove steps and fix such objects up, usually by deleting
//! them so the apply recreates them.
//!
//! Every hook must be idempotent and must treat a missing object as done.
//! The registry runs the migrations whose `targets` predicate accepts the
//! cluster and addon, in registration order, and keeps going after a
//! failure so one broken migration does not hide the others.

mod immutable;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use immutable::{ImmutableFieldMigration, ImmutableRule};

use crate::error::{Error, Result};
use crate::store::DynamicStore;
use crate::unstructured::Unstructured;

/// What a migration may know about the cluster it runs against
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    /// Kubernetes version, e.g. `1.30.2`
    pub version: String,
    /// Cloud provider name, e.g. `aws`
    pub provider: String,
    /// Feature gates enabled on the cluster
    pub features: BTreeSet<String>,
}

impl ClusterInfo {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Inputs shared by all hooks of one apply or remove
pub struct MigrationContext<'a> {
    pub cluster: &'a ClusterInfo,
    pub addon: &'a str,
    /// Objects of the rendered manifest
    pub objects: &'a [Unstructured],
    /// Live objects in the user cluster
    pub store: &'a dyn DynamicStore,
}

#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this migration applies to `addon` on `cluster`
    fn targets(&self, cluster: &ClusterInfo, addon: &str) -> bool;

    async fn pre_apply(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn post_apply(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn pre_remove(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn post_remove(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Hook {
    PreApply,
    PostApply,
    PreRemove,
    PostRemove,
}

/// Addons whose workloads changed their label selectors between releases
const SELECTOR_ADDONS: [&str; 6] = [
    "canal",
    "cilium",
    "coredns",
    "kube-proxy",
    "metrics-server",
    "node-local-dns",
];

/// Addons whose bindings moved to a different role between releases
const ROLE_REF_ADDONS: [&str; 4] = ["canal", "cilium", "csi", "metrics-server"];

/// CSI drivers are only deployed as an addon with an external cloud provider
pub const EXTERNAL_CLOUD_PROVIDER_FEATURE: &str = "externalCloudProvider";

/// Ordered set of migrations behind the same four hooks
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Arc<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The migrations shipped with fleetplane
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(
                ImmutableFieldMigration::workload_selectors().for_addons(SELECTOR_ADDONS),
            ))
            .register(Arc::new(
                ImmutableFieldMigration::role_refs().for_addons(ROLE_REF_ADDONS),
            ))
            .register(Arc::new(
                ImmutableFieldMigration::csi_drivers()
                    .for_addons(["csi"])
                    .requiring_feature(EXTERNAL_CLOUD_PROVIDER_FEATURE),
            ));
        registry
    }

    pub fn register(&mut self, migration: Arc<dyn Migration>) -> &mut Self {
        self.migrations.push(migration);
        self
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    async fn run(&self, hook: Hook, ctx: &MigrationContext<'_>) -> Result<()> {
        let mut failures = Vec::new();
        for migration in &self.migrations {
            if !migration.targets(ctx.cluster, ctx.addon) {
                continue;
            }
            debug!(
                migration = migration.name(),
                addon = ctx.addon,
                cluster = %ctx.cluster.name,
                ?hook,
                "Running migration hook"
            );
            let result = match hook {
                Hook::PreApply => migration.pre_apply(ctx).await,
                Hook::PostApply => migration.post_apply(ctx).await,
                Hook::PreRemove => migration.pre_remove(ctx).await,
                Hook::PostRemove => migration.post_remove(ctx).await,
            };
            if let Err(e) = result {
                warn!(migration = migration.name(), ?hook, "Migration hook failed: {}", e);
                failures.push((migration.name().to_string(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::MigrationErrors(failures))
        }
    }
}

#[async_trait]
impl Migration for MigrationRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    fn targets(&self, cluster: &ClusterInfo, addon: &str) -> bool {
        self.migrations.iter().any(|m| m.targets(cluster, addon))
    }

    async fn pre_apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        self.run(Hook::PreApply, ctx).await
    }

    async fn post_apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        self.run(Hook::PostApply, ctx).await
    }

    async fn pre_remove(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        self.run(Hook::PreRemove, ctx).await
    }

    async fn post_remove(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        self.run(Hook::PostRemove, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDynamicStore;
    use std::sync::Mutex;

    /// Records every hook call; fails `pre_apply` when asked to
    struct Recording {
        name: String,
        addon: String,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn new(name: &str, addon: &str, calls: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                addon: addon.to_string(),
                fail: false,
                calls: Arc::clone(calls),
            }
        }

        fn record(&self, hook: &str) {
            self.calls.lock().unwrap().push(format!("{}:{hook}", self.name));
        }
    }

    #[async_trait]
    impl Migration for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn targets(&self, _cluster: &ClusterInfo, addon: &str) -> bool {
            addon == self.addon
        }

        async fn pre_apply(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
            self.record("pre_apply");
            if self.fail {
                return Err(Error::ConfigError("broken".into()));
            }
            Ok(())
        }

        async fn post_apply(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
            self.record("post_apply");
            Ok(())
        }

        async fn pre_remove(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
            self.record("pre_remove");
            Ok(())
        }

        async fn post_remove(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
            self.record("post_remove");
            Ok(())
        }
    }

    fn context<'a>(
        cluster: &'a ClusterInfo,
        addon: &'a str,
        store: &'a MemoryDynamicStore,
    ) -> MigrationContext<'a> {
        MigrationContext {
            cluster,
            addon,
            objects: &[],
            store,
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MigrationRegistry::new();
        registry
            .register(Arc::new(Recording::new("first", "csi", &calls)))
            .register(Arc::new(Recording::new("second", "csi", &calls)));

        let cluster = ClusterInfo::default();
        let store = MemoryDynamicStore::new();
        let ctx = context(&cluster, "csi", &store);
        registry.pre_apply(&ctx).await.unwrap();
        registry.post_apply(&ctx).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:pre_apply", "second:pre_apply", "first:post_apply", "second:post_apply"]
        );
    }

    #[tokio::test]
    async fn test_untargeted_migration_is_never_invoked() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MigrationRegistry::new();
        registry.register(Arc::new(Recording::new("csi-only", "csi", &calls)));

        let cluster = ClusterInfo::default();
        let store = MemoryDynamicStore::new();
        let ctx = context(&cluster, "dns", &store);
        registry.pre_apply(&ctx).await.unwrap();
        registry.post_apply(&ctx).await.unwrap();
        registry.pre_remove(&ctx).await.unwrap();
        registry.post_remove(&ctx).await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert!(!registry.targets(&cluster, "dns"));
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut broken = Recording::new("broken", "csi", &calls);
        broken.fail = true;
        let mut registry = MigrationRegistry::new();
        registry
            .register(Arc::new(broken))
            .register(Arc::new(Recording::new("healthy", "csi", &calls)));

        let cluster = ClusterInfo::default();
        let store = MemoryDynamicStore::new();
        let err = registry
            .pre_apply(&context(&cluster, "csi", &store))
            .await
            .unwrap_err();

        match err {
            Error::MigrationErrors(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "broken");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(calls.lock().unwrap().contains(&"healthy:pre_apply".to_string()));
    }

    #[test]
    fn test_builtin_registry() {
        assert_eq!(MigrationRegistry::builtin().len(), 3);
    }

    #[test]
    fn test_builtin_registry_is_gated() {
        let registry = MigrationRegistry::builtin();
        let mut cluster = ClusterInfo::default();
        assert!(!registry.targets(&cluster, "dashboard"));
        assert!(registry.targets(&cluster, "coredns"));
        assert!(registry.targets(&cluster, "csi"));

        cluster
            .features
            .insert(EXTERNAL_CLOUD_PROVIDER_FEATURE.to_string());
        assert!(!registry.targets(&cluster, "dashboard"));
    }
}
