//! Recreate objects whose immutable fields changed
//!
//! Label selectors of workloads, the `roleRef` of RBAC bindings and most of a
//! CSIDriver's spec cannot be updated. When a new addon version changes one
//! of them, the live object is deleted before apply so the apply creates it
//! fresh.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use super::{ClusterInfo, Migration, MigrationContext};
use crate::error::{Error, Result};
use crate::store::ObjectKey;
use crate::unstructured::Unstructured;

/// Kinds of one API group and the field paths that cannot change on them
#[derive(Clone, Debug)]
pub struct ImmutableRule {
    pub group: &'static str,
    pub kinds: &'static [&'static str],
    /// Whether objects of these kinds live in a namespace
    pub namespaced: bool,
    pub paths: &'static [&'static [&'static str]],
}

impl ImmutableRule {
    fn matches(&self, group: &str, kind: &str) -> bool {
        self.group == group && self.kinds.contains(&kind)
    }
}

const WORKLOAD_SELECTOR: ImmutableRule = ImmutableRule {
    group: "apps",
    kinds: &["Deployment", "DaemonSet", "StatefulSet"],
    namespaced: true,
    paths: &[&["spec", "selector"]],
};

const CLUSTER_ROLE_BINDING_ROLE_REF: ImmutableRule = ImmutableRule {
    group: "rbac.authorization.k8s.io",
    kinds: &["ClusterRoleBinding"],
    namespaced: false,
    paths: &[&["roleRef"]],
};

const ROLE_BINDING_ROLE_REF: ImmutableRule = ImmutableRule {
    group: "rbac.authorization.k8s.io",
    kinds: &["RoleBinding"],
    namespaced: true,
    paths: &[&["roleRef"]],
};

const CSI_DRIVER_SPEC: ImmutableRule = ImmutableRule {
    group: "storage.k8s.io",
    kinds: &["CSIDriver"],
    namespaced: false,
    paths: &[
        &["spec", "attachRequired"],
        &["spec", "podInfoOnMount"],
        &["spec", "volumeLifecycleModes"],
        &["spec", "fsGroupPolicy"],
    ],
};

pub struct ImmutableFieldMigration {
    name: String,
    rules: Vec<ImmutableRule>,
    /// Restrict to these addons; empty means every addon
    addons: BTreeSet<String>,
    /// Only run on clusters with this feature gate
    feature: Option<String>,
}

impl ImmutableFieldMigration {
    pub fn new(name: &str, rules: Vec<ImmutableRule>) -> Self {
        Self {
            name: name.to_string(),
            rules,
            addons: BTreeSet::new(),
            feature: None,
        }
    }

    pub fn for_addons<I, S>(mut self, addons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addons = addons.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring_feature(mut self, feature: &str) -> Self {
        self.feature = Some(feature.to_string());
        self
    }

    pub fn workload_selectors() -> Self {
        Self::new("workload-selectors", vec![WORKLOAD_SELECTOR])
    }

    pub fn role_refs() -> Self {
        Self::new(
            "binding-role-refs",
            vec![CLUSTER_ROLE_BINDING_ROLE_REF, ROLE_BINDING_ROLE_REF],
        )
    }

    pub fn csi_drivers() -> Self {
        Self::new("csi-driver-spec", vec![CSI_DRIVER_SPEC])
    }

    fn rule_for(&self, obj: &Unstructured) -> Result<Option<&ImmutableRule>> {
        let gvk = obj.gvk()?;
        Ok(self.rules.iter().find(|r| r.matches(&gvk.group, &gvk.kind)))
    }

    /// Path of the first immutable field set in `rendered` that differs live
    fn changed_field(
        rule: &ImmutableRule,
        rendered: &Unstructured,
        live: &Unstructured,
    ) -> Result<Option<String>> {
        for path in rule.paths {
            let Some(wanted) = rendered.value_at(path)? else {
                continue;
            };
            if live.value_at(path)? != Some(wanted) {
                return Ok(Some(path.join(".")));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Migration for ImmutableFieldMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn targets(&self, cluster: &ClusterInfo, addon: &str) -> bool {
        let addon_ok = self.addons.is_empty() || self.addons.contains(addon);
        let feature_ok = self
            .feature
            .as_deref()
            .map_or(true, |f| cluster.has_feature(f));
        addon_ok && feature_ok
    }

    async fn pre_apply(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        for rendered in ctx.objects {
            let Some(rule) = self.rule_for(rendered)? else {
                continue;
            };
            let gvk = rendered.gvk()?;
            let namespace = match (rule.namespaced, rendered.namespace()?) {
                (true, None) => {
                    return Err(Error::field(
                        "metadata.namespace",
                        format!("required for namespaced kind {}", gvk.kind),
                    ))
                }
                (true, Some(ns)) => Some(ns.to_string()),
                (false, _) => None,
            };
            let key = ObjectKey {
                namespace,
                name: rendered.name()?.to_string(),
            };
            let live = match ctx.store.get(&gvk, &key).await {
                Ok(live) => live,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let Some(field) = Self::changed_field(rule, rendered, &live)? else {
                continue;
            };
            info!(
                migration = %self.name,
                kind = %gvk.kind,
                object = %key,
                %field,
                "Immutable field changed, deleting object for recreation"
            );
            match ctx.store.delete(&gvk, &key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
