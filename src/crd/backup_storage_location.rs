//! ClusterBackupStorageLocation Custom Resource Definition
//!
//! Declares where cluster backups are written. The master cluster holds the
//! canonical object; the sync controller replicates spec, labels, the
//! referenced credential secret and the observed status into every seed.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretKeySelector};
use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleetplane.io",
    version = "v1",
    kind = "ClusterBackupStorageLocation",
    namespaced,
    status = "ClusterBackupStorageLocationStatus",
    shortname = "cbsl",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Bucket","type":"string","jsonPath":".spec.objectStorage.bucket"}"#,
    printcolumn = r#"{"name":"Sync","type":"string","jsonPath":".status.syncPhase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBackupStorageLocationSpec {
    /// Storage provider plugin name, e.g. `aws` or `gcp`
    pub provider: String,

    pub object_storage: ObjectStorageLocation,

    /// Provider-specific settings passed through untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Secret holding the provider credentials, in the object's namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<SecretKeySelector>,

    #[serde(default)]
    pub default: bool,

    /// How often backups in the bucket are re-listed, e.g. `1m`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,

    /// How often the location's availability is checked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_frequency: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    pub bucket: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// PEM bundle used to verify the storage endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

/// Availability of the storage location as observed by the backup tooling
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupStorageLocationPhase {
    Available,
    Unavailable,
}

/// Replication progress of a master object across seeds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Pending,
    Syncing,
    Synced,
    PartiallyFailed,
    Cleaning,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Pending => "Pending",
            SyncPhase::Syncing => "Syncing",
            SyncPhase::Synced => "Synced",
            SyncPhase::PartiallyFailed => "PartiallyFailed",
            SyncPhase::Cleaning => "Cleaning",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBackupStorageLocationStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupStorageLocationPhase>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 timestamp of the last backup listing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_validation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_phase: Option<SyncPhase>,
}

impl ClusterBackupStorageLocationSpec {
    /// Reject specs no seed could use
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(Error::field("spec.provider", "must not be empty"));
        }
        if self.object_storage.bucket.trim().is_empty() {
            return Err(Error::field("spec.objectStorage.bucket", "must not be empty"));
        }
        if let Some(credential) = &self.credential {
            if credential.name.is_empty() || credential.key.is_empty() {
                return Err(Error::field(
                    "spec.credential",
                    "name and key are both required",
                ));
            }
        }
        Ok(())
    }
}

impl ClusterBackupStorageLocation {
    pub fn sync_phase(&self) -> SyncPhase {
        self.status
            .as_ref()
            .and_then(|s| s.sync_phase)
            .unwrap_or_default()
    }
}
