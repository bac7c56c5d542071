//! Controllers for the fleet control plane
//!
//! The engine (work queue, worker pool, watch mapping) and the conflict-retry
//! updater are shared. On top of them sit the IPAM controller for Machines,
//! the ClusterBackupStorageLocation sync controller and the addon migration
//! registry used by the apply pipeline.

pub mod cbsl_sync;
#[cfg(test)]
mod cbsl_sync_test;
pub mod conditions;
pub mod engine;
pub mod events;
pub mod finalizers;
pub mod ipam;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod migrations;
pub mod queue;
pub mod updater;

pub use cbsl_sync::{CbslSyncController, SeedCluster, SyncOptions};
pub use engine::{own_key, periodic_list, Action, Controller, Reconciler};
pub use events::{EventRecorder, EventType, KubeEventRecorder, MemoryEventRecorder};
pub use finalizers::SEED_CLEANUP_FINALIZER;
pub use ipam::{IpamController, IpamOptions, Pool};
pub use migrations::{ClusterInfo, Migration, MigrationContext, MigrationRegistry};
pub use queue::{QueueBackoff, WorkQueue};
pub use updater::{
    ensure_labels, patch_with_retry, update_status_with_retry, update_with_retry, RetryConfig,
};
