//! Custom Resource Definitions for fleetplane
//!
//! `Machine` is the workload object the IPAM controller initializes in user
//! clusters; `ClusterBackupStorageLocation` is replicated from the master
//! cluster into every seed.

mod backup_storage_location;
mod machine;
pub mod types;

#[cfg(test)]
mod tests;

pub use backup_storage_location::{
    BackupStorageLocationPhase, ClusterBackupStorageLocation, ClusterBackupStorageLocationSpec,
    ClusterBackupStorageLocationStatus, ObjectStorageLocation, SyncPhase,
};
pub use machine::{
    DnsConfig, Machine, MachineSpec, MachineStatus, NetworkConfig, ProviderSpec,
    INITIALIZERS_ANNOTATION, IPAM_INITIALIZER,
};
pub use types::*;
