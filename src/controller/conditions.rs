//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Set on Machines by the IPAM controller
pub const CONDITION_TYPE_NETWORK_INITIALIZED: &str = "NetworkInitialized";
/// Set on master ClusterBackupStorageLocations by the sync controller
pub const CONDITION_TYPE_SEEDS_SYNCED: &str = "SeedsSynced";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

pub const REASON_ADDRESS_ASSIGNED: &str = "AddressAssigned";
pub const REASON_CIDR_EXHAUSTED: &str = "CidrExhausted";
pub const REASON_INVALID_PROVIDER_SPEC: &str = "InvalidProviderSpec";
pub const REASON_ALL_SEEDS_SYNCED: &str = "AllSeedsSynced";
pub const REASON_SEED_SYNC_FAILED: &str = "SeedSyncFailed";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Update or add a condition to the conditions list.
///
/// The transition time only moves when the status flips, so setting the same
/// condition twice leaves the list untouched. Returns whether anything
/// changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason && existing.message == message {
            return false;
        }
        if existing.status != status {
            existing.last_transition_time = Utc::now().to_rfc3339();
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        });
    }
    true
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            CONDITION_TYPE_NETWORK_INITIALIZED,
            CONDITION_STATUS_TRUE,
            REASON_ADDRESS_ASSIGNED,
            "assigned 10.0.0.2/24",
        ));
        assert_eq!(conditions.len(), 1);
        assert!(is_condition_true(&conditions, CONDITION_TYPE_NETWORK_INITIALIZED));
    }

    #[test]
    fn test_set_same_condition_is_noop() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_SEEDS_SYNCED,
            CONDITION_STATUS_TRUE,
            REASON_ALL_SEEDS_SYNCED,
            "2 seed(s)",
        );
        let before = conditions.clone();
        assert!(!set_condition(
            &mut conditions,
            CONDITION_TYPE_SEEDS_SYNCED,
            CONDITION_STATUS_TRUE,
            REASON_ALL_SEEDS_SYNCED,
            "2 seed(s)"
        ));
        assert_eq!(conditions, before);
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_SEEDS_SYNCED,
            CONDITION_STATUS_FALSE,
            REASON_SEED_SYNC_FAILED,
            "seed-a failed",
        );
        let first = conditions[0].last_transition_time.clone();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_SEEDS_SYNCED,
            CONDITION_STATUS_FALSE,
            REASON_SEED_SYNC_FAILED,
            "seed-b failed",
        );
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "seed-b failed");
    }

    #[test]
    fn test_remove_condition() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_SEEDS_SYNCED,
            CONDITION_STATUS_UNKNOWN,
            "Pending",
            "",
        );
        remove_condition(&mut conditions, CONDITION_TYPE_SEEDS_SYNCED);
        assert!(find_condition(&conditions, CONDITION_TYPE_SEEDS_SYNCED).is_none());
    }
}
