//! Lease based leader election
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs
//! controllers. The holder renews every [`RENEW_INTERVAL`]; others retry
//! every [`RETRY_INTERVAL`] and take over once the lease has not been
//! renewed for its duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::FIELD_MANAGER;

pub const LEASE_NAME: &str = "fleetplane-operator-leader";
pub const LEASE_DURATION_SECS: i32 = 15;
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Identity written into the lease: the pod name, else the host name
pub fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeaseAction {
    /// We hold it; bump the renew time
    Renew,
    /// Vacant or expired; claim it
    Acquire,
    /// Someone else holds a live lease
    Wait,
}

fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }
    if holder.map_or(true, str::is_empty) {
        return LeaseAction::Acquire;
    }
    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(i64::from(duration))
        })
        .unwrap_or(true);
    if expired {
        LeaseAction::Acquire
    } else {
        LeaseAction::Wait
    }
}

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag, true while this replica holds the lease
    pub fn is_leader(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    /// Keep acquiring or renewing the lease until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(identity = %self.identity, lease = LEASE_NAME, "Starting leader election");
        loop {
            let wait = match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if !self.is_leader.swap(true, Ordering::Relaxed) {
                        info!("Acquired leadership for lease {}", LEASE_NAME);
                    }
                    RENEW_INTERVAL
                }
                Ok(false) => {
                    if self.is_leader.swap(false, Ordering::Relaxed) {
                        warn!("Lost leadership for lease {}", LEASE_NAME);
                    }
                    RETRY_INTERVAL
                }
                Err(e) => {
                    warn!("Leader election error: {}", e);
                    self.is_leader.store(false, Ordering::Relaxed);
                    RETRY_INTERVAL
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.is_leader.store(false, Ordering::Relaxed);
    }

    /// Resolve once leadership is held; `false` if cancelled first
    pub async fn wait_for_leadership(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.is_leader.load(Ordering::Relaxed) {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let params = PatchParams::apply(FIELD_MANAGER);

        let existing = match self.leases.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS),
                        ..Default::default()
                    }),
                };
                self.leases.create(&PostParams::default(), &lease).await?;
                info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        let patch = match decide(existing.spec.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Renew => serde_json::json!({
                "metadata": { "resourceVersion": existing.metadata.resource_version },
                "spec": {
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            }),
            LeaseAction::Acquire => {
                debug!(
                    previous = ?existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref()),
                    "Lease expired, taking over"
                );
                serde_json::json!({
                    "metadata": { "resourceVersion": existing.metadata.resource_version },
                    "spec": {
                        "holderIdentity": self.identity,
                        "acquireTime": MicroTime(now),
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                        "leaseTransitions": existing
                            .spec
                            .as_ref()
                            .and_then(|s| s.lease_transitions)
                            .unwrap_or(0) + 1,
                    }
                })
            }
        };

        // the version token makes two replicas racing for an expired lease
        // produce one winner and one conflict
        match self
            .leases
            .patch(LEASE_NAME, &params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str, renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            ..Default::default()
        }
    }

    #[test]
    fn test_holder_renews() {
        assert_eq!(decide(Some(&spec("pod-a", 1)), "pod-a", Utc::now()), LeaseAction::Renew);
    }

    #[test]
    fn test_live_lease_of_other_holder_waits() {
        assert_eq!(decide(Some(&spec("pod-b", 1)), "pod-a", Utc::now()), LeaseAction::Wait);
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        assert_eq!(decide(Some(&spec("pod-b", 60)), "pod-a", Utc::now()), LeaseAction::Acquire);
    }

    #[test]
    fn test_vacant_lease_is_acquired() {
        assert_eq!(decide(None, "pod-a", Utc::now()), LeaseAction::Acquire);
        assert_eq!(decide(Some(&spec("", 1)), "pod-a", Utc::now()), LeaseAction::Acquire);
    }
}
