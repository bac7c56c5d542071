//! IPAM controller
//!
//! Machines created with the `ipam` initializer get a static address from
//! the configured pools. There is no allocation ledger: the addresses in use
//! are whatever the live machines carry in their provider spec. That makes
//! the scan-then-write sequence racy unless two rules hold:
//!
//! 1. only one allocation runs at a time (the controller runs one worker);
//! 2. an allocation is not finished until a fresh read of the machine shows
//!    the written address, so the next scan is guaranteed to see it.

mod pool;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use pool::{assigned_address, parse_cidr, Pool};

use super::conditions::{
    set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_STATUS_UNKNOWN,
    CONDITION_TYPE_NETWORK_INITIALIZED, REASON_ADDRESS_ASSIGNED, REASON_CIDR_EXHAUSTED,
    REASON_INVALID_PROVIDER_SPEC,
};
use super::engine::{own_key, Action, Controller, Reconciler};
use super::events::{EventRecorder, EventType};
use super::finalizers::is_being_deleted;
use super::queue::QueueBackoff;
use super::updater::{update_status_with_retry, update_with_retry, RetryConfig};
use crate::crd::{Machine, MachineStatus, NetworkConfig, IPAM_INITIALIZER};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore};

pub const CONTROLLER_NAME: &str = "ipam";

#[derive(Clone, Debug)]
pub struct IpamOptions {
    /// Tried in order; the first pool with a free address wins
    pub pools: Vec<Pool>,
    /// How long to wait for a written address to become readable
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for IpamOptions {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }
}

/// Watch predicate: only machines still waiting for the initializer
pub fn needs_network(machine: &Machine) -> bool {
    machine.has_initializer(IPAM_INITIALIZER)
}

pub struct IpamController {
    machines: Arc<dyn ObjectStore<Machine>>,
    events: Arc<dyn EventRecorder>,
    options: IpamOptions,
}

impl IpamController {
    pub fn new(
        machines: Arc<dyn ObjectStore<Machine>>,
        events: Arc<dyn EventRecorder>,
        options: IpamOptions,
    ) -> Self {
        Self {
            machines,
            events,
            options,
        }
    }

    /// Controller watching machines that still carry the initializer
    pub fn controller(self: Arc<Self>, backoff: QueueBackoff) -> Controller<Self> {
        let watch = self.machines.watch();
        Controller::new(self, 1, backoff).watches_with(watch, needs_network, own_key)
    }

    /// Addresses held by live machines other than `skip`
    async fn used_addresses(&self, skip: &ObjectKey) -> Result<HashSet<IpAddr>> {
        let mut used = HashSet::new();
        for machine in self.machines.list(None).await? {
            if is_being_deleted(&machine) || &ObjectKey::from_object(&machine) == skip {
                continue;
            }
            let network = match machine.network() {
                Ok(Some(network)) if !network.cidr.is_empty() => network,
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        machine = %ObjectKey::from_object(&machine),
                        "Ignoring machine with unreadable network: {}", e
                    );
                    continue;
                }
            };
            match assigned_address(&network.cidr) {
                Ok(ip) => {
                    used.insert(ip);
                }
                Err(e) => warn!(
                    machine = %ObjectKey::from_object(&machine),
                    "Ignoring machine with unparseable address: {}", e
                ),
            }
        }
        Ok(used)
    }

    fn allocate(&self, used: &HashSet<IpAddr>) -> Result<(&Pool, IpAddr)> {
        self.options
            .pools
            .iter()
            .find_map(|pool| pool.first_free(used).map(|ip| (pool, ip)))
            .ok_or(Error::CidrExhausted {
                pools: self.options.pools.len(),
            })
    }

    /// Poll until a fresh read of the machine carries `cidr`
    async fn wait_for_assignment(
        &self,
        key: &ObjectKey,
        cidr: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + self.options.wait_timeout;
        loop {
            let machine = self.machines.get(key).await?;
            let visible = machine
                .network()
                .ok()
                .flatten()
                .map_or(false, |n| n.cidr == cidr);
            if visible {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("address {cidr} to appear on machine {key}"),
                    seconds: self.options.wait_timeout.as_secs(),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    async fn initialize(
        &self,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<NetworkConfig> {
        let key = ObjectKey::from_object(machine);

        let (network, pool) = match machine.network()? {
            Some(existing) if !existing.cidr.is_empty() => {
                debug!(%key, cidr = %existing.cidr, "Machine already has an address");
                (existing, None)
            }
            _ => {
                let used = self.used_addresses(&key).await?;
                let (pool, ip) = self.allocate(&used)?;
                debug!(%key, %pool, %ip, in_use = used.len(), "Picked address");
                (pool.assignment(ip), Some(pool.to_string()))
            }
        };

        update_with_retry(&*self.machines, &key, &self.options.retry, |m: &mut Machine| {
            m.set_network(&network)?;
            m.remove_initializer(IPAM_INITIALIZER);
            Ok(())
        })
        .await?;

        self.wait_for_assignment(&key, &network.cidr, cancel).await?;

        if let Some(pool) = pool {
            info!(cidr = %network.cidr, %pool, "Assigned address");
            #[cfg(feature = "metrics")]
            super::metrics::inc_ipam_allocation(&pool);
        }
        Ok(network)
    }

    async fn set_network_condition(
        &self,
        key: &ObjectKey,
        status: &str,
        reason: &str,
        message: &str,
    ) {
        let result = update_status_with_retry(
            &*self.machines,
            key,
            &self.options.retry,
            |m: &mut Machine| {
                let st = m.status.get_or_insert_with(MachineStatus::default);
                set_condition(
                    &mut st.conditions,
                    CONDITION_TYPE_NETWORK_INITIALIZED,
                    status,
                    reason,
                    message,
                );
                if status == CONDITION_STATUS_FALSE {
                    st.error_reason = Some(reason.to_string());
                    st.error_message = Some(message.to_string());
                } else {
                    st.error_reason = None;
                    st.error_message = None;
                }
                Ok(())
            },
        )
        .await;
        if let Err(e) = result {
            if !e.is_not_found() {
                warn!(%key, "Failed to update NetworkInitialized condition: {}", e);
            }
        }
    }

    async fn report_failure(&self, machine: &Machine, error: &Error) {
        let key = ObjectKey::from_object(machine);
        let (status, reason) = match error {
            Error::Cancelled => return,
            e if e.is_not_found() => return,
            Error::CidrExhausted { .. } => (CONDITION_STATUS_FALSE, REASON_CIDR_EXHAUSTED),
            e if e.is_terminal() => (CONDITION_STATUS_FALSE, REASON_INVALID_PROVIDER_SPEC),
            _ => (CONDITION_STATUS_UNKNOWN, "AllocationFailed"),
        };

        #[cfg(feature = "metrics")]
        if matches!(error, Error::CidrExhausted { .. }) {
            super::metrics::inc_ipam_exhausted();
        }

        let message = error.to_string();
        self.set_network_condition(&key, status, reason, &message).await;
        if let Err(e) = self
            .events
            .record(&machine.object_ref(&()), EventType::Warning, reason, &message)
            .await
        {
            warn!(%key, "Failed to record event: {}", e);
        }
    }
}

#[async_trait]
impl Reconciler for IpamController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    fn max_concurrency(&self) -> Option<usize> {
        Some(1)
    }

    #[instrument(skip(self, cancel), fields(name = %key.name, namespace = ?key.namespace))]
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action> {
        let Some(machine) = self.machines.get_opt(key).await? else {
            return Ok(Action::await_change());
        };
        if is_being_deleted(&machine) || !machine.has_initializer(IPAM_INITIALIZER) {
            return Ok(Action::await_change());
        }

        let start = Instant::now();
        match self.initialize(&machine, cancel).await {
            Ok(network) => {
                info!(
                    cidr = %network.cidr,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Initialized machine network"
                );
                let message = format!("assigned {}", network.cidr);
                self.set_network_condition(
                    key,
                    CONDITION_STATUS_TRUE,
                    REASON_ADDRESS_ASSIGNED,
                    &message,
                )
                .await;
                Ok(Action::await_change())
            }
            Err(e) => {
                self.report_failure(&machine, &e).await;
                Err(e)
            }
        }
    }
}
