//! Reconcile loop
//!
//! A [`Controller`] owns one work queue and a bounded pool of workers. Watch
//! sources feed it through pure mapping functions that turn a changed object
//! into the keys that must be reconciled; the reconciler itself only ever
//! sees a key and re-reads everything it needs.
//!
//! Outcome handling per key:
//! - `Ok(action)`: backoff is reset; `Action::requeue` schedules a fixed
//!   future pass, `Action::await_change` waits for the next event.
//! - `NotFound`: the object is gone, which counts as converged.
//! - terminal errors: logged once and forgotten, retrying cannot help.
//! - anything else: re-queued with per-key exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{QueueBackoff, WorkQueue};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore, StoreObject};

/// What to do with a key after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration` even if nothing changes
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Converged; wait for the next watch event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Used in logs and metric labels
    fn name(&self) -> &str;

    /// Drive the object behind `key` towards its desired state. Must be
    /// idempotent and must not assume anything about what changed.
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action>;

    /// Worker count override for reconcilers that reason about global state
    fn max_concurrency(&self) -> Option<usize> {
        None
    }
}

/// Identity mapping for a controller watching its own kind
pub fn own_key<K: Resource>(obj: &K) -> Vec<ObjectKey> {
    vec![ObjectKey::from_object(obj)]
}

/// Lists every object of a kind right away and then every `period`, so a
/// controller re-checks state that changed without a watch event
pub fn periodic_list<K: StoreObject>(
    store: Arc<dyn ObjectStore<K>>,
    namespace: Option<String>,
    period: Duration,
) -> BoxStream<'static, Result<K>> {
    stream::unfold(
        (store, namespace, true),
        move |(store, namespace, first)| async move {
            if !first {
                tokio::time::sleep(period).await;
            }
            let batch = match store.list(namespace.as_deref()).await {
                Ok(items) => items.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            };
            Some((stream::iter(batch), (store, namespace, false)))
        },
    )
    .flatten()
    .boxed()
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    workers: usize,
    sources: Vec<BoxStream<'static, Vec<ObjectKey>>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, workers: usize, backoff: QueueBackoff) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(backoff),
            workers: workers.max(1),
            sources: Vec::new(),
        }
    }

    /// Feed the queue from `stream`, mapping each object to keys
    pub fn watches<K, M>(self, stream: BoxStream<'static, Result<K>>, mapper: M) -> Self
    where
        K: Send + 'static,
        M: Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        self.watches_with(stream, |_: &K| true, mapper)
    }

    /// Like [`Controller::watches`], dropping objects `predicate` rejects
    pub fn watches_with<K, P, M>(
        mut self,
        stream: BoxStream<'static, Result<K>>,
        predicate: P,
        mapper: M,
    ) -> Self
    where
        K: Send + 'static,
        P: Fn(&K) -> bool + Send + Sync + 'static,
        M: Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        let name = self.reconciler.name().to_string();
        let keys = stream
            .filter_map(move |event| {
                let keys = match event {
                    Ok(obj) if predicate(&obj) => Some(mapper(&obj)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(controller = %name, "Watch error: {}", e);
                        None
                    }
                };
                futures::future::ready(keys)
            })
            .boxed();
        self.sources.push(keys);
        self
    }

    /// Handle on the queue, for enqueueing keys by hand
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Run until `cancel` fires. In-flight reconciles see the same token and
    /// are awaited before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let name = self.reconciler.name().to_string();
        let workers = self
            .reconciler
            .max_concurrency()
            .unwrap_or(self.workers)
            .max(1);
        info!(controller = %name, workers, "Starting controller");

        let mut feeders = Vec::new();
        for mut source in self.sources {
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            feeders.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = source.next() => match next {
                            Some(keys) => keys.into_iter().for_each(|k| queue.add(k)),
                            None => break,
                        },
                    }
                }
            }));
        }

        let mut handles = Vec::new();
        for _ in 0..workers {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(reconciler.as_ref(), &queue, &key, &cancel).await;
                    queue.done(&key);
                }
            }));
        }

        cancel.cancelled().await;
        info!(controller = %name, "Shutting down controller");
        self.queue.shutdown();
        for feeder in feeders {
            feeder.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(controller = %name, "Worker task failed: {}", e);
            }
        }
        Ok(())
    }
}

async fn process<R: Reconciler + ?Sized>(
    reconciler: &R,
    queue: &Arc<WorkQueue>,
    key: &ObjectKey,
    cancel: &CancellationToken,
) {
    let name = reconciler.name();
    let start = Instant::now();
    let result = reconciler.reconcile(key, cancel).await;

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(name, start.elapsed().as_secs_f64());
        super::metrics::set_queue_depth(name, queue.len());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = start;

    match result {
        Ok(action) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                debug!(controller = %name, %key, ?delay, "Requeue requested");
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) if e.is_not_found() => {
            debug!(controller = %name, %key, "Object gone, nothing to do");
            queue.forget(key);
        }
        Err(Error::Cancelled) => {}
        Err(e) => {
            #[cfg(feature = "metrics")]
            super::metrics::inc_reconcile_error(name, e.kind());

            if e.is_terminal() {
                warn!(controller = %name, %key, "Reconcile failed permanently: {}", e);
                queue.forget(key);
            } else {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    controller = %name,
                    %key,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed: {}",
                    e
                );
            }
        }
    }
}
