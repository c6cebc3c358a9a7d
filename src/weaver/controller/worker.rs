/*
 * Copyright (C) 2025 The Weaver Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Work-queue front end for Bundle reconciliation.
//!
//! Each Bundle key owns a single-slot mailbox: enqueues while a pass is
//! running collapse into one follow-up pass, and no two passes for the same
//! key ever run concurrently. A semaphore bounds how many passes run across
//! all keys. Retriable failures re-run the key with exponential backoff;
//! terminal failures and conflicts wait for the next event.

use crate::weaver::api::types::Bundle;
use crate::weaver::controller::error::{SyncError, SyncFailure};
use crate::weaver::controller::ready::ReadyChecker;
use crate::weaver::controller::sync::SyncTask;
use crate::weaver::k8s::client::{BundleClient, ObjectStore, SmartClient};
use crate::weaver::logger::{log_debug, log_error, log_info, log_warn};
use crate::weaver::observability::metrics::{self, ReconcileResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "worker";
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Identifies one Bundle in the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleKey {
    pub namespace: String,
    pub name: String,
}

impl BundleKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn for_bundle(bundle: &Bundle) -> Self {
        Self::new(bundle.namespace(), bundle.name())
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub type ReconcileFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SyncFailure>> + Send + 'a>>;

/// One reconciliation pass for one Bundle key.
pub trait Reconcile: Send + Sync + 'static {
    fn reconcile<'a>(&'a self, key: &BundleKey, cancel: CancellationToken) -> ReconcileFuture<'a>;
}

enum KeyState {
    Running,
    /// An enqueue arrived while the key was running; run once more.
    RunningDirty,
}

struct PoolInner {
    handler: Arc<dyn Reconcile>,
    permits: Arc<Semaphore>,
    states: Mutex<HashMap<BundleKey, KeyState>>,
    cancel: CancellationToken,
    backoff_initial: Duration,
    backoff_max: Duration,
}

/// Pool of reconciliation workers with per-key serialization.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn Reconcile>, workers: usize, cancel: CancellationToken) -> Self {
        Self::with_backoff(handler, workers, cancel, BACKOFF_INITIAL, BACKOFF_MAX)
    }

    pub fn with_backoff(
        handler: Arc<dyn Reconcile>,
        workers: usize,
        cancel: CancellationToken,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handler,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                states: Mutex::new(HashMap::new()),
                cancel,
                backoff_initial,
                backoff_max,
            }),
        }
    }

    /// Schedules a pass for the key. Duplicate enqueues while a pass is
    /// running collapse into a single follow-up pass.
    pub fn enqueue(&self, key: BundleKey) {
        let mut states = self
            .inner
            .states
            .lock()
            .expect("worker pool state poisoned");
        match states.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = KeyState::RunningDirty;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(KeyState::Running);
                let inner = Arc::clone(&self.inner);
                tokio::spawn(run_key(inner, key));
            }
        }
    }

    /// Number of keys currently scheduled or running.
    pub fn active_keys(&self) -> usize {
        self.inner
            .states
            .lock()
            .expect("worker pool state poisoned")
            .len()
    }
}

async fn run_key(inner: Arc<PoolInner>, key: BundleKey) {
    let mut backoff = inner.backoff_initial;
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let permit = match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let result = inner
            .handler
            .reconcile(&key, inner.cancel.child_token())
            .await;
        drop(permit);

        let retry = match &result {
            Ok(()) => {
                backoff = inner.backoff_initial;
                false
            }
            Err(failure) if failure.error.is_cancelled() => false,
            Err(failure) if failure.error.is_conflict() => {
                // The racing write produces an event of its own; the next
                // enqueue picks the key back up.
                log_debug(
                    COMPONENT,
                    "Pass hit a write conflict, waiting for the next event",
                    &[("key", &key.to_string())],
                );
                false
            }
            Err(failure) if failure.retriable => {
                log_warn(
                    COMPONENT,
                    "Pass failed, will retry",
                    &[
                        ("key", &key.to_string()),
                        ("error", &failure.error.to_string()),
                    ],
                );
                true
            }
            Err(failure) => {
                log_error(
                    COMPONENT,
                    "Pass failed terminally, waiting for the bundle to change",
                    &[
                        ("key", &key.to_string()),
                        ("error", &failure.error.to_string()),
                    ],
                );
                false
            }
        };

        let rerun = {
            let mut states = inner.states.lock().expect("worker pool state poisoned");
            let dirty = matches!(states.get(&key), Some(KeyState::RunningDirty));
            if dirty || retry {
                states.insert(key.clone(), KeyState::Running);
                if dirty {
                    backoff = inner.backoff_initial;
                }
                true
            } else {
                states.remove(&key);
                false
            }
        };
        if !rerun {
            break;
        }
        if retry {
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = inner.cancel.cancelled() => break,
            }
            backoff = (backoff * 2).min(inner.backoff_max);
        }
    }
    let mut states = inner.states.lock().expect("worker pool state poisoned");
    states.remove(&key);
}

/// Default [`Reconcile`] implementation: loads the Bundle snapshot and runs
/// one sync task over it.
pub struct BundleReconciler {
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn SmartClient>,
    bundles: Arc<dyn BundleClient>,
    ready_checker: Arc<ReadyChecker>,
}

impl BundleReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn SmartClient>,
        bundles: Arc<dyn BundleClient>,
        ready_checker: Arc<ReadyChecker>,
    ) -> Self {
        Self {
            store,
            client,
            bundles,
            ready_checker,
        }
    }

    async fn run(&self, key: &BundleKey, cancel: CancellationToken) -> Result<(), SyncFailure> {
        let bundle = match self.bundles.get(&key.namespace, &key.name).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                // Deleted since the enqueue; the host cascade cleans up the
                // children through the controller owner reference.
                log_debug(
                    COMPONENT,
                    "Bundle is gone, nothing to reconcile",
                    &[("key", &key.to_string())],
                );
                return Ok(());
            }
            Err(err) => return Err(SyncFailure::retriable(SyncError::Api(err))),
        };

        log_info(
            COMPONENT,
            "Reconciling bundle",
            &[("key", &key.to_string())],
        );
        let mut task = SyncTask::new(
            bundle,
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            Arc::clone(&self.bundles),
            Arc::clone(&self.ready_checker),
            cancel,
        );
        let result = task.process().await;
        let result = task.handle_process_result(result).await;
        let outcome = match &result {
            Ok(()) => ReconcileResult::Success,
            Err(failure) if failure.error.is_conflict() => ReconcileResult::Conflict,
            Err(failure) if failure.retriable => ReconcileResult::RetriableError,
            Err(_) => ReconcileResult::TerminalError,
        };
        metrics::record_reconcile(outcome);
        result
    }
}

impl Reconcile for BundleReconciler {
    fn reconcile<'a>(&'a self, key: &BundleKey, cancel: CancellationToken) -> ReconcileFuture<'a> {
        let key = key.clone();
        Box::pin(async move { self.run(&key, cancel).await })
    }
}
