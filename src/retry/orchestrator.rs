// Retry orchestrator
//
// Each run is a tokio task; callers get a handle back immediately and are
// never blocked while a lease is busy. At most one series waits per lock
// file: starting a new one cancels the previous.

use super::{OverridePrompt, RetryEvent, RetryPolicy, RunOutcome};
use crate::leases::{AcquireOutcome, LeaseRecord, LockCoordinator, ReleaseOutcome};
use crate::LockError;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct PendingSeries {
    id: u64,
    cancel: Arc<watch::Sender<bool>>,
}

/// Runs operations under a lease with bounded retries
pub struct RetryOrchestrator {
    policy: RetryPolicy,
    prompt: Arc<dyn OverridePrompt>,
    events: Option<mpsc::UnboundedSender<RetryEvent>>,
    pending: Arc<DashMap<PathBuf, PendingSeries>>,
    next_series: AtomicU64,
}

impl std::fmt::Debug for RetryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("policy", &self.policy)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy, prompt: Arc<dyn OverridePrompt>) -> Self {
        Self {
            policy,
            prompt,
            events: None,
            pending: Arc::new(DashMap::new()),
            next_series: AtomicU64::new(1),
        }
    }

    /// Report progress on a channel. Events are dropped once the receiver is gone.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RetryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` under the coordinator's lease with the default policy
    pub fn run_with_lock<T, F, Fut>(
        &self,
        coordinator: Arc<LockCoordinator>,
        expected_duration: Duration,
        operation_label: impl Into<String>,
        operation: F,
    ) -> RetryHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.run_with_policy(
            coordinator,
            self.policy,
            expected_duration,
            operation_label,
            operation,
        )
    }

    /// Like `run_with_lock` with an explicit policy for this run
    pub fn run_with_policy<T, F, Fut>(
        &self,
        coordinator: Arc<LockCoordinator>,
        policy: RetryPolicy,
        expected_duration: Duration,
        operation_label: impl Into<String>,
        operation: F,
    ) -> RetryHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = coordinator.lock_path().to_path_buf();
        let id = self.next_series.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);

        if let Some(previous) = self.pending.insert(
            key.clone(),
            PendingSeries {
                id,
                cancel: Arc::clone(&cancel),
            },
        ) {
            info!(resource = %coordinator.resource(), "superseding pending retry series");
            previous.cancel.send_replace(true);
        }

        let series = Series {
            id,
            key: key.clone(),
            coordinator,
            policy,
            expected_duration,
            label: operation_label.into(),
            prompt: Arc::clone(&self.prompt),
            events: self.events.clone(),
            pending: Arc::clone(&self.pending),
            cancel: cancel_rx,
        };

        RetryHandle {
            resource: key,
            cancel,
            join: tokio::spawn(series.run(operation)),
        }
    }

    /// Cancel the series waiting on `lock_path`, if any
    pub fn cancel(&self, lock_path: &Path) -> bool {
        match self.pending.remove(lock_path) {
            Some((_, series)) => {
                series.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Lock files with a series still waiting for its lease
    pub fn pending(&self) -> Vec<PathBuf> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }
}

/// Handle to a running series
#[derive(Debug)]
pub struct RetryHandle<T> {
    resource: PathBuf,
    cancel: Arc<watch::Sender<bool>>,
    join: JoinHandle<RunOutcome<T>>,
}

impl<T> RetryHandle<T> {
    pub fn lock_path(&self) -> &Path {
        &self.resource
    }

    /// Stop waiting for the lease. An operation already running is not interrupted.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn outcome(self) -> RunOutcome<T> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => RunOutcome::Cancelled,
            Err(e) => RunOutcome::LockFailed(LockError::Other(anyhow::anyhow!(
                "retry task failed: {}",
                e
            ))),
        }
    }
}

/// Everything one run needs, moved into its task
struct Series {
    id: u64,
    key: PathBuf,
    coordinator: Arc<LockCoordinator>,
    policy: RetryPolicy,
    expected_duration: Duration,
    label: String,
    prompt: Arc<dyn OverridePrompt>,
    events: Option<mpsc::UnboundedSender<RetryEvent>>,
    pending: Arc<DashMap<PathBuf, PendingSeries>>,
    cancel: watch::Receiver<bool>,
}

impl Series {
    async fn run<T, F, Fut>(mut self, operation: F) -> RunOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let outcome = match self.acquire_with_retries().await {
            Ok(forced) => {
                self.finish_waiting();
                self.run_locked(operation, forced).await
            }
            Err(outcome) => outcome,
        };
        self.finish_waiting();
        outcome
    }

    /// Acquire the lease, retrying while busy. `Ok` tells whether the lease
    /// was forced; `Err` carries the final outcome.
    async fn acquire_with_retries<T>(&mut self) -> Result<bool, RunOutcome<T>> {
        let max_attempts = self.policy.max_attempts.max(1);
        let resource = self.coordinator.resource().to_string();

        for attempt in 1..=max_attempts {
            if *self.cancel.borrow() {
                return Err(self.cancelled());
            }

            self.emit(RetryEvent::Attempt {
                resource: resource.clone(),
                attempt,
                max_attempts,
            });
            debug!(
                resource = %resource,
                attempt,
                max_attempts,
                operation = %self.label,
                "acquire attempt"
            );

            let (duration, label) = (self.expected_duration, self.label.clone());
            let acquired = self
                .coordinator
                .run_blocking(move |c| c.acquire(duration, &label))
                .await;
            match acquired {
                Ok(AcquireOutcome::Acquired(_)) => {
                    self.emit(RetryEvent::Acquired {
                        resource: resource.clone(),
                        forced: false,
                    });
                    return Ok(false);
                }
                Ok(AcquireOutcome::Busy(holder)) => {
                    let attempts_remaining = max_attempts - attempt;
                    if attempts_remaining == 0 {
                        warn!(
                            resource = %resource,
                            attempts = attempt,
                            lease = %holder,
                            "lease still busy, giving up"
                        );
                        self.emit(RetryEvent::Exhausted {
                            resource: resource.clone(),
                            attempts: attempt,
                            holder: Some(holder.clone()),
                        });
                        return Err(RunOutcome::Exhausted {
                            attempts: attempt,
                            holder: Some(holder),
                        });
                    }

                    info!(
                        resource = %resource,
                        attempts_remaining,
                        retry_in_ms = self.policy.retry_delay.as_millis() as u64,
                        lease = %holder,
                        "lease busy, retry scheduled"
                    );
                    self.emit(RetryEvent::Busy {
                        resource: resource.clone(),
                        holder,
                        attempts_remaining,
                        retry_in: self.policy.retry_delay,
                    });

                    let delay = self.policy.retry_delay;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_cancelled(&mut self.cancel) => return Err(self.cancelled()),
                    }
                }
                Ok(AcquireOutcome::StaleDetected(holder)) => {
                    return self.override_stale(holder).await;
                }
                Err(e) => {
                    error!(resource = %resource, error = %e, "acquire failed");
                    self.emit(RetryEvent::Failed {
                        resource: resource.clone(),
                        reason: e.to_string(),
                    });
                    return Err(RunOutcome::LockFailed(e));
                }
            }
        }

        Err(RunOutcome::Exhausted {
            attempts: max_attempts,
            holder: None,
        })
    }

    async fn override_stale<T>(
        &mut self,
        holder: Option<LeaseRecord>,
    ) -> Result<bool, RunOutcome<T>> {
        let resource = self.coordinator.resource().to_string();
        self.emit(RetryEvent::StaleDetected {
            resource: resource.clone(),
            holder: holder.clone(),
        });

        let prompt = Arc::clone(&self.prompt);
        let confirmed = tokio::select! {
            confirmed = prompt.confirm_override(&resource, holder.as_ref()) => confirmed,
            _ = wait_cancelled(&mut self.cancel) => return Err(self.cancelled()),
        };

        if !confirmed {
            info!(resource = %resource, "stale lease override declined");
            self.emit(RetryEvent::OverrideDeclined {
                resource: resource.clone(),
            });
            return Err(RunOutcome::OverrideDeclined { holder });
        }

        let (duration, label) = (self.expected_duration, self.label.clone());
        let forced = self
            .coordinator
            .run_blocking(move |c| c.force_acquire(duration, &label))
            .await;
        match forced {
            Ok(_) => {
                self.emit(RetryEvent::Acquired { resource, forced: true });
                Ok(true)
            }
            Err(e) => {
                error!(resource = %resource, error = %e, "forced acquire failed");
                self.emit(RetryEvent::Failed {
                    resource,
                    reason: e.to_string(),
                });
                Err(RunOutcome::LockFailed(e))
            }
        }
    }

    /// Run the operation once, then release whatever happened
    async fn run_locked<T, F, Fut>(&self, operation: F, forced: bool) -> RunOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let resource = self.coordinator.resource().to_string();
        let keeper = self
            .policy
            .heartbeat_interval
            .map(|interval| self.coordinator.spawn_heartbeat(interval));

        let result = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;
        drop(keeper);

        match self.coordinator.run_blocking(|c| c.release()).await {
            Ok(ReleaseOutcome::NotOwner(holder)) => {
                warn!(
                    resource = %resource,
                    lease = %holder,
                    "lease taken over while operation ran"
                );
                self.emit(RetryEvent::ReleaseFailed {
                    resource: resource.clone(),
                    reason: format!("lease now {}", holder),
                });
            }
            Ok(_) => self.emit(RetryEvent::Released {
                resource: resource.clone(),
            }),
            Err(e) => {
                warn!(resource = %resource, error = %e, "release failed");
                self.emit(RetryEvent::ReleaseFailed {
                    resource: resource.clone(),
                    reason: e.to_string(),
                });
            }
        }

        match result {
            Ok(Ok(value)) => {
                info!(
                    resource = %resource,
                    operation = %self.label,
                    forced,
                    "operation completed"
                );
                RunOutcome::Completed { value, forced }
            }
            Ok(Err(e)) => {
                warn!(
                    resource = %resource,
                    operation = %self.label,
                    error = %e,
                    "operation failed"
                );
                self.emit(RetryEvent::Failed {
                    resource,
                    reason: e.to_string(),
                });
                RunOutcome::OperationFailed(e)
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    resource = %resource,
                    operation = %self.label,
                    %reason,
                    "operation panicked"
                );
                self.emit(RetryEvent::Failed {
                    resource,
                    reason: reason.clone(),
                });
                RunOutcome::OperationFailed(anyhow::anyhow!("operation panicked: {}", reason))
            }
        }
    }

    fn cancelled<T>(&self) -> RunOutcome<T> {
        info!(resource = %self.coordinator.resource(), "retry series cancelled");
        self.emit(RetryEvent::Cancelled {
            resource: self.coordinator.resource().to_string(),
        });
        RunOutcome::Cancelled
    }

    /// Drop this series from the pending table unless it was superseded
    fn finish_waiting(&self) {
        self.pending.remove_if(&self.key, |_, series| series.id == self.id);
    }

    fn emit(&self, event: RetryEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Resolves once cancellation is requested or every sender is gone
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
