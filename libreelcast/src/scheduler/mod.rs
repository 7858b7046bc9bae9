//! Task Scheduler
//!
//! `submit` splits a task into one sub-job per target platform and puts them
//! on a bounded queue without waiting; a fixed pool of workers drains it.
//! A worker runs one attempt at a time: get a valid token, call the
//! platform's adapter, feed the outcome through the [`RetryPolicy`], and hand
//! the result to the [`StatusAggregator`]. Retries are re-enqueued by a timer
//! task after their backoff, so no worker sleeps through a delay and attempt
//! k+1 is only queued once attempt k has been recorded.
//!
//! Cancellation is cooperative and read from the store, so a cancel issued
//! by another process sharing the store is honored too: a cancelled task's
//! queued and parked sub-jobs are skipped when dequeued, and an attempt that
//! is already running still records its outcome but never schedules another
//! attempt.
//!
//! If recording an outcome fails, the write is retried with backoff in the
//! background until it lands, so a sub-job is never left open.

mod admission;
mod retry;

pub use admission::AdmissionGate;
pub use retry::{AttemptOutcome, Decision, RetryPolicy};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::aggregator::{AttemptRecord, StatusAggregator};
use crate::config::EngineConfig;
use crate::error::{CredentialError, ReelcastError, Result, SchedulerError};
use crate::events::{Event, EventBus};
use crate::oauth::TokenRefresher;
use crate::platforms::{PlatformRegistry, PlatformResult};
use crate::store::PublishStore;
use crate::types::{ContentRef, PlatformId, PublishRecord, PublishTask};

/// Reason recorded for the record of an in-flight attempt whose task was cancelled
pub const CANCELLED_REASON: &str = "task cancelled";

/// Reason recorded when the owner has no credential for the platform
pub const NOT_CONNECTED_REASON: &str = "account not connected";

/// One (task, platform) unit of work
#[derive(Debug, Clone)]
struct Job {
    task_id: String,
    owner_account_id: String,
    platform: PlatformId,
    content: Arc<ContentRef>,
    /// Attempts already recorded for this sub-job
    attempts_made: u32,
}

struct Inner {
    sender: mpsc::Sender<Job>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    store: Arc<dyn PublishStore>,
    registry: PlatformRegistry,
    refresher: Arc<TokenRefresher>,
    aggregator: Arc<StatusAggregator>,
    policy: RetryPolicy,
    gate: AdmissionGate<Job>,
    shutdown: watch::Sender<bool>,
    events: EventBus,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Scheduler {
    /// Start the worker pool
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &EngineConfig,
        store: Arc<dyn PublishStore>,
        registry: PlatformRegistry,
        refresher: Arc<TokenRefresher>,
        aggregator: Arc<StatusAggregator>,
        events: EventBus,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            store,
            registry,
            refresher,
            aggregator,
            policy: RetryPolicy::from_config(config),
            gate: AdmissionGate::new(&config.per_platform_concurrency_cap, config.worker_pool_size),
            shutdown,
            events,
        });

        let pool_size = config.worker_pool_size.max(1);
        let workers = (0..pool_size)
            .map(|id| tokio::spawn(worker_loop(id, inner.clone())))
            .collect();

        tracing::info!("Scheduler started with {} workers", pool_size);

        Self {
            inner,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Persist a new task and enqueue one sub-job per target
    ///
    /// Returns as soon as the sub-jobs are queued.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::UnknownPlatform` if a target has no registered adapter
    /// - `SchedulerError::QueueFull` if the queue cannot take every sub-job;
    ///   nothing is stored or enqueued in that case
    /// - `SchedulerError::ShuttingDown` after [`shutdown`](Self::shutdown)
    pub async fn submit(&self, task: PublishTask) -> Result<String> {
        let inner = &self.inner;

        if *inner.shutdown.borrow() {
            return Err(SchedulerError::ShuttingDown.into());
        }

        if let Some(platform) = task
            .targets()
            .iter()
            .find(|p| !inner.registry.contains(**p))
        {
            return Err(SchedulerError::UnknownPlatform(platform.to_string()).into());
        }

        let needed = task.targets().len();
        let permits = inner.sender.try_reserve_many(needed).map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => SchedulerError::QueueFull(needed),
            mpsc::error::TrySendError::Closed(()) => SchedulerError::ShuttingDown,
        })?;

        let records: Vec<PublishRecord> = task
            .targets()
            .iter()
            .map(|p| PublishRecord::queued(task.id.clone(), *p))
            .collect();
        inner.store.insert_task(&task, &records).await?;

        inner.events.emit(Event::TaskSubmitted {
            task_id: task.id.clone(),
            platforms: task.targets().to_vec(),
        });

        let content = Arc::new(task.content.clone());
        for (permit, platform) in permits.zip(task.targets().iter()) {
            permit.send(Job {
                task_id: task.id.clone(),
                owner_account_id: task.owner_account_id.clone(),
                platform: *platform,
                content: content.clone(),
                attempts_made: 0,
            });
        }

        tracing::info!(
            "Task {} submitted for {} platform(s)",
            task.id,
            task.targets().len()
        );
        Ok(task.id)
    }

    /// Cancel a task
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TaskNotFound`
    /// - `SchedulerError::AlreadyTerminal` if the task already finished
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        self.inner.aggregator.cancel(task_id).await
    }

    /// Stop the workers after their current attempt and wait for them
    ///
    /// Queued and parked sub-jobs stay `queued` in the store. Pending retry
    /// timers are dropped.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn worker_loop(id: usize, inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    tracing::debug!("Worker {} started", id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = {
            let mut receiver = inner.receiver.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                job = receiver.recv() => job,
            }
        };

        match job {
            Some(job) => inner.dispatch(job).await,
            None => break,
        }
    }

    tracing::debug!("Worker {} stopped", id);
}

impl Inner {
    /// Whether the stored task already finished, e.g. cancelled by another process
    async fn task_finished(&self, task_id: &str) -> bool {
        match self.store.get_task(task_id).await {
            Ok(Some(task)) => task.status.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("Could not read status of task {}: {}", task_id, e);
                false
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn dispatch(self: &Arc<Self>, job: Job) {
        if self.task_finished(&job.task_id).await {
            tracing::debug!("Skipping {}/{}: task finished", job.task_id, job.platform);
            return;
        }

        let platform = job.platform;
        let mut next = self.gate.admit(platform, job);
        if next.is_none() {
            tracing::debug!("Lane {} full, parked sub-job", platform);
        }

        while let Some(job) = next {
            if self.task_finished(&job.task_id).await {
                tracing::debug!("Skipping {}/{}: task finished", job.task_id, job.platform);
            } else {
                self.run_attempt(job).await;
            }

            if self.is_shutting_down() {
                break;
            }
            // A parked job on this lane inherits the slot
            next = self.gate.release(platform);
        }
    }

    async fn run_attempt(self: &Arc<Self>, job: Job) {
        let attempt = job.attempts_made + 1;

        self.events.emit(Event::AttemptStarted {
            task_id: job.task_id.clone(),
            platform: job.platform,
            attempt,
        });

        if let Err(e) = self.aggregator.mark_started(&job.task_id).await {
            tracing::warn!("Could not mark task {} started: {}", job.task_id, e);
        }

        let outcome = self.attempt_outcome(&job).await;
        let mut decision = self.policy.decide(outcome, attempt);

        // A task only finishes with an open record when it was cancelled
        if let Decision::Retry { .. } = decision {
            if self.task_finished(&job.task_id).await {
                decision = Decision::Failed(CANCELLED_REASON.to_string());
            }
        }

        match self.commit(&job, &decision).await {
            Ok(true) => self.after_commit(job, decision),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    "Failed to record attempt {} of {}/{}: {}. Will retry the write",
                    attempt,
                    job.task_id,
                    job.platform,
                    e
                );
                self.retry_commit(job, decision);
            }
        }
    }

    /// Write the attempt's result; `false` if the record was already terminal
    async fn commit(&self, job: &Job, decision: &Decision) -> Result<bool> {
        let record = match decision {
            Decision::Succeeded(external_id) => AttemptRecord::Succeeded {
                external_id: external_id.clone(),
            },
            Decision::Retry { reason, .. } => AttemptRecord::WillRetry {
                reason: reason.clone(),
            },
            Decision::Failed(reason) => AttemptRecord::Failed {
                reason: reason.clone(),
            },
        };

        let applied = self
            .aggregator
            .apply_attempt(&job.task_id, job.platform, record, now())
            .await?;
        Ok(applied.is_some())
    }

    /// Keep retrying a failed write in the background until it lands or the
    /// scheduler shuts down
    fn retry_commit(self: &Arc<Self>, job: Job, decision: Decision) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            let mut tries: u32 = 1;

            loop {
                let delay = inner.policy.backoff_delay(tries);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }

                match inner.commit(&job, &decision).await {
                    Ok(true) => {
                        inner.after_commit(job, decision);
                        return;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        tracing::warn!(
                            "Recording {}/{} still failing after {} tries: {}",
                            job.task_id,
                            job.platform,
                            tries + 1,
                            e
                        );
                        tries = tries.saturating_add(1);
                    }
                }
            }
        });
    }

    fn after_commit(self: &Arc<Self>, job: Job, decision: Decision) {
        let attempt = job.attempts_made + 1;

        match decision {
            Decision::Succeeded(external_id) => {
                tracing::info!(
                    "Published {} to {} as {} (attempt {})",
                    job.task_id,
                    job.platform,
                    external_id,
                    attempt
                );
            }
            Decision::Failed(reason) => {
                tracing::warn!(
                    "Publishing {} to {} failed after {} attempt(s): {}",
                    job.task_id,
                    job.platform,
                    attempt,
                    reason
                );
            }
            Decision::Retry { delay, reason } => {
                tracing::warn!(
                    "Attempt {}/{} for {} on {} failed: {}. Retrying in {}ms",
                    attempt,
                    self.policy.max_attempts(),
                    job.task_id,
                    job.platform,
                    reason,
                    delay.as_millis()
                );
                self.events.emit(Event::RetryScheduled {
                    task_id: job.task_id.clone(),
                    platform: job.platform,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason,
                });
                self.schedule_retry(
                    Job {
                        attempts_made: attempt,
                        ..job
                    },
                    delay,
                );
            }
        }
    }

    /// Token, then adapter; every failure classified
    async fn attempt_outcome(&self, job: &Job) -> AttemptOutcome {
        let token = match self
            .refresher
            .access_token_for(&job.owner_account_id, job.platform)
            .await
        {
            Ok(token) => token,
            Err(ReelcastError::Credential(CredentialError::NotFound(_))) => {
                return AttemptOutcome::Unauthorized(NOT_CONNECTED_REASON.to_string());
            }
            Err(e) if e.requires_reauthorization() => {
                return AttemptOutcome::Unauthorized(format!("reconnect account: {}", e));
            }
            Err(e) => return AttemptOutcome::RefreshTransient(e.to_string()),
        };

        match self.registry.get(job.platform) {
            Some(adapter) => AttemptOutcome::Platform(adapter.publish(&token, &job.content).await),
            None => AttemptOutcome::Platform(PlatformResult::RejectedPermanently(format!(
                "no adapter registered for {}",
                job.platform
            ))),
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }

            if inner.task_finished(&job.task_id).await {
                return;
            }

            let task_id = job.task_id.clone();
            if inner.sender.send(job).await.is_err() {
                tracing::warn!("Queue closed before retry of {} could be enqueued", task_id);
            }
        });
    }
}
