//! Status Aggregator
//!
//! Owns every write to a task's records and aggregate status. Updates for one
//! task are serialized through a per-task lock (a single writer per task, no
//! global lock), and the task status is always recomputed as a fold over all
//! of the task's records, so the order in which sibling sub-jobs finish does
//! not change the final status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{Result, SchedulerError};
use crate::events::{Event, EventBus};
use crate::store::PublishStore;
use crate::types::{
    PlatformId, PublishRecord, PublishStats, PublishTask, RecordStatus, StatsQuery, TaskCounts,
    TaskStatus,
};

/// Result of one attempt as the aggregator records it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptRecord {
    Succeeded { external_id: String },
    WillRetry { reason: String },
    Failed { reason: String },
}

/// Aggregate status implied by a task's records
///
/// Terminal statuses are sticky. Otherwise: `success` iff every record succeeded,
/// `failed` iff every record failed, `partial_success` when all are terminal
/// with at least one of each, and `in_progress` while any record is open.
pub fn fold_status(records: &[PublishRecord], current: TaskStatus) -> TaskStatus {
    if current.is_terminal() || records.is_empty() {
        return current;
    }

    if !records.iter().all(PublishRecord::is_terminal) {
        return TaskStatus::InProgress;
    }

    let succeeded = records
        .iter()
        .filter(|r| r.status == RecordStatus::Succeeded)
        .count();

    if succeeded == records.len() {
        TaskStatus::Success
    } else if succeeded == 0 {
        TaskStatus::Failed
    } else {
        TaskStatus::PartialSuccess
    }
}

/// Stats over a set of tasks and their records
pub fn compute_stats(tasks: &[PublishTask], records: &[PublishRecord]) -> PublishStats {
    let mut counts = TaskCounts::default();
    for task in tasks {
        counts.add(task.status);
    }

    let terminal = records.iter().filter(|r| r.is_terminal()).count();
    let succeeded: Vec<&PublishRecord> = records
        .iter()
        .filter(|r| r.status == RecordStatus::Succeeded)
        .collect();

    let success_rate = if terminal == 0 {
        0.0
    } else {
        succeeded.len() as f64 / terminal as f64
    };

    let average_attempts_per_success = if succeeded.is_empty() {
        0.0
    } else {
        succeeded.iter().map(|r| r.attempt_count as f64).sum::<f64>() / succeeded.len() as f64
    };

    PublishStats {
        tasks: counts,
        success_rate,
        average_attempts_per_success,
    }
}

pub struct StatusAggregator {
    store: Arc<dyn PublishStore>,
    events: EventBus,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stats_cache: RwLock<HashMap<String, PublishStats>>,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn PublishStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            locks: Mutex::new(HashMap::new()),
            stats_cache: RwLock::new(HashMap::new()),
        }
    }

    fn lock_for(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry of a finished task if nobody else holds it
    fn prune_lock(&self, task_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            locks.remove(task_id);
        }
    }

    async fn load_task(&self, task_id: &str) -> Result<PublishTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()).into())
    }

    /// Move a pending task to `in_progress` when its first attempt starts
    pub async fn mark_started(&self, task_id: &str) -> Result<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id).await?;
        if task.status == TaskStatus::Pending {
            self.set_status(&task, TaskStatus::InProgress).await?;
        }
        Ok(())
    }

    /// Persist an updated record and recompute the task's status
    ///
    /// An update to a record that is already terminal is ignored. Returns the
    /// task status after the update.
    pub async fn on_record_update(&self, record: PublishRecord) -> Result<TaskStatus> {
        let lock = self.lock_for(&record.task_id);
        let guard = lock.lock().await;

        let task_id = record.task_id.clone();
        let stored = self
            .store
            .get_records(&task_id)
            .await?
            .into_iter()
            .find(|r| r.platform == record.platform);

        if stored.is_some_and(|r| r.is_terminal()) {
            tracing::debug!(
                "Ignoring update for terminal record {}/{}",
                task_id,
                record.platform
            );
            return Ok(self.load_task(&task_id).await?.status);
        }

        let status = self.write_and_fold(record).await?;

        drop(guard);
        self.prune_if_finished(&task_id, status, &lock).await;
        Ok(status)
    }

    /// Apply one attempt's result to the stored record of `(task_id, platform)`
    ///
    /// Returns the updated record, or `None` if the record was already
    /// terminal and therefore left untouched.
    pub async fn apply_attempt(
        &self,
        task_id: &str,
        platform: PlatformId,
        attempt: AttemptRecord,
        at: i64,
    ) -> Result<Option<PublishRecord>> {
        let lock = self.lock_for(task_id);
        let guard = lock.lock().await;

        let mut record = self
            .store
            .get_records(task_id)
            .await?
            .into_iter()
            .find(|r| r.platform == platform)
            .unwrap_or_else(|| PublishRecord::queued(task_id, platform));

        let applied = match attempt {
            AttemptRecord::Succeeded { external_id } => record.record_success(external_id, at),
            AttemptRecord::WillRetry { reason } => record.record_retry(reason, at),
            AttemptRecord::Failed { reason } => record.record_failure(reason, at),
        };

        if !applied {
            tracing::debug!(
                "Ignoring attempt result for terminal record {}/{}",
                task_id,
                platform
            );
            return Ok(None);
        }

        let status = self.write_and_fold(record.clone()).await?;

        drop(guard);
        self.prune_if_finished(task_id, status, &lock).await;
        Ok(Some(record))
    }

    /// Cancel a task that is not yet terminal
    ///
    /// # Errors
    ///
    /// `SchedulerError::AlreadyTerminal` if the task finished (in any way) before.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let lock = self.lock_for(task_id);
        let guard = lock.lock().await;

        let result = self.cancel_locked(task_id).await;

        drop(guard);
        self.prune_lock(task_id, &lock);
        result
    }

    async fn cancel_locked(&self, task_id: &str) -> Result<()> {
        let task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(task_id.to_string()).into());
        }

        self.set_status(&task, TaskStatus::Cancelled).await?;
        self.events.emit(Event::TaskCancelled {
            task_id: task_id.to_string(),
        });
        tracing::info!("Task {} cancelled", task_id);
        Ok(())
    }

    /// Caller must hold the task's lock
    async fn write_and_fold(&self, record: PublishRecord) -> Result<TaskStatus> {
        let task = self.load_task(&record.task_id).await?;

        self.store.put_record(&record).await?;
        let became_terminal = record.is_terminal();
        let owner = task.owner_account_id.clone();
        self.events.emit(Event::RecordUpdated { record });

        let records = self.store.get_records(&task.id).await?;
        let status = fold_status(&records, task.status);
        if status != task.status {
            self.set_status(&task, status).await?;
        }

        if became_terminal {
            self.refresh_stats(&owner).await?;
        }

        Ok(status)
    }

    async fn set_status(&self, task: &PublishTask, status: TaskStatus) -> Result<()> {
        self.store.update_task_status(&task.id, status).await?;
        tracing::info!("Task {}: {} -> {}", task.id, task.status, status);
        self.events.emit(Event::TaskStatusChanged {
            task_id: task.id.clone(),
            from: task.status,
            to: status,
        });
        Ok(())
    }

    async fn prune_if_finished(
        &self,
        task_id: &str,
        status: TaskStatus,
        lock: &Arc<tokio::sync::Mutex<()>>,
    ) {
        if !status.is_terminal() {
            return;
        }
        // Queued records of a cancelled task never finish
        if status == TaskStatus::Cancelled {
            self.prune_lock(task_id, lock);
            return;
        }
        let all_terminal = match self.store.get_records(task_id).await {
            Ok(records) => records.iter().all(PublishRecord::is_terminal),
            Err(_) => false,
        };
        if all_terminal {
            self.prune_lock(task_id, lock);
        }
    }

    /// Recompute and cache the owner's stats
    async fn refresh_stats(&self, account_id: &str) -> Result<PublishStats> {
        let stats = self.stats(&StatsQuery::for_account(account_id)).await?;

        self.stats_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id.to_string(), stats.clone());

        self.events.emit(Event::StatsUpdated {
            account_id: account_id.to_string(),
            stats: stats.clone(),
        });
        Ok(stats)
    }

    /// Stats computed from the store
    pub async fn stats(&self, query: &StatsQuery) -> Result<PublishStats> {
        let tasks = self.store.list_tasks(query).await?;
        let records = self.store.list_records(query).await?;
        Ok(compute_stats(&tasks, &records))
    }

    /// Latest snapshot computed for an account, if any record of theirs finished
    pub fn cached_stats(&self, account_id: &str) -> Option<PublishStats> {
        self.stats_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account_id)
            .cloned()
    }
}
