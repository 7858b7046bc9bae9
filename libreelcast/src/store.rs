//! Persistence interface consulted by the engine
//!
//! The engine only needs keyed CRUD for credentials, tasks and records plus
//! two listing queries for stats. Implementations must give read-your-writes
//! consistency within one process. [`crate::db::Database`] is the SQLite
//! implementation; [`MemoryStore`] keeps everything in process memory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, SchedulerError};
use crate::types::{
    PlatformId, PublishRecord, PublishTask, StatsQuery, StoredCredential, TaskStatus,
};

#[async_trait]
pub trait PublishStore: Send + Sync {
    async fn get_credential(
        &self,
        account_id: &str,
        platform: PlatformId,
    ) -> Result<Option<StoredCredential>>;

    /// Insert or replace the credential for `(account_id, platform)`
    async fn put_credential(&self, credential: &StoredCredential) -> Result<()>;

    /// Deleting a missing credential is not an error
    async fn delete_credential(&self, account_id: &str, platform: PlatformId) -> Result<()>;

    /// Store a new task together with its initial records, atomically
    async fn insert_task(&self, task: &PublishTask, records: &[PublishRecord]) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<PublishTask>>;

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;

    /// Tasks matching the query, newest first
    async fn list_tasks(&self, query: &StatsQuery) -> Result<Vec<PublishTask>>;

    /// Insert or replace the record for `(record.task_id, record.platform)`
    async fn put_record(&self, record: &PublishRecord) -> Result<()>;

    /// Records of one task, in the task's target order
    async fn get_records(&self, task_id: &str) -> Result<Vec<PublishRecord>>;

    /// Records of every task matching the query
    async fn list_records(&self, query: &StatsQuery) -> Result<Vec<PublishRecord>>;
}

#[derive(Default)]
struct MemoryState {
    credentials: HashMap<(String, PlatformId), StoredCredential>,
    tasks: HashMap<String, PublishTask>,
    records: HashMap<String, Vec<PublishRecord>>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PublishStore for MemoryStore {
    async fn get_credential(
        &self,
        account_id: &str,
        platform: PlatformId,
    ) -> Result<Option<StoredCredential>> {
        Ok(self
            .read()
            .credentials
            .get(&(account_id.to_string(), platform))
            .cloned())
    }

    async fn put_credential(&self, credential: &StoredCredential) -> Result<()> {
        self.write().credentials.insert(
            (credential.account_id.clone(), credential.platform),
            credential.clone(),
        );
        Ok(())
    }

    async fn delete_credential(&self, account_id: &str, platform: PlatformId) -> Result<()> {
        self.write()
            .credentials
            .remove(&(account_id.to_string(), platform));
        Ok(())
    }

    async fn insert_task(&self, task: &PublishTask, records: &[PublishRecord]) -> Result<()> {
        let mut state = self.write();
        state.tasks.insert(task.id.clone(), task.clone());
        state.records.insert(task.id.clone(), records.to_vec());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<PublishTask>> {
        Ok(self.read().tasks.get(task_id).cloned())
    }

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut state = self.write();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.status = status;
        Ok(())
    }

    async fn list_tasks(&self, query: &StatsQuery) -> Result<Vec<PublishTask>> {
        let mut tasks: Vec<PublishTask> = self
            .read()
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn put_record(&self, record: &PublishRecord) -> Result<()> {
        let mut state = self.write();
        let records = state
            .records
            .get_mut(&record.task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(record.task_id.clone()))?;

        match records.iter_mut().find(|r| r.platform == record.platform) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn get_records(&self, task_id: &str) -> Result<Vec<PublishRecord>> {
        Ok(self.read().records.get(task_id).cloned().unwrap_or_default())
    }

    async fn list_records(&self, query: &StatsQuery) -> Result<Vec<PublishRecord>> {
        let state = self.read();
        Ok(state
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .flat_map(|task| state.records.get(&task.id).cloned().unwrap_or_default())
            .collect())
    }
}
