//! Publish engine facade
//!
//! `PublishEngine` is the single entry point for callers: it owns the shared
//! store, credential store, token refresher, status aggregator and scheduler,
//! and exposes task submission, status, cancellation, account connection and
//! stats.
//!
//! # Example
//!
//! ```no_run
//! use libreelcast::config::Config;
//! use libreelcast::engine::PublishEngine;
//! use libreelcast::types::{ContentRef, PlatformId};
//!
//! # async fn example() -> libreelcast::error::Result<()> {
//! let engine = PublishEngine::from_config(&Config::load()?).await?;
//!
//! let task_id = engine
//!     .submit_publish(
//!         "acct-1",
//!         ContentRef::new("https://cdn.example/launch.mp4", "Launch day"),
//!         vec![PlatformId::YouTube],
//!     )
//!     .await?;
//!
//! let view = engine.task_status(&task_id).await?;
//! println!("{}: {}", task_id, view.task.status);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::StatusAggregator;
use crate::config::{Config, EngineConfig};
use crate::credentials::{CredentialStore, TokenCipher};
use crate::db::Database;
use crate::error::{ReelcastError, Result, SchedulerError};
use crate::events::{EventBus, EventReceiver};
use crate::oauth::{HttpTokenEndpoint, TokenEndpoint, TokenRefresher};
use crate::platforms::PlatformRegistry;
use crate::scheduler::Scheduler;
use crate::store::PublishStore;
use crate::types::{
    ContentRef, Credential, CredentialKey, PlatformId, PublishStats, PublishTask, StatsQuery,
    TaskView,
};

pub struct PublishEngine {
    store: Arc<dyn PublishStore>,
    refresher: Arc<TokenRefresher>,
    aggregator: Arc<StatusAggregator>,
    scheduler: Scheduler,
    events: EventBus,
}

impl PublishEngine {
    /// Wire up an engine from its collaborators and start the worker pool
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn PublishStore>,
        cipher: TokenCipher,
        endpoint: Arc<dyn TokenEndpoint>,
        registry: PlatformRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let credentials = CredentialStore::new(store.clone(), cipher);
        let refresher = Arc::new(TokenRefresher::new(
            credentials,
            endpoint,
            config.refresh_safety_margin_seconds,
            events.clone(),
        ));
        let aggregator = Arc::new(StatusAggregator::new(store.clone(), events.clone()));
        let scheduler = Scheduler::start(
            config,
            store.clone(),
            registry,
            refresher.clone(),
            aggregator.clone(),
            events.clone(),
        );

        Ok(Self {
            store,
            refresher,
            aggregator,
            scheduler,
            events,
        })
    }

    /// Build the production stack: SQLite store, credential key, HTTP token
    /// endpoint and the configured platform adapters
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be opened or the credential key cannot be
    /// loaded.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let cipher = TokenCipher::load(&config.credentials)?;
        let db = Database::new(&config.database.path).await?;

        Self::new(
            &config.engine,
            Arc::new(db),
            cipher,
            Arc::new(HttpTokenEndpoint::from_config(&config.platforms)),
            PlatformRegistry::from_config(&config.platforms),
        )
    }

    /// Submit content for publication; returns the new task's id immediately
    pub async fn submit_publish(
        &self,
        owner_account_id: &str,
        content: ContentRef,
        platforms: Vec<PlatformId>,
    ) -> Result<String> {
        let task = PublishTask::new(owner_account_id, content, platforms)?;
        self.scheduler.submit(task).await
    }

    /// Task with its per-platform records
    pub async fn task_status(&self, task_id: &str) -> Result<TaskView> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        let records = self.store.get_records(task_id).await?;
        Ok(TaskView { task, records })
    }

    /// Cancel a task; `false` if it had already finished
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        match self.scheduler.cancel(task_id).await {
            Ok(()) => Ok(true),
            Err(ReelcastError::Scheduler(SchedulerError::AlreadyTerminal(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store the credential produced by an OAuth callback
    ///
    /// Replaces any previous credential and clears the account's
    /// re-authorization flag.
    pub async fn connect_account(&self, credential: Credential) -> Result<()> {
        let key = credential.key();
        self.refresher.credentials().put(&credential).await?;
        self.refresher.clear_flag(&key);
        tracing::info!("Connected account {}", key);
        Ok(())
    }

    pub async fn disconnect_account(&self, account_id: &str, platform: PlatformId) -> Result<()> {
        let key = CredentialKey::new(account_id, platform);
        self.refresher.credentials().delete(account_id, platform).await?;
        self.refresher.clear_flag(&key);
        tracing::info!("Disconnected account {}", key);
        Ok(())
    }

    pub fn needs_reauthorization(&self, account_id: &str, platform: PlatformId) -> bool {
        self.refresher.needs_reauthorization(account_id, platform)
    }

    pub fn accounts_needing_reauthorization(&self) -> Vec<CredentialKey> {
        self.refresher.flagged()
    }

    pub async fn stats(&self, query: &StatsQuery) -> Result<PublishStats> {
        self.aggregator.stats(query).await
    }

    /// Snapshot recomputed the last time one of the account's records finished
    pub fn cached_stats(&self, account_id: &str) -> Option<PublishStats> {
        self.aggregator.cached_stats(account_id)
    }

    /// Tasks matching the query, newest first
    pub async fn list_tasks(&self, query: &StatsQuery) -> Result<Vec<PublishTask>> {
        self.store.list_tasks(query).await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Wait until the task reaches a terminal status or `timeout` passes
    ///
    /// Returns the latest view either way; check `view.task.status`.
    pub async fn wait_for_terminal(&self, task_id: &str, timeout: Duration) -> Result<TaskView> {
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let view = self.task_status(task_id).await?;
            if view.task.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(view);
            }

            // Any event may be the one that finished the task; re-check at
            // least every 250ms in case we lagged behind the bus
            let tick = tokio::time::sleep(Duration::from_millis(250));
            tokio::select! {
                _ = events.recv() => {}
                _ = tick => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Stop the worker pool after in-flight attempts finish
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
