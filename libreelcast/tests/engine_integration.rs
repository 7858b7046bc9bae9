//! Integration tests for PublishEngine
//!
//! Drives the whole engine (scheduler, refresher, aggregator) against the
//! in-memory store and scripted platform adapters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::Semaphore;

use libreelcast::config::EngineConfig;
use libreelcast::error::{DbError, RefreshError, ReelcastError, SchedulerError};
use libreelcast::events::Event;
use libreelcast::oauth::{TokenEndpoint, TokenGrant};
use libreelcast::platforms::mock::MockAdapter;
use libreelcast::types::StoredCredential;
use libreelcast::{
    ContentRef, Credential, MemoryStore, PlatformId, PlatformRegistry, PlatformResult,
    PublishEngine, PublishRecord, PublishStore, PublishTask, RecordStatus, StatsQuery,
    TaskStatus, TaskView, TokenCipher,
};

const ACCOUNT: &str = "acct-1";
const WAIT: Duration = Duration::from_secs(5);

/// Token endpoint that answers every refresh the same way
struct FixedEndpoint {
    invalid_grant: bool,
}

#[async_trait]
impl TokenEndpoint for FixedEndpoint {
    async fn refresh(
        &self,
        _platform: PlatformId,
        _refresh_token: &SecretString,
    ) -> Result<TokenGrant, RefreshError> {
        if self.invalid_grant {
            Err(RefreshError::InvalidGrant("invalid_grant: Token has been revoked".to_string()))
        } else {
            Ok(TokenGrant {
                access_token: SecretString::from("refreshed-access".to_string()),
                expires_in: 3600,
                refresh_token: None,
            })
        }
    }
}

/// Token endpoint that fails transiently a fixed number of times, then grants
struct FlakyEndpoint {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyEndpoint {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenEndpoint for FlakyEndpoint {
    async fn refresh(
        &self,
        _platform: PlatformId,
        _refresh_token: &SecretString,
    ) -> Result<TokenGrant, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RefreshError::Transient("503 from token endpoint".to_string()));
        }
        Ok(TokenGrant {
            access_token: SecretString::from("refreshed-access".to_string()),
            expires_in: 3600,
            refresh_token: None,
        })
    }
}

/// Store whose first `put_record` calls fail
struct FailingWritesStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
}

#[async_trait]
impl PublishStore for FailingWritesStore {
    async fn get_credential(
        &self,
        account_id: &str,
        platform: PlatformId,
    ) -> libreelcast::Result<Option<StoredCredential>> {
        self.inner.get_credential(account_id, platform).await
    }

    async fn put_credential(&self, credential: &StoredCredential) -> libreelcast::Result<()> {
        self.inner.put_credential(credential).await
    }

    async fn delete_credential(
        &self,
        account_id: &str,
        platform: PlatformId,
    ) -> libreelcast::Result<()> {
        self.inner.delete_credential(account_id, platform).await
    }

    async fn insert_task(
        &self,
        task: &PublishTask,
        records: &[PublishRecord],
    ) -> libreelcast::Result<()> {
        self.inner.insert_task(task, records).await
    }

    async fn get_task(&self, task_id: &str) -> libreelcast::Result<Option<PublishTask>> {
        self.inner.get_task(task_id).await
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> libreelcast::Result<()> {
        self.inner.update_task_status(task_id, status).await
    }

    async fn list_tasks(&self, query: &StatsQuery) -> libreelcast::Result<Vec<PublishTask>> {
        self.inner.list_tasks(query).await
    }

    async fn put_record(&self, record: &PublishRecord) -> libreelcast::Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DbError::IoError(std::io::Error::other("disk I/O error")).into());
        }
        self.inner.put_record(record).await
    }

    async fn get_records(&self, task_id: &str) -> libreelcast::Result<Vec<PublishRecord>> {
        self.inner.get_records(task_id).await
    }

    async fn list_records(&self, query: &StatsQuery) -> libreelcast::Result<Vec<PublishRecord>> {
        self.inner.list_records(query).await
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_pool_size: 4,
        max_retries: 3,
        backoff_base_ms: 10,
        backoff_max_ms: 1_000,
        rate_limit_floor_ms: 10,
        ..EngineConfig::default()
    }
}

fn engine_with(config: EngineConfig, registry: PlatformRegistry, invalid_grant: bool) -> PublishEngine {
    build_engine(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(FixedEndpoint { invalid_grant }),
        registry,
    )
}

fn build_engine(
    config: EngineConfig,
    store: Arc<dyn PublishStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    registry: PlatformRegistry,
) -> PublishEngine {
    PublishEngine::new(&config, store, TokenCipher::generate(), endpoint, registry).unwrap()
}

fn fresh_credential(platform: PlatformId) -> Credential {
    Credential::new(
        ACCOUNT,
        platform,
        format!("{}-access", platform),
        format!("{}-refresh", platform),
        chrono::Utc::now().timestamp() + 3600,
        vec!["upload".to_string()],
    )
}

async fn connect_all(engine: &PublishEngine, platforms: &[PlatformId]) {
    for platform in platforms {
        engine.connect_account(fresh_credential(*platform)).await.unwrap();
    }
}

fn clip() -> ContentRef {
    ContentRef::new("https://cdn.example/clip.mp4", "clip")
}

fn record(view: &TaskView, platform: PlatformId) -> &libreelcast::PublishRecord {
    view.records
        .iter()
        .find(|r| r.platform == platform)
        .expect("record for platform")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let tiktok = Arc::new(MockAdapter::scripted(
        PlatformId::TikTok,
        vec![
            PlatformResult::TransientFailure("502 Bad Gateway".to_string()),
            PlatformResult::TransientFailure("connection reset".to_string()),
        ],
    ));
    let registry = PlatformRegistry::new()
        .register(youtube.clone())
        .register(tiktok.clone());
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::YouTube, PlatformId::TikTok]).await;

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::TikTok])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Success);

    let yt = record(&view, PlatformId::YouTube);
    assert_eq!(yt.status, RecordStatus::Succeeded);
    assert_eq!(yt.attempt_count, 1);

    let tt = record(&view, PlatformId::TikTok);
    assert_eq!(tt.status, RecordStatus::Succeeded);
    assert_eq!(tt.attempt_count, 3);
    assert_eq!(tt.external_id.as_deref(), Some("tiktok-post-3"));
    assert_eq!(tiktok.call_count(), 3);
    assert_eq!(tiktok.tokens_seen(), vec!["tiktok-access"; 3]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_permanent_rejection_gives_partial_success() {
    let registry = PlatformRegistry::new()
        .register(Arc::new(MockAdapter::accepting(PlatformId::YouTube)))
        .register(Arc::new(MockAdapter::always(
            PlatformId::Instagram,
            PlatformResult::RejectedPermanently("policy".to_string()),
        )));
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::YouTube, PlatformId::Instagram]).await;

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::Instagram])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::PartialSuccess);
    let ig = record(&view, PlatformId::Instagram);
    assert_eq!(ig.status, RecordStatus::Failed);
    assert_eq!(ig.attempt_count, 1);
    assert_eq!(ig.last_error.as_deref(), Some("policy"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_retries_exhausted_with_growing_backoff() {
    let tiktok = Arc::new(MockAdapter::always(
        PlatformId::TikTok,
        PlatformResult::TransientFailure("503".to_string()),
    ));
    let registry = PlatformRegistry::new().register(tiktok.clone());
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::TikTok]).await;
    let mut events = engine.subscribe();

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::TikTok])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Failed);
    let tt = record(&view, PlatformId::TikTok);
    assert_eq!(tt.attempt_count, 4);
    assert_eq!(tt.last_error.as_deref(), Some("503"));
    assert_eq!(tiktok.call_count(), 4);

    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::RetryScheduled { attempt, delay_ms, .. } = event {
            delays.push((attempt, delay_ms));
        }
    }
    assert_eq!(delays.len(), 3);
    assert_eq!(
        delays.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(delays.windows(2).all(|w| w[0].1 < w[1].1), "{:?}", delays);

    // Attempts are spaced by at least the scheduled delay
    let times = tiktok.call_times();
    for (i, (_, delay_ms)) in delays.iter().enumerate() {
        assert!(times[i + 1] - times[i] >= Duration::from_millis(*delay_ms));
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let youtube = Arc::new(MockAdapter::scripted(
        PlatformId::YouTube,
        vec![PlatformResult::RateLimited(None)],
    ));
    let registry = PlatformRegistry::new().register(youtube.clone());
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::YouTube]).await;

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Success);
    assert_eq!(record(&view, PlatformId::YouTube).attempt_count, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_revoked_refresh_token_fails_once_and_flags_account() {
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let registry = PlatformRegistry::new().register(youtube.clone());
    let engine = engine_with(fast_config(), registry, true);
    let mut events = engine.subscribe();

    let mut expired = fresh_credential(PlatformId::YouTube);
    expired.expires_at = chrono::Utc::now().timestamp() - 10;
    engine.connect_account(expired).await.unwrap();

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Failed);
    let yt = record(&view, PlatformId::YouTube);
    assert_eq!(yt.attempt_count, 1);
    assert!(yt.last_error.as_deref().unwrap().starts_with("reconnect account"));
    assert_eq!(youtube.call_count(), 0);

    assert!(engine.needs_reauthorization(ACCOUNT, PlatformId::YouTube));
    assert_eq!(engine.accounts_needing_reauthorization().len(), 1);

    let mut flagged = false;
    while let Ok(event) = events.try_recv() {
        if let Event::ReauthorizationRequired { account_id, platform, .. } = event {
            assert_eq!(account_id, ACCOUNT);
            assert_eq!(platform, PlatformId::YouTube);
            flagged = true;
        }
    }
    assert!(flagged);

    // Reconnecting clears the flag
    engine
        .connect_account(fresh_credential(PlatformId::YouTube))
        .await
        .unwrap();
    assert!(!engine.needs_reauthorization(ACCOUNT, PlatformId::YouTube));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_is_refreshed_before_publishing() {
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let registry = PlatformRegistry::new().register(youtube.clone());
    let engine = engine_with(fast_config(), registry, false);

    let mut expired = fresh_credential(PlatformId::YouTube);
    expired.expires_at = chrono::Utc::now().timestamp() + 30;
    engine.connect_account(expired).await.unwrap();

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Success);
    assert_eq!(youtube.tokens_seen(), vec!["refreshed-access"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_transient_refresh_failure_is_retried() {
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let endpoint = Arc::new(FlakyEndpoint::new(1));
    let engine = build_engine(
        fast_config(),
        Arc::new(MemoryStore::new()),
        endpoint.clone(),
        PlatformRegistry::new().register(youtube.clone()),
    );
    let mut events = engine.subscribe();

    let mut expired = fresh_credential(PlatformId::YouTube);
    expired.expires_at = chrono::Utc::now().timestamp() - 10;
    engine.connect_account(expired).await.unwrap();

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Success);
    let yt = record(&view, PlatformId::YouTube);
    assert_eq!(yt.attempt_count, 2);
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    assert_eq!(youtube.call_count(), 1);
    assert_eq!(youtube.tokens_seen(), vec!["refreshed-access"]);
    assert!(!engine.needs_reauthorization(ACCOUNT, PlatformId::YouTube));

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let Event::RetryScheduled { attempt, delay_ms, .. } = event {
            assert_eq!(attempt, 1);
            assert!(delay_ms >= 10);
            retries += 1;
        }
    }
    assert_eq!(retries, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_tampered_credential_fails_once_and_flags_account() {
    let store = Arc::new(MemoryStore::new());
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let engine = build_engine(
        fast_config(),
        store.clone(),
        Arc::new(FixedEndpoint {
            invalid_grant: false,
        }),
        PlatformRegistry::new().register(youtube.clone()),
    );
    engine
        .connect_account(fresh_credential(PlatformId::YouTube))
        .await
        .unwrap();

    let mut stored = store
        .get_credential(ACCOUNT, PlatformId::YouTube)
        .await
        .unwrap()
        .unwrap();
    let mut bytes = stored.access_token_ciphertext.into_bytes();
    let middle = bytes.len() / 2;
    bytes[middle] = if bytes[middle] == b'A' { b'B' } else { b'A' };
    stored.access_token_ciphertext = String::from_utf8(bytes).unwrap();
    store.put_credential(&stored).await.unwrap();

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Failed);
    let yt = record(&view, PlatformId::YouTube);
    assert_eq!(yt.attempt_count, 1);
    assert!(yt.last_error.as_deref().unwrap().starts_with("reconnect account"));
    assert_eq!(youtube.call_count(), 0);
    assert!(engine.needs_reauthorization(ACCOUNT, PlatformId::YouTube));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_record_write_is_retried() {
    let store = Arc::new(FailingWritesStore {
        inner: MemoryStore::new(),
        failures_left: AtomicUsize::new(2),
    });
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let engine = build_engine(
        fast_config(),
        store,
        Arc::new(FixedEndpoint {
            invalid_grant: false,
        }),
        PlatformRegistry::new().register(youtube.clone()),
    );
    connect_all(&engine, &[PlatformId::YouTube]).await;

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Success);
    let yt = record(&view, PlatformId::YouTube);
    assert_eq!(yt.status, RecordStatus::Succeeded);
    assert_eq!(yt.attempt_count, 1);
    // The outcome is written again, the platform is not called again
    assert_eq!(youtube.call_count(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_from_another_engine_stops_queued_sub_jobs() {
    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let youtube = Arc::new(MockAdapter::gated(PlatformId::YouTube, gate.clone()));
    let tiktok = Arc::new(MockAdapter::accepting(PlatformId::TikTok));
    let publisher = build_engine(
        EngineConfig {
            worker_pool_size: 1,
            ..fast_config()
        },
        store.clone(),
        Arc::new(FixedEndpoint {
            invalid_grant: false,
        }),
        PlatformRegistry::new()
            .register(youtube.clone())
            .register(tiktok.clone()),
    );
    let canceller = build_engine(
        fast_config(),
        store,
        Arc::new(FixedEndpoint {
            invalid_grant: false,
        }),
        PlatformRegistry::new(),
    );
    connect_all(&publisher, &[PlatformId::YouTube, PlatformId::TikTok]).await;

    let task_id = publisher
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::TikTok])
        .await
        .unwrap();
    wait_until(|| youtube.call_count() == 1).await;

    assert!(canceller.cancel_task(&task_id).await.unwrap());
    gate.add_permits(1);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let view = publisher.task_status(&task_id).await.unwrap();
        if record(&view, PlatformId::YouTube).is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = publisher.task_status(&task_id).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Cancelled);
    assert_eq!(tiktok.call_count(), 0);
    assert_eq!(record(&view, PlatformId::TikTok).status, RecordStatus::Queued);

    publisher.shutdown().await;
    canceller.shutdown().await;
}

#[tokio::test]
async fn test_missing_credential_fails_without_retry() {
    let tiktok = Arc::new(MockAdapter::accepting(PlatformId::TikTok));
    let registry = PlatformRegistry::new().register(tiktok.clone());
    let engine = engine_with(fast_config(), registry, false);

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::TikTok])
        .await
        .unwrap();
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Failed);
    let tt = record(&view, PlatformId::TikTok);
    assert_eq!(tt.attempt_count, 1);
    assert_eq!(tt.last_error.as_deref(), Some("account not connected"));
    assert_eq!(tiktok.call_count(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_skips_queued_sub_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let youtube = Arc::new(MockAdapter::gated(PlatformId::YouTube, gate.clone()));
    let tiktok = Arc::new(MockAdapter::accepting(PlatformId::TikTok));
    let instagram = Arc::new(MockAdapter::accepting(PlatformId::Instagram));
    let registry = PlatformRegistry::new()
        .register(youtube.clone())
        .register(tiktok.clone())
        .register(instagram.clone());
    let config = EngineConfig {
        worker_pool_size: 1,
        ..fast_config()
    };
    let engine = engine_with(config, registry, false);
    connect_all(&engine, &PlatformId::all()).await;

    let task_id = engine
        .submit_publish(
            ACCOUNT,
            clip(),
            vec![PlatformId::YouTube, PlatformId::TikTok, PlatformId::Instagram],
        )
        .await
        .unwrap();

    // The only worker is now held inside the YouTube upload
    wait_until(|| youtube.call_count() == 1).await;

    assert!(engine.cancel_task(&task_id).await.unwrap());
    gate.add_permits(1);

    // The in-flight attempt still records its outcome
    let deadline = tokio::time::Instant::now() + WAIT;
    let view = loop {
        let view = engine.task_status(&task_id).await.unwrap();
        if record(&view, PlatformId::YouTube).is_terminal() {
            break view;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(record(&view, PlatformId::YouTube).status, RecordStatus::Succeeded);

    // Give the worker time to drain the cancelled sub-jobs
    tokio::time::sleep(Duration::from_millis(50)).await;
    let view = engine.task_status(&task_id).await.unwrap();

    assert_eq!(view.task.status, TaskStatus::Cancelled);
    assert_eq!(tiktok.call_count(), 0);
    assert_eq!(instagram.call_count(), 0);
    assert_eq!(record(&view, PlatformId::TikTok).status, RecordStatus::Queued);
    assert_eq!(record(&view, PlatformId::Instagram).status, RecordStatus::Queued);

    // Cancelling again reports the task as already finished
    assert!(!engine.cancel_task(&task_id).await.unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_unknown_task() {
    let engine = engine_with(fast_config(), PlatformRegistry::new(), false);

    let err = engine.cancel_task("no-such-task").await.unwrap_err();
    assert!(matches!(
        err,
        ReelcastError::Scheduler(SchedulerError::TaskNotFound(_))
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_status_stays_in_progress_until_every_record_finishes() {
    let gate = Arc::new(Semaphore::new(0));
    let youtube = Arc::new(MockAdapter::accepting(PlatformId::YouTube));
    let tiktok = Arc::new(MockAdapter::gated(PlatformId::TikTok, gate.clone()));
    let registry = PlatformRegistry::new()
        .register(youtube.clone())
        .register(tiktok.clone());
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::YouTube, PlatformId::TikTok]).await;

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::TikTok])
        .await
        .unwrap();

    let view = engine
        .wait_for_terminal(&task_id, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(view.task.status, TaskStatus::InProgress);
    assert_eq!(record(&view, PlatformId::YouTube).status, RecordStatus::Succeeded);
    assert!(!record(&view, PlatformId::TikTok).is_terminal());

    gate.add_permits(1);
    let view = engine.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Success);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_unknown_platform() {
    let registry =
        PlatformRegistry::new().register(Arc::new(MockAdapter::accepting(PlatformId::YouTube)));
    let engine = engine_with(fast_config(), registry, false);

    let err = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::TikTok])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReelcastError::Scheduler(SchedulerError::UnknownPlatform(ref p)) if p == "tiktok"
    ));

    let tasks = engine.list_tasks(&StatsQuery::default()).await.unwrap();
    assert!(tasks.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_when_queue_cannot_take_every_sub_job() {
    let registry = PlatformId::all()
        .into_iter()
        .fold(PlatformRegistry::new(), |registry, platform| {
            registry.register(Arc::new(MockAdapter::accepting(platform)))
        });
    let config = EngineConfig {
        queue_capacity: 2,
        ..fast_config()
    };
    let engine = engine_with(config, registry, false);

    let err = engine
        .submit_publish(ACCOUNT, clip(), PlatformId::all().to_vec())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReelcastError::Scheduler(SchedulerError::QueueFull(3))
    ));
    assert_eq!(err.exit_code(), 1);

    let tasks = engine.list_tasks(&StatsQuery::default()).await.unwrap();
    assert!(tasks.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_empty_and_duplicate_targets() {
    let registry =
        PlatformRegistry::new().register(Arc::new(MockAdapter::accepting(PlatformId::YouTube)));
    let engine = engine_with(fast_config(), registry, false);

    let empty = engine.submit_publish(ACCOUNT, clip(), vec![]).await;
    assert!(matches!(empty, Err(ReelcastError::InvalidInput(_))));

    let duplicate = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::YouTube])
        .await;
    assert!(matches!(duplicate, Err(ReelcastError::InvalidInput(_))));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_per_platform_cap_is_respected() {
    let youtube =
        Arc::new(MockAdapter::accepting(PlatformId::YouTube).with_delay(Duration::from_millis(20)));
    let tiktok =
        Arc::new(MockAdapter::accepting(PlatformId::TikTok).with_delay(Duration::from_millis(20)));
    let registry = PlatformRegistry::new()
        .register(youtube.clone())
        .register(tiktok.clone());
    let config = EngineConfig {
        worker_pool_size: 4,
        per_platform_concurrency_cap: HashMap::from([(PlatformId::YouTube, 1)]),
        ..fast_config()
    };
    let engine = engine_with(config, registry, false);
    connect_all(&engine, &[PlatformId::YouTube, PlatformId::TikTok]).await;

    let mut task_ids = Vec::new();
    for _ in 0..4 {
        task_ids.push(
            engine
                .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::TikTok])
                .await
                .unwrap(),
        );
    }
    for task_id in &task_ids {
        let view = engine.wait_for_terminal(task_id, WAIT).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Success);
    }

    assert_eq!(youtube.call_count(), 4);
    assert_eq!(youtube.max_in_flight(), 1);
    assert!(tiktok.max_in_flight() <= 4);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stats_over_finished_tasks() {
    let registry = PlatformRegistry::new()
        .register(Arc::new(MockAdapter::accepting(PlatformId::YouTube)))
        .register(Arc::new(MockAdapter::always(
            PlatformId::TikTok,
            PlatformResult::RejectedPermanently("duplicate video".to_string()),
        )));
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::YouTube, PlatformId::TikTok]).await;

    let ok = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    let partial = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube, PlatformId::TikTok])
        .await
        .unwrap();
    engine.wait_for_terminal(&ok, WAIT).await.unwrap();
    engine.wait_for_terminal(&partial, WAIT).await.unwrap();

    let stats = engine.stats(&StatsQuery::for_account(ACCOUNT)).await.unwrap();
    assert_eq!(stats.tasks.total(), 2);
    assert_eq!(stats.tasks.success, 1);
    assert_eq!(stats.tasks.partial_success, 1);
    assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((stats.average_attempts_per_success - 1.0).abs() < 1e-9);

    let other = engine.stats(&StatsQuery::for_account("someone-else")).await.unwrap();
    assert_eq!(other.tasks.total(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_events_follow_task_lifecycle() {
    let registry =
        PlatformRegistry::new().register(Arc::new(MockAdapter::accepting(PlatformId::YouTube)));
    let engine = engine_with(fast_config(), registry, false);
    connect_all(&engine, &[PlatformId::YouTube]).await;
    let mut events = engine.subscribe();

    let task_id = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap();
    engine.wait_for_terminal(&task_id, WAIT).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.task_id() == Some(task_id.as_str()) {
            seen.push(event);
        }
    }

    assert!(matches!(seen.first(), Some(Event::TaskSubmitted { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::AttemptStarted { attempt: 1, .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        Event::TaskStatusChanged { to: TaskStatus::Success, .. }
    )));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let registry =
        PlatformRegistry::new().register(Arc::new(MockAdapter::accepting(PlatformId::YouTube)));
    let engine = engine_with(fast_config(), registry, false);
    engine.shutdown().await;

    let err = engine
        .submit_publish(ACCOUNT, clip(), vec![PlatformId::YouTube])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReelcastError::Scheduler(SchedulerError::ShuttingDown)
    ));
}
