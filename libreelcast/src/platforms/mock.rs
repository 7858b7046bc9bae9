//! Scripted adapter for testing
//!
//! [`MockAdapter`] answers publish calls from a script of [`PlatformResult`]s
//! and records what it saw, so scheduler tests can drive exact outcome
//! sequences without network access.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::platforms::{PlatformAdapter, PlatformResult};
use crate::types::{ContentRef, PlatformId};

/// Configuration for mock adapter behavior
#[derive(Clone)]
pub struct MockConfig {
    pub platform: PlatformId,

    /// Results handed out in order, one per call
    pub script: Vec<PlatformResult>,

    /// Result once the script is used up; `None` means accept with a generated id
    pub fallback: Option<PlatformResult>,

    /// Simulated network latency
    pub delay: Duration,

    /// When set, each call waits for a permit before answering
    pub gate: Option<Arc<Semaphore>>,
}

impl MockConfig {
    pub fn new(platform: PlatformId) -> Self {
        Self {
            platform,
            script: Vec::new(),
            fallback: None,
            delay: Duration::ZERO,
            gate: None,
        }
    }
}

/// What the adapter observed
#[derive(Default)]
struct Observed {
    call_times: Vec<Instant>,
    tokens: Vec<String>,
    titles: Vec<String>,
}

pub struct MockAdapter {
    config: MockConfig,
    script: Mutex<VecDeque<PlatformResult>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    observed: Mutex<Observed>,
}

impl MockAdapter {
    pub fn new(config: MockConfig) -> Self {
        let script = config.script.iter().cloned().collect();
        Self {
            config,
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            observed: Mutex::new(Observed::default()),
        }
    }

    /// Accepts every call
    pub fn accepting(platform: PlatformId) -> Self {
        Self::new(MockConfig::new(platform))
    }

    /// Answers with `script` in order, then accepts
    pub fn scripted(platform: PlatformId, script: Vec<PlatformResult>) -> Self {
        Self::new(MockConfig {
            script,
            ..MockConfig::new(platform)
        })
    }

    /// Answers every call with `result`
    pub fn always(platform: PlatformId, result: PlatformResult) -> Self {
        Self::new(MockConfig {
            fallback: Some(result),
            ..MockConfig::new(platform)
        })
    }

    /// Accepts, but only after the test adds a permit to `gate` for each call
    pub fn gated(platform: PlatformId, gate: Arc<Semaphore>) -> Self {
        Self::new(MockConfig {
            gate: Some(gate),
            ..MockConfig::new(platform)
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// When each call started
    pub fn call_times(&self) -> Vec<Instant> {
        self.observed().call_times.clone()
    }

    /// Access tokens the calls were made with
    pub fn tokens_seen(&self) -> Vec<String> {
        self.observed().tokens.clone()
    }

    pub fn titles_seen(&self) -> Vec<String> {
        self.observed().titles.clone()
    }

    fn observed(&self) -> std::sync::MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_result(&self, call: usize) -> PlatformResult {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        scripted
            .or_else(|| self.config.fallback.clone())
            .unwrap_or_else(|| {
                PlatformResult::Accepted(format!("{}-post-{}", self.config.platform, call))
            })
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> PlatformId {
        self.config.platform
    }

    async fn publish(&self, access_token: &SecretString, content: &ContentRef) -> PlatformResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        {
            let mut observed = self.observed();
            observed.call_times.push(Instant::now());
            observed.tokens.push(access_token.expose_secret().to_string());
            observed.titles.push(content.title.clone());
        }

        if !self.config.delay.is_zero() {
            tokio::time::sleep(self.config.delay).await;
        }

        if let Some(gate) = &self.config.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = self.next_result(call);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
