//! Platform adapters
//!
//! Each supported platform gets one [`PlatformAdapter`] that turns a
//! [`ContentRef`] into that platform's publish call and classifies the outcome
//! into a [`PlatformResult`]. Adapters never retry; the scheduler owns retry
//! policy so backoff and attempt accounting are the same for every platform.
//!
//! Adapters are registered per [`PlatformId`] in a [`PlatformRegistry`] built
//! once at startup.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libreelcast::platforms::{PlatformRegistry, mock::MockAdapter};
//! use libreelcast::types::PlatformId;
//!
//! let registry = PlatformRegistry::new()
//!     .register(Arc::new(MockAdapter::accepting(PlatformId::TikTok)));
//!
//! assert!(registry.get(PlatformId::TikTok).is_some());
//! ```

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PlatformsConfig;
use crate::types::{ContentRef, PlatformId};

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;
pub mod youtube;

/// Classified outcome of one publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformResult {
    /// Published; carries the platform's id for the new item
    Accepted(String),
    /// Try again later, after the given delay if the platform named one
    RateLimited(Option<Duration>),
    /// Content-level rejection (policy, validation). Never retried.
    RejectedPermanently(String),
    /// Network failure or server error. Retried with backoff.
    TransientFailure(String),
}

impl PlatformResult {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformResult::RateLimited(_) | PlatformResult::TransientFailure(_)
        )
    }
}

impl fmt::Display for PlatformResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformResult::Accepted(id) => write!(f, "accepted as {}", id),
            PlatformResult::RateLimited(Some(after)) => {
                write!(f, "rate limited, retry after {}ms", after.as_millis())
            }
            PlatformResult::RateLimited(None) => write!(f, "rate limited"),
            PlatformResult::RejectedPermanently(reason) => f.write_str(reason),
            PlatformResult::TransientFailure(reason) => f.write_str(reason),
        }
    }
}

/// One platform's publish capability
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> PlatformId;

    /// Perform exactly one publish call
    ///
    /// Every failure, including transport errors, must come back as a
    /// `PlatformResult` variant.
    async fn publish(&self, access_token: &SecretString, content: &ContentRef) -> PlatformResult;
}

/// Adapter per platform, fixed after startup
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    adapters: HashMap<PlatformId, Arc<dyn PlatformAdapter>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter under its own platform id, replacing any previous one
    pub fn register(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.adapters.insert(adapter.platform(), adapter);
        self
    }

    /// Register the built-in adapters for every platform configured in `config`
    pub fn from_config(config: &PlatformsConfig) -> Self {
        let mut registry = Self::new();
        if let Some(youtube) = &config.youtube {
            registry = registry.register(Arc::new(youtube::YouTubeAdapter::new(youtube)));
        }
        registry
    }

    pub fn get(&self, platform: PlatformId) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn contains(&self, platform: PlatformId) -> bool {
        self.adapters.contains_key(&platform)
    }

    /// Registered platforms, sorted
    pub fn platforms(&self) -> Vec<PlatformId> {
        let mut platforms: Vec<PlatformId> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}
