//! Reelcast - publish orchestration for connected social accounts
//!
//! This library schedules publication of one content item to several
//! platforms on behalf of a connected account. It keeps each account's OAuth
//! tokens encrypted at rest and refreshed, runs one sub-job per platform on a
//! bounded worker pool with centralized retry policy, and folds per-platform
//! outcomes into the task's aggregate status and stats.

pub mod aggregator;
pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod oauth;
pub mod platforms;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{CredentialStore, TokenCipher};
pub use db::Database;
pub use engine::PublishEngine;
pub use error::{ReelcastError, Result};
pub use platforms::{PlatformAdapter, PlatformRegistry, PlatformResult};
pub use store::{MemoryStore, PublishStore};
pub use types::{
    ContentRef, Credential, PlatformId, PublishRecord, PublishStats, PublishTask, RecordStatus,
    StatsQuery, TaskStatus, TaskView,
};
