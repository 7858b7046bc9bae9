//! Core types for Reelcast

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ReelcastError, Result};

/// Platforms the engine knows how to publish to
///
/// The set is closed; adapters are registered per variant at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    YouTube,
    TikTok,
    Instagram,
}

impl PlatformId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::TikTok => "tiktok",
            Self::Instagram => "instagram",
        }
    }

    pub fn all() -> [PlatformId; 3] {
        [Self::YouTube, Self::TikTok, Self::Instagram]
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformId {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "youtube" => Ok(Self::YouTube),
            "tiktok" => Ok(Self::TikTok),
            "instagram" => Ok(Self::Instagram),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: youtube, tiktok, instagram",
                other
            ))),
        }
    }
}

/// Identifies one credential: a connected account on one platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub account_id: String,
    pub platform: PlatformId,
}

impl CredentialKey {
    pub fn new(account_id: impl Into<String>, platform: PlatformId) -> Self {
        Self {
            account_id: account_id.into(),
            platform,
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.platform)
    }
}

/// Decrypted OAuth credential
///
/// Only exists in memory. Token values are wrapped in `SecretString`, so
/// `Debug` output redacts them.
#[derive(Debug)]
pub struct Credential {
    pub account_id: String,
    pub platform: PlatformId,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// Unix timestamp after which the access token is no longer accepted
    pub expires_at: i64,
    pub scopes: Vec<String>,
}

impl Credential {
    pub fn new(
        account_id: impl Into<String>,
        platform: PlatformId,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            platform,
            access_token: SecretString::from(access_token.into()),
            refresh_token: SecretString::from(refresh_token.into()),
            expires_at,
            scopes,
        }
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.account_id.clone(), self.platform)
    }

    /// Whether the access token is still usable `safety_margin` seconds from `now`
    pub fn is_fresh(&self, now: i64, safety_margin: i64) -> bool {
        now < self.expires_at - safety_margin
    }
}

/// Independent copy of a secret value
pub(crate) fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            account_id: self.account_id.clone(),
            platform: self.platform,
            access_token: copy_secret(&self.access_token),
            refresh_token: copy_secret(&self.refresh_token),
            expires_at: self.expires_at,
            scopes: self.scopes.clone(),
        }
    }
}

/// Credential as persisted: token fields hold age ciphertext (base64)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub account_id: String,
    pub platform: PlatformId,
    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: String,
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub updated_at: i64,
}

/// Reference to the content being published
///
/// Media is never embedded; `uri` points at it and the adapter decides how to
/// hand it to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub uri: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ContentRef {
    pub fn new(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: title.into(),
            description: None,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    PartialSuccess,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PartialSuccess | Self::Success | Self::Failed | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::PartialSuccess => "partial_success",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "partial_success" => Ok(Self::PartialSuccess),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown task status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Queued,
    Retrying,
    Succeeded,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "retrying" => Ok(Self::Retrying),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown record status '{}'",
                other
            ))),
        }
    }
}

/// A request to publish one content item to a set of platforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTask {
    pub id: String,
    pub owner_account_id: String,
    pub content: ContentRef,
    targets: Vec<PlatformId>,
    pub created_at: i64,
    pub status: TaskStatus,
}

impl PublishTask {
    /// Create a pending task
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the target list is empty or names a platform twice.
    pub fn new(
        owner_account_id: impl Into<String>,
        content: ContentRef,
        targets: Vec<PlatformId>,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(ReelcastError::InvalidInput(
                "A publish task needs at least one target platform".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for platform in &targets {
            if !seen.insert(*platform) {
                return Err(ReelcastError::InvalidInput(format!(
                    "Platform {} listed more than once",
                    platform
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            owner_account_id: owner_account_id.into(),
            content,
            targets,
            created_at: chrono::Utc::now().timestamp(),
            status: TaskStatus::Pending,
        })
    }

    /// Rebuild a task loaded from storage
    pub(crate) fn from_parts(
        id: String,
        owner_account_id: String,
        content: ContentRef,
        targets: Vec<PlatformId>,
        created_at: i64,
        status: TaskStatus,
    ) -> Self {
        Self {
            id,
            owner_account_id,
            content,
            targets,
            created_at,
            status,
        }
    }

    /// Target platforms, in submission order. Fixed at creation.
    pub fn targets(&self) -> &[PlatformId] {
        &self.targets
    }
}

/// Outcome tracking for one (task, platform) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub task_id: String,
    pub platform: PlatformId,
    pub attempt_count: u32,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// Platform-side id of the published item
    pub external_id: Option<String>,
    pub status: RecordStatus,
}

impl PublishRecord {
    pub fn queued(task_id: impl Into<String>, platform: PlatformId) -> Self {
        Self {
            task_id: task_id.into(),
            platform,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            external_id: None,
            status: RecordStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a successful attempt. Returns false if the record was already terminal.
    pub fn record_success(&mut self, external_id: String, at: i64) -> bool {
        self.apply_attempt(RecordStatus::Succeeded, None, Some(external_id), at)
    }

    /// Record an attempt that will be retried
    pub fn record_retry(&mut self, reason: String, at: i64) -> bool {
        self.apply_attempt(RecordStatus::Retrying, Some(reason), None, at)
    }

    /// Record a final failed attempt
    pub fn record_failure(&mut self, reason: String, at: i64) -> bool {
        self.apply_attempt(RecordStatus::Failed, Some(reason), None, at)
    }

    fn apply_attempt(
        &mut self,
        status: RecordStatus,
        error: Option<String>,
        external_id: Option<String>,
        at: i64,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.attempt_count += 1;
        self.last_attempt_at = Some(at);
        self.last_error = error;
        self.external_id = external_id;
        self.status = status;
        true
    }
}

/// Task counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub partial_success: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::PartialSuccess => self.partial_success += 1,
            TaskStatus::Success => self.success += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending
            + self.in_progress
            + self.partial_success
            + self.success
            + self.failed
            + self.cancelled
    }
}

/// Read projection over tasks and records. Never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishStats {
    pub tasks: TaskCounts,
    /// Succeeded records over terminal records, 0.0 when nothing finished
    pub success_rate: f64,
    pub average_attempts_per_success: f64,
}

/// Filter for stats and task listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsQuery {
    pub account_id: Option<String>,
    /// Inclusive lower bound on task creation time
    pub since: Option<i64>,
    /// Exclusive upper bound on task creation time
    pub until: Option<i64>,
}

impl StatsQuery {
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &PublishTask) -> bool {
        if let Some(account) = &self.account_id {
            if &task.owner_account_id != account {
                return false;
            }
        }
        if let Some(since) = self.since {
            if task.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if task.created_at >= until {
                return false;
            }
        }
        true
    }
}

/// What callers see when asking for a task's status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task: PublishTask,
    pub records: Vec<PublishRecord>,
}
