//! Error types for Reelcast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReelcastError>;

#[derive(Error, Debug)]
pub enum ReelcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Token refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ReelcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ReelcastError::InvalidInput(_) => 3,
            ReelcastError::Credential(CredentialError::NotFound(_))
            | ReelcastError::Credential(CredentialError::Corrupt(_))
            | ReelcastError::Refresh(RefreshError::InvalidGrant(_)) => 2,
            ReelcastError::Credential(_) => 1,
            ReelcastError::Refresh(_) => 1,
            ReelcastError::Scheduler(_) => 1,
            ReelcastError::Config(_) => 1,
            ReelcastError::Database(_) => 1,
        }
    }

    /// Whether the account behind this error has to be connected again
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            ReelcastError::Credential(CredentialError::NotFound(_))
                | ReelcastError::Credential(CredentialError::Corrupt(_))
                | ReelcastError::Refresh(RefreshError::InvalidGrant(_))
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    /// Ciphertext failed its authenticity check. The account must be reconnected.
    #[error("Credential corrupt for {0}; reconnect the account")]
    Corrupt(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Credential key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a token refresh, classified for the retry policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Refresh token revoked or expired; never retried
    #[error("Refresh grant rejected: {0}")]
    InvalidGrant(String),

    /// Network failure or server error; the caller may retry
    #[error("Transient refresh failure: {0}")]
    Transient(String),
}

impl RefreshError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RefreshError::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} is already in a terminal state")]
    AlreadyTerminal(String),

    #[error("Work queue is full ({0} free slots needed)")]
    QueueFull(usize),

    #[error("No adapter registered for platform {0}")]
    UnknownPlatform(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}
