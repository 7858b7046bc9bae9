//! Token Refresher
//!
//! [`TokenRefresher::ensure_valid`] hands out an access token that is good for
//! at least the configured safety margin, refreshing it through the platform's
//! OAuth token endpoint when needed. Refreshes are serialized per credential:
//! concurrent callers for the same account and platform wait on one lock and
//! re-check the stored credential after acquiring it, so only the first one
//! talks to the network.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::config::PlatformsConfig;
use crate::credentials::CredentialStore;
use crate::error::{CredentialError, RefreshError, ReelcastError, Result};
use crate::events::{Event, EventBus};
use crate::types::{copy_secret, Credential, CredentialKey, PlatformId};

/// Result of a successful refresh-token exchange
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: SecretString,
    /// Seconds until the new access token expires
    pub expires_in: i64,
    /// Some platforms rotate the refresh token, most do not
    pub refresh_token: Option<SecretString>,
}

/// A platform's OAuth token endpoint
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        platform: PlatformId,
        refresh_token: &SecretString,
    ) -> std::result::Result<TokenGrant, RefreshError>;
}

/// OAuth client registration for one platform
#[derive(Debug)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_url: String,
}

/// Standard `grant_type=refresh_token` exchange over HTTPS
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    clients: HashMap<PlatformId, OAuthClient>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    refresh_token: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

impl HttpTokenEndpoint {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            clients: HashMap::new(),
        }
    }

    pub fn with_client(mut self, platform: PlatformId, client: OAuthClient) -> Self {
        self.clients.insert(platform, client);
        self
    }

    /// Register every platform that has OAuth settings in the config
    pub fn from_config(config: &PlatformsConfig) -> Self {
        let mut endpoint = Self::new();
        if let Some(youtube) = &config.youtube {
            endpoint = endpoint.with_client(
                PlatformId::YouTube,
                OAuthClient {
                    client_id: youtube.client_id.clone(),
                    client_secret: SecretString::from(youtube.client_secret.clone()),
                    token_url: youtube.token_url.clone(),
                },
            );
        }
        endpoint
    }
}

impl Default for HttpTokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(
        &self,
        platform: PlatformId,
        refresh_token: &SecretString,
    ) -> std::result::Result<TokenGrant, RefreshError> {
        let client = self.clients.get(&platform).ok_or_else(|| {
            RefreshError::InvalidGrant(format!("no OAuth client configured for {}", platform))
        })?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.expose_secret()),
        ];

        let response = self
            .http
            .post(&client.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            let body: TokenResponse = response.json().await.map_err(|e| {
                RefreshError::Transient(format!("malformed token response: {}", e))
            })?;

            return Ok(TokenGrant {
                access_token: SecretString::from(body.access_token),
                expires_in: body.expires_in,
                refresh_token: body.refresh_token.map(SecretString::from),
            });
        }

        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            return Err(RefreshError::Transient(format!(
                "token endpoint returned {}",
                status
            )));
        }

        // Only the OAuth error code is surfaced, never the raw body
        let reason = match response.json::<TokenErrorResponse>().await {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            Err(_) => format!("token endpoint returned {}", status),
        };

        Err(RefreshError::InvalidGrant(reason))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TokenRefresher {
    credentials: CredentialStore,
    endpoint: Arc<dyn TokenEndpoint>,
    safety_margin: i64,
    events: EventBus,
    /// Lazily created, one per credential, never shared across credentials
    locks: Mutex<HashMap<CredentialKey, Arc<tokio::sync::Mutex<()>>>>,
    reauth: RwLock<HashSet<CredentialKey>>,
}

impl TokenRefresher {
    pub fn new(
        credentials: CredentialStore,
        endpoint: Arc<dyn TokenEndpoint>,
        safety_margin_seconds: i64,
        events: EventBus,
    ) -> Self {
        Self {
            credentials,
            endpoint,
            safety_margin: safety_margin_seconds,
            events,
            locks: Mutex::new(HashMap::new()),
            reauth: RwLock::new(HashSet::new()),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    fn lock_for(&self, key: &CredentialKey) -> Arc<tokio::sync::Mutex<()>> {
        lock_or_recover(&self.locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return an access token valid beyond the safety margin, refreshing if needed
    ///
    /// The returned credential is the one now in the store: unchanged on the
    /// fast path, or carrying the new access token and expiry after a refresh.
    ///
    /// # Errors
    ///
    /// - `RefreshError::InvalidGrant` if the platform rejected the refresh
    ///   token, or the stored credential is gone or unreadable. The account
    ///   is flagged for re-authorization.
    /// - `RefreshError::Transient` for network, server or persistence failures
    pub async fn ensure_valid(
        &self,
        credential: Credential,
    ) -> std::result::Result<(SecretString, Credential), RefreshError> {
        if credential.is_fresh(now(), self.safety_margin) {
            tracing::debug!("Access token for {} still fresh", credential.key());
            let token = copy_secret(&credential.access_token);
            return Ok((token, credential));
        }

        let key = credential.key();
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(&key).await
        };
        self.prune_lock(&key, &lock);
        result
    }

    /// Drop the credential's lock entry if no other caller holds or awaits it
    fn prune_lock(&self, key: &CredentialKey, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = lock_or_recover(&self.locks);
        // One reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }

    /// Caller must hold the credential's lock
    async fn refresh_locked(
        &self,
        key: &CredentialKey,
    ) -> std::result::Result<(SecretString, Credential), RefreshError> {
        let key = key.clone();

        // Another caller may have refreshed while we waited
        let current = match self.credentials.get(&key.account_id, key.platform).await {
            Ok(current) => current,
            Err(e) if e.requires_reauthorization() => {
                let err = RefreshError::InvalidGrant(e.to_string());
                self.flag(&key, &err.to_string());
                return Err(err);
            }
            Err(e) => return Err(RefreshError::Transient(e.to_string())),
        };

        if current.is_fresh(now(), self.safety_margin) {
            tracing::debug!("Credential {} was refreshed concurrently", key);
            let token = copy_secret(&current.access_token);
            return Ok((token, current));
        }

        tracing::info!("Refreshing access token for {}", key);

        let grant = match self
            .endpoint
            .refresh(key.platform, &current.refresh_token)
            .await
        {
            Ok(grant) => grant,
            Err(err @ RefreshError::InvalidGrant(_)) => {
                tracing::warn!("Refresh grant rejected for {}: {}", key, err);
                self.flag(&key, &err.to_string());
                return Err(err);
            }
            Err(err) => {
                tracing::warn!("Token refresh for {} failed: {}", key, err);
                return Err(err);
            }
        };

        let refreshed = Credential {
            account_id: current.account_id.clone(),
            platform: current.platform,
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .unwrap_or_else(|| copy_secret(&current.refresh_token)),
            expires_at: now().saturating_add(grant.expires_in.max(0)),
            scopes: current.scopes.clone(),
        };

        self.credentials
            .put(&refreshed)
            .await
            .map_err(|e| RefreshError::Transient(format!("failed to persist refreshed token: {}", e)))?;

        self.clear_flag(&key);
        tracing::info!("Refreshed access token for {}", key);

        let token = copy_secret(&refreshed.access_token);
        Ok((token, refreshed))
    }

    /// Load the stored credential and run it through [`ensure_valid`](Self::ensure_valid)
    ///
    /// A missing or corrupt credential flags the account for re-authorization.
    pub async fn access_token_for(
        &self,
        account_id: &str,
        platform: PlatformId,
    ) -> Result<SecretString> {
        let key = CredentialKey::new(account_id, platform);

        let credential = match self.credentials.get(account_id, platform).await {
            Ok(credential) => credential,
            Err(e @ ReelcastError::Credential(CredentialError::NotFound(_))) => {
                self.flag(&key, "account not connected");
                return Err(e);
            }
            Err(e) => {
                if e.requires_reauthorization() {
                    self.flag(&key, &e.to_string());
                }
                return Err(e);
            }
        };

        let (token, _) = self.ensure_valid(credential).await?;
        Ok(token)
    }

    fn flag(&self, key: &CredentialKey, reason: &str) {
        let newly_flagged = self
            .reauth
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());

        if newly_flagged {
            tracing::warn!("Account {} needs re-authorization: {}", key, reason);
            self.events.emit(Event::ReauthorizationRequired {
                account_id: key.account_id.clone(),
                platform: key.platform,
                reason: reason.to_string(),
            });
        }
    }

    pub fn clear_flag(&self, key: &CredentialKey) {
        self.reauth
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn needs_reauthorization(&self, account_id: &str, platform: PlatformId) -> bool {
        self.reauth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&CredentialKey::new(account_id, platform))
    }

    /// Every flagged credential, sorted by account then platform
    pub fn flagged(&self) -> Vec<CredentialKey> {
        let mut keys: Vec<CredentialKey> = self
            .reauth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            a.account_id
                .cmp(&b.account_id)
                .then(a.platform.cmp(&b.platform))
        });
        keys
    }
}
