//! Encrypted credential storage
//!
//! Token values are encrypted with a single process-wide age X25519 identity
//! before they reach the [`PublishStore`], and decrypted on the way back.
//! age ciphertext is authenticated, so a tampered or foreign ciphertext fails
//! to decrypt and surfaces as [`CredentialError::Corrupt`]; a wrong-but-valid
//! looking token is never returned.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libreelcast::credentials::{CredentialStore, TokenCipher};
//! use libreelcast::store::MemoryStore;
//! use libreelcast::types::{Credential, PlatformId};
//!
//! # async fn example() -> libreelcast::error::Result<()> {
//! let store = CredentialStore::new(Arc::new(MemoryStore::new()), TokenCipher::generate());
//!
//! let credential = Credential::new("acct-1", PlatformId::YouTube, "ya29...", "1//...", 1_900_000_000, vec![]);
//! store.put(&credential).await?;
//!
//! let loaded = store.get("acct-1", PlatformId::YouTube).await?;
//! assert_eq!(loaded.expires_at, 1_900_000_000);
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use age::secrecy::ExposeSecret as _;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::config::{expand_path, CredentialKeyConfig};
use crate::error::{CredentialError, Result};
use crate::store::PublishStore;
use crate::types::{Credential, CredentialKey, PlatformId, StoredCredential};

/// Environment variable holding the identity itself, taking precedence over `key_file`
pub const KEY_ENV_VAR: &str = "REELCAST_CREDENTIAL_KEY";

/// Symmetric-at-rest encryption of token values
pub struct TokenCipher {
    identity: age::x25519::Identity,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Fresh random key, mostly useful for tests and `keygen`
    pub fn generate() -> Self {
        Self {
            identity: age::x25519::Identity::generate(),
        }
    }

    /// Parse an `AGE-SECRET-KEY-1...` string
    pub fn from_key_str(key: &str) -> Result<Self> {
        let identity = age::x25519::Identity::from_str(key.trim())
            .map_err(|e| CredentialError::KeyUnavailable(e.to_string()))?;
        Ok(Self { identity })
    }

    /// Load the process-wide key from `REELCAST_CREDENTIAL_KEY` or the configured file
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::KeyUnavailable` when neither source yields a
    /// valid identity. Callers treat this as fatal at startup.
    pub fn load(config: &CredentialKeyConfig) -> Result<Self> {
        if let Ok(key) = std::env::var(KEY_ENV_VAR) {
            tracing::debug!("Loading credential key from {}", KEY_ENV_VAR);
            return Self::from_key_str(&key);
        }

        let path = expand_path(&config.key_file);
        tracing::debug!("Loading credential key from {}", path.display());

        let contents = Zeroizing::new(std::fs::read_to_string(&path).map_err(|e| {
            CredentialError::KeyUnavailable(format!("{}: {}", path.display(), e))
        })?);

        // Key files written by age-keygen carry comment lines
        let key = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| {
                CredentialError::KeyUnavailable(format!("{} holds no key", path.display()))
            })?;

        Self::from_key_str(key)
    }

    /// Generate a new key and write it to `path` with owner-only permissions
    ///
    /// Refuses to overwrite an existing file.
    pub fn write_new_key_file(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(CredentialError::KeyUnavailable(format!(
                "{} already exists; refusing to overwrite",
                path.display()
            ))
            .into());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CredentialError::Io)?;
        }

        let cipher = Self::generate();
        let secret = cipher.identity.to_string();
        let contents = Zeroizing::new(format!(
            "# public key: {}\n{}\n",
            cipher.recipient(),
            secret.expose_secret()
        ));
        std::fs::write(path, contents.as_bytes()).map_err(CredentialError::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(CredentialError::Io)?;
        }

        tracing::info!("Wrote new credential key to {}", path.display());
        Ok(cipher)
    }

    /// Public half of the key, safe to print
    pub fn recipient(&self) -> String {
        self.identity.to_public().to_string()
    }

    /// Encrypt a token value to base64-encoded age ciphertext
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let encryptor =
            age::Encryptor::with_recipients(vec![
                Box::new(self.identity.to_public()) as Box<dyn age::Recipient + Send>
            ])
            .ok_or_else(|| CredentialError::Encryption("no recipients".to_string()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
    }

    /// Decrypt and authenticate a ciphertext produced by [`TokenCipher::encrypt`]
    ///
    /// Every failure (bad base64, wrong key, modified bytes, truncated stream,
    /// non-UTF-8 plaintext) is reported as `Corrupt` for `key`.
    pub fn decrypt(&self, ciphertext: &str, key: &CredentialKey) -> Result<SecretString> {
        let corrupt = |reason: String| {
            tracing::warn!("Credential {} failed verification: {}", key, reason);
            CredentialError::Corrupt(key.to_string())
        };

        let data = base64::engine::general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| corrupt(e.to_string()))?;

        let decryptor = match age::Decryptor::new(&data[..]) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => return Err(corrupt("unexpected passphrase envelope".to_string()).into()),
            Err(e) => return Err(corrupt(e.to_string()).into()),
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| corrupt(e.to_string()))?;

        let mut decrypted = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| corrupt(e.to_string()))?;

        let text = std::str::from_utf8(&decrypted).map_err(|e| corrupt(e.to_string()))?;
        Ok(SecretString::from(text.to_owned()))
    }
}

/// Credential Store: `get`/`put`/`delete` with transparent encryption
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn PublishStore>,
    cipher: Arc<TokenCipher>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn PublishStore>, cipher: TokenCipher) -> Self {
        Self {
            store,
            cipher: Arc::new(cipher),
        }
    }

    /// Load and decrypt the credential for an account on a platform
    ///
    /// # Errors
    ///
    /// - `CredentialError::NotFound` if nothing is stored
    /// - `CredentialError::Corrupt` if either token fails verification
    pub async fn get(&self, account_id: &str, platform: PlatformId) -> Result<Credential> {
        let key = CredentialKey::new(account_id, platform);

        let stored = self
            .store
            .get_credential(account_id, platform)
            .await?
            .ok_or_else(|| CredentialError::NotFound(key.to_string()))?;

        let access_token = self.cipher.decrypt(&stored.access_token_ciphertext, &key)?;
        let refresh_token = self.cipher.decrypt(&stored.refresh_token_ciphertext, &key)?;

        tracing::debug!("Loaded credential {}", key);

        Ok(Credential {
            account_id: stored.account_id,
            platform: stored.platform,
            access_token,
            refresh_token,
            expires_at: stored.expires_at,
            scopes: stored.scopes,
        })
    }

    /// Encrypt and store a credential, replacing any previous one for the same key
    pub async fn put(&self, credential: &Credential) -> Result<()> {
        let stored = StoredCredential {
            account_id: credential.account_id.clone(),
            platform: credential.platform,
            access_token_ciphertext: self
                .cipher
                .encrypt(credential.access_token.expose_secret())?,
            refresh_token_ciphertext: self
                .cipher
                .encrypt(credential.refresh_token.expose_secret())?,
            expires_at: credential.expires_at,
            scopes: credential.scopes.clone(),
            updated_at: chrono::Utc::now().timestamp(),
        };

        self.store.put_credential(&stored).await?;
        tracing::debug!("Stored credential {}", credential.key());
        Ok(())
    }

    pub async fn delete(&self, account_id: &str, platform: PlatformId) -> Result<()> {
        self.store.delete_credential(account_id, platform).await?;
        tracing::debug!(
            "Deleted credential {}",
            CredentialKey::new(account_id, platform)
        );
        Ok(())
    }
}
