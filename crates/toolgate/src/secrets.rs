use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::resolver::Provider;

const SECRET_ENVELOPE_PREFIX: &str = "enc:v1:";

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store timed out after {0}ms")]
    Timeout(u64),
    #[error("secret envelope invalid: {0}")]
    Cipher(String),
}

/// Opaque handle to decrypted secret material. Debug/Display never print the
/// inner value; callers that genuinely need it go through `expose`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretRef([redacted])")
    }
}

/// Per-user provider credential as seen by callers of the adapter. The
/// secret material only ever leaves this module inside [`SecretRef`].
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user_id: String,
    pub provider: Provider,
    pub secret_ref: SecretRef,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Raw storage row. `secret` holds the at-rest form: an `enc:v1:` envelope
/// when a cipher is configured, plaintext for legacy rows.
#[derive(Clone)]
pub struct SecretRow {
    pub user_id: String,
    pub service: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SecretRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRow")
            .field("user_id", &self.user_id)
            .field("service", &self.service)
            .field("secret", &"[redacted]")
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

/// Row-storage collaborator. Implementations must enforce per-owner
/// isolation: a caller can only ever read rows for the `user_id` it names.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn fetch(&self, user_id: &str, service: &str)
    -> Result<Option<SecretRow>, SecretStoreError>;

    async fn store(&self, row: SecretRow) -> Result<(), SecretStoreError>;

    async fn remove(&self, user_id: &str, service: &str) -> Result<(), SecretStoreError>;

    async fn touch(
        &self,
        user_id: &str,
        service: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SecretStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemorySecretBackend {
    rows: Arc<RwLock<HashMap<(String, String), SecretRow>>>,
}

impl InMemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for InMemorySecretBackend {
    async fn fetch(
        &self,
        user_id: &str,
        service: &str,
    ) -> Result<Option<SecretRow>, SecretStoreError> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(user_id.to_string(), service.to_string())).cloned())
    }

    async fn store(&self, row: SecretRow) -> Result<(), SecretStoreError> {
        let mut rows = self.rows.write().await;
        rows.insert((row.user_id.clone(), row.service.clone()), row);
        Ok(())
    }

    async fn remove(&self, user_id: &str, service: &str) -> Result<(), SecretStoreError> {
        let mut rows = self.rows.write().await;
        rows.remove(&(user_id.to_string(), service.to_string()));
        Ok(())
    }

    async fn touch(
        &self,
        user_id: &str,
        service: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SecretStoreError> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&(user_id.to_string(), service.to_string())) {
            row.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SecretCipher {
    key_id: String,
    key: [u8; 32],
}

impl SecretCipher {
    /// Builds the cipher from configured key material. A malformed key is
    /// ignored with a warning rather than failing startup, matching how the
    /// embedding service treats optional encryption config.
    pub fn from_config(config: &Config) -> Option<Self> {
        let encoded_key = config.secret_encryption_key.as_deref()?.trim().to_string();
        if encoded_key.is_empty() {
            return None;
        }
        let key_id = config
            .secret_encryption_key_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("v1")
            .to_string();

        let decoded = URL_SAFE_NO_PAD
            .decode(encoded_key.as_bytes())
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(encoded_key.as_bytes()));
        let key = match decoded {
            Ok(bytes) if bytes.len() == 32 => {
                let mut material = [0u8; 32];
                material.copy_from_slice(bytes.as_slice());
                material
            }
            Ok(bytes) => {
                tracing::warn!(
                    target: "toolgate.secrets",
                    key_bytes = bytes.len(),
                    "secret encryption key ignored: expected 32-byte base64 value",
                );
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    target: "toolgate.secrets",
                    error = %error,
                    "secret encryption key ignored: invalid base64 payload",
                );
                return None;
            }
        };

        Some(Self { key_id, key })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(key_id: &str, key: [u8; 32]) -> Self {
        Self {
            key_id: key_id.to_string(),
            key,
        }
    }
}

pub fn is_encrypted_secret(value: &str) -> bool {
    value.starts_with(SECRET_ENVELOPE_PREFIX)
}

fn encrypt_secret(plaintext: &str, cipher: Option<&SecretCipher>) -> Result<String, SecretStoreError> {
    let Some(cipher) = cipher else {
        return Ok(plaintext.to_string());
    };
    if is_encrypted_secret(plaintext) {
        return Ok(plaintext.to_string());
    }

    let nonce_source = Uuid::new_v4().as_bytes().to_owned();
    let nonce = Nonce::from_slice(&nonce_source[..12]);
    let aead = ChaCha20Poly1305::new_from_slice(&cipher.key)
        .map_err(|error| SecretStoreError::Cipher(format!("cipher init failed: {error}")))?;
    let ciphertext = aead
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|error| SecretStoreError::Cipher(format!("encrypt failed: {error}")))?;

    let nonce_b64 = URL_SAFE_NO_PAD.encode(nonce_source[..12].as_ref());
    let ciphertext_b64 = URL_SAFE_NO_PAD.encode(ciphertext);
    Ok(format!(
        "{SECRET_ENVELOPE_PREFIX}{}:{nonce_b64}:{ciphertext_b64}",
        cipher.key_id
    ))
}

fn decrypt_secret(stored: &str, cipher: Option<&SecretCipher>) -> Result<String, SecretStoreError> {
    if !is_encrypted_secret(stored) {
        return Ok(stored.to_string());
    }

    let Some(cipher) = cipher else {
        return Err(SecretStoreError::Cipher(
            "secret is encrypted but no decryption key is configured".to_string(),
        ));
    };

    let mut parts = stored.split(':');
    let version = parts.next().unwrap_or_default();
    let version_suffix = parts.next().unwrap_or_default();
    let key_id = parts.next().unwrap_or_default();
    let nonce_b64 = parts.next().unwrap_or_default();
    let ciphertext_b64 = parts.next().unwrap_or_default();
    let has_extra_parts = parts.next().is_some();

    if version != "enc" || version_suffix != "v1" || has_extra_parts {
        return Err(SecretStoreError::Cipher("envelope shape is invalid".to_string()));
    }
    if key_id != cipher.key_id {
        return Err(SecretStoreError::Cipher(format!(
            "envelope key id {key_id} is not configured"
        )));
    }

    let nonce_raw = URL_SAFE_NO_PAD
        .decode(nonce_b64.as_bytes())
        .map_err(|error| SecretStoreError::Cipher(format!("nonce decode failed: {error}")))?;
    if nonce_raw.len() != 12 {
        return Err(SecretStoreError::Cipher("nonce length is invalid".to_string()));
    }
    let ciphertext = URL_SAFE_NO_PAD
        .decode(ciphertext_b64.as_bytes())
        .map_err(|error| SecretStoreError::Cipher(format!("payload decode failed: {error}")))?;

    let aead = ChaCha20Poly1305::new_from_slice(&cipher.key)
        .map_err(|error| SecretStoreError::Cipher(format!("cipher init failed: {error}")))?;
    let plaintext = aead
        .decrypt(Nonce::from_slice(nonce_raw.as_slice()), ciphertext.as_slice())
        .map_err(|_| SecretStoreError::Cipher("decrypt failed".to_string()))?;
    String::from_utf8(plaintext)
        .map_err(|_| SecretStoreError::Cipher("plaintext is not utf-8".to_string()))
}

/// Secret Store Adapter: encrypt-at-write access to per-user provider
/// credentials. Every backend call is bounded by the configured timeout.
#[derive(Clone)]
pub struct SecretStoreAdapter {
    backend: Arc<dyn SecretBackend>,
    cipher: Option<SecretCipher>,
    timeout_ms: u64,
}

impl SecretStoreAdapter {
    pub fn new(backend: Arc<dyn SecretBackend>, cipher: Option<SecretCipher>, timeout_ms: u64) -> Self {
        Self {
            backend,
            cipher,
            timeout_ms,
        }
    }

    pub async fn get(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<CredentialRecord>, SecretStoreError> {
        let service = provider.as_str();
        let Some(row) = self
            .bounded(self.backend.fetch(user_id, service))
            .await?
        else {
            return Ok(None);
        };

        let plaintext = decrypt_secret(row.secret.as_str(), self.cipher.as_ref())?;

        // Legacy plaintext rows are rewritten encrypted the first time they
        // are read with a cipher configured.
        if self.cipher.is_some() && !is_encrypted_secret(row.secret.as_str()) {
            let migrated = SecretRow {
                secret: encrypt_secret(plaintext.as_str(), self.cipher.as_ref())?,
                ..row.clone()
            };
            if let Err(error) = self.bounded(self.backend.store(migrated)).await {
                tracing::debug!(
                    target: "toolgate.secrets",
                    service,
                    error = %error,
                    "failed to migrate legacy plaintext secret row",
                );
            }
        }

        Ok(Some(CredentialRecord {
            user_id: row.user_id,
            provider,
            secret_ref: SecretRef::new(plaintext),
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        }))
    }

    pub async fn put(
        &self,
        user_id: &str,
        provider: Provider,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(SecretStoreError::Cipher("secret must not be empty".to_string()));
        }
        let row = SecretRow {
            user_id: user_id.to_string(),
            service: provider.as_str().to_string(),
            secret: encrypt_secret(secret, self.cipher.as_ref())?,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.bounded(self.backend.store(row)).await
    }

    pub async fn delete(&self, user_id: &str, provider: Provider) -> Result<(), SecretStoreError> {
        self.bounded(self.backend.remove(user_id, provider.as_str()))
            .await
    }

    pub async fn touch_last_used(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<(), SecretStoreError> {
        self.bounded(self.backend.touch(user_id, provider.as_str(), Utc::now()))
            .await
    }

    async fn bounded<T, F>(&self, future: F) -> Result<T, SecretStoreError>
    where
        F: Future<Output = Result<T, SecretStoreError>>,
    {
        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), future).await {
            Ok(result) => result,
            Err(_) => Err(SecretStoreError::Timeout(self.timeout_ms)),
        }
    }
}
