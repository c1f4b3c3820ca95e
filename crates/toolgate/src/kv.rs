use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("kv operation timed out after {0}ms")]
    Timeout(u64),
    #[error("kv payload corrupt: {0}")]
    Corrupt(String),
}

/// Key-value collaborator contract. All mutation primitives are atomic with
/// respect to concurrent callers and other process instances; the crate never
/// takes an in-process lock around them.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Increments the counter at `key`, creating it with `window_ms` expiry
    /// when absent. Returns the post-increment count.
    async fn incr_with_expiry(&self, key: &str, window_ms: u64) -> Result<u64, KvError>;

    /// Atomic compare-and-set. `expected: None` means "create only if
    /// absent". Returns false when the current value does not match.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_ms: Option<u64>,
    ) -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Adds `member` to the unordered set at `key` (tag index maintenance).
    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;
}

/// Bounds an external store call. A timeout is treated identically to a store
/// error by every caller; the in-flight future is dropped here but real
/// backends are expected to let the operation complete server-side.
pub(crate) async fn with_timeout<T, F>(timeout_ms: u64, future: F) -> Result<T, KvError>
where
    F: Future<Output = Result<T, KvError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => result,
        Err(_) => Err(KvError::Timeout(timeout_ms)),
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<i64>,
}

impl StoredValue {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|expires_at| expires_at > now_ms)
    }
}

#[derive(Default)]
struct KvState {
    values: HashMap<String, StoredValue>,
    sets: HashMap<String, HashSet<String>>,
}

/// Reference store used by tests and single-process deployments. Production
/// deployments implement [`KvStore`] against Redis or an equivalent backend.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    inner: Arc<RwLock<KvState>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn incr_with_expiry(&self, key: &str, window_ms: u64) -> Result<u64, KvError> {
        let now = Self::now_ms();
        let mut state = self.inner.write().await;
        let live = state
            .values
            .get(key)
            .filter(|stored| stored.is_live(now))
            .cloned();

        let (count, expires_at_ms) = match live {
            Some(stored) => {
                let current = stored
                    .value
                    .parse::<u64>()
                    .map_err(|_| KvError::Corrupt(format!("counter at {key} is not numeric")))?;
                (current.saturating_add(1), stored.expires_at_ms)
            }
            None => (1, Some(now + window_ms as i64)),
        };

        state.values.insert(
            key.to_string(),
            StoredValue {
                value: count.to_string(),
                expires_at_ms,
            },
        );
        Ok(count)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_ms: Option<u64>,
    ) -> Result<bool, KvError> {
        let now = Self::now_ms();
        let mut state = self.inner.write().await;
        let current = state
            .values
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone());

        let matches = match (expected, current.as_deref()) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected == current,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }

        state.values.insert(
            key.to_string(),
            StoredValue {
                value: new.to_string(),
                expires_at_ms: ttl_ms.map(|ttl| now + ttl as i64),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Self::now_ms();
        let state = self.inner.read().await;
        Ok(state
            .values
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), KvError> {
        let now = Self::now_ms();
        let mut state = self.inner.write().await;
        state.values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: ttl_ms.map(|ttl| now + ttl as i64),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.inner.write().await;
        state.values.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut state = self.inner.write().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let state = self.inner.read().await;
        Ok(state
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}
