use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::kv::{KvStore, with_timeout};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(String),
    #[error("cache codec error: {0}")]
    Codec(String),
    #[error("cache loader error: {0}")]
    Load(String),
}

/// Stored entry: the value plus the tags it was indexed under and its own
/// expiry, so a backend without TTL enforcement still serves correct misses.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    value: Value,
    tags: Vec<String>,
    expires_at_ms: i64,
}

#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Read-through cache with tag-indexed invalidation over the KV store.
///
/// The secondary index (`tag:{tag}` -> set of keys) is maintained at write
/// time; invalidating a tag deletes every indexed key plus the index itself
/// before returning. A KV outage on the read path degrades to a miss so the
/// loader still runs; the result simply is not cached.
pub struct TagCache {
    kv: Arc<dyn KvStore>,
    timeout_ms: u64,
    stats: CacheStats,
}

impl TagCache {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            timeout_ms: config.kv_timeout_ms,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        tags: &[String],
        ttl_ms: u64,
        loader: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let now = Utc::now().timestamp_millis();
        if let Some(value) = self.read_fresh::<T>(key, now).await {
            self.stats.record_hit();
            return Ok(value);
        }

        self.stats.record_miss();
        self.stats.record_load();
        let value = loader().await.inspect_err(|_| self.stats.record_error())?;
        self.store(key, tags, ttl_ms, &value, now).await;
        Ok(value)
    }

    pub async fn invalidate_tag(&self, tag: &str) -> Result<(), CacheError> {
        let index_key = format!("tag:{tag}");
        let members = with_timeout(self.timeout_ms, self.kv.set_members(index_key.as_str()))
            .await
            .map_err(|error| CacheError::Store(error.to_string()))?;
        for member in &members {
            with_timeout(self.timeout_ms, self.kv.delete(member.as_str()))
                .await
                .map_err(|error| CacheError::Store(error.to_string()))?;
        }
        with_timeout(self.timeout_ms, self.kv.delete(index_key.as_str()))
            .await
            .map_err(|error| CacheError::Store(error.to_string()))?;
        Ok(())
    }

    async fn read_fresh<T>(&self, key: &str, now_ms: i64) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let raw = match with_timeout(self.timeout_ms, self.kv.get(key)).await {
            Ok(raw) => raw?,
            Err(error) => {
                self.stats.record_error();
                tracing::debug!(
                    target: "toolgate.cache",
                    error = %error,
                    "cache read failed; treating as miss",
                );
                return None;
            }
        };

        let envelope: CacheEnvelope = serde_json::from_str(raw.as_str()).ok()?;
        if envelope.expires_at_ms <= now_ms {
            return None;
        }
        serde_json::from_value(envelope.value).ok()
    }

    async fn store<T>(&self, key: &str, tags: &[String], ttl_ms: u64, value: &T, now_ms: i64)
    where
        T: Serialize,
    {
        let envelope = match serde_json::to_value(value) {
            Ok(value) => CacheEnvelope {
                value,
                tags: tags.to_vec(),
                expires_at_ms: now_ms + ttl_ms as i64,
            },
            Err(error) => {
                self.stats.record_error();
                tracing::debug!(target: "toolgate.cache", error = %error, "cache encode failed");
                return;
            }
        };
        let encoded = match serde_json::to_string(&envelope) {
            Ok(encoded) => encoded,
            Err(error) => {
                self.stats.record_error();
                tracing::debug!(target: "toolgate.cache", error = %error, "cache encode failed");
                return;
            }
        };

        if let Err(error) =
            with_timeout(self.timeout_ms, self.kv.set(key, encoded.as_str(), Some(ttl_ms))).await
        {
            self.stats.record_error();
            tracing::debug!(target: "toolgate.cache", error = %error, "cache write failed");
            return;
        }
        for tag in tags {
            let index_key = format!("tag:{tag}");
            if let Err(error) =
                with_timeout(self.timeout_ms, self.kv.set_add(index_key.as_str(), key)).await
            {
                self.stats.record_error();
                tracing::debug!(target: "toolgate.cache", error = %error, "tag index write failed");
            }
        }
    }
}
