use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::config::Config;
use crate::hash::HashedIdentifier;
use crate::kv::{KvError, KvStore, with_timeout};

/// Policy applied when the limiter's backing store cannot be consulted.
///
/// Privileged or cost-bearing operations (credential validation, streaming
/// inference, key management) declare `FailClosed`: an outage must not turn
/// into unbounded spend. Low-stakes routes declare `FailOpen` so a transient
/// blip does not take them down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedMode {
    FailOpen,
    FailClosed,
}

impl DegradedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }
}

impl fmt::Display for DegradedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    StoreUnavailable,
    Timeout,
}

impl DegradedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::Timeout => "timeout",
        }
    }

    fn from_kv_error(error: &KvError) -> Self {
        match error {
            KvError::Timeout(_) => Self::Timeout,
            KvError::Unavailable(_) | KvError::Corrupt(_) => Self::StoreUnavailable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimitSpec {
    pub name: String,
    pub max_requests: u64,
    pub window_ms: u64,
    pub degraded_mode: DegradedMode,
}

impl LimitSpec {
    pub fn fail_open(name: &str, max_requests: u64, window_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            window_ms,
            degraded_mode: DegradedMode::FailOpen,
        }
    }

    pub fn fail_closed(name: &str, max_requests: u64, window_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            window_ms,
            degraded_mode: DegradedMode::FailClosed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at_epoch_ms: i64,
    pub degraded: bool,
    pub degraded_reason: Option<DegradedReason>,
}

/// Deduplicates operator alerts: one emission per (reason, scope) inside a
/// rolling window, so a sustained outage pages once instead of per request.
struct DegradedAlerts {
    window_ms: u64,
    last_emit: Mutex<HashMap<String, i64>>,
    emitted: AtomicU64,
}

impl DegradedAlerts {
    fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_emit: Mutex::new(HashMap::new()),
            emitted: AtomicU64::new(0),
        }
    }

    fn note(&self, scope: &str, now_ms: i64) -> bool {
        let mut guard = match self.last_emit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(last) = guard.get(scope) {
            if now_ms.saturating_sub(*last) < self.window_ms as i64 {
                return false;
            }
        }
        guard.insert(scope.to_string(), now_ms);
        self.emitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// Fixed sliding-window counter over the KV store: one increment-with-expiry
/// per check, no in-process state beyond alert dedup bookkeeping.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    timeout_ms: u64,
    alerts: DegradedAlerts,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            timeout_ms: config.kv_timeout_ms,
            alerts: DegradedAlerts::new(config.alert_dedup_window_ms),
        }
    }

    pub async fn check(&self, identifier: &HashedIdentifier, limit: &LimitSpec) -> RateLimitDecision {
        let now = Utc::now().timestamp_millis();
        let window_ms = limit.window_ms.max(1);
        let window_index = now.div_euclid(window_ms as i64);
        let reset_at_epoch_ms = (window_index + 1) * window_ms as i64;
        let key = format!("rl:{identifier}:{}:{window_index}", limit.name);

        match with_timeout(self.timeout_ms, self.kv.incr_with_expiry(key.as_str(), window_ms)).await
        {
            Ok(count) => RateLimitDecision {
                allowed: count <= limit.max_requests,
                remaining: limit.max_requests.saturating_sub(count),
                reset_at_epoch_ms,
                degraded: false,
                degraded_reason: None,
            },
            Err(error) => self.degraded_decision(limit, reset_at_epoch_ms, now, &error),
        }
    }

    /// Count of degraded-mode operator alerts actually emitted (post-dedup).
    pub fn emitted_alerts(&self) -> u64 {
        self.alerts.emitted()
    }

    fn degraded_decision(
        &self,
        limit: &LimitSpec,
        reset_at_epoch_ms: i64,
        now_ms: i64,
        error: &KvError,
    ) -> RateLimitDecision {
        let reason = DegradedReason::from_kv_error(error);
        let scope = format!("{}:{}", limit.name, reason.as_str());
        if self.alerts.note(scope.as_str(), now_ms) {
            tracing::warn!(
                target: "toolgate.rate_limit",
                limit = limit.name.as_str(),
                reason = reason.as_str(),
                mode = limit.degraded_mode.as_str(),
                "rate limiter degraded; applying declared policy",
            );
        }

        RateLimitDecision {
            allowed: limit.degraded_mode == DegradedMode::FailOpen,
            remaining: 0,
            reset_at_epoch_ms,
            degraded: true,
            degraded_reason: Some(reason),
        }
    }
}
