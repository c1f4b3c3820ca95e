use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::errors::GuardrailError;
use crate::hash::sha256_hex;
use crate::kv::{KvError, KvStore, with_timeout};
use crate::rate_limit::DegradedMode;

const CAS_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Expired => "expired",
        }
    }
}

/// Statuses move forward only: `pending -> approved|rejected`,
/// `approved -> executed`, anything -> `expired` once the TTL lapses.
fn legal_transition(from: ApprovalStatus, to: ApprovalStatus) -> bool {
    matches!(
        (from, to),
        (ApprovalStatus::Pending, ApprovalStatus::Approved)
            | (ApprovalStatus::Pending, ApprovalStatus::Rejected)
            | (ApprovalStatus::Approved, ApprovalStatus::Executed)
            | (_, ApprovalStatus::Expired)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// `idem:{sha256(token:scope)}` - the raw token never reaches the store.
    pub key: String,
    pub status: ApprovalStatus,
    pub payload_hash: String,
    /// Outcome recorded by the executor; replayed to retried callers.
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Pending and approved records lapse to expired when not advanced in
    /// time; executed/rejected are terminal until the store entry itself
    /// falls out.
    fn lapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, ApprovalStatus::Pending | ApprovalStatus::Approved)
            && self.expires_at <= now
    }
}

/// Derives the ledger key from a caller-supplied token and operation scope.
pub fn ledger_key(token: &str, scope: &str) -> String {
    format!("idem:{}", sha256_hex(format!("{}:{}", token.trim(), scope.trim()).as_bytes()))
}

/// Records in-flight/completed operation outcomes. All races are settled at
/// the KV compare-and-set boundary, never by an in-process lock, so the
/// ledger is safe across process instances.
pub struct IdempotencyLedger {
    kv: Arc<dyn KvStore>,
    timeout_ms: u64,
    ttl_ms: u64,
}

impl IdempotencyLedger {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            timeout_ms: config.kv_timeout_ms,
            ttl_ms: config.approval_ttl_ms(),
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Creates a `pending` record for `key`, or returns the existing one.
    /// Exactly one concurrent caller wins the create; losers observe the
    /// winner's record. Reusing a key with a different payload hash is a
    /// conflict, not a race.
    pub async fn create_or_get(
        &self,
        key: &str,
        payload_hash: &str,
    ) -> Result<IdempotencyRecord, GuardrailError> {
        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            match self.fetch_raw(key).await? {
                Some((record, raw)) => {
                    if record.lapsed(now) {
                        let fresh = self.fresh_record(key, payload_hash, now);
                        if self.swap(key, raw.as_str(), &fresh).await? {
                            return Ok(fresh);
                        }
                        continue;
                    }
                    if record.payload_hash != payload_hash {
                        return Err(GuardrailError::IdempotencyConflict(
                            "idempotency key reused with a different payload".to_string(),
                        ));
                    }
                    return Ok(record);
                }
                None => {
                    let fresh = self.fresh_record(key, payload_hash, now);
                    if self.create(key, &fresh).await? {
                        return Ok(fresh);
                    }
                }
            }
        }
        Err(GuardrailError::Internal(
            "idempotency record contention not settled".to_string(),
        ))
    }

    /// Conditionally moves `key` from `from` to `to`. Returns false when the
    /// record is gone or no longer in `from` - someone else already advanced
    /// it, which callers treat as a no-op rather than an error.
    pub async fn advance(
        &self,
        key: &str,
        from: ApprovalStatus,
        to: ApprovalStatus,
    ) -> Result<bool, GuardrailError> {
        if !legal_transition(from, to) {
            return Err(GuardrailError::InvalidRequest(format!(
                "illegal idempotency transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }

        let Some((record, raw)) = self.fetch_raw(key).await? else {
            return Ok(false);
        };
        if record.status != from || record.lapsed(Utc::now()) {
            return Ok(false);
        }

        let mut advanced = record;
        advanced.status = to;
        self.swap(key, raw.as_str(), &advanced).await
    }

    /// Attaches the executor's outcome to an executed record so retried
    /// callers get the original result back.
    pub async fn record_result(&self, key: &str, result: Value) -> Result<(), GuardrailError> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((record, raw)) = self.fetch_raw(key).await? else {
                return Ok(());
            };
            if record.status != ApprovalStatus::Executed {
                return Ok(());
            }
            let mut updated = record;
            updated.result = Some(result.clone());
            if self.swap(key, raw.as_str(), &updated).await? {
                return Ok(());
            }
        }
        Err(GuardrailError::Internal(
            "idempotency result update contention not settled".to_string(),
        ))
    }

    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, GuardrailError> {
        let now = Utc::now();
        Ok(self.fetch_raw(key).await?.map(|(mut record, _)| {
            if record.lapsed(now) {
                record.status = ApprovalStatus::Expired;
            }
            record
        }))
    }

    fn fresh_record(&self, key: &str, payload_hash: &str, now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.to_string(),
            status: ApprovalStatus::Pending,
            payload_hash: payload_hash.to_string(),
            result: None,
            created_at: now,
            expires_at: now + Duration::milliseconds(self.ttl_ms as i64),
        }
    }

    async fn fetch_raw(
        &self,
        key: &str,
    ) -> Result<Option<(IdempotencyRecord, String)>, GuardrailError> {
        let Some(raw) = with_timeout(self.timeout_ms, self.kv.get(key))
            .await
            .map_err(map_kv_error)?
        else {
            return Ok(None);
        };
        let record = serde_json::from_str::<IdempotencyRecord>(raw.as_str())
            .map_err(|_| GuardrailError::Internal("idempotency record corrupt".to_string()))?;
        Ok(Some((record, raw)))
    }

    async fn create(&self, key: &str, record: &IdempotencyRecord) -> Result<bool, GuardrailError> {
        let encoded = encode(record)?;
        with_timeout(
            self.timeout_ms,
            self.kv
                .compare_and_set(key, None, encoded.as_str(), Some(self.ttl_ms)),
        )
        .await
        .map_err(map_kv_error)
    }

    async fn swap(
        &self,
        key: &str,
        current_raw: &str,
        record: &IdempotencyRecord,
    ) -> Result<bool, GuardrailError> {
        let remaining_ms = (record.expires_at - Utc::now()).num_milliseconds().max(1) as u64;
        let encoded = encode(record)?;
        with_timeout(
            self.timeout_ms,
            self.kv
                .compare_and_set(key, Some(current_raw), encoded.as_str(), Some(remaining_ms)),
        )
        .await
        .map_err(map_kv_error)
    }
}

fn encode(record: &IdempotencyRecord) -> Result<String, GuardrailError> {
    serde_json::to_string(record)
        .map_err(|_| GuardrailError::Internal("idempotency record encode failed".to_string()))
}

/// The ledger backs privileged operations, so a store outage always fails
/// closed.
fn map_kv_error(error: KvError) -> GuardrailError {
    GuardrailError::InfraDegraded {
        mode: DegradedMode::FailClosed,
        reason: match error {
            KvError::Timeout(ms) => format!("kv timeout after {ms}ms"),
            KvError::Unavailable(_) => "kv store unavailable".to_string(),
            KvError::Corrupt(_) => "kv payload corrupt".to_string(),
        },
    }
}
