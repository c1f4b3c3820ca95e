use serde::Serialize;
use serde_json::Value;

use crate::errors::GuardrailError;
use crate::hash::canonical_sha256;
use crate::idempotency::{ApprovalStatus, IdempotencyLedger, ledger_key};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// Awaiting a human decision. The caller surfaces this and re-submits
    /// the same token later; the gate never poll-blocks.
    Pending,
    Rejected,
    /// This caller won the `approved -> executed` transition and must run
    /// the tool call exactly once, then report back via [`ApprovalGate::complete`].
    Approved,
    /// The operation already ran; `result` is whatever the executor
    /// recorded for the original run.
    AlreadyExecuted { result: Option<Value> },
}

/// Gates sensitive tool invocations behind a human-approval state machine
/// keyed by idempotency tokens. Duplicate and concurrent re-submissions all
/// collapse onto one ledger record, so a retried booking or payment can
/// never execute twice.
pub struct ApprovalGate {
    ledger: IdempotencyLedger,
}

impl ApprovalGate {
    pub fn new(ledger: IdempotencyLedger) -> Self {
        Self { ledger }
    }

    pub async fn require_approval(
        &self,
        token: &str,
        scope: &str,
        payload: &Value,
    ) -> Result<ApprovalOutcome, GuardrailError> {
        if token.trim().is_empty() {
            return Err(GuardrailError::InvalidRequest(
                "idempotency token is required for approval-gated calls".to_string(),
            ));
        }
        let payload_hash = canonical_sha256(payload)
            .map_err(|_| GuardrailError::Internal("payload hash failed".to_string()))?;
        let key = ledger_key(token, scope);

        let record = self.ledger.create_or_get(key.as_str(), payload_hash.as_str()).await?;
        match record.status {
            ApprovalStatus::Pending | ApprovalStatus::Expired => Ok(ApprovalOutcome::Pending),
            ApprovalStatus::Rejected => Ok(ApprovalOutcome::Rejected),
            ApprovalStatus::Executed => Ok(ApprovalOutcome::AlreadyExecuted {
                result: record.result,
            }),
            ApprovalStatus::Approved => {
                if self
                    .ledger
                    .advance(key.as_str(), ApprovalStatus::Approved, ApprovalStatus::Executed)
                    .await?
                {
                    tracing::debug!(
                        target: "toolgate.approval",
                        scope,
                        "approved call claimed for execution",
                    );
                    return Ok(ApprovalOutcome::Approved);
                }
                // Lost the race: someone else claimed execution.
                let current = self.ledger.get(key.as_str()).await?;
                Ok(ApprovalOutcome::AlreadyExecuted {
                    result: current.and_then(|record| record.result),
                })
            }
        }
    }

    /// Applies the human decision. Returns false when the record already
    /// advanced (a second moderator clicking after the first, or the record
    /// lapsed).
    pub async fn decide(
        &self,
        token: &str,
        scope: &str,
        approve: bool,
    ) -> Result<bool, GuardrailError> {
        let key = ledger_key(token, scope);
        let to = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.ledger.advance(key.as_str(), ApprovalStatus::Pending, to).await
    }

    /// Executor report-back: records the outcome of the single execution so
    /// later re-submissions receive it instead of re-running.
    pub async fn complete(
        &self,
        token: &str,
        scope: &str,
        result: Value,
    ) -> Result<(), GuardrailError> {
        let key = ledger_key(token, scope);
        self.ledger.record_result(key.as_str(), result).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::json;

    use super::{ApprovalGate, ApprovalOutcome};
    use crate::config::Config;
    use crate::errors::GuardrailError;
    use crate::idempotency::IdempotencyLedger;
    use crate::kv::InMemoryKvStore;

    fn gate() -> ApprovalGate {
        ApprovalGate::new(IdempotencyLedger::new(
            Arc::new(InMemoryKvStore::new()),
            &Config::for_tests(),
        ))
    }

    fn booking_payload() -> serde_json::Value {
        json!({"hotel": "h-42", "nights": 2, "amount_cents": 18900})
    }

    #[tokio::test]
    async fn first_sight_is_pending_and_stays_pending_until_decided() -> Result<()> {
        let gate = gate();
        let payload = booking_payload();

        let first = gate.require_approval("K1", "booking", &payload).await?;
        assert_eq!(first, ApprovalOutcome::Pending);

        let resubmitted = gate.require_approval("K1", "booking", &payload).await?;
        assert_eq!(resubmitted, ApprovalOutcome::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn rejection_is_terminal() -> Result<()> {
        let gate = gate();
        let payload = booking_payload();
        gate.require_approval("K1", "booking", &payload).await?;
        assert!(gate.decide("K1", "booking", false).await?);

        let outcome = gate.require_approval("K1", "booking", &payload).await?;
        assert_eq!(outcome, ApprovalOutcome::Rejected);
        // A second moderator decision is a no-op.
        assert!(!gate.decide("K1", "booking", true).await?);
        Ok(())
    }

    #[tokio::test]
    async fn approval_executes_exactly_once_across_concurrent_resubmissions() -> Result<()> {
        let gate = Arc::new(gate());
        let payload = booking_payload();
        gate.require_approval("K1", "booking", &payload).await?;
        assert!(gate.decide("K1", "booking", true).await?);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                gate.require_approval("K1", "booking", &payload).await
            }));
        }

        let mut approved = 0;
        let mut already_executed = 0;
        for handle in handles {
            match handle.await?? {
                ApprovalOutcome::Approved => approved += 1,
                ApprovalOutcome::AlreadyExecuted { .. } => already_executed += 1,
                other => anyhow::bail!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(approved, 1);
        assert_eq!(already_executed, 4);
        Ok(())
    }

    #[tokio::test]
    async fn executed_result_is_replayed_to_retries() -> Result<()> {
        let gate = gate();
        let payload = booking_payload();
        gate.require_approval("K1", "booking", &payload).await?;
        gate.decide("K1", "booking", true).await?;
        assert_eq!(
            gate.require_approval("K1", "booking", &payload).await?,
            ApprovalOutcome::Approved
        );
        gate.complete("K1", "booking", json!({"confirmation": "c-77"})).await?;

        let replayed = gate.require_approval("K1", "booking", &payload).await?;
        assert_eq!(
            replayed,
            ApprovalOutcome::AlreadyExecuted {
                result: Some(json!({"confirmation": "c-77"})),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn tampered_payload_with_the_same_token_is_a_conflict() -> Result<()> {
        let gate = gate();
        gate.require_approval("K1", "booking", &booking_payload()).await?;

        let tampered = json!({"hotel": "h-42", "nights": 2, "amount_cents": 1});
        let outcome = gate.require_approval("K1", "booking", &tampered).await;
        assert!(matches!(outcome, Err(GuardrailError::IdempotencyConflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn payload_field_order_does_not_cause_conflicts() -> Result<()> {
        let gate = gate();
        gate.require_approval(
            "K1",
            "booking",
            &json!({"hotel": "h-42", "nights": 2, "amount_cents": 18900}),
        )
        .await?;
        let reordered = json!({"amount_cents": 18900, "nights": 2, "hotel": "h-42"});
        let outcome = gate.require_approval("K1", "booking", &reordered).await?;
        assert_eq!(outcome, ApprovalOutcome::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn empty_token_is_an_invalid_request() {
        let gate = gate();
        let outcome = gate.require_approval("  ", "booking", &booking_payload()).await;
        assert!(matches!(outcome, Err(GuardrailError::InvalidRequest(_))));
    }
}
