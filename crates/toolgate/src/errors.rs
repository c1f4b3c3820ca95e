use crate::rate_limit::DegradedMode;

/// Boundary error taxonomy. Every infrastructure failure inside the crate is
/// mapped to one of these before it crosses the public surface; backend error
/// chains, connection strings and raw identifiers never leak through.
#[derive(Debug, thiserror::Error)]
pub enum GuardrailError {
    /// Resolution exhausted. Recoverable by user action: add a key or enable
    /// gateway fallback.
    #[error("no provider available: {0}")]
    NoProviderAvailable(String),
    /// The caller reused an idempotency token for a different operation.
    /// Not retryable with the same token.
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),
    /// Retryable after `reset_at_epoch_ms`.
    #[error("rate limited until {reset_at_epoch_ms}")]
    RateLimited { reset_at_epoch_ms: i64 },
    /// A guard could not be evaluated because its backing store is down or
    /// timing out. `mode` carries the fail-open/fail-closed sub-decision.
    #[error("infrastructure degraded ({mode}): {reason}")]
    InfraDegraded { mode: DegradedMode, reason: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl GuardrailError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoProviderAvailable(_) => "no_provider_available",
            Self::IdempotencyConflict(_) => "idempotency_conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::InfraDegraded { .. } => "infra_degraded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller can retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::InfraDegraded { .. } | Self::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::GuardrailError;
    use crate::rate_limit::DegradedMode;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            GuardrailError::NoProviderAvailable("x".to_string()).code(),
            "no_provider_available"
        );
        assert_eq!(
            GuardrailError::RateLimited {
                reset_at_epoch_ms: 1
            }
            .code(),
            "rate_limited"
        );
    }

    #[test]
    fn degraded_is_retryable_but_conflict_is_not() {
        let degraded = GuardrailError::InfraDegraded {
            mode: DegradedMode::FailClosed,
            reason: "kv timeout".to_string(),
        };
        assert!(degraded.retryable());
        assert!(!GuardrailError::IdempotencyConflict("reuse".to_string()).retryable());
    }
}
