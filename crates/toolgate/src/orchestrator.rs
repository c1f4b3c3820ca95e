use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::approval::{ApprovalGate, ApprovalOutcome};
use crate::cache::TagCache;
use crate::config::Config;
use crate::errors::GuardrailError;
use crate::hash::HashedIdentifier;
use crate::idempotency::IdempotencyLedger;
use crate::kv::KvStore;
use crate::rate_limit::{DegradedMode, LimitSpec, RateLimitDecision, RateLimiter};
use crate::resolver::{
    ConsentStore, CredentialResolver, GatewayCredential, ResolutionResult, ServerFallbackKeys,
};
use crate::secrets::{SecretBackend, SecretCipher, SecretStoreAdapter};

/// One request-scoped guardrail evaluation as submitted by the upstream
/// request handler. `identifier` is already hashed; the raw caller identity
/// never enters this subsystem.
#[derive(Debug, Clone)]
pub struct EvaluateRequest {
    pub user_id: String,
    pub identifier: HashedIdentifier,
    pub limit: LimitSpec,
    pub model_hint: Option<String>,
    pub requires_approval: bool,
    pub idempotency_token: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct EvaluateDecision {
    pub rate_limit: RateLimitDecision,
    pub resolution: Option<ResolutionResult>,
    pub approval: Option<ApprovalOutcome>,
}

impl EvaluateDecision {
    /// Why the request must be denied at the protocol layer, if it must.
    /// `None` does not imply execution: a pending approval also holds the
    /// call, it is just not an error.
    pub fn deny_reason(&self) -> Option<GuardrailError> {
        if self.rate_limit.allowed {
            return None;
        }
        if self.rate_limit.degraded {
            return Some(GuardrailError::InfraDegraded {
                mode: DegradedMode::FailClosed,
                reason: self
                    .rate_limit
                    .degraded_reason
                    .map(|reason| reason.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Some(GuardrailError::RateLimited {
            reset_at_epoch_ms: self.rate_limit.reset_at_epoch_ms,
        })
    }

    /// Whether the downstream tool executor may be invoked for this request.
    pub fn should_execute(&self) -> bool {
        self.rate_limit.allowed
            && self.resolution.is_some()
            && matches!(self.approval, None | Some(ApprovalOutcome::Approved))
    }
}

/// Public entry point: composes the rate limiter, credential resolver and
/// approval gate into one request-scoped decision.
pub struct Guardrail {
    limiter: RateLimiter,
    resolver: CredentialResolver,
    gate: ApprovalGate,
}

impl Guardrail {
    /// Wires the full stack over shared collaborator stores. The shared
    /// gateway credential and server fallback keys are loaded here, once,
    /// and never re-read per request.
    pub fn new(
        kv: Arc<dyn KvStore>,
        secret_backend: Arc<dyn SecretBackend>,
        consent: Arc<dyn ConsentStore>,
        config: &Config,
    ) -> Self {
        let cipher = SecretCipher::from_config(config);
        let secrets = SecretStoreAdapter::new(secret_backend, cipher, config.secret_timeout_ms);
        let cache = Arc::new(TagCache::new(kv.clone(), config));
        let resolver = CredentialResolver::new(
            secrets,
            cache,
            consent,
            GatewayCredential::from_config(config),
            ServerFallbackKeys::from_config(config),
            config,
        );
        let limiter = RateLimiter::new(kv.clone(), config);
        let gate = ApprovalGate::new(IdempotencyLedger::new(kv, config));
        Self {
            limiter,
            resolver,
            gate,
        }
    }

    pub fn from_parts(limiter: RateLimiter, resolver: CredentialResolver, gate: ApprovalGate) -> Self {
        Self {
            limiter,
            resolver,
            gate,
        }
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn evaluate(
        &self,
        request: EvaluateRequest,
    ) -> Result<EvaluateDecision, GuardrailError> {
        let token = request
            .idempotency_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty());
        if request.requires_approval && token.is_none() {
            return Err(GuardrailError::InvalidRequest(
                "approval-gated calls require an idempotency token".to_string(),
            ));
        }

        let rate_limit = self.limiter.check(&request.identifier, &request.limit).await;
        if !rate_limit.allowed {
            return Ok(EvaluateDecision {
                rate_limit,
                resolution: None,
                approval: None,
            });
        }

        let resolution = self
            .resolver
            .resolve(request.user_id.as_str(), request.model_hint.as_deref())
            .await?;

        let approval = match token.filter(|_| request.requires_approval) {
            Some(token) => Some(
                self.gate
                    .require_approval(token, request.limit.name.as_str(), &request.payload)
                    .await?,
            ),
            None => None,
        };

        Ok(EvaluateDecision {
            rate_limit,
            resolution: Some(resolution),
            approval,
        })
    }
}
