pub mod approval;
pub mod cache;
pub mod config;
pub mod errors;
pub mod hash;
pub mod idempotency;
pub mod kv;
pub mod orchestrator;
pub mod rate_limit;
pub mod resolver;
pub mod secrets;

pub use approval::{ApprovalGate, ApprovalOutcome};
pub use cache::{CacheError, CacheStats, TagCache};
pub use config::Config;
pub use errors::GuardrailError;
pub use hash::{HashedIdentifier, canonical_sha256, sha256_hex};
pub use idempotency::{ApprovalStatus, IdempotencyLedger, IdempotencyRecord, ledger_key};
pub use kv::{InMemoryKvStore, KvError, KvStore};
pub use orchestrator::{EvaluateDecision, EvaluateRequest, Guardrail};
pub use rate_limit::{DegradedMode, DegradedReason, LimitSpec, RateLimitDecision, RateLimiter};
pub use resolver::{
    BYOK_PRIORITY, ConsentStore, CredentialResolver, GatewayCredential, InMemoryConsentStore,
    Provider, ResolutionPath, ResolutionResult, ServerFallbackKeys,
};
pub use secrets::{
    CredentialRecord, InMemorySecretBackend, SecretBackend, SecretCipher, SecretRef, SecretRow,
    SecretStoreAdapter, SecretStoreError,
};
