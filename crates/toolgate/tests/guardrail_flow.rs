use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use toolgate::{
    ApprovalOutcome, Config, ConsentStore, EvaluateRequest, Guardrail, GuardrailError,
    HashedIdentifier, InMemoryConsentStore, InMemoryKvStore, InMemorySecretBackend, KvError,
    KvStore, LimitSpec, Provider, ResolutionPath,
};

/// KV wrapper that can be flipped into an outage mid-test.
struct FlakyKv {
    inner: InMemoryKvStore,
    offline: AtomicBool,
}

impl FlakyKv {
    fn new() -> Self {
        Self {
            inner: InMemoryKvStore::new(),
            offline: AtomicBool::new(false),
        }
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KvError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyKv {
    async fn incr_with_expiry(&self, key: &str, window_ms: u64) -> Result<u64, KvError> {
        self.check()?;
        self.inner.incr_with_expiry(key, window_ms).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_ms: Option<u64>,
    ) -> Result<bool, KvError> {
        self.check()?;
        self.inner.compare_and_set(key, expected, new, ttl_ms).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), KvError> {
        self.check()?;
        self.inner.set(key, value, ttl_ms).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), KvError> {
        self.check()?;
        self.inner.set_add(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.check()?;
        self.inner.set_members(key).await
    }
}

struct Harness {
    guardrail: Guardrail,
    consent: Arc<InMemoryConsentStore>,
    kv: Arc<FlakyKv>,
}

fn harness() -> Harness {
    let kv = Arc::new(FlakyKv::new());
    let consent = Arc::new(InMemoryConsentStore::new());
    let guardrail = Guardrail::new(
        kv.clone(),
        Arc::new(InMemorySecretBackend::new()),
        consent.clone(),
        &Config::for_tests(),
    );
    Harness {
        guardrail,
        consent,
        kv,
    }
}

fn request(user: &str, limit: LimitSpec) -> EvaluateRequest {
    EvaluateRequest {
        user_id: user.to_string(),
        identifier: HashedIdentifier::from_raw("user", user),
        limit,
        model_hint: None,
        requires_approval: false,
        idempotency_token: None,
        payload: json!({}),
    }
}

fn booking_request(user: &str, token: &str) -> EvaluateRequest {
    let mut request = request(user, LimitSpec::fail_closed("booking", 100, 60_000));
    request.requires_approval = true;
    request.idempotency_token = Some(token.to_string());
    request.payload = json!({"hotel": "h-42", "nights": 2});
    request
}

#[tokio::test]
async fn users_without_keys_ride_the_team_gateway() -> Result<()> {
    let harness = harness();
    let decision = harness
        .guardrail
        .evaluate(request("u1", LimitSpec::fail_open("chat", 10, 60_000)))
        .await?;
    let resolution = decision
        .resolution
        .ok_or_else(|| anyhow::anyhow!("resolution missing"))?;
    assert_eq!(resolution.path, ResolutionPath::TeamGateway);
    Ok(())
}

#[tokio::test]
async fn consent_false_without_keys_fails_with_no_provider() -> Result<()> {
    let harness = harness();
    harness.consent.set_allow_gateway_fallback("u1", false).await?;
    let result = harness
        .guardrail
        .evaluate(request("u1", LimitSpec::fail_open("chat", 10, 60_000)))
        .await;
    assert!(matches!(result, Err(GuardrailError::NoProviderAvailable(_))));
    Ok(())
}

#[tokio::test]
async fn credential_writes_are_visible_to_the_very_next_resolve() -> Result<()> {
    let harness = harness();
    let resolver = harness.guardrail.resolver();
    let chat = || request("u1", LimitSpec::fail_open("chat", 100, 60_000));

    resolver.put_credential("u1", Provider::OpenAi, "sk-key-a").await?;
    let with_key = harness.guardrail.evaluate(chat()).await?;
    assert_eq!(
        with_key.resolution.map(|resolution| resolution.path),
        Some(ResolutionPath::UserVault)
    );

    // Revocation: no TTL wait, the next request already reflects it.
    resolver.delete_credential("u1", Provider::OpenAi).await?;
    let without_key = harness.guardrail.evaluate(chat()).await?;
    assert_eq!(
        without_key.resolution.map(|resolution| resolution.path),
        Some(ResolutionPath::TeamGateway)
    );

    // Rotation to a new key is equally immediate.
    resolver.put_credential("u1", Provider::OpenAi, "sk-key-b").await?;
    let rotated = harness.guardrail.evaluate(chat()).await?;
    assert_eq!(
        rotated.resolution.map(|resolution| resolution.path),
        Some(ResolutionPath::UserVault)
    );
    Ok(())
}

#[tokio::test]
async fn kv_outage_applies_the_declared_degraded_policy() -> Result<()> {
    let harness = harness();
    harness.kv.set_offline(true);
    let identifier = HashedIdentifier::from_raw("user", "u1");

    let closed = harness
        .guardrail
        .limiter()
        .check(&identifier, &LimitSpec::fail_closed("key-management", 10, 60_000))
        .await;
    assert!(!closed.allowed);
    assert!(closed.degraded);

    let open = harness
        .guardrail
        .limiter()
        .check(&identifier, &LimitSpec::fail_open("chat", 10, 60_000))
        .await;
    assert!(open.allowed);
    assert!(open.degraded);
    assert_eq!(harness.guardrail.limiter().emitted_alerts(), 2);

    // Same reason and scope inside the dedup window: no second page.
    let repeat = harness
        .guardrail
        .limiter()
        .check(&identifier, &LimitSpec::fail_open("chat", 10, 60_000))
        .await;
    assert!(repeat.allowed);
    assert_eq!(harness.guardrail.limiter().emitted_alerts(), 2);
    Ok(())
}

#[tokio::test]
async fn degraded_fail_open_requests_still_resolve_credentials() -> Result<()> {
    let harness = harness();
    harness
        .guardrail
        .resolver()
        .put_credential("u1", Provider::Anthropic, "sk-ant")
        .await?;

    harness.kv.set_offline(true);
    let decision = harness
        .guardrail
        .evaluate(request("u1", LimitSpec::fail_open("chat", 10, 60_000)))
        .await?;

    // The cache cannot be consulted, so the lookup falls through to the
    // vault directly; the request is not blocked by the cache outage.
    assert!(decision.rate_limit.degraded);
    let resolution = decision
        .resolution
        .ok_or_else(|| anyhow::anyhow!("resolution missing"))?;
    assert_eq!(resolution.provider, Provider::Anthropic);
    assert_eq!(resolution.path, ResolutionPath::UserVault);
    Ok(())
}

#[tokio::test]
async fn fail_closed_outage_denies_with_infra_degraded() -> Result<()> {
    let harness = harness();
    harness.kv.set_offline(true);
    let decision = harness
        .guardrail
        .evaluate(request("u1", LimitSpec::fail_closed("inference", 10, 60_000)))
        .await?;
    assert!(!decision.should_execute());
    assert!(matches!(
        decision.deny_reason(),
        Some(GuardrailError::InfraDegraded { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn booking_flow_executes_exactly_once_across_retries() -> Result<()> {
    let harness = harness();
    let guardrail = Arc::new(harness.guardrail);

    let first = guardrail.evaluate(booking_request("u1", "K1")).await?;
    assert_eq!(first.approval, Some(ApprovalOutcome::Pending));
    assert!(!first.should_execute());

    // Human approves out of band; the client retries the same token.
    assert!(guardrail.gate().decide("K1", "booking", true).await?);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let guardrail = guardrail.clone();
        handles.push(tokio::spawn(async move {
            guardrail.evaluate(booking_request("u1", "K1")).await
        }));
    }

    let mut approved = 0;
    let mut replayed = 0;
    for handle in handles {
        match handle.await??.approval {
            Some(ApprovalOutcome::Approved) => approved += 1,
            Some(ApprovalOutcome::AlreadyExecuted { .. }) => replayed += 1,
            other => anyhow::bail!("unexpected approval outcome: {other:?}"),
        }
    }
    assert_eq!(approved, 1);
    assert_eq!(replayed, 4);

    // The executor reports back; later retries see the recorded result.
    guardrail
        .gate()
        .complete("K1", "booking", json!({"confirmation": "c-9"}))
        .await?;
    let replay = guardrail.evaluate(booking_request("u1", "K1")).await?;
    assert_eq!(
        replay.approval,
        Some(ApprovalOutcome::AlreadyExecuted {
            result: Some(json!({"confirmation": "c-9"})),
        })
    );
    Ok(())
}

#[tokio::test]
async fn rejected_bookings_never_reach_the_executor() -> Result<()> {
    let harness = harness();
    harness.guardrail.evaluate(booking_request("u1", "K2")).await?;
    assert!(harness.guardrail.gate().decide("K2", "booking", false).await?);

    let decision = harness.guardrail.evaluate(booking_request("u1", "K2")).await?;
    assert_eq!(decision.approval, Some(ApprovalOutcome::Rejected));
    assert!(!decision.should_execute());
    Ok(())
}

#[tokio::test]
async fn reusing_a_token_for_a_different_operation_is_a_conflict() -> Result<()> {
    let harness = harness();
    harness.guardrail.evaluate(booking_request("u1", "K3")).await?;

    let mut tampered = booking_request("u1", "K3");
    tampered.payload = json!({"hotel": "h-42", "nights": 9});
    let result = harness.guardrail.evaluate(tampered).await;
    assert!(matches!(result, Err(GuardrailError::IdempotencyConflict(_))));
    Ok(())
}

#[tokio::test]
async fn rate_limit_identifiers_never_contain_raw_user_ids() {
    let identifier = HashedIdentifier::from_raw("ip", "203.0.113.7");
    assert!(!identifier.as_str().contains("203.0.113.7"));
    assert!(identifier.as_str().starts_with("ip:"));
}
