use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cache::{CacheError, TagCache};
use crate::config::Config;
use crate::errors::GuardrailError;
use crate::hash::sha256_hex;
use crate::rate_limit::DegradedMode;
use crate::secrets::{SecretRef, SecretStoreAdapter, SecretStoreError};

/// Closed set of model providers. Runtime dispatch is a match on this enum;
/// there is no plugin loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Xai,
    OpenRouter,
    Gateway,
}

/// BYOK lookup order when a user holds keys for several providers.
pub const BYOK_PRIORITY: [Provider; 4] = [
    Provider::OpenAi,
    Provider::OpenRouter,
    Provider::Anthropic,
    Provider::Xai,
];

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Xai => "xai",
            Self::OpenRouter => "openrouter",
            Self::Gateway => "gateway",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4.1",
            Self::Anthropic => "claude-sonnet-4-5",
            Self::Xai => "grok-4",
            Self::OpenRouter => "openrouter/auto",
            Self::Gateway => "gateway/auto",
        }
    }

    /// Whether `hint` names a model in this provider's namespace. The
    /// gateway proxies every provider, so it accepts any hint.
    pub fn owns_model(self, hint: &str) -> bool {
        let hint = hint.trim();
        if hint.is_empty() {
            return false;
        }
        match self {
            Self::OpenAi => {
                hint.starts_with("gpt-")
                    || hint.starts_with("o1")
                    || hint.starts_with("o3")
                    || hint.starts_with("o4")
            }
            Self::Anthropic => hint.starts_with("claude-"),
            Self::Xai => hint.starts_with("grok-"),
            Self::OpenRouter => hint.contains('/'),
            Self::Gateway => true,
        }
    }
}

impl FromStr for Provider {
    type Err = GuardrailError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "xai" => Ok(Self::Xai),
            "openrouter" => Ok(Self::OpenRouter),
            "gateway" => Ok(Self::Gateway),
            other => Err(GuardrailError::InvalidRequest(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionPath {
    UserVault,
    ServerFallback,
    TeamGateway,
}

impl ResolutionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserVault => "user-vault",
            Self::ServerFallback => "server-fallback",
            Self::TeamGateway => "team-gateway",
        }
    }
}

/// Routing decision for one request. Carries no secret material, so it is
/// safe to put in telemetry as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionResult {
    pub provider: Provider,
    pub model_id: String,
    pub path: ResolutionPath,
    pub resolved_at: DateTime<Utc>,
}

/// Per-user opt-out from the shared gateway. Absent means allowed.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn allow_gateway_fallback(&self, user_id: &str)
    -> Result<Option<bool>, SecretStoreError>;

    async fn set_allow_gateway_fallback(
        &self,
        user_id: &str,
        allow: bool,
    ) -> Result<(), SecretStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryConsentStore {
    flags: Arc<RwLock<HashMap<String, bool>>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn allow_gateway_fallback(
        &self,
        user_id: &str,
    ) -> Result<Option<bool>, SecretStoreError> {
        let flags = self.flags.read().await;
        Ok(flags.get(user_id).copied())
    }

    async fn set_allow_gateway_fallback(
        &self,
        user_id: &str,
        allow: bool,
    ) -> Result<(), SecretStoreError> {
        let mut flags = self.flags.write().await;
        flags.insert(user_id.to_string(), allow);
        Ok(())
    }
}

/// Process-wide shared gateway credential. Loaded once at startup by
/// explicit init and injected; never re-read per request.
pub struct GatewayCredential {
    pub api_key: SecretRef,
    pub model_id: String,
}

impl GatewayCredential {
    pub fn from_config(config: &Config) -> Option<Arc<Self>> {
        let api_key = config.gateway_api_key.as_deref()?.trim();
        if api_key.is_empty() {
            return None;
        }
        Some(Arc::new(Self {
            api_key: SecretRef::new(api_key),
            model_id: config.gateway_model_id.clone(),
        }))
    }
}

/// Server-side fallback keys, one per provider, loaded once at startup.
#[derive(Default)]
pub struct ServerFallbackKeys {
    keys: HashMap<Provider, SecretRef>,
}

impl ServerFallbackKeys {
    pub fn from_config(config: &Config) -> Self {
        let mut keys = HashMap::new();
        let entries = [
            (Provider::OpenAi, config.server_openai_api_key.as_deref()),
            (Provider::OpenRouter, config.server_openrouter_api_key.as_deref()),
            (Provider::Anthropic, config.server_anthropic_api_key.as_deref()),
            (Provider::Xai, config.server_xai_api_key.as_deref()),
        ];
        for (provider, key) in entries {
            if let Some(key) = key.map(str::trim).filter(|key| !key.is_empty()) {
                keys.insert(provider, SecretRef::new(key));
            }
        }
        Self { keys }
    }

    pub fn get(&self, provider: Provider) -> Option<&SecretRef> {
        self.keys.get(&provider)
    }
}

/// Picks a usable provider/model pair for a request, walking the priority
/// chain: per-user gateway secret, BYOK keys, server fallback keys, then the
/// shared team gateway behind the user's consent flag.
pub struct CredentialResolver {
    secrets: SecretStoreAdapter,
    cache: Arc<TagCache>,
    consent: Arc<dyn ConsentStore>,
    gateway: Option<Arc<GatewayCredential>>,
    server_fallback: ServerFallbackKeys,
    cache_ttl_ms: u64,
}

impl CredentialResolver {
    pub fn new(
        secrets: SecretStoreAdapter,
        cache: Arc<TagCache>,
        consent: Arc<dyn ConsentStore>,
        gateway: Option<Arc<GatewayCredential>>,
        server_fallback: ServerFallbackKeys,
        config: &Config,
    ) -> Self {
        Self {
            secrets,
            cache,
            consent,
            gateway,
            server_fallback,
            cache_ttl_ms: config.credential_cache_ttl_ms,
        }
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        model_hint: Option<&str>,
    ) -> Result<ResolutionResult, GuardrailError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(GuardrailError::InvalidRequest("user_id is required".to_string()));
        }
        let user_hash = sha256_hex(user_id.as_bytes());

        // User-owned credentials first: the gateway-scoped secret, then BYOK
        // keys in fixed priority order.
        let mut user_chain = vec![Provider::Gateway];
        user_chain.extend(BYOK_PRIORITY);
        for provider in user_chain {
            if self.user_credential_present(user_id, user_hash.as_str(), provider).await {
                self.spawn_touch(user_id, provider);
                return Ok(self.build_result(provider, ResolutionPath::UserVault, model_hint));
            }
        }

        for provider in BYOK_PRIORITY {
            if self.server_fallback.get(provider).is_some() {
                return Ok(self.build_result(provider, ResolutionPath::ServerFallback, model_hint));
            }
        }

        let consent = self
            .consent
            .allow_gateway_fallback(user_id)
            .await
            .map_err(|error| {
                tracing::debug!(
                    target: "toolgate.resolver",
                    error = %error,
                    "consent lookup failed; refusing gateway fallback",
                );
                GuardrailError::NoProviderAvailable(
                    "gateway consent could not be verified".to_string(),
                )
            })?
            .unwrap_or(true);
        if !consent {
            return Err(GuardrailError::NoProviderAvailable(
                "gateway fallback disabled by user consent; add a provider key".to_string(),
            ));
        }

        let Some(gateway) = self.gateway.as_ref() else {
            return Err(GuardrailError::NoProviderAvailable(
                "no credential configured and no shared gateway available".to_string(),
            ));
        };
        let model_id = match model_hint.map(str::trim).filter(|hint| !hint.is_empty()) {
            Some(hint) => hint.to_string(),
            None => gateway.model_id.clone(),
        };
        Ok(ResolutionResult {
            provider: Provider::Gateway,
            model_id,
            path: ResolutionPath::TeamGateway,
            resolved_at: Utc::now(),
        })
    }

    /// Stores or rotates a user credential and synchronously invalidates the
    /// user's cached lookups, so the very next resolve sees the new state.
    pub async fn put_credential(
        &self,
        user_id: &str,
        provider: Provider,
        secret: &str,
    ) -> Result<(), GuardrailError> {
        self.secrets
            .put(user_id, provider, secret)
            .await
            .map_err(map_secret_write_error)?;
        self.invalidate_user(user_id).await
    }

    pub async fn delete_credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<(), GuardrailError> {
        self.secrets
            .delete(user_id, provider)
            .await
            .map_err(map_secret_write_error)?;
        self.invalidate_user(user_id).await
    }

    pub async fn set_gateway_consent(
        &self,
        user_id: &str,
        allow: bool,
    ) -> Result<(), GuardrailError> {
        self.consent
            .set_allow_gateway_fallback(user_id, allow)
            .await
            .map_err(map_secret_write_error)?;
        self.invalidate_user(user_id).await
    }

    async fn user_credential_present(
        &self,
        user_id: &str,
        user_hash: &str,
        provider: Provider,
    ) -> bool {
        let key = format!("cred:{user_hash}:{}", provider.as_str());
        let tags = vec![format!("user:{user_hash}")];
        let secrets = &self.secrets;
        let lookup = self
            .cache
            .get_or_load::<bool, _, _>(
                key.as_str(),
                tags.as_slice(),
                self.cache_ttl_ms,
                move || async move {
                    secrets
                        .get(user_id, provider)
                        .await
                        .map(|record| record.is_some())
                        .map_err(|error| CacheError::Load(error.to_string()))
                },
            )
            .await;

        match lookup {
            Ok(present) => present,
            Err(error) => {
                // A vault outage reads as "absent for this provider"; the
                // chain continues instead of failing the request.
                tracing::debug!(
                    target: "toolgate.resolver",
                    provider = provider.as_str(),
                    error = %error,
                    "credential lookup failed; continuing down the chain",
                );
                false
            }
        }
    }

    fn build_result(
        &self,
        provider: Provider,
        path: ResolutionPath,
        model_hint: Option<&str>,
    ) -> ResolutionResult {
        let model_id = match model_hint.map(str::trim).filter(|hint| provider.owns_model(hint)) {
            Some(hint) => hint.to_string(),
            None => provider.default_model().to_string(),
        };
        ResolutionResult {
            provider,
            model_id,
            path,
            resolved_at: Utc::now(),
        }
    }

    /// Best-effort `last_used_at` touch; never delays or fails the response.
    fn spawn_touch(&self, user_id: &str, provider: Provider) {
        let secrets = self.secrets.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = secrets.touch_last_used(user_id.as_str(), provider).await {
                tracing::debug!(
                    target: "toolgate.resolver",
                    provider = provider.as_str(),
                    error = %error,
                    "last_used_at touch failed",
                );
            }
        });
    }

    async fn invalidate_user(&self, user_id: &str) -> Result<(), GuardrailError> {
        let tag = format!("user:{}", sha256_hex(user_id.trim().as_bytes()));
        self.cache.invalidate_tag(tag.as_str()).await.map_err(|error| {
            GuardrailError::InfraDegraded {
                mode: DegradedMode::FailClosed,
                reason: format!("credential cache invalidation failed: {error}"),
            }
        })
    }
}

fn map_secret_write_error(error: SecretStoreError) -> GuardrailError {
    match error {
        SecretStoreError::Cipher(message) => GuardrailError::Internal(message),
        SecretStoreError::Timeout(ms) => GuardrailError::InfraDegraded {
            mode: DegradedMode::FailClosed,
            reason: format!("secret store timeout after {ms}ms"),
        },
        SecretStoreError::Unavailable(_) => GuardrailError::InfraDegraded {
            mode: DegradedMode::FailClosed,
            reason: "secret store unavailable".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{
        ConsentStore, CredentialResolver, GatewayCredential, InMemoryConsentStore, Provider,
        ResolutionPath, ServerFallbackKeys,
    };
    use crate::cache::TagCache;
    use crate::config::Config;
    use crate::errors::GuardrailError;
    use crate::kv::InMemoryKvStore;
    use crate::secrets::{
        InMemorySecretBackend, SecretBackend, SecretRow, SecretStoreAdapter, SecretStoreError,
    };

    struct OfflineBackend;

    #[async_trait]
    impl SecretBackend for OfflineBackend {
        async fn fetch(
            &self,
            _user_id: &str,
            _service: &str,
        ) -> Result<Option<SecretRow>, SecretStoreError> {
            Err(SecretStoreError::Unavailable("vault offline".to_string()))
        }

        async fn store(&self, _row: SecretRow) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("vault offline".to_string()))
        }

        async fn remove(&self, _user_id: &str, _service: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("vault offline".to_string()))
        }

        async fn touch(
            &self,
            _user_id: &str,
            _service: &str,
            _at: DateTime<Utc>,
        ) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("vault offline".to_string()))
        }
    }

    struct Fixture {
        resolver: CredentialResolver,
        consent: Arc<InMemoryConsentStore>,
    }

    fn fixture_with(backend: Arc<dyn SecretBackend>, config: Config) -> Fixture {
        let consent = Arc::new(InMemoryConsentStore::new());
        let cache = Arc::new(TagCache::new(Arc::new(InMemoryKvStore::new()), &config));
        let resolver = CredentialResolver::new(
            SecretStoreAdapter::new(backend, None, config.secret_timeout_ms),
            cache,
            consent.clone(),
            GatewayCredential::from_config(&config),
            ServerFallbackKeys::from_config(&config),
            &config,
        );
        Fixture { resolver, consent }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemorySecretBackend::new()), Config::for_tests())
    }

    #[tokio::test]
    async fn no_keys_defaults_to_team_gateway() -> Result<()> {
        let fixture = fixture();
        let result = fixture.resolver.resolve("u1", None).await?;
        assert_eq!(result.path, ResolutionPath::TeamGateway);
        assert_eq!(result.provider, Provider::Gateway);
        assert_eq!(result.model_id, "gateway/auto");
        Ok(())
    }

    #[tokio::test]
    async fn consent_false_without_keys_fails_resolution() -> Result<()> {
        let fixture = fixture();
        fixture
            .consent
            .set_allow_gateway_fallback("u1", false)
            .await?;
        let result = fixture.resolver.resolve("u1", None).await;
        assert!(matches!(result, Err(GuardrailError::NoProviderAvailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn byok_respects_fixed_priority_order() -> Result<()> {
        let fixture = fixture();
        fixture
            .resolver
            .put_credential("u1", Provider::Xai, "xai-key")
            .await?;
        fixture
            .resolver
            .put_credential("u1", Provider::Anthropic, "sk-ant-key")
            .await?;

        let result = fixture.resolver.resolve("u1", None).await?;
        assert_eq!(result.provider, Provider::Anthropic);
        assert_eq!(result.path, ResolutionPath::UserVault);
        assert_eq!(result.model_id, "claude-sonnet-4-5");
        Ok(())
    }

    #[tokio::test]
    async fn user_gateway_secret_wins_over_byok() -> Result<()> {
        let fixture = fixture();
        fixture
            .resolver
            .put_credential("u1", Provider::OpenAi, "sk-openai")
            .await?;
        fixture
            .resolver
            .put_credential("u1", Provider::Gateway, "gw-user-key")
            .await?;

        let result = fixture.resolver.resolve("u1", None).await?;
        assert_eq!(result.provider, Provider::Gateway);
        assert_eq!(result.path, ResolutionPath::UserVault);
        Ok(())
    }

    #[tokio::test]
    async fn model_hint_is_used_only_within_the_provider_namespace() -> Result<()> {
        let fixture = fixture();
        fixture
            .resolver
            .put_credential("u1", Provider::OpenAi, "sk-openai")
            .await?;

        let hinted = fixture.resolver.resolve("u1", Some("gpt-4.1-mini")).await?;
        assert_eq!(hinted.model_id, "gpt-4.1-mini");

        let foreign = fixture.resolver.resolve("u1", Some("claude-sonnet-4-5")).await?;
        assert_eq!(foreign.model_id, "gpt-4.1");
        Ok(())
    }

    #[tokio::test]
    async fn deleting_the_key_is_visible_on_the_very_next_resolve() -> Result<()> {
        let fixture = fixture();
        fixture
            .resolver
            .put_credential("u1", Provider::OpenAi, "sk-openai")
            .await?;
        assert_eq!(
            fixture.resolver.resolve("u1", None).await?.path,
            ResolutionPath::UserVault
        );

        fixture
            .resolver
            .delete_credential("u1", Provider::OpenAi)
            .await?;
        assert_eq!(
            fixture.resolver.resolve("u1", None).await?.path,
            ResolutionPath::TeamGateway
        );
        Ok(())
    }

    #[tokio::test]
    async fn server_fallback_keys_outrank_the_shared_gateway() -> Result<()> {
        let mut config = Config::for_tests();
        config.server_openrouter_api_key = Some("or-server-key".to_string());
        let fixture = fixture_with(Arc::new(InMemorySecretBackend::new()), config);

        let result = fixture.resolver.resolve("u1", None).await?;
        assert_eq!(result.provider, Provider::OpenRouter);
        assert_eq!(result.path, ResolutionPath::ServerFallback);
        Ok(())
    }

    #[tokio::test]
    async fn vault_outage_degrades_to_gateway_fallback() -> Result<()> {
        let fixture = fixture_with(Arc::new(OfflineBackend), Config::for_tests());
        let result = fixture.resolver.resolve("u1", None).await?;
        assert_eq!(result.path, ResolutionPath::TeamGateway);
        Ok(())
    }

    #[tokio::test]
    async fn vault_outage_with_consent_false_fails_closed() -> Result<()> {
        let fixture = fixture_with(Arc::new(OfflineBackend), Config::for_tests());
        fixture
            .consent
            .set_allow_gateway_fallback("u1", false)
            .await?;
        let result = fixture.resolver.resolve("u1", None).await;
        assert!(matches!(result, Err(GuardrailError::NoProviderAvailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn no_gateway_configured_and_no_keys_is_a_resolution_failure() -> Result<()> {
        let mut config = Config::for_tests();
        config.gateway_api_key = None;
        let fixture = fixture_with(Arc::new(InMemorySecretBackend::new()), config);
        let result = fixture.resolver.resolve("u1", None).await;
        assert!(matches!(result, Err(GuardrailError::NoProviderAvailable(_))));
        Ok(())
    }
}
