use std::env;

const DEFAULT_KV_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SECRET_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CREDENTIAL_CACHE_TTL_MS: u64 = 60_000;
const DEFAULT_APPROVAL_TTL_SECONDS: u64 = 900;
const DEFAULT_ALERT_DEDUP_WINDOW_MS: u64 = 60_000;
const DEFAULT_GATEWAY_MODEL_ID: &str = "gateway/auto";

#[derive(Debug, Clone)]
pub struct Config {
    pub kv_timeout_ms: u64,
    pub secret_timeout_ms: u64,
    pub credential_cache_ttl_ms: u64,
    pub approval_ttl_seconds: u64,
    pub alert_dedup_window_ms: u64,
    pub gateway_api_key: Option<String>,
    pub gateway_model_id: String,
    pub server_openai_api_key: Option<String>,
    pub server_openrouter_api_key: Option<String>,
    pub server_anthropic_api_key: Option<String>,
    pub server_xai_api_key: Option<String>,
    pub secret_encryption_key: Option<String>,
    pub secret_encryption_key_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let kv_timeout_ms = env::var("TOOLGATE_KV_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_KV_TIMEOUT_MS);

        let secret_timeout_ms = env::var("TOOLGATE_SECRET_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SECRET_TIMEOUT_MS);

        // Credential lookups are cached briefly; rotation safety comes from
        // synchronous tag invalidation, not from a short TTL, but the TTL is
        // still clamped to one minute.
        let credential_cache_ttl_ms = env::var("TOOLGATE_CREDENTIAL_CACHE_TTL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CREDENTIAL_CACHE_TTL_MS)
            .min(60_000);

        let approval_ttl_seconds = env::var("TOOLGATE_APPROVAL_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_APPROVAL_TTL_SECONDS);

        let alert_dedup_window_ms = env::var("TOOLGATE_ALERT_DEDUP_WINDOW_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_ALERT_DEDUP_WINDOW_MS);

        let gateway_api_key = optional_env("TOOLGATE_GATEWAY_API_KEY");

        let gateway_model_id = env::var("TOOLGATE_GATEWAY_MODEL_ID")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GATEWAY_MODEL_ID.to_string());

        Self {
            kv_timeout_ms,
            secret_timeout_ms,
            credential_cache_ttl_ms,
            approval_ttl_seconds,
            alert_dedup_window_ms,
            gateway_api_key,
            gateway_model_id,
            server_openai_api_key: optional_env("TOOLGATE_SERVER_OPENAI_API_KEY"),
            server_openrouter_api_key: optional_env("TOOLGATE_SERVER_OPENROUTER_API_KEY"),
            server_anthropic_api_key: optional_env("TOOLGATE_SERVER_ANTHROPIC_API_KEY"),
            server_xai_api_key: optional_env("TOOLGATE_SERVER_XAI_API_KEY"),
            secret_encryption_key: optional_env("TOOLGATE_SECRET_ENCRYPTION_KEY"),
            secret_encryption_key_id: optional_env("TOOLGATE_SECRET_KEY_ID"),
        }
    }

    pub fn for_tests() -> Self {
        Self {
            kv_timeout_ms: 250,
            secret_timeout_ms: 250,
            credential_cache_ttl_ms: 60_000,
            approval_ttl_seconds: 900,
            alert_dedup_window_ms: 60_000,
            gateway_api_key: Some("gw-test-key".to_string()),
            gateway_model_id: DEFAULT_GATEWAY_MODEL_ID.to_string(),
            server_openai_api_key: None,
            server_openrouter_api_key: None,
            server_anthropic_api_key: None,
            server_xai_api_key: None,
            secret_encryption_key: None,
            secret_encryption_key_id: None,
        }
    }

    pub fn approval_ttl_ms(&self) -> u64 {
        self.approval_ttl_seconds.saturating_mul(1_000)
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
