use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_PORT: u16 = 8989;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 600;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MODEL_CACHE_TTL_SECS: u64 = 3600;

/// Environment variables the gateway recognizes. Anything else is ignored.
const ENV_KEYS: &[&str] = &[
    "PROXY_API_KEY",
    "REFRESH_TOKEN",
    "KIRO_REGION",
    "KIRO_CREDS_FILE",
    "PROFILE_ARN",
    "TOKEN_REFRESH_THRESHOLD",
    "MAX_RETRIES",
    "MODEL_CACHE_TTL",
    "BIND",
    "PORT",
];

/// Immutable gateway configuration, loaded once at startup.
///
/// Field names mirror the environment variable names so the figment `Env`
/// provider maps them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KirogateConfig {
    /// Bearer secret clients must present on /v1 routes.
    pub proxy_api_key: String,
    /// Initial upstream refresh token. Optional when a credentials file is
    /// configured and present.
    pub refresh_token: Option<String>,
    /// Upstream region, templated into the vendor endpoints.
    pub kiro_region: String,
    /// Credentials file path. When set, refreshed credentials are written
    /// back to it.
    pub kiro_creds_file: Option<String>,
    /// Optional upstream profile identifier.
    pub profile_arn: Option<String>,
    /// Seconds before expiry at which the token is refreshed in advance.
    pub token_refresh_threshold: u64,
    /// Retry cap for the upstream client.
    pub max_retries: u32,
    /// Model catalog snapshot TTL in seconds.
    pub model_cache_ttl: u64,
    pub bind: String,
    pub port: u16,
}

impl Default for KirogateConfig {
    fn default() -> Self {
        Self {
            proxy_api_key: String::new(),
            refresh_token: None,
            kiro_region: DEFAULT_REGION.to_string(),
            kiro_creds_file: None,
            profile_arn: None,
            token_refresh_threshold: DEFAULT_REFRESH_THRESHOLD_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            model_cache_ttl: DEFAULT_MODEL_CACHE_TTL_SECS,
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl KirogateConfig {
    /// Load configuration from the environment over built-in defaults.
    pub fn load() -> crate::error::Result<Self> {
        let config: KirogateConfig = Figment::from(Serialized::defaults(KirogateConfig::default()))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot serve a single request.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.proxy_api_key.is_empty() {
            return Err(crate::error::GatewayError::Config(
                "PROXY_API_KEY must be set".into(),
            ));
        }
        if self.refresh_token.is_none() && self.kiro_creds_file.is_none() {
            return Err(crate::error::GatewayError::Config(
                "one of REFRESH_TOKEN or KIRO_CREDS_FILE must be set".into(),
            ));
        }
        Ok(())
    }

    pub fn refresh_url(&self) -> String {
        format!(
            "https://prod.{}.auth.desktop.kiro.dev/refreshToken",
            self.kiro_region
        )
    }

    pub fn models_url(&self) -> String {
        format!("https://q.{}.amazonaws.com/ListAvailableModels", self.kiro_region)
    }

    pub fn generate_url(&self) -> String {
        format!(
            "https://codewhisperer.{}.amazonaws.com/generateAssistantResponse",
            self.kiro_region
        )
    }
}
