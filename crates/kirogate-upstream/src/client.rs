//! Upstream HTTP client with the bounded retry policy.
//!
//! Retries cover connection establishment and the initial response status
//! only: a 403 buys exactly one forced token refresh, 429/5xx and network
//! failures back off exponentially, any other 4xx fails immediately. Once a
//! streaming body has been handed back, failures propagate to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use kirogate_core::config::KirogateConfig;
use kirogate_core::{GatewayError, Result};

use crate::auth::TokenManager;
use crate::convert::ConversationState;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Long assistant turns are expected; only stall detection, not a deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(300);
/// The model list is small; do not let a stuck upstream hang `/v1/models`.
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(4);

pub struct KiroClient {
    http: reqwest::Client,
    auth: Arc<TokenManager>,
    generate_url: String,
    models_url: String,
    max_retries: u32,
}

impl KiroClient {
    pub fn from_config(auth: Arc<TokenManager>, config: &KirogateConfig) -> Result<Self> {
        Self::with_endpoints(
            auth,
            config.generate_url(),
            config.models_url(),
            config.max_retries,
        )
    }

    /// Explicit endpoints; used directly by tests against fixture servers.
    pub fn with_endpoints(
        auth: Arc<TokenManager>,
        generate_url: String,
        models_url: String,
        max_retries: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config(format!("upstream http client: {e}")))?;
        Ok(Self {
            http,
            auth,
            generate_url,
            models_url,
            max_retries,
        })
    }

    /// Open the streaming completion call. The returned response has only
    /// its status consumed; the body streams as the caller reads it.
    pub async fn generate_assistant_response(
        &self,
        state: &ConversationState,
    ) -> Result<reqwest::Response> {
        let mut state = state.clone();
        state.conversation_id = Some(Uuid::new_v4().to_string());

        let mut body = serde_json::Map::new();
        body.insert(
            "conversationState".to_string(),
            serde_json::to_value(&state)?,
        );
        if let Some(arn) = self.auth.profile_arn().await {
            body.insert("profileArn".to_string(), serde_json::Value::String(arn));
        }
        let body = serde_json::Value::Object(body);

        self.send_with_retry(|| self.http.post(&self.generate_url).json(&body))
            .await
    }

    pub async fn list_available_models(&self) -> Result<Vec<UpstreamModel>> {
        let resp = self
            .send_with_retry(|| self.http.get(&self.models_url).timeout(MODELS_TIMEOUT))
            .await?;
        let body: ModelListResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("model list response: {e}")))?;
        Ok(body.models)
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 1;
        let mut refreshed = false;

        loop {
            let token = self.auth.access_token().await?;
            let result = build()
                .bearer_auth(&token)
                .header("User-Agent", self.auth.user_agent())
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = retry_delay(attempt, None);
                        warn!(error = %e, attempt, "upstream request failed, backing off");
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::UpstreamUnavailable(format!(
                        "network failure after {attempt} attempts: {e}"
                    )));
                }
            };

            if resp.status().is_success() {
                return Ok(resp);
            }

            let status = resp.status().as_u16();
            match status {
                403 => {
                    if refreshed {
                        return Err(GatewayError::AuthUnavailable(
                            "upstream rejected token after refresh".into(),
                        ));
                    }
                    debug!("upstream 403, forcing token refresh");
                    self.auth.force_refresh(&token).await?;
                    refreshed = true;
                    attempt += 1;
                }
                429 | 500..=599 => {
                    if attempt < self.max_retries {
                        let delay = retry_delay(attempt, retry_after(&resp));
                        warn!(status, attempt, delay_ms = delay.as_millis() as u64, "upstream throttled, backing off");
                        sleep(delay).await;
                        attempt += 1;
                    } else {
                        return Err(GatewayError::UpstreamUnavailable(format!(
                            "status {status} after {attempt} attempts"
                        )));
                    }
                }
                _ => {
                    let message = resp.text().await.unwrap_or_default();
                    return Err(GatewayError::UpstreamRejected { status, message });
                }
            }
        }
    }
}

/// Parse a `Retry-After` header given in seconds, when present.
fn retry_after(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Exponential backoff: 1 s, 2 s, 4 s, capped at 4 s. A server-provided
/// Retry-After wins when present but is still capped.
fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let delay = match retry_after_secs {
        Some(secs) => Duration::from_secs(secs),
        None => BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1)),
    };
    delay.min(BACKOFF_CAP)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamModel {
    pub model_id: String,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<UpstreamModel>,
}
