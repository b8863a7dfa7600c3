//! Kiro credential management.
//!
//! Auth flow:
//!   1. Startup loads the credentials record from `KIRO_CREDS_FILE` when
//!      configured, otherwise bootstraps from `REFRESH_TOKEN` alone.
//!   2. Before each upstream call, `access_token` returns the cached token
//!      if it is still fresh, refreshing in advance of expiry otherwise.
//!   3. The HTTP client calls `force_refresh` once when an upstream 403
//!      reveals a token the expiry data said was fine.
//!   4. Successful refreshes rewrite the credentials file atomically.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use kirogate_core::config::KirogateConfig;
use kirogate_core::{GatewayError, Result};

const CONNECT_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const REFRESH_READ_TIMEOUT: StdDuration = StdDuration::from_secs(15);

/// Credentials record, matching the on-disk JSON wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Owns the access/refresh token pair for the process.
///
/// Reads take the fast path through a read lock; stale callers funnel into
/// the write lock where a double-check ensures at most one refresh request
/// flies regardless of how many tasks raced in. The refresh itself runs in
/// a spawned task so a cancelled request (client disconnect) cannot abort a
/// refresh that would benefit every later request.
pub struct TokenManager {
    client: reqwest::Client,
    creds: Arc<RwLock<Credentials>>,
    refresh_url: String,
    creds_path: Option<PathBuf>,
    refresh_threshold: Duration,
    user_agent: String,
}

impl TokenManager {
    pub fn from_config(config: &KirogateConfig) -> Result<Self> {
        let creds = load_credentials(config)?;
        Self::new(
            creds,
            config.refresh_url(),
            config.kiro_creds_file.clone().map(PathBuf::from),
            config.token_refresh_threshold,
        )
    }

    pub fn new(
        creds: Credentials,
        refresh_url: String,
        creds_path: Option<PathBuf>,
        refresh_threshold_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REFRESH_READ_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config(format!("auth http client: {e}")))?;

        Ok(Self {
            client,
            creds: Arc::new(RwLock::new(creds)),
            refresh_url,
            creds_path,
            refresh_threshold: Duration::seconds(refresh_threshold_secs as i64),
            user_agent: build_user_agent(),
        })
    }

    /// Stable opaque client identifier sent on every upstream request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.creds.read().await.profile_arn.clone()
    }

    /// Return a currently-valid access token, refreshing when stale.
    pub async fn access_token(&self) -> Result<String> {
        // Fast path — read lock only
        {
            let creds = self.creds.read().await;
            if let Some(token) = fresh_token(&creds, self.refresh_threshold) {
                return Ok(token);
            }
        }
        self.spawn_refresh(Recheck::Fresh(self.refresh_threshold)).await
    }

    /// Refresh after an upstream 403. `rejected` is the token the upstream
    /// turned away; when concurrent 403s race, only the first caller to win
    /// the write lock performs the refresh — the rest find the cached token
    /// already replaced and return it without a second request.
    pub async fn force_refresh(&self, rejected: &str) -> Result<String> {
        self.spawn_refresh(Recheck::Superseded(rejected.to_string()))
            .await
    }

    /// Run the refresh in its own task: if the awaiting request is
    /// cancelled, the refresh still completes and stores the new token.
    async fn spawn_refresh(&self, recheck: Recheck) -> Result<String> {
        let job = RefreshJob {
            client: self.client.clone(),
            creds: self.creds.clone(),
            refresh_url: self.refresh_url.clone(),
            creds_path: self.creds_path.clone(),
            user_agent: self.user_agent.clone(),
            recheck,
        };
        tokio::spawn(job.run())
            .await
            .map_err(|e| GatewayError::AuthUnavailable(format!("refresh task failed: {e}")))?
    }
}

/// Double-check performed under the write lock before the refresh request
/// goes out, so callers queued behind an in-flight refresh observe its
/// result instead of issuing a duplicate.
enum Recheck {
    /// Skip when the cached token is still fresh by the expiry clock.
    Fresh(Duration),
    /// Skip when the cached token is no longer the one the upstream
    /// rejected — another task already refreshed it.
    Superseded(String),
}

struct RefreshJob {
    client: reqwest::Client,
    creds: Arc<RwLock<Credentials>>,
    refresh_url: String,
    creds_path: Option<PathBuf>,
    user_agent: String,
    recheck: Recheck,
}

impl RefreshJob {
    async fn run(self) -> Result<String> {
        let mut creds = self.creds.write().await;

        match &self.recheck {
            Recheck::Fresh(threshold) => {
                if let Some(token) = fresh_token(&creds, *threshold) {
                    return Ok(token);
                }
            }
            Recheck::Superseded(rejected) => {
                if let Some(current) = creds.access_token.as_deref() {
                    if current != rejected {
                        return Ok(current.to_string());
                    }
                }
            }
        }

        info!("refreshing Kiro access token");

        let resp = self
            .client
            .post(&self.refresh_url)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refreshToken": creds.refresh_token }))
            .send()
            .await
            .map_err(|e| GatewayError::AuthUnavailable(format!("refresh request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, "token refresh rejected");
            return Err(GatewayError::AuthUnavailable(format!(
                "refresh returned status {status}"
            )));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::AuthUnavailable(format!("invalid refresh response: {e}")))?;

        let access = body.access_token.ok_or_else(|| {
            GatewayError::AuthUnavailable("refresh response lacks accessToken".into())
        })?;

        creds.access_token = Some(access.clone());
        if let Some(rt) = body.refresh_token {
            creds.refresh_token = rt;
        }
        creds.expires_at = body.expires_at;
        if body.profile_arn.is_some() {
            creds.profile_arn = body.profile_arn;
        }

        debug!(expires_at = ?creds.expires_at, "Kiro token refreshed");

        if let Some(ref path) = self.creds_path {
            if let Err(e) = persist_credentials(path, &creds) {
                warn!(path = %path.display(), error = %e, "failed to save refreshed credentials");
            }
        }

        Ok(access)
    }
}

/// Freshness predicate: a token is fresh while `now + threshold` stays
/// short of the known expiry. A token with no expiry is trusted until an
/// upstream 403 forces a refresh.
fn fresh_token(creds: &Credentials, threshold: Duration) -> Option<String> {
    let token = creds.access_token.as_ref()?;
    match creds.expires_at {
        Some(expires_at) if Utc::now() + threshold >= expires_at => None,
        _ => Some(token.clone()),
    }
}

fn load_credentials(config: &KirogateConfig) -> Result<Credentials> {
    if let Some(ref path) = config.kiro_creds_file {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let creds: Credentials = serde_json::from_str(&data).map_err(|e| {
                    GatewayError::Config(format!("invalid credentials file {path}: {e}"))
                })?;
                return Ok(creds);
            }
            Err(e) if config.refresh_token.is_some() => {
                debug!(path = %path, error = %e, "credentials file absent, bootstrapping from env");
            }
            Err(e) => {
                return Err(GatewayError::Config(format!(
                    "cannot read credentials file {path}: {e}"
                )));
            }
        }
    }

    let refresh_token = config
        .refresh_token
        .clone()
        .ok_or_else(|| GatewayError::Config("no credentials source configured".into()))?;

    Ok(Credentials {
        access_token: None,
        refresh_token,
        expires_at: None,
        profile_arn: config.profile_arn.clone(),
        region: Some(config.kiro_region.clone()),
    })
}

/// Write-temp-then-rename so a crash mid-write never corrupts the file.
fn persist_credentials(path: &Path, creds: &Credentials) -> Result<()> {
    let json = serde_json::to_string_pretty(creds)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), json)?;
    tmp.persist(path).map_err(|e| GatewayError::Io(e.error))?;
    Ok(())
}

fn build_user_agent() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(std::env::consts::ARCH.as_bytes());
    let fingerprint = hex::encode(&hasher.finalize()[..8]);
    format!("kirogate/{} ({fingerprint})", env!("CARGO_PKG_VERSION"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    profile_arn: Option<String>,
}
