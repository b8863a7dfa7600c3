//! Model catalog: the static external→internal name map plus a lazy, TTL'd
//! snapshot of the upstream model list merged with a fallback table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use kirogate_core::{GatewayError, Result};

use crate::client::{KiroClient, UpstreamModel};

/// Authoritative external → internal id map. Completions always resolve
/// through this table; the fetched catalog only affects `/v1/models`.
pub const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-opus-4-5", "claude-opus-4.5"),
    ("claude-opus-4-5-20251101", "claude-opus-4.5"),
    ("claude-haiku-4-5", "claude-haiku-4.5"),
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

pub fn internal_id(external: &str) -> Option<&'static str> {
    MODEL_MAP
        .iter()
        .find(|(ext, _)| *ext == external)
        .map(|(_, internal)| *internal)
}

/// Map an external model name to its internal id, or fail the request.
pub fn resolve(external: &str) -> Result<String> {
    internal_id(external)
        .map(String::from)
        .ok_or_else(|| GatewayError::UnknownModel(external.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelOrigin {
    Upstream,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub external_name: String,
    pub internal_id: String,
    pub model_id: String,
    pub origin: ModelOrigin,
}

struct Snapshot {
    fetched_at: Instant,
    models: Vec<ModelDescriptor>,
}

/// TTL'd view of the published model set.
///
/// The snapshot lock is only ever held to copy or swap; the fetch happens
/// under a separate population mutex, so readers with a stale snapshot are
/// never queued behind the network.
pub struct ModelCatalog {
    client: Arc<KiroClient>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    populate: Mutex<()>,
}

impl ModelCatalog {
    pub fn new(client: Arc<KiroClient>, ttl_secs: u64) -> Self {
        Self {
            client,
            ttl: Duration::from_secs(ttl_secs),
            snapshot: RwLock::new(None),
            populate: Mutex::new(()),
        }
    }

    /// Current descriptor list, fetching lazily. A snapshot past its TTL is
    /// refreshed by whichever caller wins the population mutex; the rest
    /// serve the stale copy rather than waiting on the fetch.
    pub async fn models(&self) -> Vec<ModelDescriptor> {
        let stale = {
            let guard = self.snapshot.read().await;
            match guard.as_ref() {
                Some(s) if s.fetched_at.elapsed() < self.ttl => return s.models.clone(),
                Some(s) => Some(s.models.clone()),
                None => None,
            }
        };

        let _populate = match (stale, self.populate.try_lock()) {
            (_, Ok(guard)) => guard,
            (Some(models), Err(_)) => return models,
            (None, Err(_)) => self.populate.lock().await,
        };

        // Another caller may have repopulated while we took the mutex.
        {
            let guard = self.snapshot.read().await;
            if let Some(s) = guard.as_ref() {
                if s.fetched_at.elapsed() < self.ttl {
                    return s.models.clone();
                }
            }
        }

        let models = match self.client.list_available_models().await {
            Ok(list) => {
                debug!(count = list.len(), "fetched upstream model list");
                merge_with_fallback(list)
            }
            Err(e) => {
                warn!(error = %e, "model list fetch failed, using fallback table");
                fallback_models()
            }
        };
        *self.snapshot.write().await = Some(Snapshot {
            fetched_at: Instant::now(),
            models: models.clone(),
        });
        models
    }
}

/// The static table as descriptors, used when the upstream list is
/// unavailable.
fn fallback_models() -> Vec<ModelDescriptor> {
    MODEL_MAP
        .iter()
        .map(|(external, internal)| ModelDescriptor {
            external_name: external.to_string(),
            internal_id: internal.to_string(),
            model_id: internal.to_string(),
            origin: ModelOrigin::Fallback,
        })
        .collect()
}

/// Descriptors from the fetched list, then any fallback externals the
/// upstream did not cover.
fn merge_with_fallback(upstream: Vec<UpstreamModel>) -> Vec<ModelDescriptor> {
    let mut models: Vec<ModelDescriptor> = Vec::new();

    for entry in &upstream {
        // Every external alias whose internal id the upstream confirmed.
        let mut matched = false;
        for (external, internal) in MODEL_MAP {
            if *internal == entry.model_id {
                matched = true;
                models.push(ModelDescriptor {
                    external_name: external.to_string(),
                    internal_id: internal.to_string(),
                    model_id: entry.model_id.clone(),
                    origin: ModelOrigin::Upstream,
                });
            }
        }
        if !matched {
            let external = entry
                .model_name
                .clone()
                .unwrap_or_else(|| entry.model_id.clone());
            models.push(ModelDescriptor {
                external_name: external,
                internal_id: entry.model_id.clone(),
                model_id: entry.model_id.clone(),
                origin: ModelOrigin::Upstream,
            });
        }
    }

    for fallback in fallback_models() {
        if !models
            .iter()
            .any(|m| m.external_name == fallback.external_name)
        {
            models.push(fallback);
        }
    }
    models
}
