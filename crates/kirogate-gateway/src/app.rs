use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};

use kirogate_core::config::KirogateConfig;
use kirogate_core::openai::ErrorResponse;
use kirogate_core::GatewayError;
use kirogate_upstream::auth::TokenManager;
use kirogate_upstream::catalog::ModelCatalog;
use kirogate_upstream::client::KiroClient;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
///
/// The auth manager and catalog are the only process-wide mutable values;
/// each guards itself behind its own lock.
pub struct AppState {
    pub config: KirogateConfig,
    pub auth: Arc<TokenManager>,
    pub kiro: Arc<KiroClient>,
    pub catalog: ModelCatalog,
}

impl AppState {
    pub fn new(config: KirogateConfig) -> kirogate_core::Result<Self> {
        let auth = Arc::new(TokenManager::from_config(&config)?);
        let kiro = Arc::new(KiroClient::from_config(auth.clone(), &config)?);
        let catalog = ModelCatalog::new(kiro.clone(), config.model_cache_ttl);
        Ok(Self {
            config,
            auth,
            kiro,
            catalog,
        })
    }
}

/// Assemble the full Axum router. `/` and `/health` are open; the /v1
/// surface sits behind the proxy-key admission layer.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/models", get(crate::http::models::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::admission::require_proxy_key,
        ));

    Router::new()
        .route("/", get(crate::http::health::health_handler))
        .route("/health", get(crate::http::health::health_handler))
        .merge(protected)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}

/// Map a gateway error onto its HTTP surface.
pub fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::new(&err.to_string(), err.code()))).into_response()
}
