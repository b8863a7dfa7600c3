use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use kirogate_core::GatewayError;

use crate::app::{error_response, AppState};

/// Bearer-key admission for the /v1 surface. Liveness routes bypass this
/// layer entirely.
pub async fn require_proxy_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if key == state.config.proxy_api_key => next.run(req).await,
        _ => {
            debug!(path = %req.uri().path(), "rejected request without valid proxy key");
            error_response(&GatewayError::Unauthorized)
        }
    }
}
