//! POST /v1/chat/completions — the end-to-end completion pipeline.
//!
//! Admission has already run; this handler resolves the model, converts the
//! request, opens the upstream stream (retries and token refresh happen
//! inside the client before any byte is forwarded), then hands the body to
//! the parser task and synthesizes the response the client asked for.

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use kirogate_core::openai::ChatCompletionRequest;
use kirogate_upstream::{catalog, convert, parser};

use crate::app::{error_response, AppState};
use crate::synth;

/// Channel capacity between the parser task and the synthesizer. Bounded so
/// back-pressure reaches the upstream read when the client socket stalls.
const EVENT_BUFFER: usize = 64;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let model_id = match catalog::resolve(&req.model) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    info!(model = %req.model, stream = req.stream, "chat completion request");

    let conversation = convert::convert(&req, &model_id);
    let upstream = match state.kiro.generate_assistant_response(&conversation).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "upstream call failed");
            return error_response(&e);
        }
    };

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();

    // Parser runs as its own task; dropping the receiver (client gone, or
    // aggregation finished) stops it and closes the upstream connection.
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(parser::process_stream(upstream, tx));

    if req.stream {
        let stream = synth::sse_stream(rx, id, req.model.clone(), created);
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    } else {
        match synth::aggregate(rx, id, req.model.clone(), created).await {
            Ok(completion) => Json(completion).into_response(),
            Err(e) => {
                warn!(error = %e, "aggregation failed");
                error_response(&e)
            }
        }
    }
}
