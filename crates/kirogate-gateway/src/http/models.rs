use std::sync::Arc;

use axum::{extract::State, Json};

use kirogate_core::openai::{ModelList, ModelObject};

use crate::app::AppState;

/// GET /v1/models — the catalog's current snapshot in OpenAI list form.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .catalog
        .models()
        .await
        .into_iter()
        .map(|m| ModelObject {
            id: m.external_name,
            object: "model".to_string(),
            created,
            owned_by: "kiro".to_string(),
        })
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}
