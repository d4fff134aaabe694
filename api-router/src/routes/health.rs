use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::api_state::ApiState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: String,
    pub environment: String,
    pub dependencies: Value,
}

/// Dependency-map health probe: local store, vector store, embedding
/// credentials. Degraded when some dependencies are down, unhealthy when
/// all are.
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let mut unhealthy = 0usize;

    let database = if state.db.health_check().await {
        "healthy"
    } else {
        unhealthy += 1;
        "unhealthy"
    };

    let vector_store = if state.vector_store.health_check().await {
        "healthy"
    } else {
        unhealthy += 1;
        "unhealthy"
    };

    let openai = if state.config.openai_api_key.is_empty() {
        unhealthy += 1;
        "not_configured"
    } else if !state.config.openai_api_key.starts_with("sk-") {
        unhealthy += 1;
        "invalid_key_format"
    } else {
        // Presence check only; probing the API here would burn quota
        "configured"
    };

    let dependency_count = 3;
    let status = if unhealthy == 0 {
        "healthy"
    } else if unhealthy >= dependency_count {
        "unhealthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        service: "rake",
        timestamp: Utc::now().to_rfc3339(),
        environment: format!("{:?}", state.config.environment).to_lowercase(),
        dependencies: json!({
            "database": database,
            "vector_store": vector_store,
            "openai": openai,
        }),
    })
}
