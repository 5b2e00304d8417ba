use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use cadence_core::templates::TemplateLoader;
use cadence_db::DbPool;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    templates: Arc<TemplateLoader>,
    executor: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub templates: HealthCheck,
    pub checked_at: String,
}

impl HealthState {
    pub fn new(db_pool: DbPool, templates: Arc<TemplateLoader>, executor: &'static str) -> Self {
        Self { db_pool, templates, executor }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let templates = templates_check(&state.templates);
    let ready = database.status == "ready" && templates.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: format!("dialogue runtime initialized with `{}` executor", state.executor),
        },
        database,
        templates,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn templates_check(templates: &TemplateLoader) -> HealthCheck {
    if templates.is_empty() {
        HealthCheck { status: "degraded", detail: "no slot templates loaded".to_string() }
    } else {
        HealthCheck { status: "ready", detail: format!("{} slot templates loaded", templates.len()) }
    }
}
