//! HTTP surface: `/api/v1/*` maps the tool facade one-to-one; `/ws` is the
//! fan-out channel.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use devlens_core::api_types::{
    BottleneckQuery, ErrorPayload, MethodologyFilter, MetricsKind, StageQuery,
    TimeRange,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::ws::websocket_handler;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_handler))
        .route("/api/v1/status", get(project_status))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/activity", get(activity_log))
        .route("/api/v1/bottlenecks", get(bottlenecks))
        .route("/api/v1/methodology", get(methodology))
        .route("/api/v1/stage", get(stage))
        .route("/api/v1/ai", get(ai_collaboration))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn to_json<T: serde::Serialize>(
    result: devlens_core::Result<T>,
) -> Json<Value> {
    match result {
        Ok(value) => Json(serde_json::to_value(value).unwrap_or(Value::Null)),
        Err(err) => Json(
            serde_json::to_value(ErrorPayload::from(&err)).unwrap_or(Value::Null),
        ),
    }
}

fn bad_query(field: &str, value: &str) -> Json<Value> {
    Json(json!({
        "error": {
            "kind": "InvalidArgument",
            "message": format!("unsupported {field}: {value}"),
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.facade.bus_stats();
    Json(json!({
        "status": "ok",
        "totalEvents": stats.total_events,
        "subscribers": stats.subscriber_count,
        "streamSubscribers": state.fanout.subscriber_count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusQuery {
    details: bool,
}

async fn project_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Json<Value> {
    to_json(state.facade.get_project_status(query.details).await)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MetricsQuery {
    range: String,
    kind: String,
}

impl Default for MetricsQuery {
    fn default() -> Self {
        Self {
            range: "1d".to_string(),
            kind: "all".to_string(),
        }
    }
}

async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Json<Value> {
    let Some(range) = TimeRange::parse(&query.range) else {
        return bad_query("range", &query.range);
    };
    let Some(kind) = MetricsKind::parse(&query.kind) else {
        return bad_query("kind", &query.kind);
    };
    to_json(state.facade.get_metrics(range, kind).await)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ActivityQuery {
    limit: u32,
    kind: Option<String>,
}

impl Default for ActivityQuery {
    fn default() -> Self {
        Self { limit: 50, kind: None }
    }
}

async fn activity_log(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Json<Value> {
    let category = match &query.kind {
        None => None,
        Some(kind) => match devlens_model::EventCategory::parse(kind) {
            Some(category) => Some(category),
            None => return bad_query("kind", kind),
        },
    };
    to_json(state.facade.get_activity_log(query.limit, category).await)
}

async fn bottlenecks(
    State(state): State<AppState>,
    Query(query): Query<BottleneckQuery>,
) -> Json<Value> {
    to_json(Ok(state.facade.analyze_bottlenecks(query)))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MethodologyQuery {
    which: String,
}

impl Default for MethodologyQuery {
    fn default() -> Self {
        Self { which: "all".to_string() }
    }
}

async fn methodology(
    State(state): State<AppState>,
    Query(query): Query<MethodologyQuery>,
) -> Json<Value> {
    let Some(which) = MethodologyFilter::parse(&query.which) else {
        return bad_query("which", &query.which);
    };
    to_json(Ok(state.facade.check_methodology(which)))
}

async fn stage(
    State(state): State<AppState>,
    Query(query): Query<StageQuery>,
) -> Json<Value> {
    to_json(Ok(state.facade.analyze_stage(query)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AiQuery {
    tool: Option<String>,
    range: Option<String>,
}

async fn ai_collaboration(
    State(state): State<AppState>,
    Query(query): Query<AiQuery>,
) -> Json<Value> {
    let range = match &query.range {
        None => None,
        Some(range) => match TimeRange::parse(range) {
            Some(range) => Some(range),
            None => return bad_query("range", range),
        },
    };
    to_json(Ok(state.facade.analyze_ai_collaboration(query.tool, range)))
}
