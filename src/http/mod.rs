use std::collections::HashMap;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::monitor::{QueryAnalysis, SlowQueryRecord};

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/dashboard", get(get_dashboard))
        .route("/slow-queries", get(get_slow_queries))
        .route("/query-analysis", get(get_query_analysis))
        .route("/indexes/script", get(get_index_script));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn get_healthz(State(ctx): State<AppContext>) -> Response {
    match ctx.connections.health_check().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// `?format=text` returns the human-readable report instead of JSON.
async fn get_dashboard(
    State(ctx): State<AppContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let report = ctx.dashboard.report().await;
    if params.get("format").map(String::as_str) == Some("text") {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            report.to_text(),
        )
            .into_response()
    } else {
        Json(report).into_response()
    }
}

async fn get_slow_queries(
    State(ctx): State<AppContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<SlowQueryRecord>> {
    let limit: usize = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    let mut records = ctx.monitor.slow_queries();
    if records.len() > limit {
        let start = records.len() - limit;
        records = records.split_off(start);
    }
    Json(records)
}

async fn get_query_analysis(State(ctx): State<AppContext>) -> Json<QueryAnalysis> {
    Json(ctx.monitor.analysis())
}

/// Re-analyze and return the script; falls back to the previous analysis if the catalog fails.
async fn get_index_script(State(ctx): State<AppContext>) -> Response {
    let token = ctx.shutdown_token().child_token();
    let analysis = match ctx.indexes.analyze(&token).await {
        Ok(analysis) => analysis,
        Err(err) => match ctx.indexes.latest_analysis() {
            Some(previous) => {
                warn!(error = %err, "index analysis failed; serving previous result");
                previous
            }
            None => {
                warn!(error = %err, "index analysis failed");
                return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
            }
        },
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        analysis.optimization_script(),
    )
        .into_response()
}
