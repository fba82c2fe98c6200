//! HTTP Surface: read-only endpoints over the live snapshot and history,
//! structured like `comsrv/src/main.rs`'s router construction — an
//! `axum::Router` over `State<Arc<AppState>>`, `tower-http` CORS, and a
//! `tokio::net::TcpListener` + `axum::serve` main loop.

use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::alerts::AlertEngine;
use crate::config::{Config, HttpConfig};
use crate::database_reader::query_history;
use crate::error::SilodError;
use crate::state::{DeviceStatus, HistorySample, StateStore};

pub struct AppState {
    pub state_store: Arc<StateStore>,
    pub alerts: Arc<AlertEngine>,
    pub config: Config,
    pub db_pool: Option<bb8::Pool<bb8_tiberius::ConnectionManager>>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({ "error": message.into() })))
}

impl IntoResponse for SilodError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            SilodError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            SilodError::PersistenceDisabled | SilodError::AlertsDisabled => StatusCode::BAD_REQUEST,
            SilodError::Validation { .. } => StatusCode::BAD_REQUEST,
            SilodError::Database(_) | SilodError::Config(_) | SilodError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SilodError::Transport(_) | SilodError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string()).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/api/data", get(api_data))
        .route("/api/stats", get(api_stats))
        .route("/api/history/{slave}", get(api_history))
        .route("/api/database", get(api_database))
        .route("/api/test_telegram", get(api_test_telegram))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(http_config: HttpConfig, state: Arc<AppState>, shutdown: impl std::future::Future<Output = ()> + Send + 'static) {
    let app = router(state);
    let addr = format!("{}:{}", http_config.host, http_config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr, "failed to bind http listener");
            return;
        }
    };
    info!(addr, "http surface listening");
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    online: usize,
    total: usize,
    uptime_seconds: i64,
    rows: Vec<DashboardRow>,
}

struct DashboardRow {
    code: String,
    status: &'static str,
    percent: String,
    last_error: String,
}

async fn dashboard(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.state_store.snapshot();
    let stats = state.state_store.stats();

    let mut slaves: Vec<&u8> = snapshot.keys().collect();
    slaves.sort();
    let rows = slaves
        .into_iter()
        .map(|slave| {
            let status = &snapshot[slave];
            DashboardRow {
                code: Config::external_code(*slave),
                status: if status.online { "online" } else { "offline" },
                percent: status.percent.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                last_error: status.last_error.clone().unwrap_or_default(),
            }
        })
        .collect();

    let template = DashboardTemplate {
        online: stats.online_slaves,
        total: stats.total_slaves,
        uptime_seconds: stats.uptime_seconds,
        rows,
    };

    match template.render() {
        Ok(body) => Html(body).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_data(State(state): State<Arc<AppState>>) -> Json<HashMap<String, DeviceStatus>> {
    let snapshot = state.state_store.snapshot();
    Json(
        snapshot
            .into_iter()
            .map(|(slave, status)| (slave.to_string(), status))
            .collect(),
    )
}

async fn api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.state_store.stats())
}

#[derive(Deserialize)]
struct HistoryQuery {
    points: Option<usize>,
    hours: Option<i64>,
}

#[derive(Serialize)]
struct HistoryPoint {
    timestamp: DateTime<Utc>,
    value: u16,
    percent: u8,
}

impl From<HistorySample> for HistoryPoint {
    fn from(s: HistorySample) -> Self {
        HistoryPoint {
            timestamp: s.timestamp,
            value: s.value,
            percent: s.percent,
        }
    }
}

async fn api_history(
    State(state): State<Arc<AppState>>,
    Path(slave): Path<u8>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    if !state.state_store.contains(slave) {
        return SilodError::UnknownDevice(slave).into_response();
    }

    if state.config.database.enabled {
        if let Some(pool) = &state.db_pool {
            let hours = query.hours.unwrap_or(24);
            let code = Config::external_code(slave);
            return match query_history(pool, &state.config.database.table_name, &code, hours).await {
                Ok(points) => Json(points).into_response(),
                Err(e) => e.into_response(),
            };
        }
    }

    let points = query.points.unwrap_or(100);
    let history = state.state_store.history(slave, Some(points)).unwrap_or_default();
    let points: Vec<HistoryPoint> = history.into_iter().map(HistoryPoint::from).collect();
    Json(points).into_response()
}

#[derive(Deserialize)]
struct DatabaseQuery {
    slave_id: Option<u8>,
}

async fn api_database(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatabaseQuery>,
) -> impl IntoResponse {
    if !state.config.database.enabled {
        return SilodError::PersistenceDisabled.into_response();
    }
    let Some(slave) = query.slave_id else {
        return error_response(StatusCode::BAD_REQUEST, "slave_id query parameter is required")
            .into_response();
    };
    let Some(pool) = &state.db_pool else {
        return SilodError::Database("pool unavailable".to_string()).into_response();
    };
    let code = Config::external_code(slave);
    match query_history(pool, &state.config.database.table_name, &code, 24).await {
        Ok(points) => Json(points).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn api_test_telegram(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.alerts.is_enabled() {
        return SilodError::AlertsDisabled.into_response();
    }
    let sent = state.alerts.test_notification().await;
    Json(json!({ "sent": sent })).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.state_store.stats();
    Json(json!({
        "status": "ok",
        "online_slaves": stats.online_slaves,
        "total_slaves": stats.total_slaves,
        "uptime": stats.uptime_seconds,
        "database": state.config.database.enabled,
        "alerts": state.alerts.is_enabled(),
    }))
}
