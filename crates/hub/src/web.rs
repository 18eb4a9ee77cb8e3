use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config;
use crate::engine::{CommandError, SteeringEngine};
use crate::phase::Phase;
use crate::policy::PolicyEntry;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub engine: Arc<SteeringEngine>,
    pub config_path: String,
    pub clock: fn() -> OffsetDateTime,
}

impl AppState {
    pub fn new(shared: SharedState, engine: Arc<SteeringEngine>, config_path: String) -> Self {
        Self {
            shared,
            engine,
            config_path,
            clock: OffsetDateTime::now_utc,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    Command(CommandError),
    Config(String),
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        ApiError::Command(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Command(e) => {
                let status = match &e {
                    CommandError::UnknownZone(_) => StatusCode::NOT_FOUND,
                    CommandError::IllegalPhase { .. } => StatusCode::CONFLICT,
                    CommandError::InvalidPolicy(_) => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, e.to_string())
            }
            ApiError::Config(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/zones/{zone_id}", get(zone_status))
        .route("/api/zones/{zone_id}/phase", post(force_phase))
        .route("/api/policies", put(update_policy))
        .route("/api/config/reload", post(reload_config))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let zones = app.engine.statuses((app.clock)()).await;
    let st = app.shared.read().await;
    Json(st.to_status(zones))
}

async fn zone_status(
    State(app): State<AppState>,
    Path(zone_id): Path<String>,
) -> Result<Response, ApiError> {
    match app.engine.zone_status(&zone_id, (app.clock)()).await {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(CommandError::UnknownZone(zone_id).into()),
    }
}

#[derive(Deserialize)]
struct ForcePhase {
    phase: Phase,
}

async fn force_phase(
    State(app): State<AppState>,
    Path(zone_id): Path<String>,
    Json(body): Json<ForcePhase>,
) -> Result<Response, ApiError> {
    let now = (app.clock)();
    match app.engine.force_phase(&zone_id, body.phase, now).await {
        Ok(Some((from, to))) => {
            info!(zone = %zone_id, %from, %to, "phase forced by operator");
            app.shared
                .write()
                .await
                .record_phase(&zone_id, from, to, true);
        }
        Ok(None) => {}
        Err(e) => {
            warn!("force phase rejected: {e}");
            return Err(e.into());
        }
    }
    zone_status(State(app), Path(zone_id)).await
}

async fn update_policy(
    State(app): State<AppState>,
    Json(entry): Json<PolicyEntry>,
) -> Result<Json<PolicyEntry>, ApiError> {
    if let Err(e) = app.engine.update_policy(&entry).await {
        warn!("policy update rejected: {e}");
        return Err(e.into());
    }
    app.shared.write().await.record_config(format!(
        "policy {}/{} updated",
        entry.direction, entry.phase
    ));
    Ok(Json(entry))
}

async fn reload_config(State(app): State<AppState>) -> Result<Response, ApiError> {
    let cfg = match config::load(&app.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            let msg = format!("{e:#}");
            warn!("config reload rejected, keeping current config: {msg}");
            app.shared
                .write()
                .await
                .record_error(None, format!("config reload rejected: {msg}"));
            return Err(ApiError::Config(msg));
        }
    };

    let change = app.engine.apply_config(cfg, (app.clock)()).await;
    info!(
        added = change.added.len(),
        updated = change.updated.len(),
        deactivated = change.deactivated.len(),
        "config reloaded"
    );
    app.shared.write().await.record_config(format!(
        "config reloaded: {} added, {} updated, {} deactivated",
        change.added.len(),
        change.updated.len(),
        change.deactivated.len()
    ));
    Ok(Json(change).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("operator api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
