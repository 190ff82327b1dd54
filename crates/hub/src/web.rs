use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tracing::info;

use crate::clock::{hhmm, minute_of_day};
use crate::conflict::ResolutionPolicy;
use crate::db::Db;
use crate::device::{Action, Command, CoverPosition, Device, Source};
use crate::driver::{Activation, Driver};
use crate::error::{ActionError, ApiError};
use crate::evaluator::{expected_cover, Candidate};
use crate::pipeline::Outcome;
use crate::preset::{parse_hhmm, DeviceConfig};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub driver: Driver,
    pub db: Db,
}

impl AppState {
    fn store(&self) -> &SharedState {
        self.driver.pipeline().state()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/presets", get(list_presets))
        .route("/api/presets/{name}", get(get_preset).put(put_preset))
        .route("/api/presets/{name}/duplicate", post(duplicate_preset))
        .route("/api/presets/{name}/activate", post(activate_preset))
        .route("/api/devices/{device}/manual", post(manual_action))
        .route("/api/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/api/policy", put(set_policy))
        .route("/api/cover/expected", get(cover_expected))
        .route("/api/actions", get(recent_actions))
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.store().snapshot().await)
}

// ── Presets ─────────────────────────────────────────────────────────

async fn list_presets(State(app): State<AppState>) -> ApiResult<Json<Vec<DeviceConfig>>> {
    Ok(Json(app.db.load_presets().await?))
}

async fn get_preset(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<DeviceConfig>> {
    app.db
        .get_preset(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no preset named '{name}'")))
}

/// Create or replace a preset. Saving the active preset re-activates it.
async fn put_preset(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(mut preset): Json<DeviceConfig>,
) -> ApiResult<Json<DeviceConfig>> {
    preset.name = name;
    let problems = preset.problems();
    if !problems.is_empty() {
        return Err(ApiError::Invalid(problems));
    }

    let now = app.store().now().unix_timestamp();
    app.db.upsert_preset(&preset, now).await?;
    info!(preset = %preset.name, "preset saved");

    if app.db.active_preset().await?.as_deref() == Some(preset.name.as_str()) {
        app.driver.activate(preset.clone()).await;
    }
    Ok(Json(preset))
}

#[derive(Deserialize)]
struct DuplicateRequest {
    name: String,
}

async fn duplicate_preset(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<DuplicateRequest>,
) -> ApiResult<(StatusCode, Json<DeviceConfig>)> {
    let new_name = req.name.trim().to_string();
    if new_name.is_empty() {
        return Err(ApiError::BadRequest("new preset name is empty".into()));
    }
    let mut copy = app
        .db
        .get_preset(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no preset named '{name}'")))?;
    if app.db.get_preset(&new_name).await?.is_some() {
        return Err(ApiError::Conflict(format!("preset '{new_name}' already exists")));
    }

    copy.name = new_name;
    let now = app.store().now().unix_timestamp();
    app.db.upsert_preset(&copy, now).await?;
    info!(from = %name, to = %copy.name, "preset duplicated");
    Ok((StatusCode::CREATED, Json(copy)))
}

#[derive(Serialize)]
struct ActivationBody {
    preset: String,
    fan: Option<Action>,
    outcome: Option<Outcome>,
    error: Option<String>,
}

impl From<Activation> for ActivationBody {
    fn from(a: Activation) -> Self {
        let (outcome, error) = match a.outcome {
            Some(Ok(o)) => (Some(o), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };
        Self {
            preset: a.preset,
            fan: a.fan,
            outcome,
            error,
        }
    }
}

async fn activate_preset(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActivationBody>> {
    let preset = app
        .db
        .get_preset(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no preset named '{name}'")))?;

    // A restart resumes whatever the pointer names, so it is written first.
    app.db.set_active_preset(&name).await?;
    let activation = app.driver.activate(preset).await;
    Ok(Json(activation.into()))
}

// ── Control ─────────────────────────────────────────────────────────

async fn manual_action(
    State(app): State<AppState>,
    Path(device): Path<String>,
    Json(command): Json<Command>,
) -> ApiResult<Json<Outcome>> {
    let device: Device = device.parse().map_err(ApiError::BadRequest)?;
    let action = command
        .for_device(device)
        .ok_or(ActionError::InvalidCommand(device))?;

    let outcome = app
        .driver
        .pipeline()
        .submit(Candidate::manual(action), Source::Manual)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct ResolveRequest {
    resolution: Source,
}

async fn resolve_conflict(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Json<Outcome>> {
    let outcome = app
        .driver
        .pipeline()
        .resolve_conflict(&id, req.resolution)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct PolicyRequest {
    policy: ResolutionPolicy,
}

async fn set_policy(
    State(app): State<AppState>,
    Json(req): Json<PolicyRequest>,
) -> impl IntoResponse {
    app.store().set_policy(req.policy).await;
    info!(policy = %req.policy, "resolution policy changed");
    Json(json!({ "policy": req.policy }))
}

// ── Queries ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CoverQuery {
    at: Option<String>,
}

#[derive(Serialize)]
struct CoverExpectation {
    time: String,
    start: Option<String>,
    end: Option<String>,
    position: Option<CoverPosition>,
}

async fn cover_expected(
    State(app): State<AppState>,
    Query(q): Query<CoverQuery>,
) -> ApiResult<Json<CoverExpectation>> {
    let minute = match q.at.as_deref() {
        Some(s) => parse_hhmm(s).ok_or_else(|| ApiError::BadRequest(format!("'{s}' is not HH:MM")))?,
        None => minute_of_day(app.store().now()),
    };
    let preset = app
        .driver
        .active_config()
        .await
        .ok_or_else(|| ApiError::NotFound("no active preset".into()))?;

    let hit = expected_cover(minute, &preset.cover);
    Ok(Json(CoverExpectation {
        time: hhmm(minute),
        start: hit.map(|(s, _)| s.start.clone()),
        end: hit.map(|(s, _)| s.end.clone()),
        position: hit.map(|(_, p)| p),
    }))
}

#[derive(Deserialize)]
struct ActionsQuery {
    limit: Option<i64>,
}

async fn recent_actions(
    State(app): State<AppState>,
    Query(q): Query<ActionsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(app.db.recent_action_events(limit).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    #[cfg(feature = "tls")]
    if let (Ok(cert), Ok(key)) = (env::var("TLS_CERT"), env::var("TLS_KEY")) {
        use anyhow::Context;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
        info!("operator api listening on https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .serve(router(app).into_make_service())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("operator api listening on http://{addr}");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
