//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<ApiState>`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ledger::{CycleRecord, TradeLedger};
use crate::types::{CycleReport, RiskLevel, TradeOutcome};
use crate::users::{ProfileUpdate, SqliteUserDirectory, UserDirectory};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Engine counters surfaced on `/api/status`, updated by the main loop
/// after every cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStatus {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub ledger: Arc<TradeLedger>,
    pub directory: Arc<SqliteUserDirectory>,
    pub status: RwLock<EngineStatus>,
}

impl ApiState {
    pub fn new(ledger: Arc<TradeLedger>, directory: Arc<SqliteUserDirectory>) -> Self {
        Self {
            ledger,
            directory,
            status: RwLock::new(EngineStatus::default()),
        }
    }
}

pub type AppState = Arc<ApiState>;

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OutcomeQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Settings patch accepted from the external settings layer. An empty
/// or blank `custom_prompt` clears the prompt.
#[derive(Debug, Deserialize)]
pub struct SettingsBody {
    pub auto_trade_enabled: Option<bool>,
    pub risk_level: Option<RiskLevel>,
    pub max_leverage: Option<u32>,
    pub custom_prompt: Option<String>,
}

impl From<SettingsBody> for ProfileUpdate {
    fn from(body: SettingsBody) -> Self {
        ProfileUpdate {
            auto_trade_enabled: body.auto_trade_enabled,
            risk_level: body.risk_level,
            max_leverage: body.max_leverage,
            custom_prompt: body
                .custom_prompt
                .map(|p| if p.trim().is_empty() { None } else { Some(p) }),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health() -> &'static str {
    "ok"
}

pub async fn get_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.status.read().await.clone())
}

pub async fn get_cycles(
    State(state): State<AppState>,
) -> Result<Json<Vec<CycleRecord>>, ApiError> {
    let cycles = state.ledger.recent_cycles(50).await.map_err(internal)?;
    Ok(Json(cycles))
}

pub async fn get_cycle_outcomes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TradeOutcome>>, ApiError> {
    let cycle_id = Uuid::parse_str(&id)
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid cycle id: {id}")))?;
    let outcomes = state
        .ledger
        .outcomes_for_cycle(cycle_id)
        .await
        .map_err(internal)?;
    Ok(Json(outcomes))
}

pub async fn get_user_outcomes(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<OutcomeQuery>,
) -> Result<Json<Vec<TradeOutcome>>, ApiError> {
    let outcomes = state
        .ledger
        .outcomes_for_user(user_id, query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(outcomes))
}

pub async fn put_user_settings(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(body): Json<SettingsBody>,
) -> Result<StatusCode, ApiError> {
    // Running cycles keep their snapshot; this takes effect from the
    // next cycle start.
    match state.directory.update_settings(user_id, body.into()).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) if e.to_string().contains("not found") => {
            Err((StatusCode::NOT_FOUND, e.to_string()))
        }
        Err(e) => Err(internal(e)),
    }
}
