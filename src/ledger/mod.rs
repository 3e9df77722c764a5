//! Trade ledger.
//!
//! Append-only outcome store over SQLite. Writes are independent per
//! user and may arrive out of submission order; readers see outcomes
//! ordered by completion time. One row per (cycle, user), enforced by
//! the schema — a second write for the same pair is an error, which
//! keeps "written exactly once" honest at the storage layer too.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::types::{CycleStatus, OutcomeStatus, TradeOutcome, TradingCycle};

/// Summary row for the cycle listing surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub symbol: String,
    pub interval: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
}

pub struct TradeLedger {
    pool: SqlitePool,
}

impl TradeLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create ledger tables if missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trading_cycles (
                 id TEXT PRIMARY KEY,
                 symbol TEXT NOT NULL,
                 interval TEXT NOT NULL,
                 started_at TEXT NOT NULL,
                 finished_at TEXT,
                 status TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create trading_cycles table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trade_outcomes (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 cycle_id TEXT NOT NULL,
                 user_id INTEGER NOT NULL,
                 decision_json TEXT,
                 action TEXT NOT NULL,
                 leverage INTEGER NOT NULL,
                 order_id TEXT,
                 status TEXT NOT NULL,
                 error_message TEXT,
                 executed_at TEXT NOT NULL,
                 UNIQUE (cycle_id, user_id)
             )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create trade_outcomes table")?;

        Ok(())
    }

    /// Register a freshly started cycle.
    pub async fn open_cycle(&self, cycle: &TradingCycle) -> Result<()> {
        sqlx::query(
            "INSERT INTO trading_cycles (id, symbol, interval, started_at, status)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cycle.id.to_string())
        .bind(&cycle.symbol)
        .bind(&cycle.interval)
        .bind(cycle.started_at)
        .bind(cycle.status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to insert cycle")?;
        Ok(())
    }

    /// Move a cycle into a terminal state. A cycle already terminal is
    /// left untouched.
    pub async fn close_cycle(
        &self,
        cycle_id: Uuid,
        status: CycleStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE trading_cycles
             SET status = ?, finished_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(finished_at)
        .bind(cycle_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to close cycle")?;
        Ok(())
    }

    /// Append one terminal outcome. Rejects non-terminal outcomes and
    /// duplicate (cycle, user) pairs.
    pub async fn record(&self, outcome: &TradeOutcome) -> Result<()> {
        if !outcome.status.is_terminal() {
            anyhow::bail!(
                "refusing to record non-terminal outcome for user {}",
                outcome.user_id
            );
        }

        let decision_json = outcome
            .decision
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialise decision")?;

        sqlx::query(
            "INSERT INTO trade_outcomes
                 (cycle_id, user_id, decision_json, action, leverage,
                  order_id, status, error_message, executed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(outcome.cycle_id.to_string())
        .bind(outcome.user_id)
        .bind(decision_json)
        .bind(outcome.action_applied.as_str())
        .bind(outcome.leverage_used as i64)
        .bind(&outcome.order_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.error_detail)
        .bind(outcome.completed_at)
        .execute(&self.pool)
        .await
        .context("Failed to record outcome")?;

        debug!(
            cycle_id = %outcome.cycle_id,
            user_id = outcome.user_id,
            status = %outcome.status,
            "Outcome recorded"
        );
        Ok(())
    }

    /// All outcomes of one cycle, ordered by completion time.
    pub async fn outcomes_for_cycle(&self, cycle_id: Uuid) -> Result<Vec<TradeOutcome>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_outcomes
             WHERE cycle_id = ?
             ORDER BY executed_at ASC, user_id ASC",
        )
        .bind(cycle_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query cycle outcomes")?;

        rows.iter().map(row_to_outcome).collect()
    }

    /// A user's recent outcomes, newest first.
    pub async fn outcomes_for_user(&self, user_id: i64, limit: u32) -> Result<Vec<TradeOutcome>> {
        let rows = sqlx::query(
            "SELECT * FROM trade_outcomes
             WHERE user_id = ?
             ORDER BY executed_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query user outcomes")?;

        rows.iter().map(row_to_outcome).collect()
    }

    /// Recent cycles, newest first.
    pub async fn recent_cycles(&self, limit: u32) -> Result<Vec<CycleRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM trading_cycles
             ORDER BY started_at DESC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query cycles")?;

        rows.iter().map(row_to_cycle).collect()
    }

    pub async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<CycleRecord>> {
        let row = sqlx::query("SELECT * FROM trading_cycles WHERE id = ?")
            .bind(cycle_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch cycle")?;

        row.map(|r| row_to_cycle(&r)).transpose()
    }
}

fn row_to_outcome(row: &SqliteRow) -> Result<TradeOutcome> {
    let cycle_id: String = row.try_get("cycle_id")?;
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    let decision_json: Option<String> = row.try_get("decision_json")?;

    Ok(TradeOutcome {
        cycle_id: Uuid::parse_str(&cycle_id).context("bad cycle id in ledger")?,
        user_id: row.try_get("user_id")?,
        decision: decision_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("bad decision json in ledger")?,
        action_applied: action.parse()?,
        leverage_used: row.try_get::<i64, _>("leverage")?.max(0) as u32,
        order_id: row.try_get("order_id")?,
        status: status.parse::<OutcomeStatus>()?,
        error_detail: row.try_get("error_message")?,
        completed_at: row.try_get("executed_at")?,
    })
}

fn row_to_cycle(row: &SqliteRow) -> Result<CycleRecord> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(CycleRecord {
        id: Uuid::parse_str(&id).context("bad cycle id")?,
        symbol: row.try_get("symbol")?,
        interval: row.try_get("interval")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: status.parse()?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
