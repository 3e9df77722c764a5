//! Shared types for the AUTOPILOT engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that market, risk, and engine
//! modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time.
    pub start_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// An ordered window of candles for one symbol/interval.
///
/// Invariant: candles are sorted by `start_time` ascending. The market
/// data source is responsible for establishing this before handing the
/// window to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleWindow {
    pub symbol: String,
    /// Exchange interval code, e.g. "1" for one-minute candles.
    pub interval: String,
    pub candles: Vec<Candle>,
}

impl CandleWindow {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Whether candles are ordered by start time ascending.
    pub fn is_ascending(&self) -> bool {
        self.candles
            .windows(2)
            .all(|pair| pair[0].start_time <= pair[1].start_time)
    }

    /// Close price of the most recent candle.
    pub fn latest_close(&self) -> Option<Decimal> {
        self.candles.last().map(|c| c.close)
    }

    /// Percentage change from the first close to the last close.
    pub fn price_change_pct(&self) -> f64 {
        let (Some(first), Some(last)) = (self.candles.first(), self.candles.last()) else {
            return 0.0;
        };
        if first.close.is_zero() {
            return 0.0;
        }
        ((last.close - first.close) / first.close * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }

    /// Mean volume across the window.
    pub fn avg_volume(&self) -> Decimal {
        if self.candles.is_empty() {
            return Decimal::ZERO;
        }
        let total: Decimal = self.candles.iter().map(|c| c.volume).sum();
        total / Decimal::from(self.candles.len())
    }

    /// Volume of the most recent candle.
    pub fn latest_volume(&self) -> Decimal {
        self.candles.last().map(|c| c.volume).unwrap_or(Decimal::ZERO)
    }

    /// Helper to build a synthetic window with a linear price ramp.
    #[cfg(test)]
    pub fn synthetic(symbol: &str, count: usize, start_price: f64, step: f64) -> Self {
        use rust_decimal::prelude::FromPrimitive;
        let base = Utc::now() - chrono::Duration::minutes(count as i64);
        let candles = (0..count)
            .map(|i| {
                let price = Decimal::from_f64(start_price + step * i as f64).unwrap();
                Candle {
                    start_time: base + chrono::Duration::minutes(i as i64),
                    open: price,
                    high: price + Decimal::ONE,
                    low: price - Decimal::ONE,
                    close: price,
                    volume: Decimal::from(100 + i as u64),
                }
            })
            .collect();
        CandleWindow {
            symbol: symbol.to_string(),
            interval: "1".to_string(),
            candles,
        }
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// A user's configured risk appetite. Bounds leverage, stop-loss and
/// take-profit levels, and the confidence threshold for acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(anyhow::anyhow!("Unknown risk level: {s}")),
        }
    }
}

/// The oracle's trade verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Hold => "hold",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TradeAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(TradeAction::Buy),
            "sell" => Ok(TradeAction::Sell),
            "hold" => Ok(TradeAction::Hold),
            _ => Err(anyhow::anyhow!("Unknown trade action: {s}")),
        }
    }
}

/// Order direction on the exchange. Unlike `TradeAction`, never `hold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Exchange wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    pub fn from_action(action: TradeAction) -> Option<Self> {
        match action {
            TradeAction::Buy => Some(OrderSide::Buy),
            TradeAction::Sell => Some(OrderSide::Sell),
            TradeAction::Hold => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// A structured trade decision returned by the oracle for one market
/// window and one effective prompt. Shared by every user in that
/// prompt group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub action: TradeAction,
    /// Calibration of the verdict, in [0, 1].
    pub confidence: f64,
    pub suggested_leverage: u32,
    /// Stop-loss as a fraction of entry price, e.g. 0.05 = 5%.
    pub stop_loss: Option<f64>,
    /// Take-profit as a fraction of entry price.
    pub take_profit: Option<f64>,
    pub rationale: String,
}

impl TradeDecision {
    /// Whether the decision satisfies the model invariants. The oracle
    /// adapter rejects responses for which this is false.
    pub fn is_valid(&self) -> bool {
        self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && self.suggested_leverage >= 1
    }

    #[cfg(test)]
    pub fn sample(action: TradeAction, confidence: f64, leverage: u32) -> Self {
        TradeDecision {
            action,
            confidence,
            suggested_leverage: leverage,
            stop_loss: Some(0.05),
            take_profit: Some(0.10),
            rationale: "test decision".to_string(),
        }
    }
}

/// System-wide risk envelope handed to the oracle so the prompt can
/// state the legal output ranges. Deliberately group-neutral: per-user
/// personalization happens downstream in `RiskPolicy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskContext {
    pub max_leverage: u32,
    pub max_stop_loss: f64,
    pub max_take_profit: f64,
}

impl Default for RiskContext {
    fn default() -> Self {
        RiskContext {
            max_leverage: 20,
            max_stop_loss: 0.10,
            max_take_profit: 0.20,
        }
    }
}

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

/// Per-user automated trading configuration. Owned by the user via the
/// settings surface; read-only to the engine within a cycle (the cycle
/// works from the snapshot taken at its start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTradeProfile {
    pub user_id: i64,
    pub email: String,
    pub risk_level: RiskLevel,
    pub max_leverage: u32,
    pub custom_prompt: Option<String>,
    pub auto_trade_enabled: bool,
    /// Vault-encrypted exchange API key (base64 blob).
    pub encrypted_api_key: String,
    /// Vault-encrypted exchange API secret (base64 blob).
    pub encrypted_api_secret: String,
}

impl UserTradeProfile {
    /// The prompt this user's decision group is keyed on: the custom
    /// prompt when present and non-blank, else the system default.
    pub fn effective_prompt<'a>(&'a self, default: &'a str) -> &'a str {
        match self.custom_prompt.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p,
            _ => default,
        }
    }

    #[cfg(test)]
    pub fn sample(user_id: i64, max_leverage: u32) -> Self {
        UserTradeProfile {
            user_id,
            email: format!("user{user_id}@example.com"),
            risk_level: RiskLevel::Medium,
            max_leverage,
            custom_prompt: None,
            auto_trade_enabled: true,
            encrypted_api_key: String::new(),
            encrypted_api_secret: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trading cycle
// ---------------------------------------------------------------------------

/// Lifecycle of one scheduled execution of the decide-and-execute loop.
///
/// `Running → Aborted` when the market window is unavailable or every
/// decision group fails; `Running → Completed` once every eligible user
/// reached a terminal outcome. Both end states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Running,
    Aborted,
    Completed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Running => "running",
            CycleStatus::Aborted => "aborted",
            CycleStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CycleStatus::Running)
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(CycleStatus::Running),
            "aborted" => Ok(CycleStatus::Aborted),
            "completed" => Ok(CycleStatus::Completed),
            _ => Err(anyhow::anyhow!("Unknown cycle status: {s}")),
        }
    }
}

/// One scheduled trading cycle. Created by the Scheduler; mutated only
/// by the engine executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingCycle {
    pub id: Uuid,
    pub symbol: String,
    pub interval: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
}

impl TradingCycle {
    pub fn new(symbol: &str, interval: &str, started_at: DateTime<Utc>) -> Self {
        TradingCycle {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            started_at,
            finished_at: None,
            status: CycleStatus::Running,
        }
    }

    /// Transition into a terminal state. A terminal cycle never
    /// transitions again.
    pub fn finish(&mut self, status: CycleStatus, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(at);
    }

    /// Deterministic per-(cycle, user) order token. Protects against
    /// duplicate submission on ambiguous network failures: resubmitting
    /// with the same key is a no-op on the exchange side.
    pub fn idempotency_key(&self, user_id: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(user_id.to_be_bytes());
        let digest = hasher.finalize();
        // 24 hex chars + prefix stays within the exchange's 36-char
        // order-link-id limit.
        format!("ap-{}", hex::encode(&digest[..12]))
    }
}

// ---------------------------------------------------------------------------
// Trade outcome
// ---------------------------------------------------------------------------

/// Status of a per-user execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Pending,
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutcomeStatus::Pending)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OutcomeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OutcomeStatus::Pending),
            "success" => Ok(OutcomeStatus::Success),
            "failed" => Ok(OutcomeStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown outcome status: {s}")),
        }
    }
}

/// The terminal per-user result of applying a decision in a cycle.
///
/// Created pending at the start of a user's attempt and consumed by one
/// of the terminal constructors — the move makes "written exactly once"
/// a type-level property rather than a convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub cycle_id: Uuid,
    pub user_id: i64,
    /// Snapshot of the group decision, None when the group's oracle
    /// call itself failed.
    pub decision: Option<TradeDecision>,
    pub action_applied: TradeAction,
    pub leverage_used: u32,
    pub order_id: Option<String>,
    pub status: OutcomeStatus,
    pub error_detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TradeOutcome {
    /// Start a user's attempt. Not recordable: the ledger only accepts
    /// terminal outcomes.
    pub fn pending(cycle_id: Uuid, user_id: i64, decision: Option<TradeDecision>) -> Self {
        TradeOutcome {
            cycle_id,
            user_id,
            decision,
            action_applied: TradeAction::Hold,
            leverage_used: 0,
            order_id: None,
            status: OutcomeStatus::Pending,
            error_detail: None,
            completed_at: Utc::now(),
        }
    }

    /// Order submitted and accepted by the exchange.
    pub fn succeeded(
        mut self,
        action: TradeAction,
        leverage: u32,
        order_id: String,
        at: DateTime<Utc>,
    ) -> Self {
        self.action_applied = action;
        self.leverage_used = leverage;
        self.order_id = Some(order_id);
        self.status = OutcomeStatus::Success;
        self.completed_at = at;
        self
    }

    /// Policy hold: no order, still a successful terminal outcome.
    pub fn held(mut self, at: DateTime<Utc>) -> Self {
        self.action_applied = TradeAction::Hold;
        self.leverage_used = 0;
        self.status = OutcomeStatus::Success;
        self.completed_at = at;
        self
    }

    /// Attempt failed; the error is captured, never propagated.
    pub fn failed(mut self, error: impl fmt::Display, at: DateTime<Utc>) -> Self {
        self.status = OutcomeStatus::Failed;
        self.error_detail = Some(error.to_string());
        self.completed_at = at;
        self
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Summary of one finished cycle, for logging and the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub status: CycleStatus,
    pub users_total: usize,
    pub prompt_groups: usize,
    pub succeeded: usize,
    pub held: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
