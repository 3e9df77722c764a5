//! Risk policy.
//!
//! Pure mapping from (oracle decision, user profile) to an effective
//! order or a hold. Deterministic given identical inputs; no hidden
//! state. Bound violations are never errors — a decision the policy
//! will not act on becomes a hold, which is recorded as a successful
//! outcome downstream.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::config::RiskSettings;
use crate::types::{OrderSide, RiskLevel, TradeAction, TradeDecision, UserTradeProfile};

// Tier defaults. Confidence thresholds follow the original product
// semantics: cautious users demand more conviction before acting.
const LOW_THRESHOLD: f64 = 0.8;
const MEDIUM_THRESHOLD: f64 = 0.7;
const HIGH_THRESHOLD: f64 = 0.6;

const LOW_MAX_LEVERAGE: u32 = 5;
const MEDIUM_MAX_LEVERAGE: u32 = 10;

const LOW_MAX_STOP_LOSS: f64 = 0.03;
const MEDIUM_MAX_STOP_LOSS: f64 = 0.05;

const LOW_MAX_TAKE_PROFIT: f64 = 0.06;
const MEDIUM_MAX_TAKE_PROFIT: f64 = 0.10;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Why a user is sitting a cycle out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum HoldReason {
    /// The oracle itself said hold.
    OracleHold,
    /// Decision confidence fell below the user's tier threshold —
    /// a policy downgrade, not an error.
    LowConfidence { confidence: f64, threshold: f64 },
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::OracleHold => write!(f, "oracle verdict: hold"),
            HoldReason::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.2} below threshold {threshold:.2}"),
        }
    }
}

/// An order as it will actually be submitted for one user, after all
/// clamping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveOrder {
    pub side: OrderSide,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Result of applying the policy to one (decision, profile) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OrderPlan {
    Hold(HoldReason),
    Execute(EffectiveOrder),
}

// ---------------------------------------------------------------------------
// Tier bounds
// ---------------------------------------------------------------------------

/// The envelope a risk tier imposes on any decision.
#[derive(Debug, Clone, Copy)]
pub struct TierBounds {
    pub confidence_threshold: f64,
    pub max_leverage: u32,
    pub max_stop_loss: f64,
    pub max_take_profit: f64,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Maps risk tiers to bounds and clamps decisions into them.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    low: TierBounds,
    medium: TierBounds,
    high: TierBounds,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self::with_envelope(20, 0.10, 0.20)
    }
}

impl RiskPolicy {
    /// Build tiers under a system-wide envelope (the high tier gets the
    /// full envelope; lower tiers get fixed tighter caps).
    pub fn with_envelope(max_leverage: u32, max_stop_loss: f64, max_take_profit: f64) -> Self {
        RiskPolicy {
            low: TierBounds {
                confidence_threshold: LOW_THRESHOLD,
                max_leverage: LOW_MAX_LEVERAGE.min(max_leverage),
                max_stop_loss: LOW_MAX_STOP_LOSS.min(max_stop_loss),
                max_take_profit: LOW_MAX_TAKE_PROFIT.min(max_take_profit),
            },
            medium: TierBounds {
                confidence_threshold: MEDIUM_THRESHOLD,
                max_leverage: MEDIUM_MAX_LEVERAGE.min(max_leverage),
                max_stop_loss: MEDIUM_MAX_STOP_LOSS.min(max_stop_loss),
                max_take_profit: MEDIUM_MAX_TAKE_PROFIT.min(max_take_profit),
            },
            high: TierBounds {
                confidence_threshold: HIGH_THRESHOLD,
                max_leverage,
                max_stop_loss,
                max_take_profit,
            },
        }
    }

    /// Build from the `[risk]` config section, letting configured
    /// thresholds override the tier defaults.
    pub fn from_settings(settings: &RiskSettings) -> Self {
        let mut policy = Self::with_envelope(
            settings.max_leverage,
            settings.max_stop_loss,
            settings.max_take_profit,
        );
        policy.apply_thresholds(&settings.confidence_thresholds);
        policy
    }

    fn apply_thresholds(&mut self, thresholds: &HashMap<String, f64>) {
        if let Some(t) = thresholds.get("low") {
            self.low.confidence_threshold = *t;
        }
        if let Some(t) = thresholds.get("medium") {
            self.medium.confidence_threshold = *t;
        }
        if let Some(t) = thresholds.get("high") {
            self.high.confidence_threshold = *t;
        }
    }

    pub fn bounds(&self, level: RiskLevel) -> &TierBounds {
        match level {
            RiskLevel::Low => &self.low,
            RiskLevel::Medium => &self.medium,
            RiskLevel::High => &self.high,
        }
    }

    /// Validate and clamp a shared group decision for one user.
    ///
    /// Guarantees `leverage ≤ min(decision.suggested_leverage,
    /// profile.max_leverage)` and that stop-loss/take-profit never
    /// exceed the tier bound (the tighter value wins).
    pub fn apply(&self, decision: &TradeDecision, profile: &UserTradeProfile) -> OrderPlan {
        let Some(side) = OrderSide::from_action(decision.action) else {
            return OrderPlan::Hold(HoldReason::OracleHold);
        };

        let bounds = self.bounds(profile.risk_level);
        if decision.confidence < bounds.confidence_threshold {
            return OrderPlan::Hold(HoldReason::LowConfidence {
                confidence: decision.confidence,
                threshold: bounds.confidence_threshold,
            });
        }

        let leverage = decision
            .suggested_leverage
            .min(profile.max_leverage)
            .min(bounds.max_leverage)
            .max(1);

        OrderPlan::Execute(EffectiveOrder {
            side,
            leverage,
            stop_loss: decision.stop_loss.map(|sl| sl.min(bounds.max_stop_loss)),
            take_profit: decision
                .take_profit
                .map(|tp| tp.min(bounds.max_take_profit)),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
