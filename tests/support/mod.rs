//! Mock collaborators for integration testing.
//!
//! Deterministic in-memory implementations of the engine's collaborator
//! seams — market data, decision oracle, exchange, user directory —
//! fully controllable from test code, with no external dependencies.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use autopilot::engine::{Clock, CycleRunner, CycleSettings, ExecutionEngine, SystemClock};
use autopilot::exchange::{Exchange, ExchangeError, OrderRequest};
use autopilot::ledger::TradeLedger;
use autopilot::llm::{DecisionError, DecisionOracle};
use autopilot::market::{DataError, MarketDataSource};
use autopilot::risk::RiskPolicy;
use autopilot::types::{
    Candle, CandleWindow, RiskContext, RiskLevel, TradeAction, TradeDecision, UserTradeProfile,
};
use autopilot::users::{ProfileUpdate, UserDirectory};
use autopilot::vault::{ApiCredentials, CredentialVault};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A synthetic window with a linear uptrend.
pub fn uptrend_window(count: usize) -> CandleWindow {
    let base = Utc::now() - ChronoDuration::minutes(count as i64);
    let candles = (0..count)
        .map(|i| {
            let price = Decimal::from_f64(40_000.0 + 25.0 * i as f64).unwrap();
            Candle {
                start_time: base + ChronoDuration::minutes(i as i64),
                open: price,
                high: price + Decimal::from(10),
                low: price - Decimal::from(10),
                close: price,
                volume: Decimal::from(500 + i as u64),
            }
        })
        .collect();
    CandleWindow {
        symbol: "BTCUSDT".to_string(),
        interval: "1".to_string(),
        candles,
    }
}

pub fn decision(action: TradeAction, confidence: f64, leverage: u32) -> TradeDecision {
    TradeDecision {
        action,
        confidence,
        suggested_leverage: leverage,
        stop_loss: Some(0.05),
        take_profit: Some(0.10),
        rationale: "scripted decision".to_string(),
    }
}

pub fn enabled_profile(
    vault: &CredentialVault,
    user_id: i64,
    max_leverage: u32,
) -> UserTradeProfile {
    UserTradeProfile {
        user_id,
        email: format!("user{user_id}@example.com"),
        risk_level: RiskLevel::Medium,
        max_leverage,
        custom_prompt: None,
        auto_trade_enabled: true,
        encrypted_api_key: vault.encrypt(&format!("key-{user_id}")).unwrap(),
        encrypted_api_secret: vault.encrypt(&format!("secret-{user_id}")).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Market data mock
// ---------------------------------------------------------------------------

/// Serves a fixed window, or a forced error.
pub struct StaticMarket {
    window: Mutex<CandleWindow>,
    force_unavailable: Mutex<Option<String>>,
}

impl StaticMarket {
    pub fn new(window: CandleWindow) -> Self {
        Self {
            window: Mutex::new(window),
            force_unavailable: Mutex::new(None),
        }
    }

    pub fn set_unavailable(&self, msg: &str) {
        *self.force_unavailable.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl MarketDataSource for StaticMarket {
    async fn get_candles(
        &self,
        _symbol: &str,
        _interval: &str,
        _count: u32,
    ) -> Result<CandleWindow, DataError> {
        if let Some(msg) = self.force_unavailable.lock().unwrap().clone() {
            return Err(DataError::Unavailable(msg));
        }
        Ok(self.window.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Oracle mock
// ---------------------------------------------------------------------------

/// Returns scripted decisions keyed by prompt override (`None` is the
/// default-prompt group) and counts calls.
pub struct ScriptedOracle {
    responses: Mutex<HashMap<Option<String>, Result<TradeDecision, DecisionError>>>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Script the default-prompt group's decision.
    pub fn with_default(self, result: Result<TradeDecision, DecisionError>) -> Self {
        self.responses.lock().unwrap().insert(None, result);
        self
    }

    /// Script a custom-prompt group's decision.
    pub fn with_prompt(self, prompt: &str, result: Result<TradeDecision, DecisionError>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(Some(prompt.to_string()), result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide<'a>(
        &self,
        _window: &CandleWindow,
        _risk: &RiskContext,
        prompt_override: Option<&'a str>,
    ) -> Result<TradeDecision, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .get(&prompt_override.map(str::to_string))
            .cloned()
            .unwrap_or_else(|| {
                Err(DecisionError::Transport(
                    "no scripted response for prompt".to_string(),
                ))
            })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Exchange mock
// ---------------------------------------------------------------------------

/// Record of one order submission as the exchange saw it.
#[derive(Debug, Clone)]
pub struct SeenOrder {
    pub api_key: String,
    pub request: OrderRequest,
}

/// Accepts orders, records them, and can fail selected users or stall
/// until released.
pub struct RecordingExchange {
    orders: Mutex<Vec<SeenOrder>>,
    fail_keys: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingExchange {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(Vec::new()),
            fail_keys: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Block every submission until permits are added to the returned
    /// gate.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                orders: Mutex::new(Vec::new()),
                fail_keys: Mutex::new(Vec::new()),
                gate: Some(Arc::clone(&gate)),
            },
            gate,
        )
    }

    /// Fail submissions arriving with this decrypted API key.
    pub fn fail_for_key(&self, api_key: &str) {
        self.fail_keys.lock().unwrap().push(api_key.to_string());
    }

    pub fn seen_orders(&self) -> Vec<SeenOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl Exchange for RecordingExchange {
    async fn place_order(
        &self,
        credentials: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<String, ExchangeError> {
        use secrecy::ExposeSecret;

        if let Some(gate) = &self.gate {
            // Permit returned on drop, so later callers pass too.
            let _permit = gate.acquire().await;
        }

        let api_key = credentials.api_key.expose_secret().to_string();
        if self.fail_keys.lock().unwrap().contains(&api_key) {
            return Err(ExchangeError::Api {
                code: 10003,
                message: "API key invalid".to_string(),
            });
        }

        self.orders.lock().unwrap().push(SeenOrder {
            api_key,
            request: order.clone(),
        });
        Ok(format!("ord-{}", order.idempotency_key))
    }
}

// ---------------------------------------------------------------------------
// Directory mock
// ---------------------------------------------------------------------------

/// In-memory profile store.
pub struct MemoryDirectory {
    profiles: Mutex<Vec<UserTradeProfile>>,
}

impl MemoryDirectory {
    pub fn new(profiles: Vec<UserTradeProfile>) -> Self {
        Self {
            profiles: Mutex::new(profiles),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn eligible_profiles(&self) -> anyhow::Result<Vec<UserTradeProfile>> {
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.auto_trade_enabled)
            .cloned()
            .collect())
    }

    async fn update_settings(&self, user_id: i64, update: ProfileUpdate) -> anyhow::Result<()> {
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or_else(|| anyhow::anyhow!("user {user_id} not found"))?;

        if let Some(enabled) = update.auto_trade_enabled {
            profile.auto_trade_enabled = enabled;
        }
        if let Some(level) = update.risk_level {
            profile.risk_level = level;
        }
        if let Some(cap) = update.max_leverage {
            profile.max_leverage = cap;
        }
        if let Some(prompt) = update.custom_prompt {
            profile.custom_prompt = prompt;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub runner: CycleRunner,
    pub ledger: Arc<TradeLedger>,
}

/// Wire a full cycle runner over the given mocks with an in-memory
/// ledger.
pub async fn build_harness(
    market: Arc<dyn MarketDataSource>,
    oracle: Arc<dyn DecisionOracle>,
    directory: Arc<dyn UserDirectory>,
    exchange: Arc<dyn Exchange>,
    vault: Arc<CredentialVault>,
) -> Harness {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let ledger = Arc::new(TradeLedger::new(pool));
    ledger.migrate().await.unwrap();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let executor = ExecutionEngine::new(
        exchange,
        Arc::clone(&vault),
        RiskPolicy::default(),
        Arc::clone(&ledger),
        Arc::clone(&clock),
        5,
    );

    let runner = CycleRunner::new(
        market,
        oracle,
        directory,
        executor,
        Arc::clone(&ledger),
        clock,
        CycleSettings {
            candle_count: 50,
            min_candles: 30,
            deadline: std::time::Duration::from_secs(30),
            risk_context: RiskContext::default(),
        },
    );

    Harness { runner, ledger }
}
