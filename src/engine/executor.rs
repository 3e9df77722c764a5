//! Execution engine.
//!
//! Applies the shared group decision for every assigned user: risk
//! clamp → scoped credential decrypt → order submission → ledger
//! record. Per-user work runs concurrently under a semaphore sized to
//! the exchange rate limit, and every user task is fully isolated —
//! errors are captured into that user's outcome and never escape.
//!
//! No retry happens within a cycle; a failed attempt is naturally
//! retried by the next scheduled cycle with a fresh decision.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::scheduler::Clock;
use crate::exchange::{Exchange, OrderRequest};
use crate::ledger::TradeLedger;
use crate::risk::{OrderPlan, RiskPolicy};
use crate::types::{TradeDecision, TradeOutcome, TradingCycle, UserTradeProfile};
use crate::vault::CredentialVault;

pub struct ExecutionEngine {
    exchange: Arc<dyn Exchange>,
    vault: Arc<CredentialVault>,
    policy: RiskPolicy,
    ledger: Arc<TradeLedger>,
    clock: Arc<dyn Clock>,
    max_in_flight: usize,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        vault: Arc<CredentialVault>,
        policy: RiskPolicy,
        ledger: Arc<TradeLedger>,
        clock: Arc<dyn Clock>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            exchange,
            vault,
            policy,
            ledger,
            clock,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Execute one cycle's assignments and record an outcome per user.
    ///
    /// `deadline` bounds the whole fan-out: attempts still in flight at
    /// the deadline (including those queued on the semaphore) are
    /// cancelled and recorded failed with a timeout reason. Outcomes
    /// already terminal by then are untouched.
    pub async fn execute(
        &self,
        cycle: &TradingCycle,
        assignments: Vec<(UserTradeProfile, Arc<TradeDecision>)>,
        deadline: Instant,
    ) -> Vec<TradeOutcome> {
        if assignments.is_empty() {
            return Vec::new();
        }

        info!(
            cycle_id = %cycle.id,
            users = assignments.len(),
            max_in_flight = self.max_in_flight,
            "Executing cycle assignments"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();

        for (profile, decision) in assignments {
            let semaphore = Arc::clone(&semaphore);
            let exchange = Arc::clone(&self.exchange);
            let vault = Arc::clone(&self.vault);
            let ledger = Arc::clone(&self.ledger);
            let clock = Arc::clone(&self.clock);
            let policy = self.policy.clone();
            let cycle = cycle.clone();

            tasks.spawn(async move {
                let user_id = profile.user_id;
                let cycle_id = cycle.id;
                let decision_snapshot = (*decision).clone();

                let attempt = tokio::time::timeout_at(deadline, async {
                    // Queue wait counts against the deadline too.
                    let _permit = semaphore.acquire_owned().await;
                    process_user(exchange, vault, policy, &clock, cycle, profile, decision).await
                })
                .await;

                let outcome = match attempt {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(user_id, "Cycle deadline exceeded — attempt cancelled");
                        TradeOutcome::pending(cycle_id, user_id, Some(decision_snapshot))
                            .failed("cycle deadline exceeded", clock.now())
                    }
                };

                if let Err(e) = ledger.record(&outcome).await {
                    error!(user_id, error = %e, "Failed to record outcome");
                }
                outcome
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "User execution task aborted"),
            }
        }
        outcomes
    }
}

/// One user's isolated attempt: clamp, decrypt, submit.
async fn process_user(
    exchange: Arc<dyn Exchange>,
    vault: Arc<CredentialVault>,
    policy: RiskPolicy,
    clock: &Arc<dyn Clock>,
    cycle: TradingCycle,
    profile: UserTradeProfile,
    decision: Arc<TradeDecision>,
) -> TradeOutcome {
    let pending = TradeOutcome::pending(cycle.id, profile.user_id, Some((*decision).clone()));

    let order = match policy.apply(&decision, &profile) {
        OrderPlan::Hold(reason) => {
            info!(user_id = profile.user_id, %reason, "Holding");
            return pending.held(clock.now());
        }
        OrderPlan::Execute(order) => order,
    };

    let request = OrderRequest {
        symbol: cycle.symbol.clone(),
        side: order.side,
        leverage: order.leverage,
        stop_loss: order.stop_loss,
        take_profit: order.take_profit,
        idempotency_key: cycle.idempotency_key(profile.user_id),
    };

    let submission = vault
        .with_decrypted(&profile, |creds| {
            let exchange = Arc::clone(&exchange);
            let request = request.clone();
            async move { exchange.place_order(&creds, &request).await }
        })
        .await;

    match submission {
        Ok(Ok(order_id)) => {
            info!(
                user_id = profile.user_id,
                order_id = %order_id,
                side = %request.side,
                leverage = request.leverage,
                "Order accepted"
            );
            pending.succeeded(decision.action, order.leverage, order_id, clock.now())
        }
        Ok(Err(e)) => {
            warn!(user_id = profile.user_id, error = %e, "Order submission failed");
            pending.failed(e, clock.now())
        }
        Err(e) => {
            warn!(user_id = profile.user_id, error = %e, "Credential decryption failed");
            pending.failed(e, clock.now())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
