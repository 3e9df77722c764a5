//! Cycle runner.
//!
//! Drives one trading cycle end to end: eligible-user snapshot →
//! candle window → one oracle call per distinct effective prompt →
//! per-user fan-out through the execution engine → terminal cycle
//! state. Grouping by effective prompt bounds oracle call volume to
//! the number of distinct prompts, not the number of users.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::executor::ExecutionEngine;
use super::scheduler::Clock;
use crate::ledger::TradeLedger;
use crate::llm::DecisionOracle;
use crate::market::{DataError, MarketDataSource};
use crate::types::{
    CycleReport, CycleStatus, OutcomeStatus, RiskContext, TradeAction, TradeDecision,
    TradeOutcome, TradingCycle, UserTradeProfile,
};
use crate::users::UserDirectory;

/// Cycle-level failure: the cycle aborts with zero per-user outcomes.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("all {0} decision group(s) failed; first error: {1}")]
    AllGroupsFailed(usize, String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Static parameters of the cycle loop.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub candle_count: u32,
    pub min_candles: usize,
    pub deadline: Duration,
    pub risk_context: RiskContext,
}

pub struct CycleRunner {
    market: Arc<dyn MarketDataSource>,
    oracle: Arc<dyn DecisionOracle>,
    directory: Arc<dyn UserDirectory>,
    executor: ExecutionEngine,
    ledger: Arc<TradeLedger>,
    clock: Arc<dyn Clock>,
    settings: CycleSettings,
}

impl CycleRunner {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        oracle: Arc<dyn DecisionOracle>,
        directory: Arc<dyn UserDirectory>,
        executor: ExecutionEngine,
        ledger: Arc<TradeLedger>,
        clock: Arc<dyn Clock>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            market,
            oracle,
            directory,
            executor,
            ledger,
            clock,
            settings,
        }
    }

    /// Run one cycle to a terminal state.
    ///
    /// On success the cycle is Completed with exactly one terminal
    /// outcome per eligible user; on a cycle-level failure it is
    /// Aborted with zero outcomes and the error is returned for
    /// operational monitoring.
    pub async fn run(&self, cycle: &mut TradingCycle) -> Result<CycleReport, CycleError> {
        info!(cycle_id = %cycle.id, symbol = %cycle.symbol, "Starting cycle");
        self.ledger.open_cycle(cycle).await?;

        match self.run_inner(cycle).await {
            Ok((outcomes, prompt_groups, users_total)) => {
                let finished = self.clock.now();
                cycle.finish(CycleStatus::Completed, finished);
                self.ledger
                    .close_cycle(cycle.id, CycleStatus::Completed, finished)
                    .await?;

                let succeeded = outcomes
                    .iter()
                    .filter(|o| {
                        o.status == OutcomeStatus::Success && o.action_applied != TradeAction::Hold
                    })
                    .count();
                let held = outcomes
                    .iter()
                    .filter(|o| {
                        o.status == OutcomeStatus::Success && o.action_applied == TradeAction::Hold
                    })
                    .count();
                let failed = outcomes
                    .iter()
                    .filter(|o| o.status == OutcomeStatus::Failed)
                    .count();

                Ok(CycleReport {
                    cycle_id: cycle.id,
                    status: cycle.status,
                    users_total,
                    prompt_groups,
                    succeeded,
                    held,
                    failed,
                    started_at: cycle.started_at,
                    finished_at: finished,
                })
            }
            Err(e) => {
                let finished = self.clock.now();
                cycle.finish(CycleStatus::Aborted, finished);
                if let Err(close_err) = self
                    .ledger
                    .close_cycle(cycle.id, CycleStatus::Aborted, finished)
                    .await
                {
                    error!(cycle_id = %cycle.id, error = %close_err, "Failed to mark cycle aborted");
                }
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        cycle: &TradingCycle,
    ) -> Result<(Vec<TradeOutcome>, usize, usize), CycleError> {
        // The deadline covers the whole cycle, decision phase included.
        let deadline = Instant::now() + self.settings.deadline;

        // 1. Snapshot eligible users. Settings changes after this point
        //    only affect later cycles.
        let profiles = self.directory.eligible_profiles().await?;
        if profiles.is_empty() {
            info!(cycle_id = %cycle.id, "No eligible users — cycle trivially complete");
            return Ok((Vec::new(), 0, 0));
        }
        let users_total = profiles.len();

        // 2. Market window.
        let window = self
            .market
            .get_candles(&cycle.symbol, &cycle.interval, self.settings.candle_count)
            .await?;
        if window.len() < self.settings.min_candles {
            return Err(DataError::WindowTooShort {
                got: window.len(),
                need: self.settings.min_candles,
            }
            .into());
        }
        info!(
            cycle_id = %cycle.id,
            candles = window.len(),
            change_pct = format!("{:+.2}%", window.price_change_pct()),
            "Market window fetched"
        );

        // 3. Group users by effective prompt; one oracle call per group.
        let groups = group_by_prompt(profiles);
        let prompt_groups = groups.len();

        let calls = groups.iter().map(|(prompt, _)| {
            self.oracle
                .decide(&window, &self.settings.risk_context, prompt.as_deref())
        });
        let results = join_all(calls).await;

        // 4. Every group failing is a cycle-level failure with zero
        //    per-user outcomes.
        if results.iter().all(|r| r.is_err()) {
            let first = results
                .iter()
                .find_map(|r| r.as_ref().err())
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(CycleError::AllGroupsFailed(prompt_groups, first));
        }

        // 5. Fan out: failed groups fail their members outright; the
        //    rest go through the execution engine.
        let mut outcomes = Vec::with_capacity(users_total);
        let mut assignments: Vec<(UserTradeProfile, Arc<TradeDecision>)> = Vec::new();

        for ((_prompt, members), result) in groups.into_iter().zip(results) {
            match result {
                Ok(decision) => {
                    info!(
                        cycle_id = %cycle.id,
                        action = %decision.action,
                        confidence = decision.confidence,
                        users = members.len(),
                        "Group decision received"
                    );
                    let shared = Arc::new(decision);
                    for profile in members {
                        assignments.push((profile, Arc::clone(&shared)));
                    }
                }
                Err(e) => {
                    warn!(
                        cycle_id = %cycle.id,
                        users = members.len(),
                        error = %e,
                        "Decision group failed"
                    );
                    for profile in members {
                        let outcome = TradeOutcome::pending(cycle.id, profile.user_id, None)
                            .failed(&e, self.clock.now());
                        if let Err(rec_err) = self.ledger.record(&outcome).await {
                            error!(
                                user_id = profile.user_id,
                                error = %rec_err,
                                "Failed to record group-failure outcome"
                            );
                        }
                        outcomes.push(outcome);
                    }
                }
            }
        }

        // 6. Per-user execution under the cycle deadline.
        let executed = self.executor.execute(cycle, assignments, deadline).await;
        outcomes.extend(executed);

        Ok((outcomes, prompt_groups, users_total))
    }
}

/// Group profiles by effective prompt: `None` is the default-prompt
/// group, `Some(p)` one group per distinct non-blank custom prompt.
fn group_by_prompt(
    profiles: Vec<UserTradeProfile>,
) -> Vec<(Option<String>, Vec<UserTradeProfile>)> {
    let mut groups: BTreeMap<Option<String>, Vec<UserTradeProfile>> = BTreeMap::new();
    for profile in profiles {
        let key = profile
            .custom_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        groups.entry(key).or_default().push(profile);
    }
    groups.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
