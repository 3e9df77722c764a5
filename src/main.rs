//! AUTOPILOT — Multi-tenant automated trading engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the SQLite store, and runs the scheduled
//! decide-and-execute loop with graceful shutdown.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use autopilot::api::{self, routes::ApiState};
use autopilot::config::AppConfig;
use autopilot::engine::{
    Clock, CycleRunner, CycleSettings, ExecutionEngine, Scheduler, StartCycle, SystemClock,
};
use autopilot::exchange::bybit::BybitExchange;
use autopilot::ledger::TradeLedger;
use autopilot::llm::openai::OpenAiOracle;
use autopilot::market::bybit::BybitMarketData;
use autopilot::risk::RiskPolicy;
use autopilot::types::{CycleReport, RiskContext};
use autopilot::users::SqliteUserDirectory;
use autopilot::vault::CredentialVault;

const BANNER: &str = r#"
    _   _   _ _____ ___  ____ ___ _     ___ _____
   / \ | | | |_   _/ _ \|  _ \_ _| |   / _ \_   _|
  / _ \| | | | | || | | | |_) | || |  | | | || |
 / ___ \ |_| | | || |_| |  __/| || |__| |_| || |
/_/   \_\___/  |_| \___/|_|  |___|_____\___/ |_|

  Multi-Tenant Automated Trading Engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        symbol = %cfg.engine.symbol,
        interval = %cfg.engine.interval,
        cycle_interval_secs = cfg.engine.cycle_interval_secs,
        testnet = cfg.exchange.testnet,
        "AUTOPILOT starting up"
    );

    // -- Storage ---------------------------------------------------------

    let connect_options = sqlx::sqlite::SqliteConnectOptions::from_str(&cfg.database.url)
        .context("Invalid database URL")?
        .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect_with(connect_options)
        .await
        .context("Failed to open SQLite database")?;

    let ledger = Arc::new(TradeLedger::new(pool.clone()));
    ledger.migrate().await?;

    let directory = Arc::new(SqliteUserDirectory::new(pool));
    directory.migrate().await?;

    // -- Initialise components -------------------------------------------

    let vault_passphrase = AppConfig::resolve_env(&cfg.vault.passphrase_env)?;
    let vault = Arc::new(CredentialVault::new(&vault_passphrase));

    let market = Arc::new(BybitMarketData::new(
        &cfg.market.base_url,
        Duration::from_secs(cfg.market.request_timeout_secs),
    )?);

    let oracle_key = std::env::var(&cfg.oracle.api_key_env).unwrap_or_default();
    if oracle_key.is_empty() {
        warn!(
            env = %cfg.oracle.api_key_env,
            "No oracle API key configured — decision calls will fail and cycles will abort"
        );
    }
    let oracle = Arc::new(OpenAiOracle::new(
        oracle_key,
        Some(cfg.oracle.model.clone()),
        Some(cfg.oracle.max_tokens),
        cfg.oracle.temperature,
        Duration::from_secs(cfg.oracle.request_timeout_secs),
    )?);
    info!(model = %cfg.oracle.model, "Using OpenAI decision oracle");

    let exchange = Arc::new(BybitExchange::new(
        cfg.exchange.effective_url(),
        cfg.exchange.recv_window_ms,
        cfg.exchange.min_available_balance,
        Duration::from_secs(cfg.exchange.order_timeout_secs),
    )?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = RiskPolicy::from_settings(&cfg.risk);
    let risk_context = RiskContext {
        max_leverage: cfg.risk.max_leverage,
        max_stop_loss: cfg.risk.max_stop_loss,
        max_take_profit: cfg.risk.max_take_profit,
    };

    let executor = ExecutionEngine::new(
        exchange,
        Arc::clone(&vault),
        policy,
        Arc::clone(&ledger),
        Arc::clone(&clock),
        cfg.engine.max_in_flight_orders,
    );

    let runner = Arc::new(CycleRunner::new(
        market,
        oracle,
        Arc::clone(&directory) as _,
        executor,
        Arc::clone(&ledger),
        Arc::clone(&clock),
        CycleSettings {
            candle_count: cfg.engine.candle_count,
            min_candles: cfg.engine.min_candles as usize,
            deadline: Duration::from_secs(cfg.engine.cycle_deadline_secs),
            risk_context,
        },
    ));

    let scheduler = Scheduler::new(Arc::clone(&clock), &cfg.engine.symbol, &cfg.engine.interval);

    // -- API surface -----------------------------------------------------

    let api_state = Arc::new(ApiState::new(Arc::clone(&ledger), Arc::clone(&directory)));
    if cfg.api.enabled {
        api::spawn_api(Arc::clone(&api_state), cfg.api.port)?;
    }

    // -- Main loop -------------------------------------------------------

    let cycle_interval = Duration::from_secs(cfg.engine.cycle_interval_secs);
    let mut interval = tokio::time::interval(cycle_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.engine.cycle_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scheduler.try_start_cycle() {
                    StartCycle::Busy => {
                        let mut status = api_state.status.write().await;
                        status.cycles_skipped += 1;
                    }
                    StartCycle::Started { mut cycle, guard } => {
                        let runner = Arc::clone(&runner);
                        let api_state = Arc::clone(&api_state);
                        tokio::spawn(async move {
                            let result = runner.run(&mut cycle).await;
                            // The guard lives until the cycle is terminal.
                            drop(guard);

                            let mut status = api_state.status.write().await;
                            status.cycles_run += 1;
                            match result {
                                Ok(report) => {
                                    log_cycle_report(&report);
                                    status.last_report = Some(report);
                                    status.last_error = None;
                                }
                                Err(e) => {
                                    error!(cycle_id = %cycle.id, error = %e, "Cycle aborted — continuing to next");
                                    status.last_error = Some(e.to_string());
                                }
                            }
                        });
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("AUTOPILOT shut down cleanly.");
    Ok(())
}

/// Log a human-readable cycle summary.
fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle_id = %report.cycle_id,
        status = %report.status,
        users = report.users_total,
        groups = report.prompt_groups,
        succeeded = report.succeeded,
        held = report.held,
        failed = report.failed,
        duration_secs = (report.finished_at - report.started_at).num_seconds(),
        "Cycle complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("autopilot=info"));

    let json_logging = std::env::var("AUTOPILOT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
