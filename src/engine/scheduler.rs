//! Cycle scheduler.
//!
//! Guarantees at most one Running cycle system-wide. The single-flight
//! flag is the only piece of exclusive mutable state in the engine; it
//! is set atomically on start and cleared by the guard's drop, so every
//! exit path — success, error, panic unwind — releases it. Triggers
//! arriving while a cycle runs are skipped, not queued.
//!
//! The clock is injectable so cadence and cycle timestamps are testable
//! without real time passing.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::TradingCycle;

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Releases the single-flight flag when the cycle's execution scope
/// ends, however it ends.
pub struct CycleGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Result of a cycle trigger.
pub enum StartCycle {
    /// A fresh cycle was allocated; hold the guard for its lifetime.
    Started {
        cycle: TradingCycle,
        guard: CycleGuard,
    },
    /// A cycle is already running; this trigger is a no-op.
    Busy,
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    in_flight: Arc<AtomicBool>,
    symbol: String,
    interval: String,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, symbol: &str, interval: &str) -> Self {
        Self {
            clock,
            in_flight: Arc::new(AtomicBool::new(false)),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        }
    }

    /// Attempt to start a cycle. Skip-if-busy: a trigger during a
    /// Running cycle produces no new cycle and is not retried.
    pub fn try_start_cycle(&self) -> StartCycle {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Cycle trigger while a cycle is still running — skipping");
            return StartCycle::Busy;
        }

        let cycle = TradingCycle::new(&self.symbol, &self.interval, self.clock.now());
        info!(cycle_id = %cycle.id, started_at = %cycle.started_at, "Cycle allocated");

        StartCycle::Started {
            cycle,
            guard: CycleGuard {
                flag: Arc::clone(&self.in_flight),
            },
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
