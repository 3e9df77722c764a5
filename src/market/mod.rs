//! Market data integration.
//!
//! Defines the `MarketDataSource` collaborator seam the engine consumes
//! and provides the Bybit v5 kline implementation. The feed itself is
//! maintained elsewhere; the engine only ever asks for a window.

pub mod bybit;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::types::CandleWindow;

/// Cycle-level market data failure: the cycle aborts with zero
/// per-user outcomes.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("market data unavailable: {0}")]
    Unavailable(String),
    #[error("malformed candle data: {0}")]
    Parse(String),
    #[error("market window too short: got {got}, need {need}")]
    WindowTooShort { got: usize, need: usize },
    #[error("market data request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Abstraction over the candle feed.
///
/// Implementors return a window ordered by start time ascending.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        count: u32,
    ) -> Result<CandleWindow, DataError>;
}
