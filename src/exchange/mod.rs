//! Exchange integration.
//!
//! Defines the `Exchange` collaborator seam the execution engine
//! submits orders through, and provides the Bybit v5 implementation.
//! Credentials are per-user and arrive already decrypted, scoped by the
//! vault; the exchange client never stores them.

pub mod bybit;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::types::OrderSide;
use crate::vault::ApiCredentials;

/// User-scoped exchange failure. Recorded on that user's outcome; never
/// retried within the same cycle.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("exchange transport failure: {0}")]
    Transport(String),
    #[error("exchange request timed out")]
    Timeout,
    #[error("insufficient balance: {available} USDT available, {required} required")]
    InsufficientBalance { available: String, required: String },
}

/// One order submission, fully clamped by the risk policy.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub leverage: u32,
    /// Stop-loss as a fraction of entry price.
    pub stop_loss: Option<f64>,
    /// Take-profit as a fraction of entry price.
    pub take_profit: Option<f64>,
    /// Per-(cycle, user) token; resubmitting with the same key must not
    /// create a second order on the venue.
    pub idempotency_key: String,
}

/// Abstraction over the order-placement venue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Submit one order attempt. Returns the venue order id.
    async fn place_order(
        &self,
        credentials: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<String, ExchangeError>;
}
