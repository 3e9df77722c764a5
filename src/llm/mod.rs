//! LLM integration for trade decisions.
//!
//! Defines the `DecisionOracle` trait and provides the OpenAI
//! chat-completions implementation. The oracle is a pure
//! request/response seam: window, risk envelope, and prompt are passed
//! explicitly, which keeps it mockable in tests.

pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::types::{CandleWindow, RiskContext, TradeDecision};

/// Prompt-group-level failure. Fails every user in the group's outcome;
/// the cycle aborts only when every group fails.
#[derive(Debug, Clone, Error)]
pub enum DecisionError {
    #[error("oracle transport failure: {0}")]
    Transport(String),
    #[error("oracle response violates schema: {0}")]
    Schema(String),
}

/// Abstraction over the external reasoning oracle.
///
/// Implementors turn a market window plus prompt into a validated
/// structured decision. One call serves every user sharing the same
/// effective prompt.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide<'a>(
        &self,
        window: &CandleWindow,
        risk: &RiskContext,
        prompt_override: Option<&'a str>,
    ) -> Result<TradeDecision, DecisionError>;

    /// Model identifier string.
    fn model_name(&self) -> &str;
}
