//! OpenAI GPT decision oracle.
//!
//! Implements the `DecisionOracle` trait against the Chat Completions
//! API with JSON response mode. Handles prompt construction, strict
//! response validation, and rate-limit retry with exponential backoff.
//! A response that is not one of the three enumerated actions, or whose
//! confidence does not parse as a number in [0, 1], is a schema
//! violation — never silently downgraded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{DecisionError, DecisionOracle};
use crate::types::{CandleWindow, RiskContext, TradeAction, TradeDecision};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_TOKENS: u32 = 500;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;

/// Candles included verbatim in the prompt (the full window is
/// summarised by the statistics block).
const PROMPT_CANDLE_TAIL: usize = 10;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenAiOracle {
    http: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    total_calls: std::sync::atomic::AtomicU64,
}

impl OpenAiOracle {
    pub fn new(
        api_key: String,
        model: Option<String>,
        max_tokens: Option<u32>,
        temperature: f64,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build OpenAI HTTP client")?;

        Ok(Self {
            http,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature,
            total_calls: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn call_api(&self, system: &str, user_message: &str) -> Result<String, DecisionError> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message.to_string(),
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying OpenAI API call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(OPENAI_API_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: ChatResponse = response.json().await.map_err(|e| {
                            DecisionError::Transport(format!("bad response body: {e}"))
                        })?;

                        self.total_calls
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                        let text = body
                            .choices
                            .first()
                            .and_then(|c| c.message.as_ref())
                            .map(|m| m.content.clone())
                            .unwrap_or_default();
                        return Ok(text);
                    }

                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, "Retryable OpenAI error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    return Err(DecisionError::Transport(format!(
                        "OpenAI API error {status}: {error_text}"
                    )));
                }
                Err(e) => {
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        Err(DecisionError::Transport(format!(
            "OpenAI API failed after {MAX_RETRIES} retries: {}",
            last_error.unwrap_or_default()
        )))
    }

    /// Build the system prompt describing the required output schema.
    pub fn system_prompt(risk: &RiskContext) -> String {
        format!(
            "You are a highly experienced cryptocurrency trader. Analyse the \
             provided candle chart data and produce a trade verdict.\n\n\
             Consider: technical indicators (RSI, MACD, Bollinger bands), \
             price patterns and trend, volume changes, support and \
             resistance levels, and market momentum.\n\n\
             Respond ONLY with a JSON object in exactly this shape:\n\
             {{\n\
             \x20 \"action\": \"buy\" | \"sell\" | \"hold\",\n\
             \x20 \"confidence\": 0.0-1.0,\n\
             \x20 \"leverage\": 1-{max_leverage},\n\
             \x20 \"stop_loss\": 0.01-{max_sl:.2},\n\
             \x20 \"take_profit\": 0.01-{max_tp:.2},\n\
             \x20 \"rationale\": \"detailed reasoning for the verdict\"\n\
             }}\n\n\
             Rules:\n\
             - Recommend hold when no clear signal exists.\n\
             - Confidence must honestly reflect the strength of the signal.\n\
             - Be conservative when signals conflict.",
            max_leverage = risk.max_leverage,
            max_sl = risk.max_stop_loss,
            max_tp = risk.max_take_profit,
        )
    }

    /// Build the user prompt: window statistics, the most recent
    /// candles, and any custom prompt appended at the end.
    pub fn build_user_prompt(window: &CandleWindow, prompt_override: Option<&str>) -> String {
        let mut prompt = String::with_capacity(2000);

        prompt.push_str(&format!(
            "MARKET: {} ({}m candles)\n",
            window.symbol, window.interval
        ));

        if let Some(close) = window.latest_close() {
            prompt.push_str(&format!("CURRENT PRICE: {close}\n"));
        }
        prompt.push_str(&format!(
            "PRICE CHANGE OVER WINDOW: {:+.2}%\n",
            window.price_change_pct()
        ));
        prompt.push_str(&format!("AVERAGE VOLUME: {}\n", window.avg_volume()));
        prompt.push_str(&format!("LATEST VOLUME: {}\n", window.latest_volume()));

        let tail_start = window.len().saturating_sub(PROMPT_CANDLE_TAIL);
        let tail: Vec<Value> = window.candles[tail_start..]
            .iter()
            .map(|c| {
                serde_json::json!({
                    "time": c.start_time.to_rfc3339(),
                    "open": c.open.to_string(),
                    "high": c.high.to_string(),
                    "low": c.low.to_string(),
                    "close": c.close.to_string(),
                    "volume": c.volume.to_string(),
                })
            })
            .collect();
        prompt.push_str(&format!(
            "\nMOST RECENT CANDLES ({} of {}):\n{}\n",
            tail.len(),
            window.len(),
            serde_json::to_string_pretty(&tail).unwrap_or_default()
        ));

        if let Some(custom) = prompt_override {
            prompt.push_str("\nADDITIONAL INSTRUCTIONS:\n");
            prompt.push_str(custom);
            prompt.push('\n');
        }

        prompt.push_str("\nAnalyse the data and return your verdict.\n");
        prompt
    }

    /// Parse and validate an oracle response into a `TradeDecision`.
    ///
    /// Strict by design: unknown action values or confidence outside
    /// [0, 1] are schema violations, not holds.
    pub fn parse_decision(text: &str) -> Result<TradeDecision, DecisionError> {
        let cleaned = strip_code_fences(text);
        let value: Value = serde_json::from_str(cleaned)
            .map_err(|e| DecisionError::Schema(format!("not valid JSON: {e}")))?;

        let action_str = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| DecisionError::Schema("missing action field".to_string()))?;
        let action: TradeAction = action_str
            .parse()
            .map_err(|_| DecisionError::Schema(format!("unknown action: {action_str}")))?;

        let confidence = number_field(&value, "confidence")?
            .ok_or_else(|| DecisionError::Schema("missing confidence field".to_string()))?;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(DecisionError::Schema(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }

        let suggested_leverage = number_field(&value, "leverage")?
            .map(|v| v.max(1.0) as u32)
            .unwrap_or(1);

        let rationale = value
            .get("rationale")
            .or_else(|| value.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(TradeDecision {
            action,
            confidence,
            suggested_leverage,
            stop_loss: number_field(&value, "stop_loss")?,
            take_profit: number_field(&value, "take_profit")?,
            rationale,
        })
    }
}

/// Extract a numeric field, accepting JSON numbers or numeric strings.
/// A present-but-non-numeric value is a schema violation.
fn number_field(value: &Value, key: &str) -> Result<Option<f64>, DecisionError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| DecisionError::Schema(format!("{key} is not a number: {s}"))),
        Some(other) => Err(DecisionError::Schema(format!(
            "{key} is not a number: {other}"
        ))),
    }
}

/// Models sometimes wrap the JSON in a markdown code fence even in
/// JSON mode.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    async fn decide<'a>(
        &self,
        window: &CandleWindow,
        risk: &RiskContext,
        prompt_override: Option<&'a str>,
    ) -> Result<TradeDecision, DecisionError> {
        let system = Self::system_prompt(risk);
        let user_msg = Self::build_user_prompt(window, prompt_override);

        debug!(
            symbol = %window.symbol,
            model = %self.model,
            custom_prompt = prompt_override.is_some(),
            "Requesting trade decision"
        );

        let text = self.call_api(&system, &user_msg).await?;
        let decision = Self::parse_decision(&text)?;

        debug!(
            action = %decision.action,
            confidence = decision.confidence,
            leverage = decision.suggested_leverage,
            "Decision received"
        );

        Ok(decision)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
