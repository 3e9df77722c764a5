//! Bybit v5 order client.
//!
//! Signed REST calls per user: wallet-balance pre-check, last-price
//! lookup, and market IOC order creation. Request signing is
//! HMAC-SHA256 over `timestamp ‖ api_key ‖ recv_window ‖ payload`,
//! where payload is the sorted query string for GET and the exact JSON
//! body for POST — the signed string and the sent string are the same
//! bytes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Exchange, ExchangeError, OrderRequest};
use crate::types::OrderSide;
use crate::vault::ApiCredentials;

const WALLET_BALANCE_PATH: &str = "/v5/account/wallet-balance";
const TICKERS_PATH: &str = "/v5/market/tickers";
const ORDER_CREATE_PATH: &str = "/v5/order/create";

/// Fraction of available balance committed per order (safety margin).
const USABLE_BALANCE_FRACTION: Decimal = dec!(0.8);

/// Smallest order quantity step for spot pairs.
const QTY_DECIMALS: u32 = 6;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BybitExchange {
    http: Client,
    base_url: String,
    recv_window_ms: u64,
    min_available_balance: Decimal,
}

impl BybitExchange {
    pub fn new(
        base_url: &str,
        recv_window_ms: u64,
        min_available_balance: f64,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Bybit exchange HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            recv_window_ms,
            min_available_balance: Decimal::from_str(&min_available_balance.to_string())
                .unwrap_or(dec!(10)),
        })
    }

    /// HMAC-SHA256 over the v5 sign string, hex-encoded.
    fn sign(secret: &str, timestamp: i64, api_key: &str, recv_window: u64, payload: &str) -> String {
        let sign_string = format!("{timestamp}{api_key}{recv_window}{payload}");
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(sign_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Canonical query string for GET signing: keys sorted, values
    /// percent-encoded.
    fn query_string(params: &[(&str, &str)]) -> String {
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort_by_key(|(k, _)| *k);
        sorted
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Order quantity in base coin from the committed balance slice.
    fn order_qty(available: Decimal, price: Decimal) -> Decimal {
        if price.is_zero() {
            return Decimal::ZERO;
        }
        (available * USABLE_BALANCE_FRACTION / price).round_dp(QTY_DECIMALS)
    }

    fn map_transport(e: reqwest::Error) -> ExchangeError {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }

    async fn signed_get(
        &self,
        credentials: &ApiCredentials,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<ApiEnvelope, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis();
        let api_key = credentials.api_key.expose_secret();
        let query = Self::query_string(params);
        let signature = Self::sign(
            credentials.api_secret.expose_secret(),
            timestamp,
            api_key,
            self.recv_window_ms,
            &query,
        );

        let response = self
            .http
            .get(format!("{}{path}?{query}", self.base_url))
            .header("X-BAPI-API-KEY", api_key)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .send()
            .await
            .map_err(Self::map_transport)?;

        response.json().await.map_err(Self::map_transport)
    }

    async fn signed_post(
        &self,
        credentials: &ApiCredentials,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiEnvelope, ExchangeError> {
        let timestamp = Utc::now().timestamp_millis();
        let api_key = credentials.api_key.expose_secret();
        // Sign the exact bytes that go on the wire.
        let body_json = body.to_string();
        let signature = Self::sign(
            credentials.api_secret.expose_secret(),
            timestamp,
            api_key,
            self.recv_window_ms,
            &body_json,
        );

        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("X-BAPI-API-KEY", api_key)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("Content-Type", "application/json")
            .body(body_json)
            .send()
            .await
            .map_err(Self::map_transport)?;

        response.json().await.map_err(Self::map_transport)
    }

    /// Available USDT in the unified account.
    async fn available_balance(
        &self,
        credentials: &ApiCredentials,
    ) -> Result<Decimal, ExchangeError> {
        let envelope = self
            .signed_get(
                credentials,
                WALLET_BALANCE_PATH,
                &[("accountType", "UNIFIED")],
            )
            .await?;

        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        let available = envelope
            .result
            .as_ref()
            .and_then(|r| r.get("list"))
            .and_then(|l| l.as_array())
            .into_iter()
            .flatten()
            .filter_map(|wallet| wallet.get("coin").and_then(|c| c.as_array()))
            .flatten()
            .find(|coin| coin.get("coin").and_then(|c| c.as_str()) == Some("USDT"))
            .and_then(|coin| coin.get("availableToWithdraw"))
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);

        Ok(available)
    }

    /// Last traded price for the symbol (public endpoint).
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let response = self
            .http
            .get(format!("{}{TICKERS_PATH}", self.base_url))
            .query(&[("category", "spot"), ("symbol", symbol)])
            .send()
            .await
            .map_err(Self::map_transport)?;

        let envelope: ApiEnvelope = response.json().await.map_err(Self::map_transport)?;
        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        envelope
            .result
            .as_ref()
            .and_then(|r| r.get("list"))
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .and_then(|t| t.get("lastPrice"))
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .filter(|p| !p.is_zero())
            .ok_or_else(|| ExchangeError::Transport("no ticker price in response".to_string()))
    }

    /// Absolute trigger prices from fractional offsets, direction-aware.
    fn trigger_prices(
        price: Decimal,
        side: OrderSide,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> (Option<Decimal>, Option<Decimal>) {
        let frac = |f: f64| Decimal::from_str(&format!("{f:.6}")).unwrap_or(Decimal::ZERO);
        let sl = stop_loss.map(|f| match side {
            OrderSide::Buy => (price * (Decimal::ONE - frac(f))).round_dp(2),
            OrderSide::Sell => (price * (Decimal::ONE + frac(f))).round_dp(2),
        });
        let tp = take_profit.map(|f| match side {
            OrderSide::Buy => (price * (Decimal::ONE + frac(f))).round_dp(2),
            OrderSide::Sell => (price * (Decimal::ONE - frac(f))).round_dp(2),
        });
        (sl, tp)
    }
}

#[async_trait]
impl Exchange for BybitExchange {
    async fn place_order(
        &self,
        credentials: &ApiCredentials,
        order: &OrderRequest,
    ) -> Result<String, ExchangeError> {
        // Balance pre-check: refuse rather than let the venue reject.
        let available = self.available_balance(credentials).await?;
        if available < self.min_available_balance {
            return Err(ExchangeError::InsufficientBalance {
                available: available.to_string(),
                required: self.min_available_balance.to_string(),
            });
        }

        let price = self.last_price(&order.symbol).await?;
        let qty = Self::order_qty(available, price);
        if qty.is_zero() {
            return Err(ExchangeError::InsufficientBalance {
                available: available.to_string(),
                required: self.min_available_balance.to_string(),
            });
        }

        let (sl_price, tp_price) =
            Self::trigger_prices(price, order.side, order.stop_loss, order.take_profit);

        let mut body = json!({
            "category": "spot",
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "orderType": "Market",
            "qty": qty.to_string(),
            "timeInForce": "IOC",
            "orderLinkId": order.idempotency_key,
        });
        if let Some(sl) = sl_price {
            body["stopLoss"] = json!(sl.to_string());
        }
        if let Some(tp) = tp_price {
            body["takeProfit"] = json!(tp.to_string());
        }

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            qty = %qty,
            order_link_id = %order.idempotency_key,
            "Submitting order"
        );

        let envelope = self
            .signed_post(credentials, ORDER_CREATE_PATH, &body)
            .await?;

        if envelope.ret_code != 0 {
            warn!(
                code = envelope.ret_code,
                message = %envelope.ret_msg,
                "Order rejected by exchange"
            );
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        envelope
            .result
            .as_ref()
            .and_then(|r| r.get("orderId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Transport("no orderId in response".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_deterministic() {
        let a = BybitExchange::sign("secret", 1700000000000, "key", 5000, "a=1&b=2");
        let b = BybitExchange::sign("secret", 1700000000000, "key", 5000, "a=1&b=2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256
    }

    #[test]
    fn test_sign_varies_with_inputs() {
        let base = BybitExchange::sign("secret", 1700000000000, "key", 5000, "a=1");
        assert_ne!(
            base,
            BybitExchange::sign("other", 1700000000000, "key", 5000, "a=1")
        );
        assert_ne!(
            base,
            BybitExchange::sign("secret", 1700000000001, "key", 5000, "a=1")
        );
        assert_ne!(
            base,
            BybitExchange::sign("secret", 1700000000000, "key", 5000, "a=2")
        );
    }

    #[test]
    fn test_query_string_sorted_and_encoded() {
        let q = BybitExchange::query_string(&[("symbol", "BTCUSDT"), ("accountType", "UNIFIED")]);
        assert_eq!(q, "accountType=UNIFIED&symbol=BTCUSDT");

        let encoded = BybitExchange::query_string(&[("a", "x y")]);
        assert_eq!(encoded, "a=x%20y");
    }

    #[test]
    fn test_order_qty_rounding() {
        let qty = BybitExchange::order_qty(dec!(1000), dec!(42000));
        // 1000 * 0.8 / 42000 = 0.019047619..., rounded to 6 dp.
        assert_eq!(qty, dec!(0.019048));
    }

    #[test]
    fn test_order_qty_zero_price() {
        assert_eq!(BybitExchange::order_qty(dec!(1000), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_trigger_prices_direction() {
        let (sl, tp) =
            BybitExchange::trigger_prices(dec!(100), OrderSide::Buy, Some(0.05), Some(0.10));
        assert_eq!(sl, Some(dec!(95.00)));
        assert_eq!(tp, Some(dec!(110.00)));

        let (sl, tp) =
            BybitExchange::trigger_prices(dec!(100), OrderSide::Sell, Some(0.05), Some(0.10));
        assert_eq!(sl, Some(dec!(105.00)));
        assert_eq!(tp, Some(dec!(90.00)));
    }

    #[test]
    fn test_trigger_prices_absent() {
        let (sl, tp) = BybitExchange::trigger_prices(dec!(100), OrderSide::Buy, None, None);
        assert_eq!(sl, None);
        assert_eq!(tp, None);
    }
}
