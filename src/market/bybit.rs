//! Bybit v5 kline client.
//!
//! Public market-data endpoint, no authentication. Bybit returns kline
//! rows newest-first with every field as a string; this client parses
//! the rows into `Decimal` candles and normalises the ordering to
//! ascending before handing the window to the engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{DataError, MarketDataSource};
use crate::types::{Candle, CandleWindow};

const KLINE_PATH: &str = "/v5/market/kline";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BybitMarketData {
    http: Client,
    base_url: String,
}

impl BybitMarketData {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Bybit market data HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Parse Bybit kline rows (newest first) into an ascending window.
    fn window_from_rows(
        symbol: &str,
        interval: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<CandleWindow, DataError> {
        let mut candles = rows
            .into_iter()
            .map(parse_row)
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|c| c.start_time);

        Ok(CandleWindow {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            candles,
        })
    }
}

/// One kline row: [startTime, open, high, low, close, volume, turnover],
/// all strings.
fn parse_row(row: Vec<String>) -> Result<Candle, DataError> {
    if row.len() < 6 {
        return Err(DataError::Parse(format!(
            "kline row has {} fields, expected at least 6",
            row.len()
        )));
    }

    let millis: i64 = row[0]
        .parse()
        .map_err(|_| DataError::Parse(format!("bad kline timestamp: {}", row[0])))?;
    let start_time: DateTime<Utc> = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DataError::Parse(format!("kline timestamp out of range: {millis}")))?;

    let field = |i: usize, name: &str| -> Result<Decimal, DataError> {
        Decimal::from_str(&row[i])
            .map_err(|_| DataError::Parse(format!("bad kline {name}: {}", row[i])))
    };

    Ok(Candle {
        start_time,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
    })
}

#[async_trait]
impl MarketDataSource for BybitMarketData {
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        count: u32,
    ) -> Result<CandleWindow, DataError> {
        let url = format!("{}{KLINE_PATH}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("category", "spot"),
                ("symbol", symbol),
                ("interval", interval),
                ("limit", &count.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::Unavailable(format!("HTTP {status}")));
        }

        let body: KlineResponse = response.json().await?;
        if body.ret_code != 0 {
            return Err(DataError::Unavailable(format!(
                "retCode {}: {}",
                body.ret_code, body.ret_msg
            )));
        }

        let rows = body.result.map(|r| r.list).unwrap_or_default();
        let window = Self::window_from_rows(symbol, interval, rows)?;

        debug!(
            symbol,
            interval,
            count = window.len(),
            "Candle window fetched"
        );

        Ok(window)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: i64, close: &str) -> Vec<String> {
        vec![
            ts.to_string(),
            close.to_string(),
            close.to_string(),
            close.to_string(),
            close.to_string(),
            "123.4".to_string(),
            "0".to_string(),
        ]
    }

    #[test]
    fn test_parse_row() {
        let candle = parse_row(row(1700000000000, "42000.5")).unwrap();
        assert_eq!(candle.close, Decimal::from_str("42000.5").unwrap());
        assert_eq!(candle.start_time.timestamp_millis(), 1700000000000);
    }

    #[test]
    fn test_parse_row_rejects_short_row() {
        let result = parse_row(vec!["1700000000000".to_string(), "1".to_string()]);
        assert!(matches!(result, Err(DataError::Parse(_))));
    }

    #[test]
    fn test_parse_row_rejects_bad_number() {
        let mut bad = row(1700000000000, "42000");
        bad[4] = "not-a-price".to_string();
        assert!(matches!(parse_row(bad), Err(DataError::Parse(_))));
    }

    #[test]
    fn test_window_normalised_ascending() {
        // Bybit returns newest first.
        let rows = vec![
            row(1700000120000, "103"),
            row(1700000060000, "102"),
            row(1700000000000, "101"),
        ];
        let window = BybitMarketData::window_from_rows("BTCUSDT", "1", rows).unwrap();
        assert_eq!(window.len(), 3);
        assert!(window.is_ascending());
        assert_eq!(
            window.latest_close(),
            Some(Decimal::from_str("103").unwrap())
        );
    }

    #[test]
    fn test_empty_rows_give_empty_window() {
        let window = BybitMarketData::window_from_rows("BTCUSDT", "1", Vec::new()).unwrap();
        assert!(window.is_empty());
    }
}
