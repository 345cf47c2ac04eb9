// =============================================================================
// Exchange kline fetcher — OHLCV bars over REST
// =============================================================================
//
// Pulls closed candles from a Binance-compatible klines endpoint:
//
//   GET {base}/api/v3/klines?symbol=BTCUSDT&interval=15m&startTime=..&endTime=..
//
// The response is an array of arrays; numeric fields arrive as JSON strings
// and are parsed defensively. A bar whose close time is still in the future
// (the in-progress candle) is skipped so the store only ever sees final data.
// =============================================================================

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{FetchWindow, Fetcher};
use crate::errors::{fetch_error_from_reqwest, fetch_error_from_status, FetchError};
use crate::types::{Observation, Ohlcv};

/// Maximum bars per request accepted by the klines endpoint.
const MAX_LIMIT: u32 = 1000;

pub struct ExchangeOhlcvFetcher {
    client: reqwest::Client,
    base_url: String,
    symbol: String,
    /// Kline interval string, e.g. `15m`, `1h`.
    bar_interval: String,
    series_id: String,
}

impl ExchangeOhlcvFetcher {
    pub fn new(
        base_url: impl Into<String>,
        symbol: impl Into<String>,
        bar_interval: impl Into<String>,
        series_id: impl Into<String>,
        timeout_ms: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            symbol: symbol.into(),
            bar_interval: bar_interval.into(),
            series_id: series_id.into(),
        })
    }

    /// Parse one kline row. Numeric fields are JSON strings on the wire.
    fn parse_row(&self, row: &serde_json::Value, now_hint_ms: i64) -> Option<Observation> {
        let arr = row.as_array()?;
        let open_time = arr.first()?.as_i64()?;
        let close_time = arr.get(6)?.as_i64()?;

        // Skip the still-open bar.
        if close_time > now_hint_ms {
            return None;
        }

        let field = |i: usize| -> Option<f64> {
            let v = arr.get(i)?;
            match v {
                serde_json::Value::String(s) => s.parse().ok(),
                serde_json::Value::Number(n) => n.as_f64(),
                _ => None,
            }
        };

        let bar = Ohlcv {
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
        };

        Some(Observation::ohlcv(self.series_id.clone(), open_time, bar))
    }
}

#[async_trait]
impl Fetcher for ExchangeOhlcvFetcher {
    async fn fetch(&self, window: FetchWindow) -> Result<Vec<Observation>, FetchError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url, self.symbol, self.bar_interval, window.t_lo_ms, window.t_hi_ms, MAX_LIMIT
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(fetch_error_from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(fetch_error_from_status(status, &url));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::fatal(anyhow::anyhow!("klines body is not JSON: {e}")))?;

        let rows = body.as_array().ok_or_else(|| {
            FetchError::fatal(anyhow::anyhow!("klines response is not an array"))
        })?;

        let mut observations = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in rows {
            match self.parse_row(row, window.t_hi_ms) {
                Some(ob) => observations.push(ob),
                None => skipped += 1,
            }
        }

        // A response where nothing parses means the contract changed.
        if observations.is_empty() && !rows.is_empty() && skipped == rows.len() && rows.len() > 1 {
            return Err(FetchError::fatal(anyhow::anyhow!(
                "no parsable bars in {} kline rows from {url}",
                rows.len()
            )));
        }

        if skipped > 1 {
            warn!(
                symbol = %self.symbol,
                skipped,
                "some kline rows were unparsable or still open"
            );
        }

        debug!(
            symbol = %self.symbol,
            bars = observations.len(),
            t_lo = window.t_lo_ms,
            t_hi = window.t_hi_ms,
            "klines fetched"
        );
        Ok(observations)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> ExchangeOhlcvFetcher {
        ExchangeOhlcvFetcher::new(
            "https://api.example.com",
            "BTCUSDT",
            "15m",
            "bitcoin:ohlcv",
            5_000,
        )
        .unwrap()
    }

    fn kline_row(open_time: i64, close: &str, close_time: i64) -> serde_json::Value {
        serde_json::json!([
            open_time,
            "100.0",
            "101.0",
            "99.0",
            close,
            "12.5",
            close_time,
            "1250.0",
            42,
            "6.0",
            "600.0",
            "0"
        ])
    }

    #[test]
    fn parses_closed_bar() {
        let f = fetcher();
        let row = kline_row(1_000, "100.5", 899_999);
        let ob = f.parse_row(&row, 900_000).unwrap();

        assert_eq!(ob.series_id, "bitcoin:ohlcv");
        assert_eq!(ob.timestamp_ms, 1_000);
        match ob.payload {
            crate::types::ObservationPayload::Ohlcv(bar) => {
                assert_eq!(bar.close, 100.5);
                assert_eq!(bar.volume, 12.5);
            }
            _ => panic!("expected OHLCV payload"),
        }
    }

    #[test]
    fn skips_open_bar() {
        let f = fetcher();
        // Close time beyond the window's upper bound: still in progress.
        let row = kline_row(900_000, "100.5", 1_799_999);
        assert!(f.parse_row(&row, 1_000_000).is_none());
    }

    #[test]
    fn rejects_garbage_row() {
        let f = fetcher();
        assert!(f.parse_row(&serde_json::json!({"not": "an array"}), 0).is_none());
        assert!(f
            .parse_row(&serde_json::json!([1000, "x", "y", "z", "w", "v", 2000]), 900_000)
            .is_none());
    }
}
