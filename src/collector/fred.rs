// =============================================================================
// Macro indicator fetcher — daily scalar series over REST
// =============================================================================
//
// Pulls daily observations from a FRED-compatible endpoint:
//
//   GET {base}/fred/series/observations?series_id=VIXCLS
//       &observation_start=YYYY-MM-DD&observation_end=YYYY-MM-DD
//       &file_type=json&api_key=...
//
// FRED reports missing data points as the literal string "." — those are
// skipped, not treated as zero. Dates are normalised to UTC-midnight epoch
// milliseconds at ingress.
// =============================================================================

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use super::{FetchWindow, Fetcher};
use crate::errors::{fetch_error_from_reqwest, fetch_error_from_status, FetchError};
use crate::types::Observation;

pub struct FredScalarFetcher {
    client: reqwest::Client,
    base_url: String,
    /// Provider-side series code, e.g. `VIXCLS`.
    fred_series: String,
    api_key: String,
    series_id: String,
}

impl FredScalarFetcher {
    pub fn new(
        base_url: impl Into<String>,
        fred_series: impl Into<String>,
        api_key: impl Into<String>,
        series_id: impl Into<String>,
        timeout_ms: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            fred_series: fred_series.into(),
            api_key: api_key.into(),
            series_id: series_id.into(),
        })
    }

    fn parse_observation(&self, row: &serde_json::Value) -> Option<Observation> {
        let date_str = row.get("date")?.as_str()?;
        let value_str = row.get("value")?.as_str()?;

        if value_str == "." {
            return None; // FRED's marker for a missing data point
        }
        let value: f64 = value_str.parse().ok()?;

        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()?;
        let timestamp_ms = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();

        Some(Observation::scalar(self.series_id.clone(), timestamp_ms, value))
    }
}

#[async_trait]
impl Fetcher for FredScalarFetcher {
    async fn fetch(&self, window: FetchWindow) -> Result<Vec<Observation>, FetchError> {
        let start = ms_to_date(window.t_lo_ms);
        let end = ms_to_date(window.t_hi_ms);
        let url = format!(
            "{}/fred/series/observations?series_id={}&observation_start={}&observation_end={}\
             &file_type=json&api_key={}",
            self.base_url, self.fred_series, start, end, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(fetch_error_from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            // Redact the api key from anything that ends up in logs.
            let redacted = format!(
                "{}/fred/series/observations?series_id={}",
                self.base_url, self.fred_series
            );
            return Err(fetch_error_from_status(status, &redacted));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::fatal(anyhow::anyhow!("FRED body is not JSON: {e}")))?;

        let rows = body
            .get("observations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                FetchError::fatal(anyhow::anyhow!(
                    "FRED response missing 'observations' array for {}",
                    self.fred_series
                ))
            })?;

        let observations: Vec<Observation> = rows
            .iter()
            .filter_map(|row| self.parse_observation(row))
            .collect();

        debug!(
            series = %self.fred_series,
            points = observations.len(),
            "macro observations fetched"
        );
        Ok(observations)
    }
}

fn ms_to_date(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}
