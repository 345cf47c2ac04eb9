// =============================================================================
// Observation Store — append-only SQLite persistence with dedup
// =============================================================================
//
// Two tables, routed by series id: `ohlcv` for asset bars (`bitcoin:ohlcv`)
// and `macro_observations` for scalar indicators (`macro:VIX`). The primary
// keys make `put` idempotent: re-inserting an existing `(series, timestamp)`
// row is a silent no-op and does not count toward the returned insert count.
//
// WAL mode lets the health endpoint and the strategy runner read while a
// collector worker writes. All writers serialise on one connection guarded by
// a parking_lot Mutex; every `put` is a single transaction (all-or-nothing).
// =============================================================================

pub mod task_state;

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::types::{macro_indicator, macro_series, Observation, ObservationPayload, Ohlcv};

/// Per-series health summary.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesHealth {
    pub count: u64,
    pub latest_ts: i64,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ohlcv (
    series_id     TEXT    NOT NULL,
    timestamp_ms  INTEGER NOT NULL,
    open          REAL    NOT NULL,
    high          REAL    NOT NULL,
    low           REAL    NOT NULL,
    close         REAL    NOT NULL,
    volume        REAL    NOT NULL,
    inserted_at   INTEGER NOT NULL,
    PRIMARY KEY (series_id, timestamp_ms)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS macro_observations (
    indicator     TEXT    NOT NULL,
    date_yyyymmdd INTEGER NOT NULL,
    value         REAL    NOT NULL,
    timestamp_ms  INTEGER NOT NULL,
    inserted_at   INTEGER NOT NULL,
    PRIMARY KEY (indicator, date_yyyymmdd)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS task_state (
    task_id              TEXT    PRIMARY KEY,
    tier                 TEXT    NOT NULL,
    interval_ms          INTEGER NOT NULL,
    last_run_ms          INTEGER NOT NULL,
    last_success_ms      INTEGER NOT NULL,
    consecutive_failures INTEGER NOT NULL,
    disabled_until_ms    INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Current on-disk schema version, recorded in the metadata table.
const SCHEMA_VERSION: i64 = 1;

/// Durable observation and task-state store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "observation store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_millis(2_000))?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert a batch of observations atomically.
    ///
    /// Existing `(series, timestamp)` rows are silently skipped. Returns the
    /// number of rows actually inserted. Either the whole batch lands or (on
    /// failure) none of it does.
    pub fn put(&self, observations: &[Observation]) -> Result<usize, StoreError> {
        if observations.is_empty() {
            return Ok(0);
        }

        // Validate the whole batch before touching the database so a rejected
        // record cannot leave a partial insert behind.
        for ob in observations {
            validate_observation(ob)?;
        }

        let mut conn = self.conn.lock();
        let now_ms = Utc::now().timestamp_millis();
        let tx = conn.transaction().map_err(StoreError::from)?;

        let mut inserted = 0usize;
        for ob in observations {
            let n = match &ob.payload {
                ObservationPayload::Ohlcv(bar) => tx.execute(
                    "INSERT OR IGNORE INTO ohlcv
                     (series_id, timestamp_ms, open, high, low, close, volume, inserted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        ob.series_id,
                        ob.timestamp_ms,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        now_ms
                    ],
                )?,
                ObservationPayload::Scalar { value } => {
                    let indicator = macro_indicator(&ob.series_id)
                        .expect("validate_observation enforces the macro: prefix");
                    tx.execute(
                        "INSERT OR IGNORE INTO macro_observations
                         (indicator, date_yyyymmdd, value, timestamp_ms, inserted_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            indicator,
                            date_key(ob.timestamp_ms),
                            value,
                            ob.timestamp_ms,
                            now_ms
                        ],
                    )?
                }
            };
            inserted += n;
        }

        tx.commit().map_err(StoreError::from)?;
        debug!(
            batch = observations.len(),
            inserted, "observation batch committed"
        );
        Ok(inserted)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Newest timestamp for a series, or `None` if the series is empty.
    pub fn latest_timestamp(&self, series_id: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let ts: Option<i64> = match macro_indicator(series_id) {
            Some(indicator) => conn.query_row(
                "SELECT MAX(timestamp_ms) FROM macro_observations WHERE indicator = ?1",
                params![indicator],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT MAX(timestamp_ms) FROM ohlcv WHERE series_id = ?1",
                params![series_id],
                |row| row.get(0),
            )?,
        };
        Ok(ts)
    }

    /// All observations for `series_id` with `t_lo <= timestamp <= t_hi`,
    /// strictly increasing by timestamp.
    pub fn range(
        &self,
        series_id: &str,
        t_lo: i64,
        t_hi: i64,
    ) -> Result<Vec<Observation>, StoreError> {
        let conn = self.conn.lock();

        if let Some(indicator) = macro_indicator(series_id) {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp_ms, value FROM macro_observations
                 WHERE indicator = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
                 ORDER BY timestamp_ms ASC",
            )?;
            let rows = stmt.query_map(params![indicator, t_lo, t_hi], |row| {
                Ok(Observation::scalar(
                    macro_series(indicator),
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp_ms, open, high, low, close, volume FROM ohlcv
                 WHERE series_id = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
                 ORDER BY timestamp_ms ASC",
            )?;
            let rows = stmt.query_map(params![series_id, t_lo, t_hi], |row| {
                Ok(Observation::ohlcv(
                    series_id,
                    row.get::<_, i64>(0)?,
                    Ohlcv {
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                    },
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        }
    }

    /// Per-series counts and freshness across both tables.
    pub fn health(&self) -> Result<HashMap<String, SeriesHealth>, StoreError> {
        let conn = self.conn.lock();
        let mut out = HashMap::new();

        let mut stmt = conn.prepare_cached(
            "SELECT series_id, COUNT(*), MAX(timestamp_ms) FROM ohlcv GROUP BY series_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (series, count, latest_ts) = row?;
            out.insert(series, SeriesHealth { count, latest_ts });
        }

        let mut stmt = conn.prepare_cached(
            "SELECT indicator, COUNT(*), MAX(timestamp_ms) FROM macro_observations
             GROUP BY indicator",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (indicator, count, latest_ts) = row?;
            out.insert(macro_series(&indicator), SeriesHealth { count, latest_ts });
        }

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Ingress validation
// ---------------------------------------------------------------------------

/// Reject malformed observations at the store boundary: empty series ids,
/// non-positive timestamps, non-finite values, and scalar payloads outside
/// the `macro:` namespace.
fn validate_observation(ob: &Observation) -> Result<(), StoreError> {
    if ob.series_id.is_empty() {
        return Err(StoreError::fatal(anyhow::anyhow!("empty series_id")));
    }
    if ob.timestamp_ms <= 0 {
        return Err(StoreError::fatal(anyhow::anyhow!(
            "non-positive timestamp {} for series {}",
            ob.timestamp_ms,
            ob.series_id
        )));
    }
    match &ob.payload {
        ObservationPayload::Ohlcv(bar) => {
            if macro_indicator(&ob.series_id).is_some() {
                return Err(StoreError::fatal(anyhow::anyhow!(
                    "OHLCV payload on macro series {}",
                    ob.series_id
                )));
            }
            let fields = [bar.open, bar.high, bar.low, bar.close, bar.volume];
            if fields.iter().any(|v| !v.is_finite()) {
                return Err(StoreError::fatal(anyhow::anyhow!(
                    "non-finite OHLCV value for series {} at {}",
                    ob.series_id,
                    ob.timestamp_ms
                )));
            }
        }
        ObservationPayload::Scalar { value } => {
            if macro_indicator(&ob.series_id).is_none() {
                return Err(StoreError::fatal(anyhow::anyhow!(
                    "scalar payload on non-macro series {}",
                    ob.series_id
                )));
            }
            if !value.is_finite() {
                return Err(StoreError::fatal(anyhow::anyhow!(
                    "non-finite value for series {} at {}",
                    ob.series_id,
                    ob.timestamp_ms
                )));
            }
        }
    }
    Ok(())
}

/// `yyyymmdd` integer key for the macro table, derived from the (UTC)
/// observation timestamp.
fn date_key(timestamp_ms: i64) -> i64 {
    let date: NaiveDate = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.date_naive())
        .unwrap_or_default();
    date.format("%Y%m%d").to_string().parse().unwrap_or(0)
}
