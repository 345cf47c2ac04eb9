// =============================================================================
// Error taxonomy — transient vs fatal, everywhere
// =============================================================================
//
// Every failure that reaches the scheduler is tagged: transient failures feed
// the backoff machinery, fatal failures park the task until an operator
// intervenes. Nothing in the pipeline converts one into the other implicitly.
// =============================================================================

use thiserror::Error;

// ---------------------------------------------------------------------------
// Fetch errors
// ---------------------------------------------------------------------------

/// Outcome classification for a collector fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network hiccup, timeout, 5xx, 429 — retried via scheduler backoff.
    #[error("transient fetch failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Permanent condition (401/403, schema mismatch) — disables the task
    /// until operator intervention.
    #[error("fatal fetch failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl FetchError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Classify an HTTP status into a fetch error.
///
/// 429 and all 5xx are transient (the provider will recover); 401/403 mean a
/// credential or permission problem no retry can fix; every other non-success
/// status is treated as a contract mismatch and therefore fatal.
pub fn fetch_error_from_status(status: reqwest::StatusCode, url: &str) -> FetchError {
    let err = anyhow::anyhow!("{url} returned {status}");
    if status.as_u16() == 429 || status.is_server_error() {
        FetchError::Transient(err)
    } else {
        FetchError::Fatal(err)
    }
}

/// Classify a reqwest transport error. Connection and timeout problems are
/// transient; anything else (bad URL, body decode) is fatal.
pub fn fetch_error_from_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchError::Transient(err.into())
    } else {
        FetchError::Fatal(err.into())
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failure from the observation / task-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock contention or a busy database — safe to retry.
    #[error("transient store failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Corruption, disk full, rejected input — propagates to the scheduler,
    /// which pauses the task.
    #[error("fatal store failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl StoreError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::Transient(err.into())
            }
            _ => Self::Fatal(err.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation errors
// ---------------------------------------------------------------------------

/// Configuration inconsistency detected when the aggregator is built.
/// Fails the process at startup; never raised mid-run.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("strategy '{0}' is enabled but has no configured weight")]
    MissingWeight(String),

    #[error("weight configured for unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("weight for strategy '{0}' must be positive, got {1}")]
    NonPositiveWeight(String, f64),

    #[error("invalid aggregation parameter: {0}")]
    InvalidParameter(String),
}
