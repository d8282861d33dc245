//! Fetch requests, raw payloads, and the market data source trait.
//!
//! The `MarketDataSource` trait abstracts over the upstream API so the pipeline
//! can be driven by a scripted source in tests.

use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Date format the upstream history endpoint expects.
pub const UPSTREAM_DATE_FORMAT: &str = "%d-%m-%Y";

/// Time scope of a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Point-in-time snapshot for one calendar day (`/coins/{id}/history`).
    DailySnapshot { date: NaiveDate },
    /// Latest rolling window of `days` days (`/coins/{id}/market_chart`).
    MarketChart { days: u32 },
}

/// One upstream request, built per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub asset_id: String,
    pub currency: String,
    pub window: Window,
}

impl FetchRequest {
    pub fn daily_snapshot(
        asset_id: impl Into<String>,
        currency: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            currency: currency.into(),
            window: Window::DailySnapshot { date },
        }
    }

    pub fn market_chart(
        asset_id: impl Into<String>,
        currency: impl Into<String>,
        days: u32,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            currency: currency.into(),
            window: Window::MarketChart { days },
        }
    }

    /// The requested calendar day, if this is a snapshot request.
    pub fn date(&self) -> Option<NaiveDate> {
        match self.window {
            Window::DailySnapshot { date } => Some(date),
            Window::MarketChart { .. } => None,
        }
    }

    /// Reject requests that would produce a malformed URL.
    pub fn validate(&self) -> Result<(), FetchError> {
        let valid_id = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        };
        if !valid_id(&self.asset_id) {
            return Err(FetchError::InvalidRequest(format!(
                "invalid asset id '{}'",
                self.asset_id
            )));
        }
        if !valid_id(&self.currency) {
            return Err(FetchError::InvalidRequest(format!(
                "invalid currency '{}'",
                self.currency
            )));
        }
        if let Window::MarketChart { days: 0 } = self.window {
            return Err(FetchError::InvalidRequest("days window must be at least 1".into()));
        }
        Ok(())
    }

    /// Endpoint path relative to the API base.
    pub fn path(&self) -> String {
        match self.window {
            Window::DailySnapshot { .. } => format!("coins/{}/history", self.asset_id),
            Window::MarketChart { .. } => format!("coins/{}/market_chart", self.asset_id),
        }
    }

    /// Query parameters for the endpoint.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        match self.window {
            Window::DailySnapshot { date } => vec![
                ("date", date.format(UPSTREAM_DATE_FORMAT).to_string()),
                ("localization", "false".to_string()),
            ],
            Window::MarketChart { days } => vec![
                ("vs_currency", self.currency.clone()),
                ("days", days.to_string()),
            ],
        }
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window {
            Window::DailySnapshot { date } => {
                write!(f, "{} snapshot on {date} ({})", self.asset_id, self.currency)
            }
            Window::MarketChart { days } => {
                write!(f, "{} market chart, {days}d ({})", self.asset_id, self.currency)
            }
        }
    }
}

/// `/coins/{id}/history` response. Only the fields we read are modelled.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SnapshotPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub market_data: Option<MarketData>,
}

/// Per-currency values nested under `market_data`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarketData {
    #[serde(default)]
    pub current_price: HashMap<String, Option<f64>>,
    #[serde(default)]
    pub market_cap: HashMap<String, Option<f64>>,
    #[serde(default)]
    pub total_volume: HashMap<String, Option<f64>>,
}

impl MarketData {
    pub fn is_empty(&self) -> bool {
        self.current_price.is_empty() && self.market_cap.is_empty() && self.total_volume.is_empty()
    }
}

/// A `[timestamp_ms, value]` pair. Nulls appear for gaps upstream.
pub type SeriesPoint = (i64, Option<f64>);

/// `/coins/{id}/market_chart` response: three independent series.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChartPayload {
    #[serde(default)]
    pub prices: Vec<SeriesPoint>,
    #[serde(default)]
    pub market_caps: Vec<SeriesPoint>,
    #[serde(default)]
    pub total_volumes: Vec<SeriesPoint>,
}

/// Decoded upstream response. Discarded after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Snapshot(SnapshotPayload),
    MarketChart(ChartPayload),
}

/// Network-level failure. Always retried within the fetch budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// The last thing that went wrong before the retry budget ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastFailure {
    Status { status: u16, body: String },
    Transport(String),
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastFailure::Status { status, body } if body.is_empty() => write!(f, "HTTP {status}"),
            LastFailure::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            LastFailure::Transport(msg) => f.write_str(msg),
        }
    }
}

/// Errors from the fetch step.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed after {attempts} attempt(s): {last}")]
    Upstream { attempts: u32, last: LastFailure },

    #[error("response format changed: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Trait for market data sources.
pub trait MarketDataSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Lightweight health check. `Ok(false)` for a non-2xx answer.
    fn ping(&self) -> Result<bool, TransportError>;

    /// Fetch and decode the payload for one request.
    fn fetch(&self, request: &FetchRequest) -> Result<Payload, FetchError>;
}
