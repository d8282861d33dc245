//! Payload normalization.
//!
//! Turns a snapshot or the three market chart series into one time-indexed,
//! ascending, de-duplicated record set rounded to 3 decimals. Pure: no I/O.
//!
//! "No data" is not an error here. It comes back as [`Normalized::Empty`] with
//! the reason, and the caller decides whether that fails the run.

use super::provider::{ChartPayload, FetchRequest, Payload, SeriesPoint, SnapshotPayload};
use super::schema::NormalizedRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Decimal places kept on every numeric field.
pub const DECIMALS: i32 = 3;

/// How the three market chart series are joined on timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignPolicy {
    /// Keep timestamps present in all three series, report the rest.
    #[default]
    Inner,
    /// Any mismatch between the timestamp sets is an error.
    Strict,
}

impl std::str::FromStr for AlignPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inner" => Ok(AlignPolicy::Inner),
            "strict" => Ok(AlignPolicy::Strict),
            other => Err(format!("unknown align policy '{other}' (expected inner or strict)")),
        }
    }
}

/// Missing or partial upstream data. Logged, never fatal to normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataQualityWarning {
    MissingMarketData,
    MissingField { field: &'static str, currency: String },
    EmptySeries,
    NoAlignedTimestamps,
    DroppedTimestamps { count: usize },
}

impl fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMarketData => f.write_str("no market data found in the response"),
            Self::MissingField { field, currency } => {
                write!(f, "market data has no '{field}' value for currency '{currency}'")
            }
            Self::EmptySeries => f.write_str("market chart series are empty"),
            Self::NoAlignedTimestamps => {
                f.write_str("no timestamp is present in all three market chart series")
            }
            Self::DroppedTimestamps { count } => write!(
                f,
                "{count} timestamp(s) dropped: not present in all three market chart series"
            ),
        }
    }
}

/// Outcome of normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Populated {
        records: Vec<NormalizedRecord>,
        warnings: Vec<DataQualityWarning>,
    },
    Empty(DataQualityWarning),
}

impl Normalized {
    pub fn records(&self) -> &[NormalizedRecord] {
        match self {
            Normalized::Populated { records, .. } => records,
            Normalized::Empty(_) => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Normalized::Empty(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error(
        "market chart series are misaligned: {prices} prices, {market_caps} market caps, \
         {total_volumes} volumes, {common} common timestamps"
    )]
    Misaligned {
        prices: usize,
        market_caps: usize,
        total_volumes: usize,
        common: usize,
    },

    #[error("timestamp out of range: {0} ms")]
    InvalidTimestamp(i64),

    #[error("snapshot payload requires a dated request, got: {0}")]
    MissingDate(String),
}

/// Round half to even at [`DECIMALS`] places.
pub fn round_value(value: f64) -> f64 {
    let scale = 10f64.powi(DECIMALS);
    (value * scale).round_ties_even() / scale
}

/// Normalize one payload for the request that produced it.
pub fn normalize(
    payload: &Payload,
    request: &FetchRequest,
    policy: AlignPolicy,
) -> Result<Normalized, NormalizeError> {
    match payload {
        Payload::Snapshot(snapshot) => {
            let date = request
                .date()
                .ok_or_else(|| NormalizeError::MissingDate(request.to_string()))?;
            Ok(normalize_snapshot(snapshot, date, &request.currency))
        }
        Payload::MarketChart(chart) => normalize_chart(chart, policy),
    }
}

/// Single snapshot → one record at 00:00:00 UTC on `date`.
pub fn normalize_snapshot(payload: &SnapshotPayload, date: NaiveDate, currency: &str) -> Normalized {
    let market_data = match &payload.market_data {
        Some(md) if !md.is_empty() => md,
        _ => return Normalized::Empty(DataQualityWarning::MissingMarketData),
    };

    let pick = |series: &std::collections::HashMap<String, Option<f64>>, field: &'static str| {
        series
            .get(currency)
            .copied()
            .flatten()
            .ok_or_else(|| DataQualityWarning::MissingField {
                field,
                currency: currency.to_string(),
            })
    };

    let values = pick(&market_data.current_price, "current_price").and_then(|price| {
        let cap = pick(&market_data.market_cap, "market_cap")?;
        let volume = pick(&market_data.total_volume, "total_volume")?;
        Ok((price, cap, volume))
    });

    match values {
        Ok((price, cap, volume)) => Normalized::Populated {
            records: vec![NormalizedRecord::new(
                date.and_time(chrono::NaiveTime::MIN).and_utc(),
                round_value(price),
                round_value(cap),
                round_value(volume),
            )],
            warnings: Vec::new(),
        },
        Err(warning) => Normalized::Empty(warning),
    }
}

/// Three series → records joined on timestamp per `policy`.
pub fn normalize_chart(
    payload: &ChartPayload,
    policy: AlignPolicy,
) -> Result<Normalized, NormalizeError> {
    let prices = index_series(&payload.prices);
    let caps = index_series(&payload.market_caps);
    let volumes = index_series(&payload.total_volumes);

    if prices.is_empty() && caps.is_empty() && volumes.is_empty() {
        return Ok(Normalized::Empty(DataQualityWarning::EmptySeries));
    }

    let common: Vec<i64> = prices
        .keys()
        .filter(|ts| caps.contains_key(ts) && volumes.contains_key(ts))
        .copied()
        .collect();

    let union: BTreeSet<i64> = prices
        .keys()
        .chain(caps.keys())
        .chain(volumes.keys())
        .copied()
        .collect();
    let dropped = union.len() - common.len();

    if policy == AlignPolicy::Strict && dropped > 0 {
        return Err(NormalizeError::Misaligned {
            prices: prices.len(),
            market_caps: caps.len(),
            total_volumes: volumes.len(),
            common: common.len(),
        });
    }

    if common.is_empty() {
        return Ok(Normalized::Empty(DataQualityWarning::NoAlignedTimestamps));
    }

    let records = common
        .iter()
        .map(|&ts| {
            let timestamp = DateTime::<Utc>::from_timestamp_millis(ts)
                .ok_or(NormalizeError::InvalidTimestamp(ts))?;
            Ok(NormalizedRecord::new(
                timestamp,
                round_value(prices[&ts]),
                round_value(caps[&ts]),
                round_value(volumes[&ts]),
            ))
        })
        .collect::<Result<Vec<_>, NormalizeError>>()?;

    let warnings = if dropped > 0 {
        vec![DataQualityWarning::DroppedTimestamps { count: dropped }]
    } else {
        Vec::new()
    };

    Ok(Normalized::Populated { records, warnings })
}

/// Timestamp → value, skipping nulls. Later duplicates win.
fn index_series(points: &[SeriesPoint]) -> BTreeMap<i64, f64> {
    points
        .iter()
        .filter_map(|&(ts, value)| value.map(|v| (ts, v)))
        .collect()
}
