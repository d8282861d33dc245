//! Normalized record type and its tabular schema.

use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Index column shared by every sink.
pub const DATETIME: &str = "datetime";
pub const PRICE: &str = "price";
pub const MARKET_CAP: &str = "market_cap";
pub const TOTAL_VOLUME: &str = "total_volume";

/// Textual timestamp format used by the CSV and SQL sinks.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// One row of market data, keyed by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub market_cap: f64,
    pub total_volume: f64,
}

impl NormalizedRecord {
    pub fn new(timestamp: DateTime<Utc>, price: f64, market_cap: f64, total_volume: f64) -> Self {
        Self {
            timestamp,
            price,
            market_cap,
            total_volume,
        }
    }

    /// `datetime` column value as text.
    pub fn datetime_text(&self) -> String {
        self.timestamp.naive_utc().format(DATETIME_FORMAT).to_string()
    }
}

/// Parse a `datetime` column value written by [`NormalizedRecord::datetime_text`]
/// (fractional seconds optional).
pub fn parse_datetime_text(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Expected schema for persisted records.
pub struct RecordSchema;

impl RecordSchema {
    pub fn schema() -> Schema {
        Schema::from_iter(vec![
            Field::new(
                DATETIME.into(),
                DataType::Datetime(TimeUnit::Milliseconds, None),
            ),
            Field::new(PRICE.into(), DataType::Float64),
            Field::new(MARKET_CAP.into(), DataType::Float64),
            Field::new(TOTAL_VOLUME.into(), DataType::Float64),
        ])
    }

    /// Validate DataFrame against schema
    pub fn validate(df: &DataFrame) -> Result<(), SchemaError> {
        let expected = Self::schema();
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        Ok(())
    }

    /// Build a DataFrame in schema order.
    pub fn to_dataframe(records: &[NormalizedRecord]) -> PolarsResult<DataFrame> {
        let millis: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_millis()).collect();
        let prices: Vec<f64> = records.iter().map(|r| r.price).collect();
        let caps: Vec<f64> = records.iter().map(|r| r.market_cap).collect();
        let volumes: Vec<f64> = records.iter().map(|r| r.total_volume).collect();

        DataFrame::new(vec![
            Column::new(DATETIME.into(), millis)
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
            Column::new(PRICE.into(), prices),
            Column::new(MARKET_CAP.into(), caps),
            Column::new(TOTAL_VOLUME.into(), volumes),
        ])
    }

    /// Convert a validated DataFrame back to records.
    pub fn from_dataframe(df: &DataFrame) -> Result<Vec<NormalizedRecord>, SchemaError> {
        Self::validate(df)?;
        let read = |e: PolarsError| SchemaError::Read(e.to_string());

        let millis = df.column(DATETIME).map_err(read)?.cast(&DataType::Int64).map_err(read)?;
        let millis = millis.i64().map_err(read)?;
        let prices = df.column(PRICE).map_err(read)?.f64().map_err(read)?;
        let caps = df.column(MARKET_CAP).map_err(read)?.f64().map_err(read)?;
        let volumes = df.column(TOTAL_VOLUME).map_err(read)?.f64().map_err(read)?;

        (0..df.height())
            .map(|i| {
                let ms = millis
                    .get(i)
                    .ok_or_else(|| SchemaError::Read(format!("null {DATETIME} at row {i}")))?;
                let timestamp = DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| SchemaError::Read(format!("timestamp out of range: {ms}")))?;
                Ok(NormalizedRecord {
                    timestamp,
                    price: prices.get(i).unwrap_or(f64::NAN),
                    market_cap: caps.get(i).unwrap_or(f64::NAN),
                    total_volume: volumes.get(i).unwrap_or(f64::NAN),
                })
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("Column read failed: {0}")]
    Read(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(ms: i64, price: f64) -> NormalizedRecord {
        NormalizedRecord::new(
            Utc.timestamp_millis_opt(ms).unwrap(),
            price,
            price * 10.0,
            price * 100.0,
        )
    }

    #[test]
    fn test_schema_has_all_required_columns() {
        let schema = RecordSchema::schema();
        for col in [DATETIME, PRICE, MARKET_CAP, TOTAL_VOLUME] {
            assert!(schema.contains(col), "missing {col}");
        }
    }

    #[test]
    fn test_dataframe_matches_schema() {
        let df = RecordSchema::to_dataframe(&[record(1_720_051_200_000, 57_000.5)]).unwrap();
        assert!(RecordSchema::validate(&df).is_ok());
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn test_dataframe_back_to_records() {
        let records = vec![record(1_720_051_200_000, 1.5), record(1_720_054_800_123, 2.25)];
        let df = RecordSchema::to_dataframe(&records).unwrap();
        assert_eq!(RecordSchema::from_dataframe(&df).unwrap(), records);
    }

    #[test]
    fn test_validate_rejects_missing_column() {
        let df = DataFrame::new(vec![Column::new(PRICE.into(), &[1.0])]).unwrap();
        assert!(matches!(
            RecordSchema::validate(&df),
            Err(SchemaError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let df = RecordSchema::to_dataframe(&[record(0, 1.0)]).unwrap();
        let mut df = df.drop(PRICE).unwrap();
        df.with_column(Column::new(PRICE.into(), &["not_a_number"]))
            .unwrap();
        assert!(matches!(
            RecordSchema::validate(&df),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_datetime_text_roundtrip() {
        let r = record(1_751_587_200_000, 1.0);
        assert_eq!(r.datetime_text(), "2025-07-04 00:00:00.000");
        assert_eq!(parse_datetime_text(&r.datetime_text()), Some(r.timestamp));
        assert_eq!(parse_datetime_text("2025-07-04 00:00:00"), Some(r.timestamp));
        assert_eq!(parse_datetime_text("04-07-2025"), None);
    }
}
