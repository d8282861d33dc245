//! MarketETL Core: fetch, normalize, and persist cryptocurrency market data.
//!
//! One invocation moves one asset's data through three steps:
//! - Fetch a daily snapshot or a rolling market chart from the CoinGecko API,
//!   with bounded exponential-backoff retries
//! - Normalize the payload into timestamp-indexed records rounded to three decimals
//! - Persist the records to a SQL table (PostgreSQL or SQLite) and/or CSV and Parquet files

pub mod data;
pub mod pipeline;
pub mod settings;
pub mod sink;

pub use pipeline::{Pipeline, PipelineError, PipelineReport, Stage};
