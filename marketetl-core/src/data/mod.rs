//! Upstream access and record normalization.

pub mod coingecko;
pub mod normalize;
pub mod provider;
pub mod retry;
pub mod schema;

pub use coingecko::{ApiPlan, CoinGeckoClient, HttpResponse, ReqwestTransport, Transport};
pub use normalize::{normalize, AlignPolicy, DataQualityWarning, NormalizeError, Normalized};
pub use provider::{FetchError, FetchRequest, MarketDataSource, Payload, TransportError, Window};
pub use retry::RetryPolicy;
pub use schema::{NormalizedRecord, RecordSchema, SchemaError};
