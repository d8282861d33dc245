//! CoinGecko v3 market data client.
//!
//! Owns the API key header, reuses one HTTP connection pool across calls, and
//! wraps every data request in the [`RetryPolicy`]. Any non-2xx status and any
//! transport failure is retried; a body that does not decode is not.

use super::provider::{
    ChartPayload, FetchError, FetchRequest, LastFailure, MarketDataSource, Payload,
    SnapshotPayload, TransportError, Window,
};
use super::retry::{Exhausted, RetryPolicy};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Upstream error bodies are cut to this many characters in error messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// CoinGecko API plan. Decides the base URL and the key header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiPlan {
    #[default]
    Demo,
    Pro,
}

impl ApiPlan {
    pub fn base_url(self) -> &'static str {
        match self {
            ApiPlan::Demo => "https://api.coingecko.com/api/v3",
            ApiPlan::Pro => "https://pro-api.coingecko.com/api/v3",
        }
    }

    pub fn key_header(self) -> &'static str {
        match self {
            ApiPlan::Demo => "x-cg-demo-api-key",
            ApiPlan::Pro => "x-cg-pro-api-key",
        }
    }
}

impl std::str::FromStr for ApiPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "demo" => Ok(ApiPlan::Demo),
            "pro" => Ok(ApiPlan::Pro),
            other => Err(format!("unknown API plan '{other}' (expected demo or pro)")),
        }
    }
}

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single GET round trip. Implementations must not retry.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse, TransportError>;
}

/// Blocking reqwest transport with the API key installed as a default header.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(plan: ApiPlan, api_key: &str) -> Result<Self, TransportError> {
        let mut key = HeaderValue::from_str(api_key)
            .map_err(|e| TransportError::Other(format!("API key is not a valid header: {e}")))?;
        key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(plan.key_header(), key);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("marketetl/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .map_err(classify)?;
        let status = resp.status().as_u16();
        let body = resp.text().map_err(classify)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// CoinGecko client generic over its transport.
pub struct CoinGeckoClient<T: Transport = ReqwestTransport> {
    transport: T,
    base_url: String,
    retry: RetryPolicy,
}

impl CoinGeckoClient<ReqwestTransport> {
    /// Client for the plan's public endpoint.
    pub fn new(plan: ApiPlan, api_key: &str) -> Result<Self, TransportError> {
        Ok(Self::with_transport(
            ReqwestTransport::new(plan, api_key)?,
            plan.base_url(),
        ))
    }
}

impl<T: Transport> CoinGeckoClient<T> {
    pub fn with_transport(transport: T, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Health check against `/ping`. Not retried.
    pub fn ping(&self) -> Result<bool, TransportError> {
        let url = format!("{}/ping", self.base_url);
        let resp = self.transport.get(&url, &[])?;
        debug!(%url, status = resp.status, "ping");
        Ok(resp.is_success())
    }

    /// Fetch and decode the payload for `request`.
    pub fn fetch(&self, request: &FetchRequest) -> Result<Payload, FetchError> {
        request.validate()?;
        let url = format!("{}/{}", self.base_url, request.path());
        let body = self.get_with_retry(&url, &request.query())?;

        match request.window {
            Window::DailySnapshot { .. } => serde_json::from_str::<SnapshotPayload>(&body)
                .map(Payload::Snapshot)
                .map_err(|e| FetchError::Decode(format!("snapshot for {}: {e}", request.asset_id))),
            Window::MarketChart { .. } => serde_json::from_str::<ChartPayload>(&body)
                .map(Payload::MarketChart)
                .map_err(|e| {
                    FetchError::Decode(format!("market chart for {}: {e}", request.asset_id))
                }),
        }
    }

    fn get_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        self.retry
            .run(|attempt| {
                debug!(%url, attempt, "GET");
                match self.transport.get(url, query) {
                    Ok(resp) if resp.is_success() => Ok(resp.body),
                    Ok(resp) => Err(LastFailure::Status {
                        status: resp.status,
                        body: resp.body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                    }),
                    Err(e) => Err(LastFailure::Transport(e.to_string())),
                }
            })
            .map_err(|Exhausted { attempts, last }| FetchError::Upstream { attempts, last })
    }
}

impl<T: Transport> MarketDataSource for CoinGeckoClient<T> {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn ping(&self) -> Result<bool, TransportError> {
        CoinGeckoClient::ping(self)
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Payload, FetchError> {
        CoinGeckoClient::fetch(self, request)
    }
}
