use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{
    Broker, BrokerOrder, BrokerOrderRequest, BrokerOrderStatus, BrokerPosition, MarketClock,
};
use crate::config::BrokerSettings;
use crate::error::PipelineError;
use crate::models::OrderSide;
use crate::Result;

const MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

// Type alias for the rate limiter to simplify signatures
type AlpacaRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Alpaca-compatible REST client with rate limiting and retries
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct AlpacaClient {
    client: Client,
    base_url: String,
    data_url: String,
    key_id: String,
    secret_key: String,
    rate_limiter: Arc<AlpacaRateLimiter>,
    retry_base_ms: u64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    client_order_id: String,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    filled_at: Option<DateTime<Utc>>,
}

impl OrderResponse {
    fn into_order(self) -> BrokerOrder {
        BrokerOrder {
            id: self.id,
            client_order_id: self.client_order_id,
            status: BrokerOrderStatus::parse(&self.status),
            filled_qty: self
                .filled_qty
                .and_then(|q| q.parse().ok())
                .unwrap_or(0.0),
            filled_avg_price: self.filled_avg_price.and_then(|p| p.parse().ok()),
            filled_at: self.filled_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    symbol: String,
    qty: String,
}

#[derive(Debug, Deserialize)]
struct ClockResponse {
    timestamp: DateTime<Utc>,
    is_open: bool,
    next_open: Option<DateTime<Utc>>,
    next_close: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LatestTradeResponse {
    trade: TradeResponse,
}

#[derive(Debug, Deserialize)]
struct TradeResponse {
    #[serde(rename = "p")]
    price: f64,
}

impl AlpacaClient {
    pub fn new(settings: &BrokerSettings) -> Result<Self> {
        let key_id = settings
            .key_id
            .clone()
            .ok_or_else(|| PipelineError::Config("broker.key_id is required for alpaca".into()))?;
        let secret_key = settings.secret_key.clone().ok_or_else(|| {
            PipelineError::Config("broker.secret_key is required for alpaca".into())
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(settings.requests_per_minute)
            .ok_or_else(|| PipelineError::Config("broker.requests_per_minute must be > 0".into()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            data_url: settings.data_url.trim_end_matches('/').to_string(),
            key_id,
            secret_key,
            rate_limiter,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
        })
    }

    /// Override the first retry delay (doubles on each attempt).
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base_ms = base.as_millis() as u64;
        self
    }

    /// Make a rate-limited API request with retry logic
    ///
    /// Returns `Ok(None)` for 404 so lookups can report "not found".
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<reqwest::Response>> {
        let mut last_error = String::new();

        for attempt in 1..=MAX_RETRIES {
            // Wait for rate limiter
            self.rate_limiter.until_ready().await;

            let mut request = self
                .client
                .request(method.clone(), url)
                .header("APCA-API-KEY-ID", &self.key_id)
                .header("APCA-API-SECRET-KEY", &self.secret_key);
            if let Some(body) = body {
                request = request.json(body);
            }

            let backoff = Duration::from_millis(self.retry_base_ms * 2u64.pow(attempt - 1));

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(Some(response));
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }

                    // Rate limit and server errors are retried
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_error = format!("{} {} returned {}", method, url, status);
                        tracing::warn!(
                            "Broker returned {}, retrying in {}ms (attempt {}/{})",
                            status,
                            backoff.as_millis(),
                            attempt,
                            MAX_RETRIES
                        );
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(backoff).await;
                        }
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(PipelineError::broker_rejected(format!(
                        "broker error ({}): {}",
                        status, error_text
                    )));
                }
                Err(e) => {
                    last_error = format!("network error: {}", e);
                    tracing::warn!(
                        "Network error: {}, retrying in {}ms (attempt {}/{})",
                        e,
                        backoff.as_millis(),
                        attempt,
                        MAX_RETRIES
                    );
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(PipelineError::broker_transient(last_error))
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::broker_transient(format!("invalid broker response: {}", e)))
    }
}

#[async_trait]
impl Broker for AlpacaClient {
    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrder> {
        let body = serde_json::json!({
            "symbol": request.symbol,
            "qty": request.qty.to_string(),
            "side": match request.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            "type": "market",
            "time_in_force": request.time_in_force,
            "client_order_id": request.client_order_id,
        });

        let url = format!("{}/v2/orders", self.base_url);
        let response = self
            .send(Method::POST, &url, Some(&body))
            .await?
            .ok_or_else(|| PipelineError::broker_rejected("order endpoint not found"))?;
        let order: OrderResponse = Self::json(response).await?;

        tracing::info!(
            "Submitted {} {} {} (broker id {})",
            request.side.as_str(),
            request.qty,
            request.symbol,
            order.id
        );

        Ok(order.into_order())
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder> {
        let url = format!("{}/v2/orders/{}", self.base_url, broker_order_id);
        let response = self
            .send(Method::GET, &url, None)
            .await?
            .ok_or_else(|| PipelineError::broker_rejected(format!("unknown order {}", broker_order_id)))?;
        let order: OrderResponse = Self::json(response).await?;
        Ok(order.into_order())
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>> {
        let url = format!(
            "{}/v2/orders:by_client_order_id?client_order_id={}",
            self.base_url, client_order_id
        );
        match self.send(Method::GET, &url, None).await? {
            Some(response) => {
                let order: OrderResponse = Self::json(response).await?;
                Ok(Some(order.into_order()))
            }
            None => Ok(None),
        }
    }

    async fn get_open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
        let url = format!("{}/v2/positions/{}", self.base_url, symbol);
        match self.send(Method::GET, &url, None).await? {
            Some(response) => {
                let position: PositionResponse = Self::json(response).await?;
                let qty = position.qty.parse::<f64>().map_err(|_| {
                    PipelineError::broker_transient(format!("invalid position qty {}", position.qty))
                })?;
                Ok(Some(BrokerPosition {
                    symbol: position.symbol,
                    qty,
                }))
            }
            None => Ok(None),
        }
    }

    async fn get_clock(&self) -> Result<MarketClock> {
        let url = format!("{}/v2/clock", self.base_url);
        let response = self
            .send(Method::GET, &url, None)
            .await?
            .ok_or_else(|| PipelineError::broker_rejected("clock endpoint not found"))?;
        let clock: ClockResponse = Self::json(response).await?;
        Ok(MarketClock {
            is_open: clock.is_open,
            timestamp: clock.timestamp,
            next_open: clock.next_open,
            next_close: clock.next_close,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
        let url = format!("{}/v2/orders/{}", self.base_url, broker_order_id);
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn latest_trade_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/v2/stocks/{}/trades/latest", self.data_url, symbol);
        match self.send(Method::GET, &url, None).await? {
            Some(response) => {
                let latest: LatestTradeResponse = Self::json(response).await?;
                Ok(Some(latest.trade.price))
            }
            None => Ok(None),
        }
    }
}
