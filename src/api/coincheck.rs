use anyhow::{Context, Result};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Balances, OrderFill, OrderRequest, OrderSide, TradingPair};

pub const COINCHECK_API_BASE: &str = "https://coincheck.com";
const RATE_LIMIT_PER_SEC: u32 = 2;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;

type HmacSha256 = Hmac<Sha256>;

type CoincheckRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API key pair for private endpoints
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Read `COINCHECK_API_KEY` / `COINCHECK_API_SECRET`
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("COINCHECK_API_KEY").ok()?;
        let api_secret = std::env::var("COINCHECK_API_SECRET").ok()?;
        if api_key.is_empty() || api_secret.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            api_secret,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Response from /api/ticker
#[derive(Debug, Deserialize)]
pub struct Ticker {
    #[serde(default)]
    pub last: Option<Decimal>,
}

/// Response from POST /api/exchange/orders
#[derive(Debug, Deserialize)]
struct OrderResponse {
    success: bool,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    rate: Option<Value>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Coincheck REST client
///
/// Public endpoints work without credentials. Private calls are signed with
/// HMAC-SHA256 over `nonce + url + body` and pass through a shared rate
/// limiter. Clones share the limiter and the nonce counter.
#[derive(Clone)]
pub struct CoincheckClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<CoincheckRateLimiter>,
    last_nonce: Arc<AtomicU64>,
    backoff: Duration,
}

impl CoincheckClient {
    pub fn new(base_url: &str, timeout: Duration, credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_PER_SEC).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            last_nonce: Arc::new(AtomicU64::new(0)),
            backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the initial retry backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fetch the public ticker for `pair`, retrying transient failures
    pub async fn get_ticker(&self, pair: &TradingPair) -> Result<Ticker> {
        let url = format!("{}/api/ticker?pair={}", self.base_url, pair.as_str());
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.fetch_json::<Ticker>(&url).await {
                Ok(ticker) => return Ok(ticker),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff = self.backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            "Ticker attempt {}/{} for {} failed: {}. Retrying in {:?}...",
                            attempt,
                            MAX_RETRIES,
                            pair,
                            e,
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("All ticker attempts failed")))
    }

    /// Last traded price, rejecting missing or non-positive values
    pub async fn last_price(&self, pair: &TradingPair) -> Result<Decimal> {
        let ticker = self.get_ticker(pair).await?;
        match ticker.last {
            Some(price) if price > Decimal::ZERO => Ok(price),
            other => anyhow::bail!("Invalid {} price: {:?}", pair, other),
        }
    }

    /// Every numeric balance field the account reports (including reserved)
    pub async fn get_all_balances(&self) -> Result<BTreeMap<String, Decimal>> {
        let url = format!("{}/api/accounts/balance", self.base_url);
        let body: BTreeMap<String, Value> = self.signed_request(Method::GET, &url, None).await?;

        if body.get("success").and_then(Value::as_bool) != Some(true) {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            anyhow::bail!("Balance query rejected: {}", error);
        }

        Ok(body
            .into_iter()
            .filter_map(|(key, value)| decimal_from_value(&value).map(|d| (key, d)))
            .collect())
    }

    /// Free JPY and BTC
    pub async fn get_balances(&self) -> Result<Balances> {
        let all = self.get_all_balances().await?;
        Ok(Balances {
            jpy: all.get("jpy").copied().unwrap_or_default(),
            btc: all.get("btc").copied().unwrap_or_default(),
        })
    }

    /// Place a market order
    ///
    /// Coincheck sizes market buys in JPY: the request's `quote_amount`, or
    /// the BTC quantity converted at the reference price, in whole yen rounded
    /// down. Sells are sized in BTC directly.
    pub async fn create_market_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        let body = match order.side {
            OrderSide::Buy => {
                let jpy = order
                    .quote_amount
                    .unwrap_or(order.quantity * order.reference_price)
                    .round_dp_with_strategy(0, RoundingStrategy::ToZero);
                serde_json::json!({
                    "pair": order.pair.as_str(),
                    "order_type": "market_buy",
                    "market_buy_amount": jpy.to_string(),
                })
            }
            OrderSide::Sell => serde_json::json!({
                "pair": order.pair.as_str(),
                "order_type": "market_sell",
                "amount": order.quantity.to_string(),
            }),
        };

        let url = format!("{}/api/exchange/orders", self.base_url);
        let response: OrderResponse = self
            .signed_request(Method::POST, &url, Some(body.to_string()))
            .await?;

        if !response.success {
            anyhow::bail!(
                "{} order rejected: {}",
                order.side,
                response.error.unwrap_or_else(|| "no error message".to_string())
            );
        }

        let order_id = match response.id {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s,
            _ => anyhow::bail!("{} order response is missing an order id", order.side),
        };

        let filled_quantity = response
            .amount
            .as_ref()
            .and_then(decimal_from_value)
            .filter(|q| *q > Decimal::ZERO)
            .unwrap_or(order.quantity);

        Ok(OrderFill {
            order_id,
            filled_quantity,
            average_price: response.rate.as_ref().and_then(decimal_from_value),
        })
    }

    async fn fetch_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Coincheck API error ({}): {}", status, text);
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    async fn signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
    ) -> Result<T> {
        let credentials = self
            .credentials
            .as_ref()
            .context("Coincheck credentials are not configured")?;

        self.rate_limiter.until_ready().await;

        let nonce = self.next_nonce().to_string();
        let body = body.unwrap_or_default();
        let signature = sign(&credentials.api_secret, &nonce, url, &body)?;

        let mut request = self
            .client
            .request(method.clone(), url)
            .header("ACCESS-KEY", &credentials.api_key)
            .header("ACCESS-NONCE", &nonce)
            .header("ACCESS-SIGNATURE", signature);
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        // Rejections come back as JSON with `success: false`, often on 4xx
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            anyhow::bail!("Coincheck API error ({}): {}", status, text);
        }

        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse response from {}: {}", url, text))
    }

    /// Strictly increasing millisecond nonce
    fn next_nonce(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_nonce
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Coincheck signature: hex(HMAC-SHA256(nonce + url + body))
pub fn sign(secret: &str, nonce: &str, url: &str, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid API secret: {}", e))?;
    mac.update(nonce.as_bytes());
    mac.update(url.as_bytes());
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        _ => None,
    }
}
