pub mod coincheck;
pub mod fear_greed;

pub use coincheck::{CoincheckClient, Credentials};
pub use fear_greed::FearGreedClient;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Balances, OrderFill, OrderRequest, SentimentReading, TradingPair};

/// Price and sentiment inputs for a cycle
#[async_trait]
pub trait MarketDataGateway: Send + Sync {
    /// Last traded price; fails when no usable price is available
    async fn current_price(&self, pair: &TradingPair) -> anyhow::Result<Decimal>;

    /// Today's Fear & Greed value (0-100)
    async fn sentiment_score(&self) -> anyhow::Result<u8>;

    /// Up to `days` readings, most recent first
    async fn sentiment_history(&self, days: u32) -> anyhow::Result<Vec<SentimentReading>>;
}

/// Balance queries and order placement on the exchange account
#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn balances(&self) -> anyhow::Result<Balances>;

    /// Submit a market order; `Ok` only for a confirmed, successful order
    async fn place_market_order(&self, order: &OrderRequest) -> anyhow::Result<OrderFill>;
}

/// Live market data: Coincheck ticker plus the alternative.me index
#[derive(Clone)]
pub struct MarketData {
    exchange: CoincheckClient,
    sentiment: FearGreedClient,
}

impl MarketData {
    pub fn new(exchange: CoincheckClient, sentiment: FearGreedClient) -> Self {
        Self {
            exchange,
            sentiment,
        }
    }
}

#[async_trait]
impl MarketDataGateway for MarketData {
    async fn current_price(&self, pair: &TradingPair) -> anyhow::Result<Decimal> {
        self.exchange.last_price(pair).await
    }

    async fn sentiment_score(&self) -> anyhow::Result<u8> {
        Ok(self.sentiment.latest().await?.value)
    }

    async fn sentiment_history(&self, days: u32) -> anyhow::Result<Vec<SentimentReading>> {
        self.sentiment.history(days).await
    }
}

#[async_trait]
impl AccountGateway for CoincheckClient {
    async fn balances(&self) -> anyhow::Result<Balances> {
        self.get_balances().await
    }

    async fn place_market_order(&self, order: &OrderRequest) -> anyhow::Result<OrderFill> {
        self.create_market_order(order).await
    }
}
