use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fractional digits kept for BTC quantities (1 satoshi)
pub const QUANTITY_DECIMALS: u32 = 8;

/// Round a coin quantity to 8 decimal places, truncating toward zero
///
/// Truncation guarantees a rounded order never exceeds the cash or coins it
/// was sized from.
pub fn round_quantity(quantity: Decimal) -> Decimal {
    quantity
        .round_dp_with_strategy(QUANTITY_DECIMALS, RoundingStrategy::ToZero)
        .normalize()
}

/// Exchange pair identifier in Coincheck notation, e.g. `btc_jpy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradingPair(pub String);

impl TradingPair {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TradingPair {
    fn default() -> Self {
        Self("btc_jpy".to_string())
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.replace('_', "/").to_uppercase())
    }
}

/// One Fear & Greed index publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub timestamp: DateTime<Utc>,
    pub value: u8,
    pub classification: String,
}

impl SentimentReading {
    /// Value substituted when the index cannot be fetched
    pub const NEUTRAL_VALUE: u8 = 50;

    /// Synthetic reading used in place of a failed fetch
    pub fn neutral(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            value: Self::NEUTRAL_VALUE,
            classification: "Neutral".to_string(),
        }
    }
}

/// Everything a cycle knows about the market and the account
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub current_price: Decimal,
    pub sentiment_score: u8,
    pub jpy_balance: Decimal,
    pub btc_balance: Decimal,
}

/// Free (available) balances on the exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balances {
    pub jpy: Decimal,
    pub btc: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => f.write_str("BUY"),
            OrderSide::Sell => f.write_str("SELL"),
        }
    }
}

/// Market order to submit
///
/// `quantity` is always in BTC. `quote_amount` is the JPY committed to a buy;
/// exchanges with quote-denominated market buys spend it directly and fall
/// back to `quantity * reference_price` when it is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub pair: TradingPair,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reference_price: Decimal,
    pub quote_amount: Option<Decimal>,
}

/// Confirmed result of a successful market order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
}
