use chrono::{Local, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

use crate::api::{AccountGateway, MarketDataGateway};
use crate::error::{BotError, Result};
use crate::execution::ledger::{Ledger, NewLot};
use crate::models::{
    round_quantity, Balances, MarketSnapshot, OrderRequest, OrderSide, SentimentReading,
    TradingPair,
};
use crate::strategy::{BuyTheDipStrategy, ExecutionAction, ExecutionDecision};

/// What happened to one decision during a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Bought {
        lot_id: u32,
        quantity: Decimal,
        price: Decimal,
        allocation: Decimal,
        order_id: String,
    },
    SoldHalf {
        lot_id: u32,
        quantity: Decimal,
        order_id: String,
    },
    SoldFull {
        lot_id: u32,
        quantity: Decimal,
        order_id: String,
    },
    Skipped {
        subject: String,
        reason: String,
    },
    /// The exchange rejected or never confirmed the order
    OrderFailed {
        subject: String,
        error: String,
    },
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Bought {
                lot_id,
                quantity,
                price,
                allocation,
                order_id,
            } => write!(
                f,
                "BUY  lot {}: {} BTC @ ¥{} (¥{:.0}, order {})",
                lot_id, quantity, price, allocation, order_id
            ),
            ActionOutcome::SoldHalf {
                lot_id,
                quantity,
                order_id,
            } => write!(
                f,
                "HALF lot {}: sold {} BTC (order {})",
                lot_id, quantity, order_id
            ),
            ActionOutcome::SoldFull {
                lot_id,
                quantity,
                order_id,
            } => write!(
                f,
                "FULL lot {}: sold {} BTC (order {})",
                lot_id, quantity, order_id
            ),
            ActionOutcome::Skipped { subject, reason } => {
                write!(f, "SKIP {}: {}", subject, reason)
            }
            ActionOutcome::OrderFailed { subject, error } => {
                write!(f, "FAIL {}: {}", subject, error)
            }
        }
    }
}

/// Summary of one evaluation cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub pair: TradingPair,
    pub snapshot: MarketSnapshot,
    pub outcomes: Vec<ActionOutcome>,
}

impl CycleReport {
    /// Number of orders that went through
    pub fn executed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    ActionOutcome::Bought { .. }
                        | ActionOutcome::SoldHalf { .. }
                        | ActionOutcome::SoldFull { .. }
                )
            })
            .count()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FGI={} {}=¥{} JPY=¥{} BTC={}",
            self.snapshot.sentiment_score,
            self.pair,
            self.snapshot.current_price,
            self.snapshot.jpy_balance,
            self.snapshot.btc_balance
        )?;
        for outcome in &self.outcomes {
            writeln!(f, "  {}", outcome)?;
        }
        write!(f, "{} order(s) executed", self.executed())
    }
}

/// Runs one fetch → decide → execute → persist pass
pub struct Orchestrator<'a, M, A> {
    market: &'a M,
    account: &'a A,
    strategy: BuyTheDipStrategy,
    pair: TradingPair,
}

impl<'a, M, A> Orchestrator<'a, M, A>
where
    M: MarketDataGateway,
    A: AccountGateway,
{
    pub fn new(
        market: &'a M,
        account: &'a A,
        strategy: BuyTheDipStrategy,
        pair: TradingPair,
    ) -> Self {
        Self {
            market,
            account,
            strategy,
            pair,
        }
    }

    /// Run a cycle at the current local time
    pub async fn run_cycle(&self, ledger: &mut Ledger) -> Result<CycleReport> {
        self.run_cycle_at(ledger, Local::now().naive_local()).await
    }

    /// Run a cycle as if the local wall clock read `now`
    ///
    /// Fails only when the price is unavailable or the ledger cannot be
    /// persisted; every other problem is a logged skip.
    pub async fn run_cycle_at(
        &self,
        ledger: &mut Ledger,
        now: NaiveDateTime,
    ) -> Result<CycleReport> {
        tracing::info!("🚀 Buy-the-dip cycle starting at {}", now.format("%Y-%m-%d %H:%M:%S"));

        let balances = self.free_balances().await;
        let sentiment_score = self.sentiment_score().await;

        let current_price = match self.market.current_price(&self.pair).await {
            Ok(price) if price > Decimal::ZERO => price,
            Ok(price) => {
                tracing::error!("✗ {} price {} is unusable, aborting cycle", self.pair, price);
                return Err(BotError::PriceUnavailable {
                    pair: self.pair.to_string(),
                    reason: format!("non-positive price {}", price),
                });
            }
            Err(e) => {
                tracing::error!("✗ {} price fetch failed, aborting cycle: {:#}", self.pair, e);
                return Err(BotError::PriceUnavailable {
                    pair: self.pair.to_string(),
                    reason: format!("{:#}", e),
                });
            }
        };

        let mut snapshot = MarketSnapshot {
            current_price,
            sentiment_score,
            jpy_balance: balances.jpy,
            btc_balance: balances.btc,
        };

        tracing::info!(
            "📊 FGI={} {}=¥{} JPY=¥{} BTC={}",
            snapshot.sentiment_score,
            self.pair,
            snapshot.current_price,
            snapshot.jpy_balance,
            snapshot.btc_balance
        );

        let mut report = CycleReport {
            pair: self.pair.clone(),
            snapshot: snapshot.clone(),
            outcomes: Vec::new(),
        };

        // Buy
        let outcome = self.evaluate_buy(ledger, &mut snapshot, now).await?;
        report.outcomes.push(outcome);

        // Sells, ascending lot id
        for index in 0..ledger.len() {
            let lot = ledger.lots()[index].clone();
            if !lot.is_open() {
                continue;
            }

            let decision =
                self.strategy
                    .decide_sell(&lot, snapshot.current_price, snapshot.btc_balance);
            let outcome = self.execute_sell(ledger, &mut snapshot, decision, lot.id).await?;
            report.outcomes.push(outcome);
        }

        tracing::info!("✅ Cycle complete: {} order(s) executed", report.executed());
        Ok(report)
    }

    async fn evaluate_buy(
        &self,
        ledger: &mut Ledger,
        snapshot: &mut MarketSnapshot,
        now: NaiveDateTime,
    ) -> Result<ActionOutcome> {
        let subject = "buy".to_string();

        if let Some(skip) = self.strategy.buy_gate(snapshot, ledger, now.date()) {
            tracing::info!("  → Buy skipped: {}", skip.reason);
            return Ok(ActionOutcome::Skipped {
                subject,
                reason: skip.reason,
            });
        }

        let history = self.sentiment_history().await;
        let decision = self
            .strategy
            .decide_buy(snapshot, ledger, &history, now.date());

        let (quantity, allocation) = match decision.action {
            ExecutionAction::Buy {
                quantity,
                allocation,
            } => (quantity, allocation),
            _ => {
                tracing::warn!("  → Buy skipped: {}", decision.reason);
                return Ok(ActionOutcome::Skipped {
                    subject,
                    reason: decision.reason,
                });
            }
        };

        tracing::info!(
            "  → BUY {} BTC @ ¥{} (¥{:.0}): {}",
            quantity,
            snapshot.current_price,
            allocation,
            decision.reason
        );

        let order = OrderRequest {
            pair: self.pair.clone(),
            side: OrderSide::Buy,
            quantity,
            reference_price: snapshot.current_price,
            quote_amount: Some(allocation),
        };

        let fill = match self.account.place_market_order(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!("  ✗ Buy order for {} BTC failed: {:#}", quantity, e);
                return Ok(ActionOutcome::OrderFailed {
                    subject,
                    error: format!("{:#}", e),
                });
            }
        };

        let amount = round_quantity(fill.filled_quantity);
        if amount <= Decimal::ZERO {
            tracing::error!(
                "  ✗ Buy order {} reported no filled quantity, nothing recorded",
                fill.order_id
            );
            return Ok(ActionOutcome::OrderFailed {
                subject,
                error: format!("order {} filled nothing", fill.order_id),
            });
        }

        // The quoted price is the lot's cost basis; the fill price is informational
        if let Some(average) = fill.average_price {
            if average != snapshot.current_price {
                tracing::info!(
                    "  Fill price ¥{} differs from quote ¥{} (recording quote)",
                    average,
                    snapshot.current_price
                );
            }
        }

        let lot_id = ledger
            .append_lot(NewLot {
                buy_price: snapshot.current_price,
                amount,
                buy_timestamp: now,
            })?
            .id;

        tracing::info!(
            "  ✓ Recorded lot {}: {} BTC @ ¥{} (order {})",
            lot_id,
            amount,
            snapshot.current_price,
            fill.order_id
        );

        self.refresh_balances(snapshot).await;

        Ok(ActionOutcome::Bought {
            lot_id,
            quantity: amount,
            price: snapshot.current_price,
            allocation,
            order_id: fill.order_id,
        })
    }

    async fn execute_sell(
        &self,
        ledger: &mut Ledger,
        snapshot: &mut MarketSnapshot,
        decision: ExecutionDecision,
        lot_id: u32,
    ) -> Result<ActionOutcome> {
        let subject = format!("lot {}", lot_id);

        let (quantity, full) = match decision.action {
            ExecutionAction::SellFull { quantity, .. } => (quantity, true),
            ExecutionAction::SellHalf { quantity, .. } => (quantity, false),
            _ => {
                tracing::info!("  → {}", decision.reason);
                return Ok(ActionOutcome::Skipped {
                    subject,
                    reason: decision.reason,
                });
            }
        };

        tracing::info!(
            "  → SELL {} {} BTC of lot {}: {}",
            if full { "ALL" } else { "HALF" },
            quantity,
            lot_id,
            decision.reason
        );

        let order = OrderRequest {
            pair: self.pair.clone(),
            side: OrderSide::Sell,
            quantity,
            reference_price: snapshot.current_price,
            quote_amount: None,
        };

        let fill = match self.account.place_market_order(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!("  ✗ Sell order for lot {} failed: {:#}", lot_id, e);
                return Ok(ActionOutcome::OrderFailed {
                    subject,
                    error: format!("{:#}", e),
                });
            }
        };

        if fill.filled_quantity != quantity {
            tracing::warn!(
                "  Lot {} sell order {} reports {} BTC filled, requested {}",
                lot_id,
                fill.order_id,
                fill.filled_quantity,
                quantity
            );
        }

        let outcome = if full {
            ledger.record_full_sell(lot_id)?;
            tracing::info!("  ✓ Lot {} closed: sold {} BTC", lot_id, quantity);
            ActionOutcome::SoldFull {
                lot_id,
                quantity,
                order_id: fill.order_id,
            }
        } else {
            ledger.record_half_sell(lot_id, quantity)?;
            tracing::info!("  ✓ Lot {} half sold: {} BTC", lot_id, quantity);
            ActionOutcome::SoldHalf {
                lot_id,
                quantity,
                order_id: fill.order_id,
            }
        };

        self.refresh_balances(snapshot).await;

        Ok(outcome)
    }

    /// Balance query that degrades to zero on failure
    async fn free_balances(&self) -> Balances {
        match self.account.balances().await {
            Ok(balances) => balances,
            Err(e) => {
                tracing::warn!("Balance query failed, assuming zero: {:#}", e);
                Balances::default()
            }
        }
    }

    async fn refresh_balances(&self, snapshot: &mut MarketSnapshot) {
        let balances = self.free_balances().await;
        snapshot.jpy_balance = balances.jpy;
        snapshot.btc_balance = balances.btc;
    }

    async fn sentiment_score(&self) -> u8 {
        match self.market.sentiment_score().await {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(
                    "Fear & Greed fetch failed, using neutral {}: {:#}",
                    SentimentReading::NEUTRAL_VALUE,
                    e
                );
                SentimentReading::NEUTRAL_VALUE
            }
        }
    }

    async fn sentiment_history(&self) -> Vec<SentimentReading> {
        let days = self.strategy.params().history_days;
        match self.market.sentiment_history(days).await {
            Ok(history) if !history.is_empty() => history,
            Ok(_) => {
                tracing::warn!("Fear & Greed history empty, using a neutral reading");
                vec![SentimentReading::neutral(Utc::now())]
            }
            Err(e) => {
                tracing::warn!(
                    "Fear & Greed history ({} days) failed, using a neutral reading: {:#}",
                    days,
                    e
                );
                vec![SentimentReading::neutral(Utc::now())]
            }
        }
    }
}
