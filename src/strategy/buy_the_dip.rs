use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::{ExecutionAction, ExecutionDecision};
use crate::config::StrategyParameters;
use crate::execution::ledger::{BuyLot, Ledger};
use crate::models::{round_quantity, MarketSnapshot, SentimentReading};

/// Scale kept while compounding the fear multiplier
const MULTIPLIER_DECIMALS: u32 = 12;

/// Sentiment-driven accumulation with two-stage take profit
///
/// Buys at most once per day while the Fear & Greed index sits at or below
/// `fear_threshold`, sizing up exponentially with each consecutive fear day.
/// Every lot is then sold independently: half at `sell_half_target`, the rest
/// at `sell_full_target`.
///
/// The strategy never touches the ledger; it only returns decisions.
#[derive(Debug, Clone)]
pub struct BuyTheDipStrategy {
    params: StrategyParameters,
}

impl BuyTheDipStrategy {
    pub fn new(params: StrategyParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StrategyParameters {
        &self.params
    }

    /// Cheap checks that decide whether the sentiment history is needed at all
    ///
    /// Returns a skip decision when no buy can happen this cycle.
    pub fn buy_gate(
        &self,
        snapshot: &MarketSnapshot,
        ledger: &Ledger,
        today: NaiveDate,
    ) -> Option<ExecutionDecision> {
        if snapshot.sentiment_score > self.params.fear_threshold {
            return Some(ExecutionDecision::skip(format!(
                "FGI {} above fear threshold {}",
                snapshot.sentiment_score, self.params.fear_threshold
            )));
        }

        if ledger.already_acted_today(today) {
            return Some(ExecutionDecision::skip(format!(
                "Already bought on {}",
                today
            )));
        }

        None
    }

    /// Length of the fear streak ending at the most recent reading
    ///
    /// `history` is most recent first. The streak stops at the first reading
    /// above the threshold and is never reported below 1.
    pub fn consecutive_fear_days(&self, history: &[SentimentReading]) -> u32 {
        let streak = history
            .iter()
            .take_while(|reading| reading.value <= self.params.fear_threshold)
            .count() as u32;

        streak.max(1)
    }

    /// `min(fear_multiplier ^ (days - 1), buy_divisions)`
    pub fn position_multiplier(&self, days: u32) -> Decimal {
        let cap = Decimal::from(self.params.buy_divisions);
        let mut multiplier = Decimal::ONE;

        for _ in 1..days {
            multiplier = (multiplier * self.params.fear_multiplier).round_dp(MULTIPLIER_DECIMALS);
            if multiplier >= cap {
                return cap;
            }
        }

        multiplier.min(cap)
    }

    /// JPY to commit after `days` consecutive fear days
    pub fn allocation(&self, days: u32) -> Decimal {
        let base = self.params.initial_cash / Decimal::from(self.params.buy_divisions);
        base * self.position_multiplier(days)
    }

    /// Full buy decision for this cycle
    pub fn decide_buy(
        &self,
        snapshot: &MarketSnapshot,
        ledger: &Ledger,
        history: &[SentimentReading],
        today: NaiveDate,
    ) -> ExecutionDecision {
        if let Some(skip) = self.buy_gate(snapshot, ledger, today) {
            return skip;
        }

        let days = self.consecutive_fear_days(history);
        let multiplier = self.position_multiplier(days);
        let allocation = self.allocation(days);

        tracing::debug!(
            "🔍 Buy sizing: {} fear day(s), multiplier {:.4}, allocation ¥{:.0}",
            days,
            multiplier,
            allocation
        );

        if allocation < self.params.min_order_value {
            return ExecutionDecision::skip(format!(
                "Allocation ¥{:.2} below minimum order ¥{}",
                allocation, self.params.min_order_value
            ));
        }

        if snapshot.jpy_balance < allocation {
            return ExecutionDecision::skip(format!(
                "Insufficient JPY: have ¥{}, need ¥{:.2}",
                snapshot.jpy_balance, allocation
            ));
        }

        if snapshot.current_price <= Decimal::ZERO {
            return ExecutionDecision::skip(format!(
                "Unusable price {}",
                snapshot.current_price
            ));
        }

        let quantity = round_quantity(allocation / snapshot.current_price);
        if quantity.is_zero() {
            return ExecutionDecision::skip(format!(
                "Allocation ¥{:.2} buys nothing at ¥{}",
                allocation, snapshot.current_price
            ));
        }

        ExecutionDecision {
            action: ExecutionAction::Buy {
                quantity,
                allocation,
            },
            reason: format!(
                "FGI {} with {} fear day(s), multiplier {:.4}",
                snapshot.sentiment_score, days, multiplier
            ),
        }
    }

    /// Take-profit decision for a single lot
    ///
    /// The full target is checked first so a lot that jumps straight past
    /// both thresholds is closed, not halved.
    pub fn decide_sell(
        &self,
        lot: &BuyLot,
        current_price: Decimal,
        available_btc: Decimal,
    ) -> ExecutionDecision {
        if !lot.is_open() {
            return ExecutionDecision::skip(format!("Lot {} already closed", lot.id));
        }

        let ratio = lot.ratio(current_price);

        let (action, quantity, reason) = if ratio >= self.params.sell_full_target {
            let quantity = lot.remaining_amount;
            (
                ExecutionAction::SellFull {
                    lot_id: lot.id,
                    quantity,
                },
                quantity,
                format!(
                    "Ratio {:.4} >= full target {}",
                    ratio, self.params.sell_full_target
                ),
            )
        } else if ratio >= self.params.sell_half_target && !lot.half_sold {
            let quantity = round_quantity(lot.remaining_amount / Decimal::TWO);
            (
                ExecutionAction::SellHalf {
                    lot_id: lot.id,
                    quantity,
                },
                quantity,
                format!(
                    "Ratio {:.4} >= half target {}",
                    ratio, self.params.sell_half_target
                ),
            )
        } else {
            return ExecutionDecision::skip(format!(
                "Lot {} ratio {:.4} below next target",
                lot.id, ratio
            ));
        };

        if quantity < self.params.min_order_unit || quantity.is_zero() {
            return ExecutionDecision::skip(format!(
                "Lot {} sell size {} BTC below minimum {}",
                lot.id, quantity, self.params.min_order_unit
            ));
        }

        if available_btc < quantity {
            return ExecutionDecision::skip(format!(
                "Lot {} needs {} BTC, only {} available",
                lot.id, quantity, available_btc
            ));
        }

        ExecutionDecision { action, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ledger::NewLot;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn strategy() -> BuyTheDipStrategy {
        BuyTheDipStrategy::new(StrategyParameters::default())
    }

    fn snapshot(score: u8, price: Decimal, jpy: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            current_price: price,
            sentiment_score: score,
            jpy_balance: jpy,
            btc_balance: Decimal::ZERO,
        }
    }

    fn history(values: &[u8]) -> Vec<SentimentReading> {
        let start = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| SentimentReading {
                timestamp: start - chrono::Duration::days(i as i64),
                value,
                classification: "Extreme Fear".to_string(),
            })
            .collect()
    }

    fn lot(buy_price: Decimal, remaining: Decimal, half_sold: bool) -> BuyLot {
        BuyLot {
            id: 3,
            buy_price,
            amount: dec!(0.002),
            remaining_amount: remaining,
            sold: false,
            half_sold,
            buy_timestamp: NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    #[test]
    fn test_fear_streak_counts_leading_run() {
        let s = strategy();
        assert_eq!(s.consecutive_fear_days(&history(&[8, 9, 10, 40, 5])), 3);
        assert_eq!(s.consecutive_fear_days(&history(&[5, 5, 5, 5, 5, 5, 5])), 7);
    }

    #[test]
    fn test_fear_streak_clamped_to_one() {
        let s = strategy();
        assert_eq!(s.consecutive_fear_days(&history(&[50])), 1);
        assert_eq!(s.consecutive_fear_days(&history(&[30, 5, 5])), 1);
        assert_eq!(s.consecutive_fear_days(&[]), 1);
    }

    #[test]
    fn test_multiplier_and_allocation() {
        let s = strategy();

        assert_eq!(s.position_multiplier(1), dec!(1));
        assert_eq!(s.allocation(1), dec!(1000));

        // 1.11^4 = 1.51807041
        assert_eq!(s.position_multiplier(5), dec!(1.51807041));
        assert_eq!(s.allocation(5), dec!(1518.07041));

        // Capped at buy_divisions
        assert_eq!(s.position_multiplier(50), dec!(10));
        assert_eq!(s.allocation(50), dec!(10000));
    }

    #[test]
    fn test_buy_skipped_above_threshold() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(dir.path().join("trades.csv")).unwrap();

        let decision = strategy().decide_buy(
            &snapshot(11, dec!(9000000), dec!(50000)),
            &ledger,
            &history(&[11]),
            today(),
        );
        assert!(decision.is_skip());
        assert!(decision.reason.contains("above fear threshold"));
    }

    #[test]
    fn test_buy_skipped_when_already_bought_today() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(dir.path().join("trades.csv")).unwrap();
        ledger
            .append_lot(NewLot {
                buy_price: dec!(9000000),
                amount: dec!(0.00011111),
                buy_timestamp: today().and_hms_opt(8, 0, 0).unwrap(),
            })
            .unwrap();

        let snap = snapshot(5, dec!(9000000), dec!(50000));
        assert!(strategy().buy_gate(&snap, &ledger, today()).is_some());

        let decision = strategy().decide_buy(&snap, &ledger, &history(&[5]), today());
        assert!(decision.is_skip());
        assert!(decision.reason.contains("Already bought"));

        // The next day is allowed again
        let tomorrow = today().succ_opt().unwrap();
        assert!(strategy().buy_gate(&snap, &ledger, tomorrow).is_none());
    }

    #[test]
    fn test_buy_sized_from_fear_streak() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(dir.path().join("trades.csv")).unwrap();

        let decision = strategy().decide_buy(
            &snapshot(8, dec!(9000000), dec!(50000)),
            &ledger,
            &history(&[8, 7, 9, 10, 6, 55, 4]),
            today(),
        );

        match decision.action {
            ExecutionAction::Buy {
                quantity,
                allocation,
            } => {
                assert_eq!(allocation, dec!(1518.07041));
                // 1518.07041 / 9,000,000 = 0.000168674..., truncated
                assert_eq!(quantity, dec!(0.00016867));
            }
            other => panic!("expected buy, got {:?}", other),
        }
        assert!(decision.reason.contains("5 fear day"));
    }

    #[test]
    fn test_buy_skipped_on_insufficient_cash() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(dir.path().join("trades.csv")).unwrap();

        let decision = strategy().decide_buy(
            &snapshot(5, dec!(9000000), dec!(999)),
            &ledger,
            &history(&[5]),
            today(),
        );
        assert!(decision.is_skip());
        assert!(decision.reason.contains("Insufficient JPY"));
    }

    #[test]
    fn test_buy_skipped_below_minimum_order_value() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(dir.path().join("trades.csv")).unwrap();
        let s = BuyTheDipStrategy::new(StrategyParameters {
            initial_cash: dec!(4000),
            ..Default::default()
        });

        let decision = s.decide_buy(
            &snapshot(5, dec!(9000000), dec!(50000)),
            &ledger,
            &history(&[5]),
            today(),
        );
        assert!(decision.is_skip());
        assert!(decision.reason.contains("below minimum order"));
    }

    #[test]
    fn test_sell_thresholds() {
        let s = strategy();
        let open = lot(dec!(1000000), dec!(0.002), false);

        // 2.9x: nothing
        let decision = s.decide_sell(&open, dec!(2900000), dec!(1));
        assert!(decision.is_skip());

        // 3.0x: half
        let decision = s.decide_sell(&open, dec!(3000000), dec!(1));
        assert_eq!(
            decision.action,
            ExecutionAction::SellHalf {
                lot_id: 3,
                quantity: dec!(0.001)
            }
        );

        // 3.95x: everything
        let decision = s.decide_sell(&open, dec!(3950000), dec!(1));
        assert_eq!(
            decision.action,
            ExecutionAction::SellFull {
                lot_id: 3,
                quantity: dec!(0.002)
            }
        );
    }

    #[test]
    fn test_half_sell_only_once() {
        let s = strategy();
        let halved = lot(dec!(1000000), dec!(0.001), true);

        let decision = s.decide_sell(&halved, dec!(3500000), dec!(1));
        assert!(decision.is_skip());

        // Full target still applies to a halved lot
        let decision = s.decide_sell(&halved, dec!(4000000), dec!(1));
        assert_eq!(
            decision.action,
            ExecutionAction::SellFull {
                lot_id: 3,
                quantity: dec!(0.001)
            }
        );
    }

    #[test]
    fn test_half_sell_rounds_to_satoshi() {
        let s = strategy();
        let odd = lot(dec!(1000000), dec!(0.00016867), false);

        let decision = s.decide_sell(&odd, dec!(3100000), dec!(1));
        assert_eq!(
            decision.action,
            ExecutionAction::SellHalf {
                lot_id: 3,
                quantity: dec!(0.00008433)
            }
        );
    }

    #[test]
    fn test_sell_skipped_on_balance_or_minimum() {
        let s = strategy();

        let open = lot(dec!(1000000), dec!(0.002), false);
        let decision = s.decide_sell(&open, dec!(4000000), dec!(0.0015));
        assert!(decision.is_skip());
        assert!(decision.reason.contains("only 0.0015 available"));

        let dust = lot(dec!(1000000), dec!(0.000015), false);
        let decision = s.decide_sell(&dust, dec!(3000000), dec!(1));
        assert!(decision.is_skip());
        assert!(decision.reason.contains("below minimum"));
    }

    #[test]
    fn test_closed_lot_never_sold() {
        let s = strategy();
        let mut closed = lot(dec!(1000000), Decimal::ZERO, true);
        closed.sold = true;

        let decision = s.decide_sell(&closed, dec!(5000000), dec!(1));
        assert!(decision.is_skip());
    }
}
