// Trading decision module
pub mod buy_the_dip;

pub use buy_the_dip::BuyTheDipStrategy;

use rust_decimal::Decimal;

/// What the decision engine wants the orchestrator to do
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    /// Market buy `quantity` BTC, sized from `allocation` JPY
    Buy {
        quantity: Decimal,
        allocation: Decimal,
    },
    /// Sell everything left in a lot
    SellFull { lot_id: u32, quantity: Decimal },
    /// One-time sale of half the remaining lot
    SellHalf { lot_id: u32, quantity: Decimal },
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.action, ExecutionAction::Skip)
    }
}
