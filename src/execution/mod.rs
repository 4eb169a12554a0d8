// Ledger persistence and cycle execution
pub mod ledger;
pub mod orchestrator;

pub use ledger::{BuyLot, Ledger, LotState, NewLot};
pub use orchestrator::{ActionOutcome, CycleReport, Orchestrator};
