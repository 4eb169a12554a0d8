// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod models;
pub mod strategy;

// Re-export commonly used types
pub use api::{AccountGateway, MarketData, MarketDataGateway};
pub use config::{AppConfig, StrategyParameters};
pub use error::{BotError, LedgerError, Result};
pub use execution::{CycleReport, Ledger, Orchestrator};
pub use models::*;
pub use strategy::BuyTheDipStrategy;
