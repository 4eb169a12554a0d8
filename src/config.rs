use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BotError, Result};
use crate::models::TradingPair;

const DEFAULT_CONFIG_NAME: &str = "buydip";
const ENV_PREFIX: &str = "BUYDIP";

/// Buy-the-dip rule set, fixed for a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters {
    pub fear_threshold: u8,
    pub fear_multiplier: Decimal,
    pub sell_half_target: Decimal,
    pub sell_full_target: Decimal,
    pub initial_cash: Decimal,
    pub history_days: u32,
    pub buy_divisions: u32,
    pub min_order_unit: Decimal,
    pub min_order_value: Decimal,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            fear_threshold: 10,                     // Buy at FGI <= 10
            fear_multiplier: Decimal::new(111, 2),  // x1.11 per extra fear day
            sell_half_target: Decimal::new(300, 2), // Half out at 3.00x
            sell_full_target: Decimal::new(395, 2), // Rest out at 3.95x
            initial_cash: Decimal::new(10_000, 0),  // JPY budget
            history_days: 7,
            buy_divisions: 10,
            min_order_unit: Decimal::new(1, 5),    // 0.00001 BTC
            min_order_value: Decimal::new(500, 0), // 500 JPY
        }
    }
}

impl StrategyParameters {
    /// Reject parameter sets the decision engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.buy_divisions == 0 {
            return Err(BotError::Config("buy_divisions must be at least 1".into()));
        }
        if self.history_days == 0 {
            return Err(BotError::Config("history_days must be at least 1".into()));
        }
        if self.fear_threshold > 100 {
            return Err(BotError::Config(format!(
                "fear_threshold {} is outside the 0-100 index range",
                self.fear_threshold
            )));
        }
        if self.fear_multiplier < Decimal::ONE {
            return Err(BotError::Config(format!(
                "fear_multiplier {} must be >= 1",
                self.fear_multiplier
            )));
        }
        if self.sell_half_target <= Decimal::ONE || self.sell_full_target <= self.sell_half_target {
            return Err(BotError::Config(format!(
                "sell targets must satisfy 1 < half ({}) < full ({})",
                self.sell_half_target, self.sell_full_target
            )));
        }
        if self.initial_cash <= Decimal::ZERO {
            return Err(BotError::Config("initial_cash must be positive".into()));
        }
        if self.min_order_unit < Decimal::ZERO || self.min_order_value < Decimal::ZERO {
            return Err(BotError::Config("order minimums cannot be negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub pair: TradingPair,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://coincheck.com".to_string(),
            pair: TradingPair::default(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.alternative.me".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Process-wide settings, built once in `main` and passed down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub strategy: StrategyParameters,
    pub exchange: ExchangeConfig,
    pub sentiment: SentimentConfig,
    pub ledger_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyParameters::default(),
            exchange: ExchangeConfig::default(),
            sentiment: SentimentConfig::default(),
            ledger_path: PathBuf::from("trades.csv"),
            log_dir: PathBuf::from("."),
        }
    }
}

impl AppConfig {
    /// Layer defaults, an optional config file and `BUYDIP__*` env vars
    ///
    /// Without an explicit path, `buydip.toml` in the working directory is
    /// used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let app: AppConfig = settings.try_deserialize()?;
        app.strategy.validate()?;
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_default_parameters() {
        let params = StrategyParameters::default();
        assert_eq!(params.fear_threshold, 10);
        assert_eq!(params.fear_multiplier, dec!(1.11));
        assert_eq!(params.sell_half_target, dec!(3.00));
        assert_eq!(params.sell_full_target, dec!(3.95));
        assert_eq!(params.initial_cash, dec!(10000));
        assert_eq!(params.buy_divisions, 10);
        assert_eq!(params.min_order_unit, dec!(0.00001));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_targets() {
        let params = StrategyParameters {
            sell_half_target: dec!(4.0),
            sell_full_target: dec!(3.0),
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("sell targets"));
    }

    #[test]
    fn test_validate_rejects_zero_divisions() {
        let params = StrategyParameters {
            buy_divisions: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_load_overrides_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buydip.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "ledger_path = \"lots.csv\"\n\n[strategy]\nfear_threshold = 20\nsell_half_target = \"2.5\"\n"
        )
        .unwrap();

        let app = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(app.strategy.fear_threshold, 20);
        assert_eq!(app.strategy.sell_half_target, dec!(2.5));
        // Untouched keys keep their defaults
        assert_eq!(app.strategy.sell_full_target, dec!(3.95));
        assert_eq!(app.ledger_path, PathBuf::from("lots.csv"));
        assert_eq!(app.exchange.pair.as_str(), "btc_jpy");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(BotError::Config(_))));
    }
}
