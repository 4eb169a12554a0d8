use std::path::PathBuf;
use thiserror::Error;

/// Failures reading, validating or persisting the position ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },

    #[error("lot {0} not found in ledger")]
    UnknownLot(u32),

    #[error("lot {lot_id}: {reason}")]
    InvalidTransition { lot_id: u32, reason: String },

    #[error("ledger row {row} is inconsistent: {reason}")]
    Corrupt { row: usize, reason: String },
}

/// Errors that end a cycle with a non-zero exit status
#[derive(Debug, Error)]
pub enum BotError {
    #[error("current price unavailable for {pair}: {reason}")]
    PriceUnavailable { pair: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
