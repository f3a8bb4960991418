//! Crate-wide error taxonomy.
//!
//! Risk refusals (`RiskLimit`) are expected control-flow outcomes, not
//! faults: the engine logs and records them and the cycle continues.
//! `Config` errors are fatal at startup; `Provider` failures abort only
//! the current cycle; `Storage` failures downgrade to warnings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BotError>;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Decision provider error: {0}")]
    Provider(String),

    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Risk limit: {0}")]
    RiskLimit(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// True for refusals that are expected control flow rather than faults.
    pub fn is_refusal(&self) -> bool {
        matches!(self, BotError::RiskLimit(_))
    }
}
