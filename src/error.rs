use crate::model::TradingFrequency;
use thiserror::Error;

/// Local, pre-submission configuration failures. These reject synchronously:
/// no request is issued and no state transition happens.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one position is required")]
    NoPositions,

    #[error("initial cash must be at least ${min:.0}, got ${got:.2}")]
    CashBelowMinimum { min: f64, got: f64 },

    #[error("duration must be between 1 and {max} days for {frequency} trading, got {got}")]
    DurationOutOfRange {
        got: u32,
        max: u32,
        frequency: TradingFrequency,
    },
}
