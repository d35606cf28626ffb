use rust_decimal::Decimal;
use thiserror::Error;

/// Failures of the pure sizing and bracket calculations. Any of these blocks order placement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    #[error("zero risk: entry equals stop, or the contract multiplier is zero")]
    ZeroRisk,

    #[error("position size {size} is below the minimum tradable size")]
    PositionTooSmall { size: Decimal },

    #[error("unsupported order type '{0}'")]
    UnsupportedOrderType(String),

    #[error("tick size must be positive, got {0}")]
    InvalidTickSize(Decimal),
}
