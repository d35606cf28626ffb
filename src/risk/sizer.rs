//! Position sizing from a dollar risk budget and a stop distance.

use super::error::RiskError;
use crate::config::RiskConfig;
use crate::utils::decimal::{checked_ratio, round_down_to_lot};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Smallest size increment the sizer produces.
pub const SIZE_LOT: Decimal = dec!(0.01);

/// Outcome of a sizing calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskSizingResult {
    /// Final size after the cap and lot rounding.
    pub position_size: Decimal,
    /// Price distance between entry and stop.
    pub risk_per_unit: Decimal,
    /// Dollar loss per contract if the stop is hit.
    pub risk_per_contract: Decimal,
    /// Size the budget alone would allow, before the cap.
    pub raw_size: Decimal,
    pub total_risk_usd: Decimal,
    pub total_profit_usd: Decimal,
    /// Profit over risk. `None` stands for an unbounded ratio.
    pub risk_reward_ratio: Option<Decimal>,
    /// Whether the target profit reaches the daily goal.
    pub meets_target: bool,
}

impl RiskSizingResult {
    /// Whole contracts to send to the broker.
    pub fn contracts(&self) -> Result<i64, RiskError> {
        let contracts = self.position_size.floor().to_i64().unwrap_or(0);
        if contracts < 1 {
            return Err(RiskError::PositionTooSmall {
                size: self.position_size,
            });
        }
        Ok(contracts)
    }
}

/// Stateless position sizer.
#[derive(Debug, Clone)]
pub struct RiskSizer {
    daily_target_usd: Decimal,
}

impl RiskSizer {
    pub fn new(daily_target_usd: Decimal) -> Self {
        Self { daily_target_usd }
    }

    pub fn from_config(config: &RiskConfig) -> Self {
        Self::new(config.daily_target_usd)
    }

    /// Size a position so that the loss at `stop` does not exceed `max_risk_usd`
    /// and the size does not exceed `cap`.
    pub fn size(
        &self,
        entry: Decimal,
        stop: Decimal,
        target: Decimal,
        contract_multiplier: Decimal,
        max_risk_usd: Decimal,
        cap: Decimal,
    ) -> Result<RiskSizingResult, RiskError> {
        let risk_per_unit = (entry - stop).abs();
        if risk_per_unit == Decimal::ZERO {
            return Err(RiskError::ZeroRisk);
        }

        let risk_per_contract = risk_per_unit * contract_multiplier;
        if risk_per_contract == Decimal::ZERO {
            return Err(RiskError::ZeroRisk);
        }

        let raw_size = max_risk_usd / risk_per_contract;
        let position_size = round_down_to_lot(raw_size.min(cap), SIZE_LOT);
        if position_size < SIZE_LOT {
            return Err(RiskError::PositionTooSmall {
                size: position_size,
            });
        }

        let profit_per_unit = (target - entry).abs();
        let total_risk_usd = position_size * risk_per_contract;
        let total_profit_usd = position_size * profit_per_unit * contract_multiplier;

        Ok(RiskSizingResult {
            position_size,
            risk_per_unit,
            risk_per_contract,
            raw_size,
            total_risk_usd,
            total_profit_usd,
            risk_reward_ratio: checked_ratio(total_profit_usd, total_risk_usd),
            meets_target: total_profit_usd >= self.daily_target_usd,
        })
    }
}

impl Default for RiskSizer {
    fn default() -> Self {
        Self::from_config(&RiskConfig::default())
    }
}
