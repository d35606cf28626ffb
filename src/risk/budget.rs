//! Dollar risk budget and per-instrument size caps.

use crate::config::RiskConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

/// Turns an account balance and a requested risk percent into a dollar budget.
#[derive(Debug, Clone)]
pub struct RiskBudget {
    config: RiskConfig,
}

impl RiskBudget {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Requested percent clamped into the configured range, or the default when absent.
    pub fn effective_percent(&self, requested: Option<Decimal>) -> Decimal {
        let percent = requested.unwrap_or(self.config.default_risk_percent);
        let clamped = percent.clamp(self.config.min_risk_percent, self.config.max_risk_percent);
        if clamped != percent {
            debug!(requested = %percent, applied = %clamped, "Risk percent clamped");
        }
        clamped
    }

    /// Maximum dollar loss for one trade.
    pub fn max_risk_usd(&self, balance: Decimal, requested_percent: Option<Decimal>) -> Decimal {
        balance * self.effective_percent(requested_percent) / dec!(100)
    }

    /// Maximum size for an instrument symbol such as "MGC".
    pub fn cap_for(&self, symbol: &str) -> Decimal {
        self.config.max_contracts_for(symbol)
    }
}
