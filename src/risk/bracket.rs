//! Conversion of absolute stop-loss/take-profit prices into tick offsets.
//!
//! The broker attaches brackets to an entry order as signed tick distances
//! from the entry price, so a long stop below entry is negative and a long
//! target above entry is positive.

use super::error::RiskError;
use crate::exchange::{BracketLeg, WireOrderType};
use crate::utils::decimal::round_half_away;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entry order kinds a trade plan can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OrderKind {
    Limit,
    Stop,
    Market,
}

impl OrderKind {
    /// Internal numeric code: 0 = Limit, 1 = Stop, 2 = Market.
    pub fn from_code(code: i32) -> Result<Self, RiskError> {
        match code {
            0 => Ok(OrderKind::Limit),
            1 => Ok(OrderKind::Stop),
            2 => Ok(OrderKind::Market),
            other => Err(RiskError::UnsupportedOrderType(other.to_string())),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            OrderKind::Limit => 0,
            OrderKind::Stop => 1,
            OrderKind::Market => 2,
        }
    }

    /// Broker wire type for this kind.
    pub fn wire_type(&self) -> WireOrderType {
        match self {
            OrderKind::Limit => WireOrderType::Limit,
            OrderKind::Stop => WireOrderType::Stop,
            OrderKind::Market => WireOrderType::Market,
        }
    }

    /// Resting orders get a fill monitor; market orders fill on placement.
    pub fn rests_on_book(&self) -> bool {
        !matches!(self, OrderKind::Market)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop => "STOP",
            OrderKind::Market => "MARKET",
        }
    }
}

impl std::str::FromStr for OrderKind {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LIMIT" => Ok(OrderKind::Limit),
            "STOP" => Ok(OrderKind::Stop),
            "MARKET" => Ok(OrderKind::Market),
            _ => Err(RiskError::UnsupportedOrderType(s.to_string())),
        }
    }
}

impl TryFrom<String> for OrderKind {
    type Error = RiskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrderKind> for String {
    fn from(kind: OrderKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed tick offsets of the protective legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Bracket {
    pub stop_loss_ticks: Option<i64>,
    pub take_profit_ticks: Option<i64>,
}

impl Bracket {
    /// Wire legs: stop-loss as a stop order, take-profit as a limit order.
    pub fn legs(&self) -> (Option<BracketLeg>, Option<BracketLeg>) {
        let stop = self.stop_loss_ticks.map(|ticks| BracketLeg {
            ticks,
            order_type: WireOrderType::Stop,
        });
        let target = self.take_profit_ticks.map(|ticks| BracketLeg {
            ticks,
            order_type: WireOrderType::Limit,
        });
        (stop, target)
    }
}

/// Convert absolute prices to tick offsets from `entry`, rounding half away from zero.
pub fn to_bracket(
    entry: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    tick_size: Decimal,
) -> Result<Bracket, RiskError> {
    if tick_size <= Decimal::ZERO {
        return Err(RiskError::InvalidTickSize(tick_size));
    }

    let ticks = |price: Decimal| -> Result<i64, RiskError> {
        round_half_away((price - entry) / tick_size)
            .to_i64()
            .ok_or(RiskError::InvalidTickSize(tick_size))
    };

    Ok(Bracket {
        stop_loss_ticks: stop_loss.map(ticks).transpose()?,
        take_profit_ticks: take_profit.map(ticks).transpose()?,
    })
}
