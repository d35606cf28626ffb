//! Net position reconstruction from the trade ledger.
//!
//! The live positions endpoint can lag behind executions, so the ledger is
//! treated as ground truth. Live data only serves as a cross-check.

use crate::exchange::{OrderSide, Position, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Fold executions into signed net sizes per contract.
///
/// Trades are ordered by timestamp with ties kept in input order, buys add
/// and sells subtract. Voided executions are skipped and flat contracts are
/// left out of the result.
pub fn reconcile(trades: &[Trade]) -> BTreeMap<String, Decimal> {
    let mut ordered: Vec<&Trade> = trades.iter().filter(|t| !t.voided).collect();
    ordered.sort_by_key(|t| t.creation_timestamp);

    let mut net: BTreeMap<String, Decimal> = BTreeMap::new();
    for trade in ordered {
        let signed = match trade.side {
            OrderSide::Buy => trade.size,
            OrderSide::Sell => -trade.size,
        };
        *net.entry(trade.contract_id.clone()).or_default() += signed;
    }

    net.retain(|_, size| !size.is_zero());
    net
}

/// Net size of one contract.
pub fn net_position(trades: &[Trade], contract_id: &str) -> Decimal {
    reconcile(trades)
        .get(contract_id)
        .copied()
        .unwrap_or(Decimal::ZERO)
}

/// Net size of one contract built by a single order.
///
/// Only counts executions of `order_id` itself or executions stamped at or
/// after `since`, so round trips that closed before the order was placed
/// cannot cancel its fill when the queried window cuts them in half.
pub fn net_position_since(
    trades: &[Trade],
    contract_id: &str,
    order_id: i64,
    since: DateTime<Utc>,
) -> Decimal {
    let own: Vec<Trade> = trades
        .iter()
        .filter(|t| t.order_id == Some(order_id) || t.creation_timestamp >= since)
        .cloned()
        .collect();
    net_position(&own, contract_id)
}

/// Ledger position next to what the live endpoint reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionView {
    pub contract_id: String,
    pub net_size: Decimal,
    pub live_size: Option<Decimal>,
    pub agrees: bool,
}

/// Merge ledger positions with live ones. The ledger wins; disagreements are logged.
pub fn merge_positions(ledger: &BTreeMap<String, Decimal>, live: &[Position]) -> Vec<PositionView> {
    let mut live_sizes: BTreeMap<&str, Decimal> = BTreeMap::new();
    for position in live {
        *live_sizes.entry(position.contract_id.as_str()).or_default() += position.signed_size();
    }

    let mut contracts: Vec<&str> = ledger.keys().map(String::as_str).collect();
    for contract in live_sizes.keys() {
        if !ledger.contains_key(*contract) {
            contracts.push(*contract);
        }
    }
    contracts.sort_unstable();

    contracts
        .into_iter()
        .map(|contract_id| {
            let net_size = ledger.get(contract_id).copied().unwrap_or(Decimal::ZERO);
            let live_size = live_sizes.get(contract_id).copied();
            let agrees = live_size.unwrap_or(Decimal::ZERO) == net_size;
            if !agrees {
                warn!(
                    contract_id,
                    ledger = %net_size,
                    live = ?live_size,
                    "Live position disagrees with trade ledger"
                );
            }
            PositionView {
                contract_id: contract_id.to_string(),
                net_size,
                live_size,
                agrees,
            }
        })
        .collect()
}
