//! Broker-agnostic interface used by the executor and the monitors.
//!
//! The live client and the scripted mock both implement [`BrokerApi`], so the
//! monitors can be driven against simulated order lifecycles in tests.

use super::error::BrokerError;
use super::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Account, contract, order, position and trade-history operations.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Active trading accounts.
    async fn accounts(&self) -> BrokerResult<Vec<Account>>;

    /// Contracts matching a symbol (e.g. "MGC").
    async fn search_contracts(&self, symbol: &str) -> BrokerResult<Vec<Contract>>;

    /// Positions the broker currently reports as open.
    async fn open_positions(&self, account_id: i64) -> BrokerResult<Vec<Position>>;

    /// Orders created within a time range.
    async fn orders(
        &self,
        account_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Order>>;

    /// Executions within a time range.
    async fn trades(
        &self,
        account_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Trade>>;

    /// Place an order, returning the broker's order id.
    async fn place_order(&self, request: &PlaceOrderRequest) -> BrokerResult<i64>;

    /// Cancel a working order.
    async fn cancel_order(&self, account_id: i64, order_id: i64) -> BrokerResult<()>;

    /// Move the limit and/or stop price of a working order.
    async fn modify_order(&self, request: &ModifyOrderRequest) -> BrokerResult<()>;

    /// Historical price bars.
    async fn bars(&self, request: &BarsRequest) -> BrokerResult<Vec<Bar>>;

    /// Account by name, or the first active account when no name is given.
    /// A configured name that matches no account is an error.
    async fn account(&self, name: Option<&str>) -> BrokerResult<Account> {
        let accounts = self.accounts().await?;
        let (chosen, missing) = match name {
            Some(name) => (
                accounts.iter().find(|a| a.name == name),
                format!("account '{}' not found", name),
            ),
            None => (accounts.first(), "no active accounts".to_string()),
        };
        chosen.cloned().ok_or_else(|| BrokerError::Api {
            endpoint: "/Account/search".to_string(),
            code: 0,
            message: missing,
        })
    }

    /// The unique currently-active contract for a symbol.
    async fn active_contract(&self, symbol: &str) -> BrokerResult<Contract> {
        let mut active: Vec<Contract> = self
            .search_contracts(symbol)
            .await?
            .into_iter()
            .filter(|c| c.active_contract)
            .collect();

        match active.len() {
            0 => Err(BrokerError::ContractNotFound(symbol.to_string())),
            1 => Ok(active.remove(0)),
            count => Err(BrokerError::AmbiguousContract {
                symbol: symbol.to_string(),
                count,
            }),
        }
    }

    /// Look up a single order by id among recent orders.
    async fn find_order(
        &self,
        account_id: i64,
        order_id: i64,
        lookback: Duration,
    ) -> BrokerResult<Option<Order>> {
        let end = Utc::now();
        let orders = self.orders(account_id, end - lookback, end).await?;
        Ok(orders.into_iter().find(|o| o.id == order_id))
    }

    /// Close of the most recent one-second bar within `lookback`.
    async fn latest_price(&self, contract_id: &str, lookback: Duration) -> BrokerResult<Decimal> {
        let end = Utc::now();
        let request = BarsRequest {
            contract_id: contract_id.to_string(),
            live: false,
            start_time: end - lookback,
            end_time: end,
            unit: BAR_UNIT_SECOND,
            unit_number: 1,
            limit: 1,
            include_partial_bar: true,
        };

        self.bars(&request)
            .await?
            .into_iter()
            .max_by_key(|bar| bar.t)
            .map(|bar| bar.c)
            .ok_or_else(|| BrokerError::NoPrice(contract_id.to_string()))
    }
}
