//! Scripted in-memory broker for paper runs and tests.
//!
//! Orders placed against the mock start out working. Their later statuses
//! are either set directly or scripted as a schedule relative to the tokio
//! clock, so monitors can be driven through hours of lifecycle under a
//! paused runtime.

use super::error::BrokerError;
use super::traits::{BrokerApi, BrokerResult};
use super::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Status changes of one order, as offsets from when the script was attached.
#[derive(Debug, Clone)]
struct StatusScript {
    origin: Instant,
    steps: Vec<(Duration, OrderStatus)>,
}

impl StatusScript {
    fn status_now(&self) -> Option<OrderStatus> {
        let elapsed = self.origin.elapsed();
        self.steps
            .iter()
            .filter(|(offset, _)| *offset <= elapsed)
            .last()
            .map(|(_, status)| *status)
    }
}

/// Everything the mock knows and everything it was asked to do.
#[derive(Debug, Default)]
pub struct MockBrokerState {
    pub accounts: Vec<Account>,
    pub contracts: Vec<Contract>,
    pub orders: HashMap<i64, Order>,
    pub trades: Vec<Trade>,
    pub positions: Vec<Position>,
    pub bars: HashMap<String, Vec<Bar>>,
    pub placed: Vec<PlaceOrderRequest>,
    pub modified: Vec<ModifyOrderRequest>,
    pub cancelled: Vec<i64>,
    pub order_queries: u32,
    pub bar_queries: u32,
    scripts: HashMap<i64, StatusScript>,
    failures_remaining: u32,
    panics_remaining: u32,
}

/// Broker double implementing [`BrokerApi`] from in-memory state.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<RwLock<MockBrokerState>>,
    order_id_counter: Arc<AtomicI64>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockBrokerState::default())),
            order_id_counter: Arc::new(AtomicI64::new(1000)),
        }
    }

    /// Mock with one tradable account and the given active contracts.
    pub async fn with_account(account: Account, contracts: Vec<Contract>) -> Self {
        let broker = Self::new();
        {
            let mut state = broker.state.write().await;
            state.accounts.push(account);
            state.contracts = contracts;
        }
        broker
    }

    pub async fn add_contract(&self, contract: Contract) {
        self.state.write().await.contracts.push(contract);
    }

    pub async fn add_position(&self, position: Position) {
        self.state.write().await.positions.push(position);
    }

    pub async fn add_trade(&self, trade: Trade) {
        self.state.write().await.trades.push(trade);
    }

    /// Insert an order directly, bypassing placement.
    pub async fn add_order(&self, order: Order) {
        self.state.write().await.orders.insert(order.id, order);
    }

    /// Overwrite an order's status.
    pub async fn set_order_status(&self, order_id: i64, status: OrderStatus) {
        let mut state = self.state.write().await;
        state.scripts.remove(&order_id);
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = status;
            order.update_timestamp = Some(Utc::now());
        }
    }

    /// Script an order's statuses as offsets from now on the tokio clock.
    pub async fn script_order(&self, order_id: i64, steps: Vec<(Duration, OrderStatus)>) {
        self.state.write().await.scripts.insert(
            order_id,
            StatusScript {
                origin: Instant::now(),
                steps,
            },
        );
    }

    /// Latest price for a contract, recorded as a bar stamped now.
    pub async fn set_price(&self, contract_id: &str, price: Decimal) {
        self.push_bar(contract_id, Utc::now(), price).await;
    }

    pub async fn push_bar(&self, contract_id: &str, t: DateTime<Utc>, close: Decimal) {
        let bar = Bar {
            t,
            o: close,
            h: close,
            l: close,
            c: close,
            v: Decimal::ONE,
        };
        self.state
            .write()
            .await
            .bars
            .entry(contract_id.to_string())
            .or_default()
            .push(bar);
    }

    /// Make the next `n` order and bar queries fail.
    pub async fn fail_next_queries(&self, n: u32) {
        self.state.write().await.failures_remaining = n;
    }

    /// Make the next `n` order queries panic.
    pub async fn panic_next_order_queries(&self, n: u32) {
        self.state.write().await.panics_remaining = n;
    }

    /// Read access to the recorded state for assertions.
    pub async fn snapshot<R>(&self, f: impl FnOnce(&MockBrokerState) -> R) -> R {
        f(&*self.state.read().await)
    }

    fn next_order_id(&self) -> i64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn take_failure(state: &mut MockBrokerState, what: &str) -> BrokerResult<()> {
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BrokerError::Simulated(format!("{} unavailable", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn accounts(&self) -> BrokerResult<Vec<Account>> {
        Ok(self.state.read().await.accounts.clone())
    }

    async fn search_contracts(&self, symbol: &str) -> BrokerResult<Vec<Contract>> {
        let needle = symbol.to_ascii_uppercase();
        Ok(self
            .state
            .read()
            .await
            .contracts
            .iter()
            .filter(|c| c.name.to_ascii_uppercase().starts_with(&needle) || c.id.contains(&needle))
            .cloned()
            .collect())
    }

    async fn open_positions(&self, account_id: i64) -> BrokerResult<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .iter()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn orders(
        &self,
        account_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Order>> {
        let mut state = self.state.write().await;
        state.order_queries += 1;

        if state.panics_remaining > 0 {
            state.panics_remaining -= 1;
            drop(state);
            panic!("simulated broker panic");
        }
        Self::take_failure(&mut state, "order search")?;

        let updates: Vec<(i64, OrderStatus)> = state
            .scripts
            .iter()
            .filter_map(|(id, script)| script.status_now().map(|status| (*id, status)))
            .collect();
        for (id, status) in updates {
            if let Some(order) = state.orders.get_mut(&id) {
                order.status = status;
            }
        }

        Ok(state
            .orders
            .values()
            .filter(|o| o.account_id == account_id)
            .filter(|o| o.creation_timestamp >= start && o.creation_timestamp <= end)
            .cloned()
            .collect())
    }

    async fn trades(
        &self,
        account_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Trade>> {
        Ok(self
            .state
            .read()
            .await
            .trades
            .iter()
            .filter(|t| t.account_id == account_id)
            .filter(|t| t.creation_timestamp >= start && t.creation_timestamp <= end)
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> BrokerResult<i64> {
        let id = self.next_order_id();
        let order = Order {
            id,
            account_id: request.account_id,
            contract_id: request.contract_id.clone(),
            creation_timestamp: Utc::now(),
            update_timestamp: None,
            status: OrderStatus::Working,
            order_type: request.order_type,
            side: request.side,
            size: Decimal::from(request.size),
            limit_price: request.limit_price,
            stop_price: request.stop_price,
        };

        let mut state = self.state.write().await;
        state.orders.insert(id, order);
        state.placed.push(request.clone());
        debug!(order_id = id, contract = %request.contract_id, side = %request.side, "Mock order placed");
        Ok(id)
    }

    async fn cancel_order(&self, _account_id: i64, order_id: i64) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        state.scripts.remove(&order_id);
        match state.orders.get_mut(&order_id) {
            Some(order) => {
                order.status = OrderStatus::Cancelled;
                state.cancelled.push(order_id);
                Ok(())
            }
            None => Err(BrokerError::Api {
                endpoint: "/Order/cancel".to_string(),
                code: 2,
                message: "Order not found".to_string(),
            }),
        }
    }

    async fn modify_order(&self, request: &ModifyOrderRequest) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&request.order_id)
            .ok_or_else(|| BrokerError::Api {
                endpoint: "/Order/modify".to_string(),
                code: 2,
                message: "Order not found".to_string(),
            })?;
        if request.limit_price.is_some() {
            order.limit_price = request.limit_price;
        }
        if request.stop_price.is_some() {
            order.stop_price = request.stop_price;
        }
        state.modified.push(request.clone());
        Ok(())
    }

    async fn bars(&self, request: &BarsRequest) -> BrokerResult<Vec<Bar>> {
        let mut state = self.state.write().await;
        state.bar_queries += 1;
        Self::take_failure(&mut state, "bar history")?;

        Ok(state
            .bars
            .get(&request.contract_id)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.t >= request.start_time && b.t <= request.end_time)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
