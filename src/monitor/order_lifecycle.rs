//! Per-order lifecycle monitor.
//!
//! ```text
//! PendingFill ──► Filled ──► Supervising ──► Closed
//!      │
//!      ├──► Cancelled
//!      ├──► Rejected
//!      └──► TimedOut
//! ```
//!
//! The first status poll happens immediately, the second after the initial
//! delay and every later one after the regular interval. Before each poll the
//! elapsed time since the monitor started is checked against the timeout; a
//! timed-out order is reported but left working at the broker.

use crate::config::MonitorConfig;
use crate::exchange::{
    BrokerApi, ModifyOrderRequest, OrderSide, OrderStatus, PlaceOrderRequest, WireOrderType,
};
use crate::notify::{notify_or_log, Notifier};
use crate::persistence::{MonitoredOrder, Store};
use crate::risk::reconciler::net_position_since;
use crate::strategy::command::run_json_command;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Monitor state, persisted with each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MonitorState {
    PendingFill,
    Filled,
    Cancelled,
    Rejected,
    TimedOut,
    Supervising,
    Closed,
}

impl MonitorState {
    /// States after which the monitor has nothing left to do.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorState::Cancelled
                | MonitorState::Rejected
                | MonitorState::TimedOut
                | MonitorState::Closed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::PendingFill => "PENDING_FILL",
            MonitorState::Filled => "FILLED",
            MonitorState::Cancelled => "CANCELLED",
            MonitorState::Rejected => "REJECTED",
            MonitorState::TimedOut => "TIMED_OUT",
            MonitorState::Supervising => "SUPERVISING",
            MonitorState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_FILL" => Ok(MonitorState::PendingFill),
            "FILLED" => Ok(MonitorState::Filled),
            "CANCELLED" => Ok(MonitorState::Cancelled),
            "REJECTED" => Ok(MonitorState::Rejected),
            "TIMED_OUT" => Ok(MonitorState::TimedOut),
            "SUPERVISING" => Ok(MonitorState::Supervising),
            "CLOSED" => Ok(MonitorState::Closed),
            other => Err(format!("unknown monitor state '{}'", other)),
        }
    }
}

/// Monitor timing.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub initial_poll: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub order_lookback: chrono::Duration,
    pub supervise_interval: Duration,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            initial_poll: config.initial_poll(),
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            order_lookback: config.order_lookback(),
            supervise_interval: config.supervise_interval(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// Position management decision while supervising a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisionDecision {
    Hold,
    Close,
    #[serde(rename = "MODIFY_SL_TP", alias = "MODIFY")]
    Modify {
        #[serde(default)]
        new_stop_loss: Option<Decimal>,
        #[serde(default)]
        new_take_profit: Option<Decimal>,
    },
}

/// What the advisor is told about a supervised position.
#[derive(Debug, Clone)]
pub struct SupervisionContext {
    pub order_id: i64,
    pub contract_id: String,
    pub entry_side: OrderSide,
    pub net_position: Decimal,
}

/// Decides how to manage an open position.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SupervisionAdvisor: Send + Sync {
    async fn advise(&self, context: &SupervisionContext) -> Result<SupervisionDecision>;
}

/// Advisor backed by an external command printing `{"decision": ...}`.
///
/// The command sees `SENTINEL_ORDER_ID`, `SENTINEL_CONTRACT`, `SENTINEL_SIDE`
/// and `SENTINEL_NET_POSITION`.
pub struct CommandAdvisor {
    command: String,
    timeout: Duration,
}

impl CommandAdvisor {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SupervisionAdvisor for CommandAdvisor {
    async fn advise(&self, context: &SupervisionContext) -> Result<SupervisionDecision> {
        let env = [
            ("SENTINEL_ORDER_ID", context.order_id.to_string()),
            ("SENTINEL_CONTRACT", context.contract_id.clone()),
            ("SENTINEL_SIDE", context.entry_side.to_string()),
            ("SENTINEL_NET_POSITION", context.net_position.to_string()),
        ];
        run_json_command(&self.command, &env, self.timeout).await
    }
}

/// Collaborators shared by every monitor.
#[derive(Clone)]
pub struct MonitorContext {
    pub broker: Arc<dyn BrokerApi>,
    pub store: Arc<Store>,
    pub notifier: Arc<dyn Notifier>,
    pub advisor: Option<Arc<dyn SupervisionAdvisor>>,
    pub settings: MonitorSettings,
}

/// Drives one order from submission to a terminal state.
pub struct OrderLifecycleMonitor {
    ctx: MonitorContext,
    record: MonitoredOrder,
}

impl OrderLifecycleMonitor {
    pub fn new(ctx: MonitorContext, record: MonitoredOrder) -> Self {
        Self { ctx, record }
    }

    /// Run until a terminal state and return it.
    #[instrument(skip(self), fields(order_id = self.record.order_id, contract = %self.record.contract_id))]
    pub async fn run(mut self) -> MonitorState {
        let state = match self.record.state {
            MonitorState::PendingFill => self.await_fill().await,
            MonitorState::Filled | MonitorState::Supervising => MonitorState::Filled,
            terminal => return terminal,
        };

        if state != MonitorState::Filled {
            return state;
        }
        self.supervise().await
    }

    /// Poll order status until it leaves the working states or the timeout passes.
    async fn await_fill(&mut self) -> MonitorState {
        let already_elapsed = (Utc::now() - self.record.started_at)
            .to_std()
            .unwrap_or_default();
        let deadline = Instant::now() + self.ctx.settings.timeout.saturating_sub(already_elapsed);
        let mut polls: u32 = 0;

        info!(timeout = ?self.ctx.settings.timeout, "Monitoring order until fill");

        loop {
            if Instant::now() >= deadline {
                let text = format!(
                    "Order #{} not filled within {}h. Monitor stopped; the order was left working.",
                    self.record.order_id,
                    self.ctx.settings.timeout.as_secs() / 3600
                );
                self.transition(MonitorState::TimedOut, &text).await;
                return MonitorState::TimedOut;
            }

            polls += 1;
            let lookup = self
                .ctx
                .broker
                .find_order(
                    self.record.account_id,
                    self.record.order_id,
                    self.ctx.settings.order_lookback,
                )
                .await;

            match lookup {
                Ok(Some(order)) => {
                    debug!(poll = polls, status = ?order.status, "Order status");
                    self.journal("poll", &format!("#{} status {:?}", polls, order.status));

                    let next = match order.status {
                        OrderStatus::Filled => Some(MonitorState::Filled),
                        OrderStatus::Cancelled => Some(MonitorState::Cancelled),
                        OrderStatus::Rejected => Some(MonitorState::Rejected),
                        _ => None,
                    };
                    if let Some(next) = next {
                        let text = format!(
                            "Order #{} {}: {} {} {}",
                            self.record.order_id,
                            next,
                            self.record.expected_side,
                            order.size,
                            self.record.contract_id
                        );
                        self.transition(next, &text).await;
                        return next;
                    }
                }
                Ok(None) => {
                    warn!(poll = polls, "Order not found in recent orders");
                    self.journal("poll_error", &format!("#{} order not found", polls));
                }
                Err(e) => {
                    warn!(poll = polls, error = %e, "Order status query failed");
                    self.journal("poll_error", &format!("#{} {}", polls, e));
                }
            }

            let delay = if polls == 1 {
                self.ctx.settings.initial_poll
            } else {
                self.ctx.settings.poll_interval
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Watch the filled position until the ledger shows it flat.
    async fn supervise(&mut self) -> MonitorState {
        if self.record.state != MonitorState::Supervising {
            let text = format!(
                "Order #{} is now supervised every {}s",
                self.record.order_id,
                self.ctx.settings.supervise_interval.as_secs()
            );
            self.record.state = MonitorState::Supervising;
            self.persist_state();
            self.journal("transition", &text);
        }

        loop {
            tokio::time::sleep(self.ctx.settings.supervise_interval).await;

            match self.supervise_once().await {
                Ok(true) => {
                    let text = format!(
                        "Position from order #{} on {} is closed",
                        self.record.order_id, self.record.contract_id
                    );
                    self.transition(MonitorState::Closed, &text).await;
                    return MonitorState::Closed;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Supervision pass failed");
                    self.journal("supervise_error", &e.to_string());
                }
            }
        }
    }

    /// One supervision pass. Returns true once the position is flat.
    async fn supervise_once(&self) -> Result<bool> {
        let end = Utc::now();
        let start = self.record.started_at - self.ctx.settings.order_lookback;
        let trades = self
            .ctx
            .broker
            .trades(self.record.account_id, start, end)
            .await
            .context("Trade ledger query failed")?;

        let net = net_position_since(
            &trades,
            &self.record.contract_id,
            self.record.order_id,
            self.record.started_at,
        );
        self.journal("supervise", &format!("net position {}", net));
        if net.is_zero() {
            return Ok(true);
        }

        let Some(advisor) = &self.ctx.advisor else {
            return Ok(false);
        };

        let decision = advisor
            .advise(&SupervisionContext {
                order_id: self.record.order_id,
                contract_id: self.record.contract_id.clone(),
                entry_side: self.record.expected_side,
                net_position: net,
            })
            .await
            .context("Supervision advisor failed")?;
        info!(?decision, %net, "Supervision decision");
        self.journal("decision", &format!("{:?}", decision));

        match decision {
            SupervisionDecision::Hold => {}
            SupervisionDecision::Close => self.close_position(net).await?,
            SupervisionDecision::Modify {
                new_stop_loss,
                new_take_profit,
            } => {
                self.modify_protection(start, new_stop_loss, new_take_profit)
                    .await?
            }
        }
        Ok(false)
    }

    /// Flatten with a market order on the opposite side.
    async fn close_position(&self, net: Decimal) -> Result<()> {
        let side = if net > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let size = net
            .abs()
            .ceil()
            .to_i64()
            .context("Position size out of range")?;

        let order_id = self
            .ctx
            .broker
            .place_order(&PlaceOrderRequest {
                account_id: self.record.account_id,
                contract_id: self.record.contract_id.clone(),
                order_type: WireOrderType::Market,
                side,
                size,
                limit_price: None,
                stop_price: None,
                stop_loss_bracket: None,
                take_profit_bracket: None,
            })
            .await
            .context("Closing order failed")?;

        let text = format!(
            "Closing position from order #{}: {} {} {} (order #{})",
            self.record.order_id, side, size, self.record.contract_id, order_id
        );
        self.journal("close", &text);
        notify_or_log(self.ctx.notifier.as_ref(), &text).await;
        Ok(())
    }

    /// Move the working stop and/or target orders on this contract.
    async fn modify_protection(
        &self,
        since: chrono::DateTime<Utc>,
        new_stop_loss: Option<Decimal>,
        new_take_profit: Option<Decimal>,
    ) -> Result<()> {
        let orders = self
            .ctx
            .broker
            .orders(self.record.account_id, since, Utc::now())
            .await
            .context("Order query failed")?;

        let working = orders.into_iter().filter(|o| {
            o.contract_id == self.record.contract_id
                && o.status == OrderStatus::Working
                && o.id != self.record.order_id
        });

        let mut modified = 0;
        for order in working {
            let request = match (order.order_type, new_stop_loss, new_take_profit) {
                (WireOrderType::Stop, Some(stop), _) => ModifyOrderRequest {
                    account_id: self.record.account_id,
                    order_id: order.id,
                    limit_price: None,
                    stop_price: Some(stop),
                },
                (WireOrderType::Limit, _, Some(target)) => ModifyOrderRequest {
                    account_id: self.record.account_id,
                    order_id: order.id,
                    limit_price: Some(target),
                    stop_price: None,
                },
                _ => continue,
            };
            self.ctx
                .broker
                .modify_order(&request)
                .await
                .with_context(|| format!("Modifying order #{} failed", order.id))?;
            modified += 1;
        }

        let text = format!(
            "Order #{} protection updated (stop {:?}, target {:?}, {} orders)",
            self.record.order_id, new_stop_loss, new_take_profit, modified
        );
        self.journal("modify", &text);
        notify_or_log(self.ctx.notifier.as_ref(), &text).await;
        Ok(())
    }

    async fn transition(&mut self, state: MonitorState, text: &str) {
        info!(from = %self.record.state, to = %state, "Monitor transition");
        self.record.state = state;
        self.persist_state();
        self.journal("transition", text);
        notify_or_log(self.ctx.notifier.as_ref(), text).await;
    }

    fn persist_state(&self) {
        if let Err(e) = self
            .ctx
            .store
            .update_monitor_state(self.record.order_id, self.record.state)
        {
            warn!(error = %e, "Failed to persist monitor state");
        }
    }

    fn journal(&self, event: &str, detail: &str) {
        if let Err(e) = self
            .ctx
            .store
            .append_journal(self.record.order_id, event, detail)
        {
            warn!(error = %e, "Failed to write monitor journal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::fixtures;
    use crate::exchange::{MockBroker, Trade};
    use crate::notify::MemoryNotifier;
    use rust_decimal_macros::dec;

    struct Harness {
        broker: MockBroker,
        store: Arc<Store>,
        notifier: Arc<MemoryNotifier>,
    }

    impl Harness {
        async fn new() -> Self {
            Self {
                broker: fixtures::broker().await,
                store: Arc::new(Store::in_memory().unwrap()),
                notifier: Arc::new(MemoryNotifier::default()),
            }
        }

        fn context(&self, advisor: Option<Arc<dyn SupervisionAdvisor>>) -> MonitorContext {
            MonitorContext {
                broker: Arc::new(self.broker.clone()),
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                advisor,
                settings: MonitorSettings::default(),
            }
        }

        /// Working buy limit order #1 with a persisted monitor record.
        async fn pending_order(&self) -> MonitoredOrder {
            self.broker
                .add_order(fixtures::order(
                    1,
                    OrderStatus::Working,
                    WireOrderType::Limit,
                    OrderSide::Buy,
                ))
                .await;
            let record = MonitoredOrder {
                order_id: 1,
                account_id: 7,
                contract_id: fixtures::mgc().id,
                expected_side: OrderSide::Buy,
                started_at: Utc::now(),
                state: MonitorState::PendingFill,
            };
            self.store.upsert_monitored_order(&record).unwrap();
            record
        }

        async fn fill_trade(&self, id: i64, side: OrderSide, size: Decimal) {
            self.broker
                .add_trade(Trade {
                    id,
                    account_id: 7,
                    contract_id: fixtures::mgc().id,
                    creation_timestamp: Utc::now(),
                    price: dec!(2350),
                    profit_and_loss: None,
                    fees: None,
                    side,
                    size,
                    voided: false,
                    order_id: Some(1),
                })
                .await;
        }
    }

    #[test]
    fn test_state_names_round_trip_through_store_format() {
        for state in [
            MonitorState::PendingFill,
            MonitorState::Supervising,
            MonitorState::TimedOut,
        ] {
            assert_eq!(state.as_str().parse::<MonitorState>().unwrap(), state);
        }
        assert!(MonitorState::Closed.is_terminal());
        assert!(!MonitorState::Filled.is_terminal());
    }

    #[test]
    fn test_decision_json() {
        let hold: SupervisionDecision =
            serde_json::from_str(r#"{"decision": "HOLD"}"#).unwrap();
        assert_eq!(hold, SupervisionDecision::Hold);

        let modify: SupervisionDecision = serde_json::from_str(
            r#"{"decision": "MODIFY_SL_TP", "new_stop_loss": 2345.5, "new_take_profit": null}"#,
        )
        .unwrap();
        assert_eq!(
            modify,
            SupervisionDecision::Modify {
                new_stop_loss: Some(dec!(2345.5)),
                new_take_profit: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_order_stops_monitor() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker
            .script_order(1, vec![(Duration::from_secs(40), OrderStatus::Cancelled)])
            .await;

        let state = OrderLifecycleMonitor::new(h.context(None), record).run().await;

        assert_eq!(state, MonitorState::Cancelled);
        // Polls at 0s, 15s, 45s.
        assert_eq!(h.broker.snapshot(|s| s.order_queries).await, 3);
        assert!(h.notifier.contains("CANCELLED"));
        assert_eq!(
            h.store.monitored_order(1).unwrap().unwrap().state,
            MonitorState::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_on_first_poll() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker.set_order_status(1, OrderStatus::Rejected).await;

        let state = OrderLifecycleMonitor::new(h.context(None), record).run().await;

        assert_eq!(state, MonitorState::Rejected);
        assert_eq!(h.broker.snapshot(|s| s.order_queries).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_before_late_fill() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker
            .script_order(
                1,
                vec![(Duration::from_secs(8 * 3600 + 60), OrderStatus::Filled)],
            )
            .await;

        let state = OrderLifecycleMonitor::new(h.context(None), record).run().await;

        assert_eq!(state, MonitorState::TimedOut);
        assert!(h.notifier.contains("not filled within 8h"));
        // The order is left alone.
        assert!(h.broker.snapshot(|s| s.cancelled.is_empty()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failures_are_retried() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker.fail_next_queries(2).await;
        h.broker
            .script_order(1, vec![(Duration::ZERO, OrderStatus::Cancelled)])
            .await;

        let state = OrderLifecycleMonitor::new(h.context(None), record).run().await;

        assert_eq!(state, MonitorState::Cancelled);
        let errors = h
            .store
            .journal(1)
            .unwrap()
            .into_iter()
            .filter(|e| e.event == "poll_error")
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_then_flat_ledger_closes() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker.set_order_status(1, OrderStatus::Filled).await;
        h.fill_trade(10, OrderSide::Buy, dec!(2)).await;
        h.fill_trade(11, OrderSide::Sell, dec!(2)).await;

        let state = OrderLifecycleMonitor::new(h.context(None), record).run().await;

        assert_eq!(state, MonitorState::Closed);
        let messages = h.notifier.messages();
        assert!(messages[0].contains("FILLED"));
        assert!(messages.last().unwrap().contains("closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_before_start_does_not_close_new_position() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        // An old round trip whose buy falls outside the look-back window
        // while its closing sell falls inside it.
        for (id, side, hours) in [(20, OrderSide::Buy, 30), (21, OrderSide::Sell, 10)] {
            h.broker
                .add_trade(Trade {
                    id,
                    account_id: 7,
                    contract_id: fixtures::mgc().id,
                    creation_timestamp: record.started_at - chrono::Duration::hours(hours),
                    price: dec!(2300),
                    profit_and_loss: None,
                    fees: None,
                    side,
                    size: dec!(2),
                    voided: false,
                    order_id: Some(id + 100),
                })
                .await;
        }
        h.broker.set_order_status(1, OrderStatus::Filled).await;
        h.fill_trade(10, OrderSide::Buy, dec!(2)).await;

        let monitor = OrderLifecycleMonitor::new(h.context(None), record);
        let handle = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_secs(181)).await;

        assert!(!handle.is_finished());
        assert!(!h.notifier.contains("closed"));
        let passes: Vec<String> = h
            .store
            .journal(1)
            .unwrap()
            .into_iter()
            .filter(|e| e.event == "supervise")
            .map(|e| e.detail)
            .collect();
        assert_eq!(passes, vec!["net position 2".to_string()]);

        h.fill_trade(11, OrderSide::Sell, dec!(2)).await;
        assert_eq!(handle.await.unwrap(), MonitorState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisor_close_places_opposite_market_order() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker.set_order_status(1, OrderStatus::Filled).await;
        h.fill_trade(10, OrderSide::Buy, dec!(2)).await;

        let broker = h.broker.clone();
        let mut advisor = MockSupervisionAdvisor::new();
        advisor.expect_advise().times(1).returning(move |ctx| {
            assert_eq!(ctx.net_position, dec!(2));
            Ok(SupervisionDecision::Close)
        });

        let monitor = OrderLifecycleMonitor::new(h.context(Some(Arc::new(advisor))), record);
        let handle = tokio::spawn(monitor.run());

        // First pass closes; the next pass sees the flat ledger.
        tokio::time::sleep(Duration::from_secs(181)).await;
        let placed = broker.snapshot(|s| s.placed.clone()).await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].size, 2);
        assert_eq!(placed[0].order_type, WireOrderType::Market);

        h.fill_trade(12, OrderSide::Sell, dec!(2)).await;
        assert_eq!(handle.await.unwrap(), MonitorState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisor_modify_moves_stop_and_target() {
        let h = Harness::new().await;
        let record = h.pending_order().await;
        h.broker.set_order_status(1, OrderStatus::Filled).await;
        h.fill_trade(10, OrderSide::Buy, dec!(2)).await;
        h.broker
            .add_order(fixtures::order(2, OrderStatus::Working, WireOrderType::Stop, OrderSide::Sell))
            .await;
        h.broker
            .add_order(fixtures::order(3, OrderStatus::Working, WireOrderType::Limit, OrderSide::Sell))
            .await;

        let mut advisor = MockSupervisionAdvisor::new();
        advisor.expect_advise().returning(|_| {
            Ok(SupervisionDecision::Modify {
                new_stop_loss: Some(dec!(2352)),
                new_take_profit: Some(dec!(2390)),
            })
        });

        let monitor = OrderLifecycleMonitor::new(h.context(Some(Arc::new(advisor))), record);
        let handle = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_secs(181)).await;
        handle.abort();

        let (stop, target) = h
            .broker
            .snapshot(|s| (s.orders[&2].stop_price, s.orders[&3].limit_price))
            .await;
        assert_eq!(stop, Some(dec!(2352)));
        assert_eq!(target, Some(dec!(2390)));
        assert_eq!(
            h.store.monitored_order(1).unwrap().unwrap().state,
            MonitorState::Supervising
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_timeout_counts_from_original_start() {
        let h = Harness::new().await;
        let mut record = h.pending_order().await;
        record.started_at = Utc::now() - chrono::Duration::hours(8) - chrono::Duration::minutes(1);

        let state = OrderLifecycleMonitor::new(h.context(None), record).run().await;

        assert_eq!(state, MonitorState::TimedOut);
        assert_eq!(h.broker.snapshot(|s| s.order_queries).await, 0);
    }
}
