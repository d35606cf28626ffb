//! Trade plan execution.
//!
//! Takes an already-decided plan through contract resolution, the ledger
//! position check, risk sizing, bracket conversion and placement, then hands
//! resting orders to the monitor supervisor.

use super::plan::{AnalysisRequest, DecisionWorkflow, TradePlan};
use crate::config::Config;
use crate::exchange::{BrokerApi, OrderSide, PlaceOrderRequest};
use crate::monitor::{LevelTriggerHandler, MonitorState, MonitorSupervisor};
use crate::notify::{notify_or_log, Notifier};
use crate::persistence::{KeyLevel, MonitoredOrder, Store};
use crate::risk::reconciler::net_position;
use crate::risk::{to_bracket, Bracket, OrderKind, RiskBudget, RiskSizer, RiskSizingResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What happened to a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Nothing was sent to the broker.
    NoTrade(String),
    /// The ledger shows an open position on the contract and the broker agrees.
    PositionOpen { contract_id: String, net: Decimal },
    Placed {
        order_id: i64,
        contract_id: String,
        side: OrderSide,
        size: i64,
        kind: OrderKind,
        sizing: RiskSizingResult,
        bracket: Bracket,
        /// Whether a lifecycle monitor was started for the order.
        monitored: bool,
    },
}

/// Places trade plans at the broker.
pub struct TradeExecutor {
    broker: Arc<dyn BrokerApi>,
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    sizer: RiskSizer,
    budget: RiskBudget,
    account_name: Option<String>,
    lookback: chrono::Duration,
    price_lookback: chrono::Duration,
    monitors: Option<Arc<MonitorSupervisor>>,
}

impl TradeExecutor {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Self {
        Self {
            broker,
            store,
            notifier,
            sizer: RiskSizer::from_config(&config.risk),
            budget: RiskBudget::new(config.risk.clone()),
            account_name: config.broker.account_name.clone(),
            lookback: config.monitor.order_lookback(),
            price_lookback: config.watcher.price_lookback(),
            monitors: None,
        }
    }

    /// Start a lifecycle monitor for every resting order placed.
    pub fn with_monitors(mut self, monitors: Arc<MonitorSupervisor>) -> Self {
        self.monitors = Some(monitors);
        self
    }

    /// Whether the live endpoint confirms a position on `contract_id`.
    ///
    /// The ledger window can cut an older round trip in half, so a non-zero
    /// windowed net only blocks placement when the broker agrees. If the
    /// live query fails the ledger answer stands.
    async fn live_position_open(&self, account_id: i64, contract_id: &str) -> bool {
        match self.broker.open_positions(account_id).await {
            Ok(live) => {
                let live_net: Decimal = live
                    .iter()
                    .filter(|p| p.contract_id == contract_id)
                    .map(|p| p.signed_size())
                    .sum();
                let open = !live_net.is_zero();
                if !open {
                    warn!(contract_id, "Ledger window shows a position the broker does not, placing anyway");
                }
                open
            }
            Err(e) => {
                warn!(error = %e, "Live position check failed, trusting the ledger");
                true
            }
        }
    }

    /// Execute `plan` on the active contract for `symbol`.
    #[instrument(skip(self, plan), fields(action = ?plan.action, kind = %plan.order_type))]
    pub async fn execute(
        &self,
        symbol: &str,
        plan: &TradePlan,
        source_id: &str,
    ) -> Result<ExecutionOutcome> {
        let Some(side) = plan.action.side() else {
            info!("Plan says wait, nothing to place");
            return Ok(ExecutionOutcome::NoTrade("plan action is WAIT".to_string()));
        };
        let stop_loss = plan
            .stop_loss
            .ok_or_else(|| anyhow!("Plan has no stop loss"))?;
        let take_profit = plan
            .primary_take_profit()
            .ok_or_else(|| anyhow!("Plan has no take profit"))?;

        let contract = self
            .broker
            .active_contract(symbol)
            .await
            .with_context(|| format!("Failed to resolve contract for {}", symbol))?;
        let account = self
            .broker
            .account(self.account_name.as_deref())
            .await
            .context("Failed to load account")?;

        let entry = match (plan.entry_price, plan.order_type) {
            (Some(entry), _) => entry,
            (None, OrderKind::Market) => self
                .broker
                .latest_price(&contract.id, self.price_lookback)
                .await
                .context("No entry price and no market price")?,
            (None, kind) => return Err(anyhow!("{} plan has no entry price", kind)),
        };

        let stored = self
            .store
            .insert_key_levels(&plan.key_levels(symbol, source_id))
            .context("Failed to store key levels")?;
        info!(stored, "Key levels saved");

        let end = Utc::now();
        let trades = self
            .broker
            .trades(account.id, end - self.lookback, end)
            .await
            .context("Failed to load trade ledger")?;
        let net = net_position(&trades, &contract.id);
        if !net.is_zero() && self.live_position_open(account.id, &contract.id).await {
            warn!(contract = %contract.id, %net, "Position already open, not placing");
            return Ok(ExecutionOutcome::PositionOpen {
                contract_id: contract.id,
                net,
            });
        }

        let max_risk = self.budget.max_risk_usd(account.balance, plan.risk_percent);
        let sizing = self.sizer.size(
            entry,
            stop_loss,
            take_profit,
            contract.multiplier(),
            max_risk,
            self.budget.cap_for(symbol),
        )?;
        let size = sizing.contracts()?;
        let bracket = to_bracket(entry, Some(stop_loss), Some(take_profit), contract.tick_size)?;
        let (stop_loss_bracket, take_profit_bracket) = bracket.legs();

        let request = PlaceOrderRequest {
            account_id: account.id,
            contract_id: contract.id.clone(),
            order_type: plan.order_type.wire_type(),
            side,
            size,
            limit_price: (plan.order_type == OrderKind::Limit).then_some(entry),
            stop_price: (plan.order_type == OrderKind::Stop).then_some(entry),
            stop_loss_bracket,
            take_profit_bracket,
        };

        info!(
            contract = %contract.id,
            %side,
            size,
            %entry,
            %max_risk,
            total_risk = %sizing.total_risk_usd,
            "Placing order"
        );
        let order_id = self
            .broker
            .place_order(&request)
            .await
            .context("Order placement failed")?;

        let text = format!(
            "Placed {} {} {} x{} @ {} (SL {}, TP {}), order #{}",
            plan.order_type, side, contract.name, size, entry, stop_loss, take_profit, order_id
        );
        notify_or_log(self.notifier.as_ref(), &text).await;

        let mut monitored = false;
        if plan.order_type.rests_on_book() {
            if let Some(monitors) = &self.monitors {
                monitors
                    .spawn(MonitoredOrder {
                        order_id,
                        account_id: account.id,
                        contract_id: contract.id.clone(),
                        expected_side: side,
                        started_at: Utc::now(),
                        state: MonitorState::PendingFill,
                    })
                    .await?;
                monitored = true;
            }
        }

        Ok(ExecutionOutcome::Placed {
            order_id,
            contract_id: contract.id,
            side,
            size,
            kind: plan.order_type,
            sizing,
            bracket,
            monitored,
        })
    }
}

/// Level trigger handler that asks the decision workflow for a plan and executes it.
pub struct AnalyzeAndExecute {
    workflow: Arc<dyn DecisionWorkflow>,
    executor: Arc<TradeExecutor>,
}

impl AnalyzeAndExecute {
    pub fn new(workflow: Arc<dyn DecisionWorkflow>, executor: Arc<TradeExecutor>) -> Self {
        Self { workflow, executor }
    }
}

#[async_trait]
impl LevelTriggerHandler for AnalyzeAndExecute {
    async fn on_trigger(&self, level: &KeyLevel, price: Decimal) -> Result<()> {
        let request = AnalysisRequest {
            instrument: level.instrument.clone(),
            price: Some(price),
            level: Some(level.clone()),
        };
        let Some(plan) = self.workflow.decide(&request).await? else {
            info!(level_id = level.id, "Analysis produced no trade plan");
            return Ok(());
        };

        let outcome = self
            .executor
            .execute(&level.instrument, &plan, &format!("level-{}", level.id))
            .await?;
        info!(level_id = level.id, ?outcome, "Level trigger handled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::fixtures;
    use crate::exchange::{MockBroker, Position, PositionType, Trade, WireOrderType};
    use crate::monitor::{MonitorContext, MonitorSettings};
    use crate::notify::MemoryNotifier;
    use crate::strategy::plan::{MockDecisionWorkflow, TradeAction};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn plan(order_type: OrderKind) -> TradePlan {
        TradePlan {
            action: TradeAction::Buy,
            order_type,
            entry_price: Some(dec!(2350.5)),
            stop_loss: Some(dec!(2335.0)),
            take_profits: BTreeMap::from([
                ("tp1".to_string(), dec!(2365.0)),
                ("tp2".to_string(), dec!(2380.0)),
            ]),
            risk_percent: Some(dec!(3)),
            forecast_strength: None,
        }
    }

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

        fn executor(&self) -> TradeExecutor {
            TradeExecutor::new(
                Arc::new(self.broker.clone()),
                self.store.clone(),
                self.notifier.clone(),
                &Config::default(),
            )
        }

        fn supervisor(&self) -> Arc<MonitorSupervisor> {
            Arc::new(MonitorSupervisor::new(
                MonitorContext {
                    broker: Arc::new(self.broker.clone()),
                    store: self.store.clone(),
                    notifier: self.notifier.clone(),
                    advisor: None,
                    settings: MonitorSettings::default(),
                },
                3,
            ))
        }
    }

    #[tokio::test]
    async fn test_limit_plan_is_sized_and_bracketed() {
        let h = Harness::new().await;
        let outcome = h.executor().execute("MGC", &plan(OrderKind::Limit), "plan-1").await.unwrap();

        // 3% of 50,000 = 1,500 budget; 15.5 points * 10 = 155 per contract.
        let ExecutionOutcome::Placed { size, bracket, sizing, monitored, .. } = outcome else {
            panic!("expected placement");
        };
        assert_eq!(sizing.position_size, dec!(9.67));
        assert_eq!(size, 9);
        assert_eq!(bracket.stop_loss_ticks, Some(-155));
        assert_eq!(bracket.take_profit_ticks, Some(145));
        assert!(!monitored);

        let placed = h.broker.snapshot(|s| s.placed.clone()).await;
        assert_eq!(placed.len(), 1);
        let request = &placed[0];
        assert_eq!(request.order_type, WireOrderType::Limit);
        assert_eq!(request.limit_price, Some(dec!(2350.5)));
        assert_eq!(request.stop_price, None);
        assert_eq!(request.stop_loss_bracket.as_ref().unwrap().order_type, WireOrderType::Stop);
        assert_eq!(request.take_profit_bracket.as_ref().unwrap().ticks, 145);

        assert_eq!(h.store.levels(Some("MGC")).unwrap().len(), 4);
        assert!(h.notifier.contains("order #1000"));
    }

    #[tokio::test]
    async fn test_stop_plan_uses_stop_price() {
        let h = Harness::new().await;
        h.executor().execute("MGC", &plan(OrderKind::Stop), "plan-2").await.unwrap();

        let request = h.broker.snapshot(|s| s.placed[0].clone()).await;
        assert_eq!(request.order_type, WireOrderType::Stop);
        assert_eq!(request.stop_price, Some(dec!(2350.5)));
        assert_eq!(request.limit_price, None);
    }

    #[tokio::test]
    async fn test_market_plan_without_entry_uses_latest_price() {
        let h = Harness::new().await;
        h.broker.set_price(&fixtures::mgc().id, dec!(2350.5)).await;
        let mut plan = plan(OrderKind::Market);
        plan.entry_price = None;

        let outcome = h.executor().execute("MGC", &plan, "plan-3").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Placed { size: 9, monitored: false, .. }));
    }

    #[tokio::test]
    async fn test_wait_plan_places_nothing() {
        let h = Harness::new().await;
        let mut plan = plan(OrderKind::Limit);
        plan.action = TradeAction::Wait;

        let outcome = h.executor().execute("MGC", &plan, "plan-4").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::NoTrade(_)));
        assert!(h.broker.snapshot(|s| s.placed.is_empty()).await);
    }

    fn ledger_trade(id: i64, side: OrderSide, size: Decimal, at: chrono::DateTime<Utc>) -> Trade {
        Trade {
            id,
            account_id: 7,
            contract_id: fixtures::mgc().id,
            creation_timestamp: at,
            price: dec!(2340),
            profit_and_loss: None,
            fees: None,
            side,
            size,
            voided: false,
            order_id: None,
        }
    }

    #[tokio::test]
    async fn test_open_ledger_position_blocks_placement() {
        let h = Harness::new().await;
        h.broker
            .add_trade(ledger_trade(1, OrderSide::Buy, dec!(4), Utc::now()))
            .await;
        h.broker
            .add_position(Position {
                id: 1,
                account_id: 7,
                contract_id: fixtures::mgc().id,
                creation_timestamp: Utc::now(),
                position_type: PositionType::Long,
                size: dec!(4),
                average_price: dec!(2340),
            })
            .await;

        let outcome = h.executor().execute("MGC", &plan(OrderKind::Limit), "plan-5").await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::PositionOpen {
                contract_id: fixtures::mgc().id,
                net: dec!(4)
            }
        );
        assert!(h.broker.snapshot(|s| s.placed.is_empty()).await);
    }

    #[tokio::test]
    async fn test_round_trip_cut_by_ledger_window_does_not_block() {
        let h = Harness::new().await;
        let now = Utc::now();
        // Only the closing sell of an old round trip is inside the window.
        h.broker
            .add_trade(ledger_trade(1, OrderSide::Buy, dec!(2), now - chrono::Duration::hours(30)))
            .await;
        h.broker
            .add_trade(ledger_trade(2, OrderSide::Sell, dec!(2), now - chrono::Duration::hours(10)))
            .await;

        let outcome = h.executor().execute("MGC", &plan(OrderKind::Limit), "plan-9").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Placed { size: 9, .. }));
        assert_eq!(h.broker.snapshot(|s| s.placed.len()).await, 1);
    }

    #[tokio::test]
    async fn test_zero_risk_plan_is_rejected() {
        let h = Harness::new().await;
        let mut plan = plan(OrderKind::Limit);
        plan.stop_loss = plan.entry_price;

        let err = h.executor().execute("MGC", &plan, "plan-6").await.unwrap_err();
        assert!(err.downcast_ref::<crate::risk::RiskError>().is_some());
        assert!(h.broker.snapshot(|s| s.placed.is_empty()).await);
    }

    #[tokio::test]
    async fn test_unknown_symbol_fails() {
        let h = Harness::new().await;
        assert!(h.executor().execute("ZZ", &plan(OrderKind::Limit), "plan-7").await.is_err());
    }

    #[tokio::test]
    async fn test_resting_order_gets_monitor() {
        let h = Harness::new().await;
        let supervisor = h.supervisor();
        let executor = h.executor().with_monitors(supervisor.clone());

        let outcome = executor.execute("MGC", &plan(OrderKind::Limit), "plan-8").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Placed { order_id: 1000, monitored: true, .. }));

        let record = h.store.monitored_order(1000).unwrap().unwrap();
        assert_eq!(record.expected_side, OrderSide::Buy);
        assert_eq!(record.contract_id, fixtures::mgc().id);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_handler_executes_decided_plan() {
        let h = Harness::new().await;
        let mut workflow = MockDecisionWorkflow::new();
        workflow
            .expect_decide()
            .times(1)
            .returning(|request| {
                assert_eq!(request.instrument, "MGC");
                assert_eq!(request.price, Some(dec!(2350)));
                Ok(Some(plan(OrderKind::Limit)))
            });

        let handler = AnalyzeAndExecute::new(Arc::new(workflow), Arc::new(h.executor()));
        let level = KeyLevel {
            id: 3,
            instrument: "MGC".to_string(),
            level: dec!(2350.5),
            kind: crate::persistence::LevelKind::EntryBuy,
            source_id: "plan-0".to_string(),
            status: crate::persistence::LevelStatus::Active,
            created_at: Utc::now(),
        };
        handler.on_trigger(&level, dec!(2350)).await.unwrap();

        assert_eq!(h.broker.snapshot(|s| s.placed.len()).await, 1);
        let sources: Vec<String> = h
            .store
            .levels(Some("MGC"))
            .unwrap()
            .into_iter()
            .map(|l| l.source_id)
            .collect();
        assert!(sources.iter().all(|s| s == "level-3"));
    }
}
