//! Trade plans handed in by the external decision workflow.

use super::command::run_json_command;
use crate::exchange::OrderSide;
use crate::persistence::{KeyLevel, LevelKind, NewKeyLevel};
use crate::risk::OrderKind;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Decided direction. `Wait` means no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    #[serde(alias = "HOLD", alias = "NONE")]
    Wait,
}

impl TradeAction {
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            TradeAction::Buy => Some(OrderSide::Buy),
            TradeAction::Sell => Some(OrderSide::Sell),
            TradeAction::Wait => None,
        }
    }
}

fn default_order_kind() -> OrderKind {
    OrderKind::Limit
}

/// Already-decided trade parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePlan {
    pub action: TradeAction,
    #[serde(default = "default_order_kind")]
    pub order_type: OrderKind,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    /// Targets keyed "tp1", "tp2", ...
    #[serde(default)]
    pub take_profits: BTreeMap<String, Decimal>,
    /// Percent of balance to risk; clamped into the configured range.
    #[serde(default)]
    pub risk_percent: Option<Decimal>,
    #[serde(default)]
    pub forecast_strength: Option<String>,
}

/// Either a bare plan or an analysis envelope carrying one under `trade_data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanEnvelope {
    Bare(TradePlan),
    Wrapped { trade_data: Option<TradePlan> },
}

impl TradePlan {
    /// Take-profit targets ordered by their number, so "tp10" follows "tp2".
    pub fn ordered_take_profits(&self) -> Vec<(u32, Decimal)> {
        let mut targets: Vec<(u32, Decimal)> = self
            .take_profits
            .iter()
            .enumerate()
            .map(|(i, (key, price))| {
                let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
                let n = digits.parse().unwrap_or(i as u32 + 1);
                (n, *price)
            })
            .collect();
        targets.sort_by_key(|(n, _)| *n);
        targets
    }

    /// First target; used for sizing and the take-profit bracket.
    pub fn primary_take_profit(&self) -> Option<Decimal> {
        self.ordered_take_profits().first().map(|(_, price)| *price)
    }

    /// Levels worth watching, tagged with their role.
    pub fn key_levels(&self, instrument: &str, source_id: &str) -> Vec<NewKeyLevel> {
        let level = |price: Decimal, kind: LevelKind| NewKeyLevel {
            instrument: instrument.to_string(),
            level: price,
            kind,
            source_id: source_id.to_string(),
        };

        let mut levels = Vec::new();
        if let (Some(entry), Some(side)) = (self.entry_price, self.action.side()) {
            let kind = match side {
                OrderSide::Buy => LevelKind::EntryBuy,
                OrderSide::Sell => LevelKind::EntrySell,
            };
            levels.push(level(entry, kind));
        }
        if let Some(stop) = self.stop_loss {
            levels.push(level(stop, LevelKind::StopLoss));
        }
        for (n, price) in self.ordered_take_profits() {
            levels.push(level(price, LevelKind::TakeProfit(n)));
        }
        levels
    }

    /// Decode a plan from decision output, with or without the envelope.
    pub fn from_value(value: serde_json::Value) -> Result<Option<Self>> {
        Ok(match serde_json::from_value(value)? {
            PlanEnvelope::Bare(plan) => Some(plan),
            PlanEnvelope::Wrapped { trade_data } => trade_data,
        })
    }
}

/// What the decision workflow is asked about.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub instrument: String,
    pub price: Option<Decimal>,
    /// Level whose proximity prompted the request.
    pub level: Option<KeyLevel>,
}

/// Produces trade plans. Implemented outside this crate's decision logic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionWorkflow: Send + Sync {
    async fn decide(&self, request: &AnalysisRequest) -> Result<Option<TradePlan>>;
}

/// Decision workflow backed by an external command.
///
/// The command sees `SENTINEL_INSTRUMENT`, `SENTINEL_PRICE`, `SENTINEL_LEVEL`
/// and `SENTINEL_LEVEL_KIND` and prints a plan, optionally wrapped as
/// `{"trade_data": {...}}`.
pub struct CommandWorkflow {
    command: String,
    timeout: Duration,
}

impl CommandWorkflow {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DecisionWorkflow for CommandWorkflow {
    async fn decide(&self, request: &AnalysisRequest) -> Result<Option<TradePlan>> {
        let mut env = vec![("SENTINEL_INSTRUMENT", request.instrument.clone())];
        if let Some(price) = request.price {
            env.push(("SENTINEL_PRICE", price.to_string()));
        }
        if let Some(level) = &request.level {
            env.push(("SENTINEL_LEVEL", level.level.to_string()));
            env.push(("SENTINEL_LEVEL_KIND", level.kind.to_string()));
        }

        let value: serde_json::Value = run_json_command(&self.command, &env, self.timeout).await?;
        TradePlan::from_value(value)
    }
}

/// Map loose instrument names to broker symbols.
pub fn instrument_symbol(query: &str) -> Option<&'static str> {
    match query.trim().to_ascii_lowercase().as_str() {
        "gold" | "mgc" | "oltin" | "zoloto" => Some("MGC"),
        "gc" => Some("GC"),
        "oil" | "cl" | "neft" => Some("CL"),
        "s&p" | "es" | "spx" => Some("ES"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "action": "BUY",
            "forecast_strength": "B",
            "risk_percent": 5.0,
            "order_type": "LIMIT",
            "entry_price": 2350.5,
            "stop_loss": 2335.0,
            "take_profits": {"tp2": 2380.0, "tp1": 2365.0}
        })
    }

    #[test]
    fn test_plan_decodes_from_float_json() {
        let plan: TradePlan = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(plan.action, TradeAction::Buy);
        assert_eq!(plan.order_type, OrderKind::Limit);
        assert_eq!(plan.entry_price, Some(dec!(2350.5)));
        assert_eq!(plan.primary_take_profit(), Some(dec!(2365)));
        assert_eq!(plan.risk_percent, Some(dec!(5)));
    }

    #[test]
    fn test_envelope_and_bare_forms() {
        let bare = TradePlan::from_value(sample_json()).unwrap().unwrap();
        let wrapped = TradePlan::from_value(serde_json::json!({
            "full_analysis": "...",
            "trade_data": sample_json()
        }))
        .unwrap()
        .unwrap();
        assert_eq!(bare, wrapped);

        let empty = TradePlan::from_value(serde_json::json!({"trade_data": null})).unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn test_wait_has_no_side() {
        let plan: TradePlan = serde_json::from_value(serde_json::json!({"action": "HOLD"})).unwrap();
        assert_eq!(plan.action, TradeAction::Wait);
        assert!(plan.action.side().is_none());
        assert!(plan.key_levels("MGC", "p").is_empty());
    }

    #[test]
    fn test_take_profits_sort_numerically() {
        let mut plan: TradePlan = serde_json::from_value(sample_json()).unwrap();
        plan.take_profits.insert("tp10".to_string(), dec!(2500));
        let order: Vec<u32> = plan.ordered_take_profits().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![1, 2, 10]);
    }

    #[test]
    fn test_key_levels_are_tagged() {
        let plan: TradePlan = serde_json::from_value(sample_json()).unwrap();
        let levels = plan.key_levels("MGC", "plan-7");
        let kinds: Vec<LevelKind> = levels.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LevelKind::EntryBuy,
                LevelKind::StopLoss,
                LevelKind::TakeProfit(1),
                LevelKind::TakeProfit(2)
            ]
        );
        assert!(levels.iter().all(|l| l.instrument == "MGC" && l.source_id == "plan-7"));
    }

    #[test]
    fn test_unknown_order_type_is_rejected() {
        let mut json = sample_json();
        json["order_type"] = serde_json::json!("TRAILING");
        assert!(serde_json::from_value::<TradePlan>(json).is_err());
    }

    #[test]
    fn test_instrument_aliases() {
        assert_eq!(instrument_symbol("Gold"), Some("MGC"));
        assert_eq!(instrument_symbol("neft"), Some("CL"));
        assert_eq!(instrument_symbol("zz"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_workflow_reads_plan() {
        let workflow = CommandWorkflow::new(
            r#"echo '{"trade_data": {"action": "SELL", "order_type": "STOP", "entry_price": 2340, "stop_loss": 2350, "take_profits": {"tp1": 2320}}}'"#,
            Duration::from_secs(10),
        );
        let plan = workflow
            .decide(&AnalysisRequest {
                instrument: "MGC".to_string(),
                price: Some(dec!(2341)),
                level: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.action, TradeAction::Sell);
        assert_eq!(plan.order_type, OrderKind::Stop);
    }
}
