//! Trade plans and their execution.
//!
//! Trading decisions are made outside this crate:
//! - An external command produces trade plans (`plan`, `command`)
//! - The executor sizes, brackets and places them (`executor`)

pub mod command;
mod executor;
pub mod plan;

pub use executor::{AnalyzeAndExecute, ExecutionOutcome, TradeExecutor};
pub use plan::{
    instrument_symbol, AnalysisRequest, CommandWorkflow, DecisionWorkflow, TradeAction, TradePlan,
};
