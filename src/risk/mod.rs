//! Risk calculations for trade entry.
//!
//! All of these are pure and side-effect free:
//! - Position sizing from a dollar budget and stop distance
//! - Risk budget and per-instrument caps from configuration
//! - Price to tick conversion for bracket legs
//! - Net position reconstruction from the trade ledger

pub mod bracket;
mod budget;
mod error;
pub mod reconciler;
mod sizer;

pub use bracket::{to_bracket, Bracket, OrderKind};
pub use budget::RiskBudget;
pub use error::RiskError;
pub use reconciler::{merge_positions, reconcile, PositionView};
pub use sizer::{RiskSizer, RiskSizingResult, SIZE_LOT};
