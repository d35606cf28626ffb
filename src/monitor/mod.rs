//! Long-running monitors.
//!
//! - Order lifecycle monitors: poll a placed order until it fills, is
//!   cancelled or rejected, or times out, then supervise the position
//! - Monitor supervisor: persisted, restartable monitor tasks
//! - Level watcher: confirmation-gated triggers near stored key levels

pub mod confirmation;
mod level_watcher;
mod order_lifecycle;
mod supervisor;

pub use confirmation::{
    ChannelConfirmation, Confirmation, ConfirmationSource, FixedConfirmation, StdinConfirmation,
};
pub use level_watcher::{is_near_level, LevelTriggerHandler, LevelWatcher};
pub use order_lifecycle::{
    CommandAdvisor, MonitorContext, MonitorSettings, MonitorState, OrderLifecycleMonitor,
    SupervisionAdvisor, SupervisionContext, SupervisionDecision,
};
pub use supervisor::MonitorSupervisor;
