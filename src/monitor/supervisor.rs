//! Supervised, restartable order monitors.
//!
//! Each monitor runs as its own tokio task. Its record is persisted before
//! the task starts and updated on every transition, so a panicked task is
//! restarted from the last persisted state and a restarted process resumes
//! every unfinished monitor with its original start time.

use super::order_lifecycle::{MonitorContext, MonitorState, OrderLifecycleMonitor};
use crate::notify::notify_or_log;
use crate::persistence::MonitoredOrder;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Aborts the wrapped task when dropped, so aborting the supervising task
/// also stops the monitor it is watching.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Owns every running order monitor.
pub struct MonitorSupervisor {
    ctx: MonitorContext,
    max_restarts: u32,
    tasks: Mutex<JoinSet<(i64, MonitorState)>>,
    running: Arc<StdMutex<HashSet<i64>>>,
}

impl MonitorSupervisor {
    pub fn new(ctx: MonitorContext, max_restarts: u32) -> Self {
        Self {
            ctx,
            max_restarts,
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Persist `record` and start monitoring it.
    pub async fn spawn(&self, record: MonitoredOrder) -> Result<()> {
        self.ctx
            .store
            .upsert_monitored_order(&record)
            .context("Failed to persist monitor record")?;
        self.ctx.store.append_journal(
            record.order_id,
            "start",
            &format!(
                "monitoring {} {} since {}",
                record.expected_side,
                record.contract_id,
                record.started_at.to_rfc3339()
            ),
        )?;
        self.launch(record).await;
        Ok(())
    }

    /// Start a monitor for every persisted record that has not finished.
    pub async fn resume(&self) -> Result<usize> {
        let pending = self
            .ctx
            .store
            .pending_monitored_orders()
            .context("Failed to load monitor records")?;

        let mut resumed = 0;
        for record in pending {
            info!(order_id = record.order_id, state = %record.state, "Resuming order monitor");
            if self.launch(record).await {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Number of monitors currently running.
    pub fn active(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Collect monitors that already finished without waiting for the rest.
    pub async fn reap(&self) -> Vec<(i64, MonitorState)> {
        let mut tasks = self.tasks.lock().await;
        let mut finished = Vec::new();
        while let Some(result) = tasks.try_join_next() {
            if let Ok(outcome) = result {
                finished.push(outcome);
            }
        }
        finished
    }

    /// Wait until every running monitor reaches a terminal state.
    pub async fn wait_all(&self) -> Vec<(i64, MonitorState)> {
        let mut tasks = self.tasks.lock().await;
        let mut finished = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => finished.push(outcome),
                Err(e) => warn!(error = %e, "Monitor task ended abnormally"),
            }
        }
        finished
    }

    /// Abort every monitor. Persisted records stay resumable.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        let count = tasks.len();
        tasks.shutdown().await;
        if let Ok(mut running) = self.running.lock() {
            running.clear();
        }
        info!(count, "Order monitors stopped");
    }

    /// Spawn the supervising task unless the order is already monitored.
    async fn launch(&self, record: MonitoredOrder) -> bool {
        let fresh = match self.running.lock() {
            Ok(mut running) => running.insert(record.order_id),
            Err(_) => false,
        };
        if !fresh {
            warn!(order_id = record.order_id, "Order is already being monitored");
            return false;
        }

        let ctx = self.ctx.clone();
        let running = self.running.clone();
        let max_restarts = self.max_restarts;
        self.tasks.lock().await.spawn(async move {
            let order_id = record.order_id;
            let state = run_with_restarts(ctx, record, max_restarts).await;
            if let Ok(mut running) = running.lock() {
                running.remove(&order_id);
            }
            (order_id, state)
        });
        true
    }
}

/// Run a monitor, restarting it from its persisted record after a panic.
async fn run_with_restarts(
    ctx: MonitorContext,
    mut record: MonitoredOrder,
    max_restarts: u32,
) -> MonitorState {
    let order_id = record.order_id;
    let mut restarts = 0;

    loop {
        let monitor = OrderLifecycleMonitor::new(ctx.clone(), record.clone());
        let mut task = AbortOnDrop(tokio::spawn(monitor.run()));

        match (&mut task.0).await {
            Ok(state) => return state,
            Err(e) if e.is_panic() => {
                if let Ok(Some(persisted)) = ctx.store.monitored_order(order_id) {
                    record = persisted;
                }

                if restarts >= max_restarts {
                    error!(order_id, restarts, "Order monitor keeps failing, giving up");
                    let text = format!(
                        "Monitor for order #{} gave up after {} restarts (last state {}). Check the order manually.",
                        order_id, restarts, record.state
                    );
                    if let Err(e) = ctx.store.append_journal(order_id, "abandoned", &text) {
                        warn!(order_id, error = %e, "Failed to write monitor journal");
                    }
                    notify_or_log(ctx.notifier.as_ref(), &text).await;
                    return record.state;
                }

                restarts += 1;
                warn!(order_id, restarts, state = %record.state, "Order monitor panicked, restarting");
                if let Err(e) = ctx.store.append_journal(
                    order_id,
                    "restart",
                    &format!("restart {} from {}", restarts, record.state),
                ) {
                    warn!(order_id, error = %e, "Failed to write monitor journal");
                }
            }
            Err(_) => return record.state,
        }
    }
}
