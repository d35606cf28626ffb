//! Key-level proximity watcher.
//!
//! Polls the latest price of every instrument that has active key levels and
//! raises a confirmation-gated trigger when the price comes within the
//! configured band of a level. Confirmation waits run in their own tasks so
//! the poll loop keeps covering the other instruments.

use super::confirmation::{Confirmation, ConfirmationSource};
use crate::config::WatcherConfig;
use crate::exchange::BrokerApi;
use crate::notify::{notify_or_log, Notifier};
use crate::persistence::{KeyLevel, Store};
use crate::utils::decimal::percentage_diff;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Whether `price` is within `threshold_percent` of `level`, relative to the level.
pub fn is_near_level(price: Decimal, level: Decimal, threshold_percent: Decimal) -> bool {
    if level <= Decimal::ZERO {
        return false;
    }
    percentage_diff(price, level) <= threshold_percent
}

/// Acts on a confirmed level trigger, typically by running analysis and placing an order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LevelTriggerHandler: Send + Sync {
    async fn on_trigger(&self, level: &KeyLevel, price: Decimal) -> Result<()>;
}

#[derive(Debug, Clone)]
struct WatcherSettings {
    poll_interval: Duration,
    threshold_percent: Decimal,
    confirmation_timeout: Duration,
    retrigger_cooldown: Duration,
    price_lookback: chrono::Duration,
}

/// Everything a trigger task needs, detached from the watcher.
#[derive(Clone)]
struct TriggerContext {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    confirmation: Arc<dyn ConfirmationSource>,
    handler: Arc<dyn LevelTriggerHandler>,
    in_flight: Arc<StdMutex<HashSet<i64>>>,
    cooldowns: Arc<StdMutex<HashMap<i64, Instant>>>,
    confirmation_timeout: Duration,
    retrigger_cooldown: Duration,
}

/// Watches active key levels against live prices.
pub struct LevelWatcher {
    broker: Arc<dyn BrokerApi>,
    settings: WatcherSettings,
    trigger_ctx: TriggerContext,
    /// Symbol to active contract id, resolved once per session.
    contracts: StdMutex<HashMap<String, String>>,
    triggers: Mutex<JoinSet<()>>,
}

impl LevelWatcher {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
        confirmation: Arc<dyn ConfirmationSource>,
        handler: Arc<dyn LevelTriggerHandler>,
        config: &WatcherConfig,
    ) -> Self {
        let settings = WatcherSettings {
            poll_interval: config.poll_interval(),
            threshold_percent: config.threshold_percent,
            confirmation_timeout: config.confirmation_timeout(),
            retrigger_cooldown: config.retrigger_cooldown(),
            price_lookback: config.price_lookback(),
        };
        Self {
            broker,
            trigger_ctx: TriggerContext {
                store,
                notifier,
                confirmation,
                handler,
                in_flight: Arc::new(StdMutex::new(HashSet::new())),
                cooldowns: Arc::new(StdMutex::new(HashMap::new())),
                confirmation_timeout: settings.confirmation_timeout,
                retrigger_cooldown: settings.retrigger_cooldown,
            },
            settings,
            contracts: StdMutex::new(HashMap::new()),
            triggers: Mutex::new(JoinSet::new()),
        }
    }

    /// Poll until `shutdown` is set.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            interval = ?self.settings.poll_interval,
            threshold = %self.settings.threshold_percent,
            "Level watcher started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(started) => info!(started, "Level triggers raised"),
                Err(e) => error!(error = %e, "Level watcher pass failed"),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        self.triggers.lock().await.shutdown().await;
        info!("Level watcher stopped");
    }

    /// One pass over all active levels. Returns the number of triggers started.
    pub async fn poll_once(&self) -> Result<usize> {
        self.reap_triggers().await;

        let mut by_instrument: BTreeMap<String, Vec<KeyLevel>> = BTreeMap::new();
        for level in self.trigger_ctx.store.active_levels()? {
            by_instrument
                .entry(level.instrument.clone())
                .or_default()
                .push(level);
        }

        let mut started = 0;
        for (instrument, levels) in by_instrument {
            let price = match self.latest_price(&instrument).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(%instrument, error = %e, "Price unavailable, skipping instrument this pass");
                    continue;
                }
            };
            debug!(%instrument, %price, levels = levels.len(), "Checking levels");

            for level in levels {
                if !is_near_level(price, level.level, self.settings.threshold_percent) {
                    continue;
                }
                if !self.claim(level.id) {
                    debug!(level_id = level.id, "Level busy or cooling down");
                    continue;
                }

                info!(level_id = level.id, %instrument, level = %level.level, %price, "Price near key level");
                let ctx = self.trigger_ctx.clone();
                self.triggers
                    .lock()
                    .await
                    .spawn(run_trigger(ctx, level, price));
                started += 1;
            }
        }
        Ok(started)
    }

    /// Wait for every in-flight trigger to finish.
    pub async fn drain(&self) {
        let mut triggers = self.triggers.lock().await;
        while triggers.join_next().await.is_some() {}
    }

    async fn reap_triggers(&self) {
        let mut triggers = self.triggers.lock().await;
        while let Some(result) = triggers.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "Level trigger task failed");
            }
        }
    }

    /// Mark a level in flight unless it already is or is cooling down.
    fn claim(&self, level_id: i64) -> bool {
        let cooling = match self.trigger_ctx.cooldowns.lock() {
            Ok(mut cooldowns) => match cooldowns.get(&level_id) {
                Some(until) if Instant::now() < *until => true,
                Some(_) => {
                    cooldowns.remove(&level_id);
                    false
                }
                None => false,
            },
            Err(_) => false,
        };
        if cooling {
            return false;
        }
        match self.trigger_ctx.in_flight.lock() {
            Ok(mut in_flight) => in_flight.insert(level_id),
            Err(_) => false,
        }
    }

    async fn latest_price(&self, instrument: &str) -> Result<Decimal> {
        let cached = self
            .contracts
            .lock()
            .ok()
            .and_then(|c| c.get(instrument).cloned());
        let contract_id = match cached {
            Some(id) => id,
            None => {
                let contract = self.broker.active_contract(instrument).await?;
                if let Ok(mut contracts) = self.contracts.lock() {
                    contracts.insert(instrument.to_string(), contract.id.clone());
                }
                contract.id
            }
        };

        Ok(self
            .broker
            .latest_price(&contract_id, self.settings.price_lookback)
            .await?)
    }
}

/// Notify, wait for confirmation, then act on the level.
async fn run_trigger(ctx: TriggerContext, level: KeyLevel, price: Decimal) {
    let prompt = format!(
        "{} at {} is near {} level {}. Act on it? (answer within {}s)",
        level.instrument,
        price,
        level.kind,
        level.level,
        ctx.confirmation_timeout.as_secs()
    );
    notify_or_log(ctx.notifier.as_ref(), &prompt).await;

    let answer = ctx
        .confirmation
        .await_confirmation(&prompt, ctx.confirmation_timeout)
        .await;
    info!(level_id = level.id, ?answer, "Level trigger answered");

    let acted = match answer {
        Confirmation::Confirmed => match ctx.handler.on_trigger(&level, price).await {
            Ok(()) => true,
            Err(e) => {
                warn!(level_id = level.id, error = %e, "Acting on level failed");
                let text = format!(
                    "Acting on {} level {} failed: {}",
                    level.instrument, level.level, e
                );
                notify_or_log(ctx.notifier.as_ref(), &text).await;
                false
            }
        },
        Confirmation::Declined | Confirmation::TimedOut => false,
    };

    if acted {
        if let Err(e) = ctx.store.mark_level_triggered(level.id) {
            warn!(level_id = level.id, error = %e, "Failed to mark level triggered");
        }
    } else if let Ok(mut cooldowns) = ctx.cooldowns.lock() {
        cooldowns.insert(level.id, Instant::now() + ctx.retrigger_cooldown);
    }

    if let Ok(mut in_flight) = ctx.in_flight.lock() {
        in_flight.remove(&level.id);
    }
}
