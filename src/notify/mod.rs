//! Outbound alerts.
//!
//! Monitors and the level watcher report fills, timeouts and triggers as
//! short plain-text messages. Delivery failures never stop a monitor; they
//! are logged and the monitor carries on.

mod telegram;

pub use telegram::TelegramNotifier;

use crate::config::Config;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Notification delivery errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification send failed: {0}")]
    SendFailed(String),

    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// A channel that can deliver a plain-text alert.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;

    fn name(&self) -> &str;
}

/// Writes alerts to the log only. Used when no messaging channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        info!(target: "alerts", "{}", text);
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Telegram when configured, otherwise the log.
pub fn from_config(config: &Config) -> Arc<dyn Notifier> {
    if config.telegram_configured() {
        Arc::new(TelegramNotifier::new(config.telegram.clone()))
    } else {
        Arc::new(LogNotifier)
    }
}

/// Send an alert, logging instead of failing when delivery does not work.
pub async fn notify_or_log(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.send(text).await {
        warn!(channel = notifier.name(), error = %e, message = text, "Failed to deliver alert");
    }
}

/// Records every message it is asked to send.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    pub sent: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _text: &str) -> Result<(), NotifyError> {
            Err(NotifyError::SendFailed("offline".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        notify_or_log(&FailingNotifier, "order filled").await;
    }

    #[tokio::test]
    async fn test_memory_notifier_records() {
        let notifier = MemoryNotifier::default();
        notify_or_log(&notifier, "order 42 filled").await;
        assert!(notifier.contains("42"));
    }

    #[test]
    fn test_unconfigured_telegram_falls_back_to_log() {
        let config = Config::default();
        assert_eq!(from_config(&config).name(), "log");
    }
}
