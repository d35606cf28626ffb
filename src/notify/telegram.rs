//! Telegram Bot API notifier.

use super::{Notifier, NotifyError};
use crate::config::TelegramConfig;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends alerts to a chat through `sendMessage`.
pub struct TelegramNotifier {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.bot_token.is_empty() && !self.config.chat_id.is_empty()
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        if !self.is_enabled() {
            debug!("Telegram notifications are disabled, skipping");
            return Ok(());
        }

        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        );
        let params = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let response = self.client.post(&url).json(&params).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            warn!("Telegram rate limited");
            return Err(NotifyError::RateLimited(60));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Failed to send Telegram message");
            return Err(NotifyError::SendFailed(format!("HTTP {}: {}", status, body)));
        }

        let reply: SendMessageResponse = response.json().await?;
        if !reply.ok {
            return Err(NotifyError::SendFailed(
                reply.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        debug!(chat_id = %self.config.chat_id, "Telegram notification sent");
        Ok(())
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> TelegramConfig {
        TelegramConfig {
            bot_token: "123:abc".to_string(),
            chat_id: "-100200".to_string(),
            enabled: true,
            api_base: server.uri(),
        }
    }

    #[tokio::test]
    async fn test_sends_plain_text_to_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(serde_json::json!({
                "chat_id": "-100200",
                "text": "Order 42 filled"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true, "result": {}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(config_for(&server));
        notifier.send("Order 42 filled").await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(config_for(&server));
        let err = notifier.send("hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::RateLimited(60)));
    }

    #[tokio::test]
    async fn test_disabled_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.enabled = false;
        TelegramNotifier::new(config).send("hello").await.unwrap();
    }
}
