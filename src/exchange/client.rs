//! ProjectX REST API client.

use crate::config::BrokerConfig;
use crate::exchange::error::BrokerError;
use crate::exchange::traits::{BrokerApi, BrokerResult};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Cached bearer token.
#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Authenticated client for the broker gateway.
///
/// The session token is shared by every caller. Refresh happens under the
/// session lock, so concurrent callers that find the token expired wait for
/// the one login in flight instead of issuing their own.
pub struct ProjectXClient {
    http: Client,
    base_url: String,
    username: String,
    api_key: String,
    token_ttl: chrono::Duration,
    session: Mutex<Option<Session>>,
}

impl ProjectXClient {
    /// Create a new client from configuration. No request is made until first use.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            api_key: config.api_key.clone(),
            token_ttl: chrono::Duration::hours(i64::from(config.token_ttl_hours)),
            session: Mutex::new(None),
        })
    }

    /// Current token, logging in first if there is none or it has expired.
    async fn token(&self) -> BrokerResult<String> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.expires_at > Utc::now() {
                return Ok(current.token.clone());
            }
            info!("Session token expired, re-authenticating");
        }

        let fresh = self.login().await?;
        let token = fresh.token.clone();
        *session = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token if it is still the one that was rejected.
    async fn invalidate(&self, rejected: &str) {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| s.token == rejected) {
            *session = None;
        }
    }

    #[instrument(skip(self))]
    async fn login(&self) -> BrokerResult<Session> {
        let request = LoginRequest {
            user_name: &self.username,
            api_key: &self.api_key,
        };
        let response: LoginResponse = self.send("/Auth/loginKey", &request, None).await?;

        if !response.status.success {
            return Err(BrokerError::Auth(
                response
                    .status
                    .error_message
                    .unwrap_or_else(|| format!("error code {}", response.status.error_code)),
            ));
        }

        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BrokerError::Auth("login response carried no token".to_string()))?;

        info!("Authenticated with broker gateway");
        Ok(Session {
            token,
            expires_at: Utc::now() + self.token_ttl,
        })
    }

    /// POST a JSON body and decode the response, without any status checks.
    async fn send<Req, Resp>(
        &self,
        endpoint: &str,
        body: &Req,
        token: Option<&str>,
    ) -> BrokerResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| BrokerError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|source| BrokerError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;

        serde_json::from_slice(&bytes).map_err(|source| BrokerError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    /// Authenticated call with envelope checking. A 401 invalidates the token
    /// and the call is retried once with a fresh one.
    async fn call<Req, Resp>(&self, endpoint: &str, body: &Req) -> BrokerResult<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned + ApiResponse,
    {
        let token = self.token().await?;
        let response: Resp = match self.send(endpoint, body, Some(&token)).await {
            Err(e) if e.is_unauthorized() => {
                warn!(endpoint, "Token rejected, refreshing session");
                self.invalidate(&token).await;
                let token = self.token().await?;
                self.send(endpoint, body, Some(&token)).await?
            }
            other => other?,
        };

        let status = response.status();
        if !status.success {
            return Err(BrokerError::Api {
                endpoint: endpoint.to_string(),
                code: status.error_code,
                message: status.error_message.clone().unwrap_or_default(),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl BrokerApi for ProjectXClient {
    #[instrument(skip(self))]
    async fn accounts(&self) -> BrokerResult<Vec<Account>> {
        let request = AccountSearchRequest {
            only_active_accounts: true,
        };
        let response: AccountsResponse = self.call("/Account/search", &request).await?;
        Ok(response.accounts)
    }

    #[instrument(skip(self))]
    async fn search_contracts(&self, symbol: &str) -> BrokerResult<Vec<Contract>> {
        let request = ContractSearchRequest {
            search_text: symbol,
            live: false,
        };
        let response: ContractsResponse = self.call("/Contract/search", &request).await?;
        debug!(symbol, found = response.contracts.len(), "Contract search");
        Ok(response.contracts)
    }

    #[instrument(skip(self))]
    async fn open_positions(&self, account_id: i64) -> BrokerResult<Vec<Position>> {
        let request = AccountRequest { account_id };
        let response: PositionsResponse = self.call("/Position/searchOpen", &request).await?;
        Ok(response.positions)
    }

    #[instrument(skip(self))]
    async fn orders(
        &self,
        account_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Order>> {
        let request = TimeRangeRequest {
            account_id,
            start_timestamp: start,
            end_timestamp: end,
        };
        let response: OrdersResponse = self.call("/Order/search", &request).await?;
        Ok(response.orders)
    }

    #[instrument(skip(self))]
    async fn trades(
        &self,
        account_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Trade>> {
        let request = TimeRangeRequest {
            account_id,
            start_timestamp: start,
            end_timestamp: end,
        };
        let response: TradesResponse = self.call("/Trade/search", &request).await?;
        Ok(response.trades)
    }

    #[instrument(skip(self), fields(contract = %request.contract_id, side = %request.side, size = request.size))]
    async fn place_order(&self, request: &PlaceOrderRequest) -> BrokerResult<i64> {
        info!(
            order_type = ?request.order_type,
            limit_price = ?request.limit_price,
            stop_price = ?request.stop_price,
            stop_loss = ?request.stop_loss_bracket,
            take_profit = ?request.take_profit_bracket,
            "Placing order"
        );
        let response: PlaceOrderResponse = self.call("/Order/place", request).await?;
        response.order_id.ok_or_else(|| BrokerError::Api {
            endpoint: "/Order/place".to_string(),
            code: response.status.error_code,
            message: "placement succeeded without an order id".to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, account_id: i64, order_id: i64) -> BrokerResult<()> {
        let request = CancelOrderRequest {
            account_id,
            order_id,
        };
        let _: EmptyResponse = self.call("/Order/cancel", &request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn modify_order(&self, request: &ModifyOrderRequest) -> BrokerResult<()> {
        let _: EmptyResponse = self.call("/Order/modify", request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn bars(&self, request: &BarsRequest) -> BrokerResult<Vec<Bar>> {
        let response: BarsResponse = self.call("/History/retrieveBars", request).await?;
        Ok(response.bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> BrokerConfig {
        BrokerConfig {
            base_url: server.uri(),
            username: "trader".to_string(),
            api_key: "secret".to_string(),
            ..BrokerConfig::default()
        }
    }

    async fn mount_login(server: &MockServer, token: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/Auth/loginKey"))
            .and(body_partial_json(serde_json::json!({
                "userName": "trader",
                "apiKey": "secret"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": token,
                "success": true,
                "errorCode": 0,
                "errorMessage": null
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_accounts_use_bearer_token() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/Account/search"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accounts": [{"id": 7, "name": "PRAC-1", "balance": 50000.0, "canTrade": true}],
                "success": true,
                "errorCode": 0,
                "errorMessage": null
            })))
            .mount(&server)
            .await;

        let client = ProjectXClient::new(&config_for(&server)).unwrap();
        let accounts = client.accounts().await.unwrap();

        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, dec!(50000));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/Position/searchOpen"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "positions": [],
                "success": true,
                "errorCode": 0
            })))
            .mount(&server)
            .await;

        let client = Arc::new(ProjectXClient::new(&config_for(&server)).unwrap());
        let calls = (0..8).map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.open_positions(7).await })
        });

        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        // MockServer verifies `expect(1)` on the login mock when dropped.
    }

    #[tokio::test]
    async fn test_unsuccessful_envelope_becomes_api_error() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/Order/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "errorCode": 2,
                "errorMessage": "Order not found"
            })))
            .mount(&server)
            .await;

        let client = ProjectXClient::new(&config_for(&server)).unwrap();
        let err = client.cancel_order(7, 99).await.unwrap_err();

        match err {
            BrokerError::Api { code, message, .. } => {
                assert_eq!(code, 2);
                assert_eq!(message, "Order not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failed_login_is_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Auth/loginKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": null,
                "success": false,
                "errorCode": 3,
                "errorMessage": "Invalid credentials"
            })))
            .mount(&server)
            .await;

        let client = ProjectXClient::new(&config_for(&server)).unwrap();
        let err = client.accounts().await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(msg) if msg == "Invalid credentials"));
    }

    #[tokio::test]
    async fn test_place_order_returns_order_id() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1", 1).await;

        Mock::given(method("POST"))
            .and(path("/Order/place"))
            .and(body_partial_json(serde_json::json!({
                "accountId": 7,
                "type": 1,
                "side": 0,
                "size": 2,
                "limitPrice": 2350.5,
                "stopLossBracket": {"ticks": -155, "type": 4},
                "takeProfitBracket": {"ticks": 145, "type": 1}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 9056,
                "success": true,
                "errorCode": 0,
                "errorMessage": null
            })))
            .mount(&server)
            .await;

        let client = ProjectXClient::new(&config_for(&server)).unwrap();
        let order_id = client
            .place_order(&PlaceOrderRequest {
                account_id: 7,
                contract_id: "CON.F.US.MGC.Z25".to_string(),
                order_type: WireOrderType::Limit,
                side: OrderSide::Buy,
                size: 2,
                limit_price: Some(dec!(2350.5)),
                stop_price: None,
                stop_loss_bracket: Some(BracketLeg {
                    ticks: -155,
                    order_type: WireOrderType::Stop,
                }),
                take_profit_bracket: Some(BracketLeg {
                    ticks: 145,
                    order_type: WireOrderType::Limit,
                }),
            })
            .await
            .unwrap();

        assert_eq!(order_id, 9056);
    }

    #[tokio::test]
    async fn test_unauthorized_response_triggers_relogin() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1", 2).await;

        Mock::given(method("POST"))
            .and(path("/Account/search"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/Account/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accounts": [],
                "success": true,
                "errorCode": 0
            })))
            .mount(&server)
            .await;

        let client = ProjectXClient::new(&config_for(&server)).unwrap();
        assert!(client.accounts().await.unwrap().is_empty());
    }
}
