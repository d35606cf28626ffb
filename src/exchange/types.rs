//! Type definitions for ProjectX API requests and responses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Serialize a timestamp the way the gateway expects: UTC, millisecond precision, `Z` suffix.
pub fn format_api_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn serialize_api_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_api_timestamp(ts))
}

// ==================== Codes ====================

/// Order side. Wire codes: 0 = Buy, 1 = Sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that flattens a position opened on this side.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl TryFrom<i32> for OrderSide {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(OrderSide::Buy),
            1 => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side code {}", other)),
        }
    }
}

impl From<OrderSide> for i32 {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => 0,
            OrderSide::Sell => 1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Ok(OrderSide::Buy),
            "SELL" | "SHORT" => Ok(OrderSide::Sell),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// Broker order type codes: 1 = Limit, 2 = Market, 4 = Stop.
///
/// Other codes the gateway may report (stop-limit, trailing stop) are kept
/// verbatim so that order listings still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum WireOrderType {
    Limit,
    Market,
    Stop,
    Other(i32),
}

impl From<i32> for WireOrderType {
    fn from(code: i32) -> Self {
        match code {
            1 => WireOrderType::Limit,
            2 => WireOrderType::Market,
            4 => WireOrderType::Stop,
            other => WireOrderType::Other(other),
        }
    }
}

impl From<WireOrderType> for i32 {
    fn from(kind: WireOrderType) -> Self {
        match kind {
            WireOrderType::Limit => 1,
            WireOrderType::Market => 2,
            WireOrderType::Stop => 4,
            WireOrderType::Other(code) => code,
        }
    }
}

/// Order status as reported by the broker.
///
/// 1 (open) and 6 (pending) are both still working; 2 = filled,
/// 3 = cancelled, 4 = rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum OrderStatus {
    Working,
    Pending,
    Filled,
    Cancelled,
    Rejected,
    Other(i32),
}

impl OrderStatus {
    /// Whether the broker will not move this order any further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::Working | OrderStatus::Pending)
    }
}

impl From<i32> for OrderStatus {
    fn from(code: i32) -> Self {
        match code {
            1 => OrderStatus::Working,
            2 => OrderStatus::Filled,
            3 => OrderStatus::Cancelled,
            4 => OrderStatus::Rejected,
            6 => OrderStatus::Pending,
            other => OrderStatus::Other(other),
        }
    }
}

impl From<OrderStatus> for i32 {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Working => 1,
            OrderStatus::Filled => 2,
            OrderStatus::Cancelled => 3,
            OrderStatus::Rejected => 4,
            OrderStatus::Pending => 6,
            OrderStatus::Other(code) => code,
        }
    }
}

/// Direction of an open position. Wire codes: 1 = Long, 2 = Short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum PositionType {
    Long,
    Short,
}

impl TryFrom<i32> for PositionType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(PositionType::Long),
            2 => Ok(PositionType::Short),
            other => Err(format!("unknown position type {}", other)),
        }
    }
}

impl From<PositionType> for i32 {
    fn from(kind: PositionType) -> Self {
        match kind {
            PositionType::Long => 1,
            PositionType::Short => 2,
        }
    }
}

// ==================== Entities ====================

/// Trading account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub balance: Decimal,
    #[serde(default)]
    pub can_trade: bool,
}

/// Futures contract as returned by contract search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
    #[serde(default)]
    pub active_contract: bool,
}

impl Contract {
    /// Dollar value of a one-point move for one contract.
    pub fn multiplier(&self) -> Decimal {
        if self.tick_size == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.tick_value / self.tick_size
    }
}

/// Order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub contract_id: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub update_timestamp: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    #[serde(rename = "type")]
    pub order_type: WireOrderType,
    pub side: OrderSide,
    pub size: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
}

/// Single execution from the trade ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: i64,
    pub account_id: i64,
    pub contract_id: String,
    pub creation_timestamp: DateTime<Utc>,
    pub price: Decimal,
    #[serde(default)]
    pub profit_and_loss: Option<Decimal>,
    #[serde(default)]
    pub fees: Option<Decimal>,
    pub side: OrderSide,
    pub size: Decimal,
    #[serde(default)]
    pub voided: bool,
    #[serde(default)]
    pub order_id: Option<i64>,
}

/// Open position as reported by the live positions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub contract_id: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub position_type: PositionType,
    pub size: Decimal,
    pub average_price: Decimal,
}

impl Position {
    /// Size with sign: positive long, negative short.
    pub fn signed_size(&self) -> Decimal {
        match self.position_type {
            PositionType::Long => self.size,
            PositionType::Short => -self.size,
        }
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub t: DateTime<Utc>,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    #[serde(default)]
    pub v: Decimal,
}

// ==================== Requests ====================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub user_name: &'a str,
    pub api_key: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSearchRequest {
    pub only_active_accounts: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSearchRequest<'a> {
    pub search_text: &'a str,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    pub account_id: i64,
}

/// Time-ranged search used by both the order and trade endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRangeRequest {
    pub account_id: i64,
    #[serde(serialize_with = "serialize_api_timestamp")]
    pub start_timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_api_timestamp")]
    pub end_timestamp: DateTime<Utc>,
}

/// Relative stop-loss/take-profit leg attached to an entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BracketLeg {
    pub ticks: i64,
    #[serde(rename = "type")]
    pub order_type: WireOrderType,
}

/// Order placement request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub account_id: i64,
    pub contract_id: String,
    #[serde(rename = "type")]
    pub order_type: WireOrderType,
    pub side: OrderSide,
    pub size: i64,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub limit_price: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_bracket: Option<BracketLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_bracket: Option<BracketLeg>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub account_id: i64,
    pub order_id: i64,
}

/// Price change for a working order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyOrderRequest {
    pub account_id: i64,
    pub order_id: i64,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub limit_price: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_price: Option<Decimal>,
}

/// Bar unit codes used by `/History/retrieveBars`.
pub const BAR_UNIT_SECOND: i32 = 1;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BarsRequest {
    pub contract_id: String,
    pub live: bool,
    #[serde(serialize_with = "serialize_api_timestamp")]
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_api_timestamp")]
    pub end_time: DateTime<Utc>,
    pub unit: i32,
    pub unit_number: i32,
    pub limit: u32,
    pub include_partial_bar: bool,
}

// ==================== Responses ====================

/// Status block every gateway response carries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Access to the status block of a decoded response.
pub trait ApiResponse {
    fn status(&self) -> &ApiStatus;
}

macro_rules! api_response {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            #[serde(flatten)]
            pub status: ApiStatus,
            $(
                #[serde(default)]
                pub $field: $ty,
            )*
        }

        impl ApiResponse for $name {
            fn status(&self) -> &ApiStatus {
                &self.status
            }
        }
    };
}

api_response!(LoginResponse { token: Option<String> });
api_response!(AccountsResponse { accounts: Vec<Account> });
api_response!(ContractsResponse { contracts: Vec<Contract> });
api_response!(PositionsResponse { positions: Vec<Position> });
api_response!(OrdersResponse { orders: Vec<Order> });
api_response!(TradesResponse { trades: Vec<Trade> });
api_response!(PlaceOrderResponse { order_id: Option<i64> });
api_response!(BarsResponse { bars: Vec<Bar> });
api_response!(EmptyResponse {});

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timestamp_format_has_millis_and_z() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 1, 13, 5, 9).unwrap();
        assert_eq!(format_api_timestamp(&ts), "2025-07-01T13:05:09.000Z");
    }

    #[test]
    fn test_place_order_serializes_brackets_and_skips_missing_prices() {
        let request = PlaceOrderRequest {
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
            take_profit_bracket: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], 1);
        assert_eq!(json["side"], 0);
        assert_eq!(json["limitPrice"], 2350.5);
        assert_eq!(json["stopLossBracket"]["ticks"], -155);
        assert_eq!(json["stopLossBracket"]["type"], 4);
        assert!(json.get("stopPrice").is_none());
        assert!(json.get("takeProfitBracket").is_none());
    }

    #[test]
    fn test_order_decodes_numeric_codes() {
        let order: Order = serde_json::from_value(serde_json::json!({
            "id": 42,
            "accountId": 7,
            "contractId": "CON.F.US.MGC.Z25",
            "creationTimestamp": "2025-07-01T13:05:09.123+00:00",
            "updateTimestamp": null,
            "status": 2,
            "type": 4,
            "side": 1,
            "size": 3,
            "limitPrice": null,
            "stopPrice": 2335.0
        }))
        .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.order_type, WireOrderType::Stop);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.stop_price, Some(dec!(2335)));
    }

    #[test]
    fn test_unknown_status_code_is_preserved() {
        let status: OrderStatus = serde_json::from_value(serde_json::json!(5)).unwrap();
        assert_eq!(status, OrderStatus::Other(5));
        assert!(!status.is_terminal());
        assert!(OrderStatus::Pending.is_working());
    }

    #[test]
    fn test_envelope_reports_failure() {
        let response: AccountsResponse = serde_json::from_value(serde_json::json!({
            "success": false,
            "errorCode": 3,
            "errorMessage": "Invalid token"
        }))
        .unwrap();

        assert!(!response.status().success);
        assert_eq!(response.status().error_code, 3);
        assert!(response.accounts.is_empty());
    }

    #[test]
    fn test_contract_multiplier() {
        let contract = Contract {
            id: "CON.F.US.MGC.Z25".to_string(),
            name: "MGCZ5".to_string(),
            description: "Micro Gold".to_string(),
            tick_size: dec!(0.1),
            tick_value: dec!(1),
            active_contract: true,
        };
        assert_eq!(contract.multiplier(), dec!(10));
    }

    #[test]
    fn test_short_position_is_negative() {
        let position: Position = serde_json::from_value(serde_json::json!({
            "id": 1,
            "accountId": 7,
            "contractId": "CON.F.US.GC.Z25",
            "creationTimestamp": "2025-07-01T13:05:09Z",
            "type": 2,
            "size": 2,
            "averagePrice": 2340.2
        }))
        .unwrap();
        assert_eq!(position.signed_size(), dec!(-2));
    }
}
