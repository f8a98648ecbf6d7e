//! Order-status channel payloads.
//!
//! The order-status feed sends one JSON text frame per order event:
//!
//! ```json
//! {"order-status":"AB05","orderData":{"orderid":"250327000123","averageprice":104.5,
//!  "filledshares":"50","status":"complete","text":""}}
//! ```

use crate::error::{WsError, WsResult};
use optmon_core::serde_util::flexible_decimal;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Order-status code carried in `order-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatusCode {
    /// Initial acknowledgement sent right after the channel connects.
    Connected,
    Open,
    Cancelled,
    Rejected,
    Complete,
    Other(String),
}

impl OrderStatusCode {
    #[must_use]
    pub fn parse(code: &str) -> Self {
        match code {
            "AB00" => Self::Connected,
            "AB01" => Self::Open,
            "AB02" => Self::Cancelled,
            "AB03" => Self::Rejected,
            "AB05" => Self::Complete,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "AB00",
            Self::Open => "AB01",
            Self::Cancelled => "AB02",
            Self::Rejected => "AB03",
            Self::Complete => "AB05",
            Self::Other(code) => code,
        }
    }
}

/// Order details inside an update.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OrderData {
    #[serde(rename = "orderid", default)]
    pub order_id: String,
    #[serde(rename = "averageprice", default, deserialize_with = "flexible_decimal")]
    pub average_price: Decimal,
    #[serde(rename = "filledshares", default, deserialize_with = "flexible_decimal")]
    pub filled_shares: Decimal,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderUpdate {
    #[serde(rename = "order-status", default)]
    order_status: String,
    #[serde(rename = "orderData", default)]
    order_data: Option<OrderData>,
}

/// One parsed order-status event.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub code: OrderStatusCode,
    pub order: OrderData,
}

impl OrderUpdate {
    /// Whether this is the post-connect acknowledgement rather than an order event.
    #[must_use]
    pub fn is_connect_ack(&self) -> bool {
        self.code == OrderStatusCode::Connected
    }
}

/// Parse an order-status text frame.
///
/// # Errors
///
/// `WsError::ParseError` if the frame is not JSON of the expected shape.
pub fn parse_order_update(text: &str) -> WsResult<OrderUpdate> {
    let raw: RawOrderUpdate =
        serde_json::from_str(text).map_err(|e| WsError::ParseError(e.to_string()))?;
    if raw.order_status.is_empty() {
        return Err(WsError::ParseError("missing order-status".to_string()));
    }
    Ok(OrderUpdate {
        code: OrderStatusCode::parse(&raw.order_status),
        order: raw.order_data.unwrap_or_default(),
    })
}
