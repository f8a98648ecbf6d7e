//! Order, trade and position records exchanged with the broker.

use optmon_core::serde_util::flexible_decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const TRANSACTION_BUY: &str = "BUY";
pub const TRANSACTION_SELL: &str = "SELL";

/// Order placement request, in the venue's field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderParams {
    pub variety: String,
    #[serde(rename = "tradingsymbol")]
    pub trading_symbol: String,
    #[serde(rename = "symboltoken")]
    pub symbol_token: String,
    #[serde(rename = "transactiontype")]
    pub transaction_type: String,
    pub exchange: String,
    #[serde(rename = "ordertype")]
    pub order_type: String,
    #[serde(rename = "producttype")]
    pub product_type: String,
    pub duration: String,
    pub price: String,
    #[serde(rename = "triggerprice", skip_serializing_if = "Option::is_none", default)]
    pub trigger_price: Option<String>,
    pub quantity: String,
}

/// One row of the order book.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OrderRecord {
    #[serde(rename = "orderid", default)]
    pub order_id: String,
    #[serde(rename = "tradingsymbol", default)]
    pub trading_symbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(rename = "transactiontype", default)]
    pub transaction_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "averageprice", default, deserialize_with = "flexible_decimal")]
    pub average_price: Decimal,
    #[serde(rename = "filledshares", default, deserialize_with = "flexible_decimal")]
    pub filled_shares: Decimal,
    #[serde(default)]
    pub text: String,
}

impl OrderRecord {
    /// Terminal venue statuses: complete, filled, cancelled, rejected.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "complete" | "filled" | "cancelled" | "rejected"
        )
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "complete" | "filled"
        )
    }

    /// Filled quantity signed by side (BUY positive).
    #[must_use]
    pub fn signed_filled(&self) -> i64 {
        signed(&self.transaction_type, self.filled_shares)
    }
}

/// One fill from the trade book.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TradeRecord {
    #[serde(rename = "tradingsymbol", default)]
    pub trading_symbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(rename = "transactiontype", default)]
    pub transaction_type: String,
    #[serde(rename = "fillsize", default, deserialize_with = "flexible_decimal")]
    pub fill_size: Decimal,
}

impl TradeRecord {
    #[must_use]
    pub fn signed_fill(&self) -> i64 {
        signed(&self.transaction_type, self.fill_size)
    }
}

/// One open position as reported by the broker's position endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BrokerPosition {
    #[serde(rename = "tradingsymbol", default)]
    pub trading_symbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(rename = "netqty", default, deserialize_with = "flexible_decimal")]
    pub net_qty: Decimal,
}

impl BrokerPosition {
    #[must_use]
    pub fn net_quantity(&self) -> i64 {
        self.net_qty.trunc().to_i64().unwrap_or(0)
    }
}

fn signed(transaction_type: &str, qty: Decimal) -> i64 {
    let qty = qty.trunc().to_i64().unwrap_or(0);
    if transaction_type.eq_ignore_ascii_case(TRANSACTION_BUY) {
        qty
    } else {
        -qty
    }
}
