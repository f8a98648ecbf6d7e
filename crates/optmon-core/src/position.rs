//! Tracked option position and the record written when it terminates.

use crate::decimal::Price;
use crate::types::{Exchange, ExitReason, OptionType, PositionStatus};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Text format for every persisted timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Serde adapter for `NaiveDateTime` in [`TIMESTAMP_FORMAT`].
pub mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }

    /// Same format for optional fields; `null` and `""` read back as `None`.
    pub mod option {
        use super::TIMESTAMP_FORMAT;
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<NaiveDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_str(&dt.format(TIMESTAMP_FORMAT).to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) if !raw.is_empty() => {
                    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
                        .map(Some)
                        .map_err(serde::de::Error::custom)
                }
                _ => Ok(None),
            }
        }
    }
}

fn default_product_type() -> String {
    "INTRADAY".to_string()
}

fn default_order_type() -> String {
    "MARKET".to_string()
}

/// Key under which a position is stored: one position per account and symbol.
#[must_use]
pub fn position_key(client_id: &str, symbol: &str) -> String {
    format!("{client_id}_{symbol}")
}

// ============================================================================
// Position
// ============================================================================

/// An open option position tracked against underlying price thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trade_id: String,
    pub client_id: String,
    /// Entry order id.
    pub order_id: String,

    /// Option trading symbol, e.g. `NIFTY27MAR2522500CE`.
    pub symbol: String,
    pub token: String,
    pub option_type: OptionType,
    pub strike_price: Decimal,
    /// Venue expiry text, e.g. `27MAR2025`.
    #[serde(default)]
    pub expiry: String,
    pub underlying_symbol: String,
    #[serde(default)]
    pub underlying_exchange: Exchange,

    pub quantity: u32,
    #[serde(default)]
    pub lot_size: u32,
    pub entry_price: Price,
    pub underlying_entry_price: Price,
    pub underlying_stop_loss: Price,
    pub underlying_target: Price,

    #[serde(rename = "producttype", default = "default_product_type")]
    pub product_type: String,
    #[serde(rename = "entry_ordertype", default = "default_order_type")]
    pub entry_order_type: String,
    #[serde(rename = "exit_ordertype", default = "default_order_type")]
    pub exit_order_type: String,

    #[serde(default)]
    pub status: PositionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Last order-status code seen for the entry order (AB01, AB05, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_status: Option<String>,

    #[serde(with = "timestamp")]
    pub entry_time: NaiveDateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_underlying_price: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_option_price: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<Decimal>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<NaiveDateTime>,
}

impl Position {
    /// Store key of this position.
    #[must_use]
    pub fn key(&self) -> String {
        position_key(&self.client_id, &self.symbol)
    }

    /// Generate a fresh trade id.
    #[must_use]
    pub fn new_trade_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Profit and loss at `exit_price`: `(pnl, pnl_percent)`.
    ///
    /// Zero when either price is not positive.
    #[must_use]
    pub fn pnl_at(&self, exit_price: Price) -> (Decimal, Decimal) {
        if !self.entry_price.is_positive() || !exit_price.is_positive() {
            return (Decimal::ZERO, Decimal::ZERO);
        }
        let diff = exit_price.inner() - self.entry_price.inner();
        let pnl = diff * Decimal::from(self.quantity);
        let pct = exit_price.pct_from(self.entry_price).unwrap_or(Decimal::ZERO);
        (pnl, pct)
    }
}

// ============================================================================
// CompletedTradeRecord
// ============================================================================

/// Write-once record of a terminated position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTradeRecord {
    pub trade_id: String,
    pub client_id: String,
    pub symbol: String,
    pub underlying_symbol: String,
    pub option_type: OptionType,
    pub strike_price: Decimal,
    #[serde(with = "timestamp")]
    pub entry_time: NaiveDateTime,
    #[serde(with = "timestamp")]
    pub exit_time: NaiveDateTime,
    pub entry_price: Price,
    pub exit_price: Price,
    pub quantity: u32,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: ExitReason,
    pub entry_order_id: String,
    pub exit_order_id: String,
    pub expiry: String,
    pub underlying_entry_price: Price,
    pub underlying_stop_loss: Price,
    pub underlying_target: Price,
}

impl CompletedTradeRecord {
    /// Build the record for `position` closing at `exit_price`.
    #[must_use]
    pub fn from_position(
        position: &Position,
        exit_price: Price,
        pnl: Decimal,
        pnl_percent: Decimal,
        exit_reason: ExitReason,
        exit_order_id: impl Into<String>,
        exit_time: NaiveDateTime,
    ) -> Self {
        Self {
            trade_id: position.trade_id.clone(),
            client_id: position.client_id.clone(),
            symbol: position.symbol.clone(),
            underlying_symbol: position.underlying_symbol.clone(),
            option_type: position.option_type,
            strike_price: position.strike_price,
            entry_time: position.entry_time,
            exit_time,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl,
            pnl_percent,
            exit_reason,
            entry_order_id: position.order_id.clone(),
            exit_order_id: exit_order_id.into(),
            expiry: position.expiry.clone(),
            underlying_entry_price: position.underlying_entry_price,
            underlying_stop_loss: position.underlying_stop_loss,
            underlying_target: position.underlying_target,
        }
    }

    /// Record for a position closed outside this system; economics unknown.
    #[must_use]
    pub fn external_exit(position: &Position, exit_time: NaiveDateTime) -> Self {
        Self::from_position(
            position,
            Price::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            ExitReason::ExternalExit,
            "",
            exit_time,
        )
    }
}
