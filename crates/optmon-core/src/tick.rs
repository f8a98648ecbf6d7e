//! Decoded market-data tick.

use crate::decimal::Price;
use crate::types::Exchange;
use serde::{Deserialize, Serialize};

/// Subscription / frame mode on the market-data feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TickMode {
    /// Last traded price only.
    Ltp = 1,
    /// LTP plus volume and OHLC.
    Quote = 2,
    /// Quote plus open interest, circuits and best-five depth.
    SnapQuote = 3,
}

impl TickMode {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Ltp),
            2 => Some(Self::Quote),
            3 => Some(Self::SnapQuote),
            _ => None,
        }
    }
}

impl From<TickMode> for u8 {
    fn from(mode: TickMode) -> Self {
        mode.as_u8()
    }
}

impl TryFrom<u8> for TickMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("unknown tick mode {value}"))
    }
}

impl std::fmt::Display for TickMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ltp => write!(f, "LTP"),
            Self::Quote => write!(f, "QUOTE"),
            Self::SnapQuote => write!(f, "SNAPQUOTE"),
        }
    }
}

/// One level of the best-five order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLevel {
    pub quantity: u64,
    pub price: Price,
    pub orders: u16,
}

/// Fields present from QUOTE mode upward.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteData {
    pub last_traded_quantity: u64,
    pub average_traded_price: Price,
    pub volume: u64,
    pub total_buy_quantity: f64,
    pub total_sell_quantity: f64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
}

/// Fields present only in full SNAPQUOTE frames.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapQuoteData {
    pub last_traded_timestamp: u64,
    pub open_interest: u64,
    pub open_interest_change_pct: f64,
    pub best_five_buy: Vec<DepthLevel>,
    pub best_five_sell: Vec<DepthLevel>,
    pub upper_circuit: Price,
    pub lower_circuit: Price,
    pub week_52_high: Price,
    pub week_52_low: Price,
}

/// One decoded market-data update for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub mode: TickMode,
    pub exchange_type: u8,
    pub token: String,
    pub sequence_number: u64,
    /// Epoch milliseconds.
    pub exchange_timestamp: u64,
    pub last_traded_price: Price,
    pub quote: Option<QuoteData>,
    pub snap_quote: Option<SnapQuoteData>,
}

impl Tick {
    /// Exchange of the tick, if the type id is known.
    #[must_use]
    pub fn exchange(&self) -> Option<Exchange> {
        Exchange::from_type_id(self.exchange_type)
    }
}
