//! Trading session utilities.
//!
//! Session classification in exchange-local time:
//! - Regular market hours (Mon–Fri, 09:15–15:30 by default)
//! - Expiry-day closing window for option positions

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// Venue expiry date format, e.g. `27MAR2025`.
pub const EXPIRY_FORMAT: &str = "%d%b%Y";

/// Default hour (local) from which expiring positions are closed.
pub const DEFAULT_EXPIRY_EXIT_HOUR: u32 = 15;

/// Market open/closed classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Open,
    Closed,
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Regular session window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl MarketHours {
    #[must_use]
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    /// Parse `"HH:MM"` bounds, as written in configuration.
    pub fn parse(open: &str, close: &str) -> Option<Self> {
        let open = NaiveTime::parse_from_str(open, "%H:%M").ok()?;
        let close = NaiveTime::parse_from_str(close, "%H:%M").ok()?;
        Some(Self { open, close })
    }

    /// Check if a local datetime falls in the session (bounds inclusive).
    #[must_use]
    pub fn is_open_at(&self, dt: NaiveDateTime) -> bool {
        if matches!(dt.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = dt.time();
        t >= self.open && t <= self.close
    }

    #[must_use]
    pub fn status_at(&self, dt: NaiveDateTime) -> MarketStatus {
        if self.is_open_at(dt) {
            MarketStatus::Open
        } else {
            MarketStatus::Closed
        }
    }
}

/// Parse a venue expiry string (`27MAR2025`, month case-insensitive).
#[must_use]
pub fn parse_expiry(expiry: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(expiry.trim(), EXPIRY_FORMAT).ok()
}

/// Check if a position expiring on `expiry` must be closed at `now`.
///
/// True on the expiry date itself from `exit_hour` onward. Unparsable
/// expiries never trigger.
#[must_use]
pub fn is_expiry_closing_at(expiry: &str, now: NaiveDateTime, exit_hour: u32) -> bool {
    match parse_expiry(expiry) {
        Some(date) => date == now.date() && now.hour() >= exit_hour,
        None => false,
    }
}
