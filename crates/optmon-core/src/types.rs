//! Venue enums shared by the feed, the monitor and persistence.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Exchange
// ============================================================================

/// Exchange segment, with the numeric type id the streaming feed uses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    #[default]
    Nse,
    Nfo,
    Bse,
    Bfo,
    Mcx,
    Ncx,
    Cds,
}

impl Exchange {
    /// Numeric exchange type used in control frames and tick headers.
    #[must_use]
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Nse => 1,
            Self::Nfo => 2,
            Self::Bse => 3,
            Self::Bfo => 4,
            Self::Mcx => 5,
            Self::Ncx => 7,
            Self::Cds => 13,
        }
    }

    /// Map a feed exchange type id back to the exchange.
    #[must_use]
    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Nse),
            2 => Some(Self::Nfo),
            3 => Some(Self::Bse),
            4 => Some(Self::Bfo),
            5 => Some(Self::Mcx),
            7 => Some(Self::Ncx),
            13 => Some(Self::Cds),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nse => "NSE",
            Self::Nfo => "NFO",
            Self::Bse => "BSE",
            Self::Bfo => "BFO",
            Self::Mcx => "MCX",
            Self::Ncx => "NCX",
            Self::Cds => "CDS",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NSE" => Ok(Self::Nse),
            "NFO" => Ok(Self::Nfo),
            "BSE" => Ok(Self::Bse),
            "BFO" => Ok(Self::Bfo),
            "MCX" => Ok(Self::Mcx),
            "NCX" => Ok(Self::Ncx),
            "CDS" => Ok(Self::Cds),
            other => Err(CoreError::InvalidExchange(other.to_string())),
        }
    }
}

// ============================================================================
// OptionType
// ============================================================================

/// Call (bullish on the underlying) or put (bearish).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

// ============================================================================
// PositionStatus
// ============================================================================

/// Lifecycle state of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Pending,
    #[default]
    Active,
    /// An exit order is in flight; no other exit may be issued.
    Exiting,
    Exited,
    Rejected,
    Cancelled,
    /// The owning account has no broker session; kept until it returns.
    ClientMissing,
}

impl PositionStatus {
    /// Whether the monitor should evaluate thresholds for this status.
    ///
    /// `ClientMissing` stays evaluable so a returning session picks it up again.
    #[must_use]
    pub fn is_evaluable(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::ClientMissing)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Exiting => "EXITING",
            Self::Exited => "EXITED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::ClientMissing => "CLIENT_MISSING",
        };
        f.write_str(s)
    }
}

// ============================================================================
// ExitReason
// ============================================================================

/// Why a position left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TargetHit,
    StopLossHit,
    ExpiryClosing,
    ManualExit,
    /// Closed outside this system, detected by reconciliation.
    ExternalExit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TargetHit => "TARGET_HIT",
            Self::StopLossHit => "STOP_LOSS_HIT",
            Self::ExpiryClosing => "EXPIRY_CLOSING",
            Self::ManualExit => "MANUAL_EXIT",
            Self::ExternalExit => "EXTERNAL_EXIT",
        };
        f.write_str(s)
    }
}
