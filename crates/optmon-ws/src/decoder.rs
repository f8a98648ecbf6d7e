//! Binary tick decoder for the market-data channel.
//!
//! Frames are fixed-offset and little-endian:
//!
//! | Offset  | Size | Field                                   |
//! |---------|------|-----------------------------------------|
//! | 0       | 1    | mode (1 LTP, 2 QUOTE, 3 SNAPQUOTE)      |
//! | 1       | 1    | exchange type                           |
//! | 2..27   | 25   | NUL-terminated ASCII token              |
//! | 27..35  | 8    | sequence number                         |
//! | 35..43  | 8    | exchange timestamp (epoch ms)           |
//! | 43..51  | 8    | last traded price × 100                 |
//! | 51..123 | 72   | QUOTE section                           |
//! | 123..379| 256  | SNAPQUOTE section                       |
//!
//! A frame that claims a richer mode than its length supports degrades to
//! the fields it does carry.

use crate::error::{WsError, WsResult};
use optmon_core::{DepthLevel, Price, QuoteData, SnapQuoteData, Tick, TickMode};

/// Minimum frame length (LTP section).
pub const LTP_FRAME_LEN: usize = 51;
/// Length through the end of the QUOTE section.
pub const QUOTE_FRAME_LEN: usize = 123;
/// Length through the end of the SNAPQUOTE section.
pub const SNAP_QUOTE_FRAME_LEN: usize = 379;

const TOKEN_START: usize = 2;
const TOKEN_END: usize = 27;
const DEPTH_START: usize = 147;
const DEPTH_PACKET_LEN: usize = 20;
const DEPTH_PACKETS: usize = 10;
const DEPTH_BUY_FLAG: u16 = 1;

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(b)
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn read_f64(buf: &[u8], at: usize) -> f64 {
    f64::from_bits(read_u64(buf, at))
}

#[inline]
fn read_price(buf: &[u8], at: usize) -> Price {
    Price::from_feed_units(read_u64(buf, at))
}

fn read_token(buf: &[u8]) -> String {
    let raw = &buf[TOKEN_START..TOKEN_END];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

/// Decode one binary market-data frame.
///
/// An unrecognised mode byte decodes as LTP.
///
/// # Errors
///
/// `WsError::MalformedFrame` if the buffer is shorter than [`LTP_FRAME_LEN`].
pub fn decode_tick(buf: &[u8]) -> WsResult<Tick> {
    if buf.len() < LTP_FRAME_LEN {
        return Err(WsError::MalformedFrame {
            len: buf.len(),
            min: LTP_FRAME_LEN,
        });
    }

    let mode = TickMode::from_u8(buf[0]).unwrap_or(TickMode::Ltp);

    let quote = if mode >= TickMode::Quote && buf.len() >= QUOTE_FRAME_LEN {
        Some(decode_quote(buf))
    } else {
        None
    };

    let snap_quote = if mode == TickMode::SnapQuote && buf.len() >= SNAP_QUOTE_FRAME_LEN {
        Some(decode_snap_quote(buf))
    } else {
        None
    };

    Ok(Tick {
        mode,
        exchange_type: buf[1],
        token: read_token(buf),
        sequence_number: read_u64(buf, 27),
        exchange_timestamp: read_u64(buf, 35),
        last_traded_price: read_price(buf, 43),
        quote,
        snap_quote,
    })
}

fn decode_quote(buf: &[u8]) -> QuoteData {
    QuoteData {
        last_traded_quantity: read_u64(buf, 51),
        average_traded_price: read_price(buf, 59),
        volume: read_u64(buf, 67),
        total_buy_quantity: read_f64(buf, 75),
        total_sell_quantity: read_f64(buf, 83),
        open: read_price(buf, 91),
        high: read_price(buf, 99),
        low: read_price(buf, 107),
        close: read_price(buf, 115),
    }
}

fn decode_snap_quote(buf: &[u8]) -> SnapQuoteData {
    let mut best_five_buy = Vec::with_capacity(5);
    let mut best_five_sell = Vec::with_capacity(5);

    for i in 0..DEPTH_PACKETS {
        let at = DEPTH_START + i * DEPTH_PACKET_LEN;
        let level = DepthLevel {
            quantity: read_u64(buf, at + 2),
            price: read_price(buf, at + 10),
            orders: read_u16(buf, at + 18),
        };
        if read_u16(buf, at) == DEPTH_BUY_FLAG {
            best_five_buy.push(level);
        } else {
            best_five_sell.push(level);
        }
    }

    SnapQuoteData {
        last_traded_timestamp: read_u64(buf, 123),
        open_interest: read_u64(buf, 131),
        open_interest_change_pct: read_f64(buf, 139),
        best_five_buy,
        best_five_sell,
        upper_circuit: read_price(buf, 347),
        lower_circuit: read_price(buf, 355),
        week_52_high: read_price(buf, 363),
        week_52_low: read_price(buf, 371),
    }
}
