//! Normalized tick records
//!
//! One `TickKind` variant per packet shape, so an LTP tick never carries
//! empty quote or depth fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

/// Numeric instrument identifier. The low byte encodes the exchange segment.
pub type InstrumentToken = u32;

/// Subscription mode, in increasing order of detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ltp,
    Quote,
    Full,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ltp => "ltp",
            Mode::Quote => "quote",
            Mode::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ltp" => Ok(Mode::Ltp),
            "quote" => Ok(Mode::Quote),
            "full" => Ok(Mode::Full),
            other => Err(CodecError::UnknownMode(other.to_string())),
        }
    }
}

/// Day open/high/low/close as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DayOhlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DepthLevel {
    pub quantity: u32,
    pub price: f64,
    pub orders: u16,
}

/// Five best bid and ask levels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    pub bids: [DepthLevel; 5],
    pub asks: [DepthLevel; 5],
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QuoteFields {
    pub last_price: f64,
    pub last_traded_quantity: u32,
    pub average_price: f64,
    pub volume: u32,
    pub total_buy_quantity: u32,
    pub total_sell_quantity: u32,
    pub ohlc: DayOhlc,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FullFields {
    pub quote: QuoteFields,
    /// Epoch seconds of the last trade
    pub last_trade_time: u32,
    pub open_interest: u32,
    pub oi_day_high: u32,
    pub oi_day_low: u32,
    /// Epoch seconds stamped by the exchange
    pub exchange_timestamp: u32,
    pub depth: MarketDepth,
}

/// Index packets carry no traded quantity or depth
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexFields {
    pub last_price: f64,
    pub ohlc: DayOhlc,
    pub change: f64,
    pub exchange_timestamp: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TickKind {
    Ltp { last_price: f64 },
    Quote(QuoteFields),
    Full(Box<FullFields>),
    IndexQuote(IndexFields),
    IndexFull(IndexFields),
}

/// One market price update. Immutable once built by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub token: InstrumentToken,
    /// Wall-clock epoch milliseconds at which the carrying frame arrived
    pub arrival_ms: i64,
    /// Codec-assigned sequence number, increasing in arrival order
    pub seq: u64,
    pub kind: TickKind,
}

impl Tick {
    pub fn new(token: InstrumentToken, arrival_ms: i64, seq: u64, kind: TickKind) -> Self {
        Self {
            token,
            arrival_ms,
            seq,
            kind,
        }
    }

    /// Shorthand for an LTP tick
    pub fn ltp(token: InstrumentToken, arrival_ms: i64, seq: u64, last_price: f64) -> Self {
        Self::new(token, arrival_ms, seq, TickKind::Ltp { last_price })
    }

    pub fn last_price(&self) -> f64 {
        match &self.kind {
            TickKind::Ltp { last_price } => *last_price,
            TickKind::Quote(q) => q.last_price,
            TickKind::Full(f) => f.quote.last_price,
            TickKind::IndexQuote(i) | TickKind::IndexFull(i) => i.last_price,
        }
    }

    pub fn mode(&self) -> Mode {
        match &self.kind {
            TickKind::Ltp { .. } => Mode::Ltp,
            TickKind::Quote(_) | TickKind::IndexQuote(_) => Mode::Quote,
            TickKind::Full(_) | TickKind::IndexFull(_) => Mode::Full,
        }
    }

    /// Quantity of the last trade, zero when the packet does not carry it
    pub fn traded_quantity(&self) -> u64 {
        match &self.kind {
            TickKind::Quote(q) => q.last_traded_quantity as u64,
            TickKind::Full(f) => f.quote.last_traded_quantity as u64,
            _ => 0,
        }
    }

    /// Exchange timestamp in epoch seconds, only present in full packets
    pub fn exchange_timestamp(&self) -> Option<u32> {
        match &self.kind {
            TickKind::Full(f) => Some(f.exchange_timestamp),
            TickKind::IndexFull(i) => i.exchange_timestamp,
            _ => None,
        }
    }

    pub fn depth(&self) -> Option<&MarketDepth> {
        match &self.kind {
            TickKind::Full(f) => Some(&f.depth),
            _ => None,
        }
    }

    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.depth().map(|d| d.bids[0])
    }

    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.depth().map(|d| d.asks[0])
    }
}
