//! Ticker wire codec
//!
//! Control frames are JSON text (`{"a": action, "v": value}`). Market data
//! arrives as binary messages: a big-endian `u16` packet count, then each
//! packet as a `u16` length followed by the packet bytes. A one-byte binary
//! message is a heartbeat.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::CodecError;
use crate::tick::{
    DayOhlc, DepthLevel, FullFields, IndexFields, InstrumentToken, MarketDepth, Mode,
    QuoteFields, Tick, TickKind,
};

pub const LTP_PACKET_LEN: usize = 8;
pub const INDEX_QUOTE_PACKET_LEN: usize = 28;
pub const INDEX_FULL_PACKET_LEN: usize = 32;
pub const QUOTE_PACKET_LEN: usize = 44;
pub const FULL_PACKET_LEN: usize = 184;

const DEPTH_OFFSET: usize = 64;
const DEPTH_LEVEL_LEN: usize = 12;

/// Exchange segment ids carried in the low byte of the token
const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;
pub const SEGMENT_INDICES: u32 = 9;

/// Price divisor for the segment an instrument trades on
pub fn price_divisor(token: InstrumentToken) -> f64 {
    match token & 0xff {
        SEGMENT_CDS => 10_000_000.0,
        SEGMENT_BCD => 10_000.0,
        _ => 100.0,
    }
}

#[derive(Serialize)]
struct ControlFrame<'a, V: Serialize> {
    a: &'a str,
    v: V,
}

/// Text messages pushed by the server alongside binary ticks
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Error {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Order postbacks; order handling lives outside the feed
    Order {
        #[serde(default)]
        data: serde_json::Value,
    },
    Message {
        #[serde(default)]
        data: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

/// Result of decoding one binary message
#[derive(Debug, Default)]
pub struct BinaryFrame {
    pub ticks: Vec<Tick>,
    /// Packets skipped because their length or layout was not recognised
    pub malformed: usize,
    pub heartbeat: bool,
}

/// Stateless apart from the sequence counter, which is shared by clones so
/// that every slot's ticks draw from one increasing sequence.
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    next_seq: Arc<AtomicU64>,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn control<V: Serialize>(action: &str, value: V) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&ControlFrame { a: action, v: value })?)
    }

    pub fn encode_subscribe(tokens: &[InstrumentToken]) -> Result<String, CodecError> {
        Self::control("subscribe", tokens)
    }

    pub fn encode_unsubscribe(tokens: &[InstrumentToken]) -> Result<String, CodecError> {
        Self::control("unsubscribe", tokens)
    }

    pub fn encode_mode(mode: Mode, tokens: &[InstrumentToken]) -> Result<String, CodecError> {
        Self::control("mode", (mode.as_str(), tokens))
    }

    pub fn decode_text(text: &str) -> Result<ServerMessage, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode one binary message into ticks stamped with `arrival_ms`.
    ///
    /// Bad packets are skipped and counted; only an empty message is an error.
    pub fn decode_binary(&self, data: &[u8], arrival_ms: i64) -> Result<BinaryFrame, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Truncated {
                needed: 1,
                available: 0,
            });
        }
        if data.len() == 1 {
            trace!("heartbeat");
            return Ok(BinaryFrame {
                heartbeat: true,
                ..Default::default()
            });
        }

        let mut buf = data;
        let count = buf.get_u16() as usize;
        let mut frame = BinaryFrame {
            ticks: Vec::with_capacity(count),
            ..Default::default()
        };

        for index in 0..count {
            if buf.remaining() < 2 {
                debug!(index, count, "packet header past end of message");
                frame.malformed += count - index;
                break;
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                debug!(index, len, remaining = buf.remaining(), "packet truncated");
                frame.malformed += count - index;
                break;
            }
            let (packet, rest) = buf.split_at(len);
            buf = rest;

            match self.decode_packet(packet, arrival_ms) {
                Some(tick) => frame.ticks.push(tick),
                None => {
                    debug!(len, "unrecognised packet length");
                    frame.malformed += 1;
                }
            }
        }

        Ok(frame)
    }

    fn decode_packet(&self, packet: &[u8], arrival_ms: i64) -> Option<Tick> {
        if packet.len() < 4 {
            return None;
        }
        let mut buf = packet;
        let token = buf.get_u32();
        let divisor = price_divisor(token);
        let price = |raw: i32| raw as f64 / divisor;

        let kind = match packet.len() {
            LTP_PACKET_LEN => TickKind::Ltp {
                last_price: price(buf.get_i32()),
            },
            INDEX_QUOTE_PACKET_LEN | INDEX_FULL_PACKET_LEN => {
                let last_price = price(buf.get_i32());
                let high = price(buf.get_i32());
                let low = price(buf.get_i32());
                let open = price(buf.get_i32());
                let close = price(buf.get_i32());
                let change = price(buf.get_i32());
                let fields = IndexFields {
                    last_price,
                    ohlc: DayOhlc {
                        open,
                        high,
                        low,
                        close,
                    },
                    change,
                    exchange_timestamp: (packet.len() == INDEX_FULL_PACKET_LEN)
                        .then(|| buf.get_u32()),
                };
                if packet.len() == INDEX_FULL_PACKET_LEN {
                    TickKind::IndexFull(fields)
                } else {
                    TickKind::IndexQuote(fields)
                }
            }
            QUOTE_PACKET_LEN => TickKind::Quote(Self::read_quote(&mut buf, divisor)),
            FULL_PACKET_LEN => {
                let quote = Self::read_quote(&mut buf, divisor);
                let last_trade_time = buf.get_u32();
                let open_interest = buf.get_u32();
                let oi_day_high = buf.get_u32();
                let oi_day_low = buf.get_u32();
                let exchange_timestamp = buf.get_u32();
                let mut depth = MarketDepth::default();
                for level in depth.bids.iter_mut().chain(depth.asks.iter_mut()) {
                    *level = DepthLevel {
                        quantity: buf.get_i32().max(0) as u32,
                        price: price(buf.get_i32()),
                        orders: buf.get_i16().max(0) as u16,
                    };
                    buf.advance(2);
                }
                TickKind::Full(Box::new(FullFields {
                    quote,
                    last_trade_time,
                    open_interest,
                    oi_day_high,
                    oi_day_low,
                    exchange_timestamp,
                    depth,
                }))
            }
            _ => return None,
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Some(Tick::new(token, arrival_ms, seq, kind))
    }

    fn read_quote(buf: &mut &[u8], divisor: f64) -> QuoteFields {
        let last_price = buf.get_i32() as f64 / divisor;
        let last_traded_quantity = buf.get_u32();
        let average_price = buf.get_i32() as f64 / divisor;
        let volume = buf.get_u32();
        let total_buy_quantity = buf.get_u32();
        let total_sell_quantity = buf.get_u32();
        let open = buf.get_i32() as f64 / divisor;
        let high = buf.get_i32() as f64 / divisor;
        let low = buf.get_i32() as f64 / divisor;
        let close = buf.get_i32() as f64 / divisor;
        QuoteFields {
            last_price,
            last_traded_quantity,
            average_price,
            volume,
            total_buy_quantity,
            total_sell_quantity,
            ohlc: DayOhlc {
                open,
                high,
                low,
                close,
            },
        }
    }

    // Packet builders. The feed never sends ticks; these exist for simulators
    // and tests that need byte-exact server frames.

    fn to_raw(token: InstrumentToken, price: f64) -> i32 {
        (price * price_divisor(token)).round() as i32
    }

    pub fn encode_ltp_packet(token: InstrumentToken, last_price: f64) -> Vec<u8> {
        let mut out = Vec::with_capacity(LTP_PACKET_LEN);
        out.put_u32(token);
        out.put_i32(Self::to_raw(token, last_price));
        out
    }

    pub fn encode_quote_packet(token: InstrumentToken, quote: &QuoteFields) -> Vec<u8> {
        let mut out = Vec::with_capacity(QUOTE_PACKET_LEN);
        out.put_u32(token);
        Self::put_quote(&mut out, token, quote);
        out
    }

    pub fn encode_full_packet(token: InstrumentToken, full: &FullFields) -> Vec<u8> {
        let mut out = Vec::with_capacity(FULL_PACKET_LEN);
        out.put_u32(token);
        Self::put_quote(&mut out, token, &full.quote);
        out.put_u32(full.last_trade_time);
        out.put_u32(full.open_interest);
        out.put_u32(full.oi_day_high);
        out.put_u32(full.oi_day_low);
        out.put_u32(full.exchange_timestamp);
        debug_assert_eq!(out.len(), DEPTH_OFFSET);
        for level in full.depth.bids.iter().chain(full.depth.asks.iter()) {
            out.put_i32(level.quantity as i32);
            out.put_i32(Self::to_raw(token, level.price));
            out.put_i16(level.orders as i16);
            out.put_u16(0);
        }
        debug_assert_eq!(out.len(), DEPTH_OFFSET + 10 * DEPTH_LEVEL_LEN);
        out
    }

    pub fn encode_index_packet(token: InstrumentToken, fields: &IndexFields) -> Vec<u8> {
        let mut out = Vec::with_capacity(INDEX_FULL_PACKET_LEN);
        out.put_u32(token);
        for value in [
            fields.last_price,
            fields.ohlc.high,
            fields.ohlc.low,
            fields.ohlc.open,
            fields.ohlc.close,
            fields.change,
        ] {
            out.put_i32(Self::to_raw(token, value));
        }
        if let Some(ts) = fields.exchange_timestamp {
            out.put_u32(ts);
        }
        out
    }

    fn put_quote(out: &mut Vec<u8>, token: InstrumentToken, quote: &QuoteFields) {
        out.put_i32(Self::to_raw(token, quote.last_price));
        out.put_u32(quote.last_traded_quantity);
        out.put_i32(Self::to_raw(token, quote.average_price));
        out.put_u32(quote.volume);
        out.put_u32(quote.total_buy_quantity);
        out.put_u32(quote.total_sell_quantity);
        out.put_i32(Self::to_raw(token, quote.ohlc.open));
        out.put_i32(Self::to_raw(token, quote.ohlc.high));
        out.put_i32(Self::to_raw(token, quote.ohlc.low));
        out.put_i32(Self::to_raw(token, quote.ohlc.close));
    }

    /// Wrap packets into one binary message
    pub fn frame_packets(packets: &[Vec<u8>]) -> Vec<u8> {
        let body: usize = packets.iter().map(|p| p.len() + 2).sum();
        let mut out = Vec::with_capacity(2 + body);
        out.put_u16(packets.len() as u16);
        for packet in packets {
            out.put_u16(packet.len() as u16);
            out.extend_from_slice(packet);
        }
        out
    }
}
