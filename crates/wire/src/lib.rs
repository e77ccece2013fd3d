//! tickfeed-wire: ticker wire format and normalized market data types
//!
//! Pure transformations only. Control frames are JSON text, tick frames are
//! length-prefixed big-endian binary packets whose shape depends on the
//! subscription mode.

pub mod bar;
pub mod codec;
pub mod error;
pub mod tick;

pub use bar::OhlcBar;
pub use codec::{BinaryFrame, ServerMessage, WireCodec};
pub use error::CodecError;
pub use tick::{
    DayOhlc, DepthLevel, FullFields, IndexFields, InstrumentToken, MarketDepth, Mode,
    QuoteFields, Tick, TickKind,
};
