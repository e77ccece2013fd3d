//! Connection seam between slots and the network
//!
//! `ConnectionSlot` only talks to these traits, so the WebSocket client can be
//! swapped for the scripted transport in `test_helpers`.

use async_trait::async_trait;

use crate::error::SlotError;

/// A data frame received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Opens connections for slots
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    /// Connect one slot with the current session token
    async fn connect(&self, slot: usize, access_token: &str)
        -> Result<Box<dyn FeedStream>, SlotError>;
}

/// One open connection
#[async_trait]
pub trait FeedStream: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SlotError>;

    /// Next data frame. Keepalive traffic is handled internally; an error means
    /// the connection is gone.
    async fn recv(&mut self) -> Result<InboundFrame, SlotError>;

    async fn close(&mut self);
}
