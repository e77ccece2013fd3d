//! Ticker WebSocket transport
//!
//! Authenticates through query parameters on the handshake. A 403 answer to
//! the handshake means the session token is no longer valid.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, http::StatusCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::SlotError;
use crate::transport::{FeedStream, FeedTransport, InboundFrame};

/// Close reason fragments the server uses for session problems
const AUTH_CLOSE_MARKERS: [&str; 3] = ["token", "auth", "session"];

/// Connects slots to the ticker endpoint
#[derive(Debug, Clone)]
pub struct KiteTransport {
    ws_url: String,
    api_key: String,
    read_timeout: Duration,
}

impl KiteTransport {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            read_timeout,
        }
    }

    fn endpoint(&self, access_token: &str) -> Result<Url, SlotError> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| SlotError::Transient(format!("invalid url {}: {}", self.ws_url, e)))?;
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("access_token", access_token);
        Ok(url)
    }
}

#[async_trait]
impl FeedTransport for KiteTransport {
    async fn connect(
        &self,
        slot: usize,
        access_token: &str,
    ) -> Result<Box<dyn FeedStream>, SlotError> {
        let url = self.endpoint(access_token)?;
        info!(slot, host = url.host_str().unwrap_or_default(), "Connecting to ticker");

        let (ws, response) = connect_async(url.as_str()).await.map_err(classify_connect_error)?;
        debug!(slot, status = ?response.status(), "WebSocket connected");

        Ok(Box::new(KiteWebSocket {
            ws,
            slot,
            read_timeout: self.read_timeout,
        }))
    }
}

fn classify_connect_error(err: tungstenite::Error) -> SlotError {
    match err {
        tungstenite::Error::Http(response) if response.status() == StatusCode::FORBIDDEN => {
            SlotError::AuthExpired(format!("handshake rejected: {}", response.status()))
        }
        other => SlotError::Transient(other.to_string()),
    }
}

/// Live ticker connection for one slot
pub struct KiteWebSocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    slot: usize,
    read_timeout: Duration,
}

#[async_trait]
impl FeedStream for KiteWebSocket {
    async fn send_text(&mut self, text: String) -> Result<(), SlotError> {
        trace!(slot = self.slot, frame = %text, "Sending control frame");
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| SlotError::Transient(e.to_string()))
    }

    async fn recv(&mut self) -> Result<InboundFrame, SlotError> {
        loop {
            // The server sends a heartbeat every second; silence means a dead socket
            let next = match tokio::time::timeout(self.read_timeout, self.ws.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        slot = self.slot,
                        timeout_secs = self.read_timeout.as_secs(),
                        "WebSocket read timeout - no data received, connection may be dead"
                    );
                    return Err(SlotError::ReadTimeout(self.read_timeout));
                }
            };

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(InboundFrame::Binary(data)),
                Some(Ok(Message::Text(text))) => return Ok(InboundFrame::Text(text)),
                Some(Ok(Message::Ping(data))) => {
                    trace!(slot = self.slot, "Received ping, sending pong");
                    self.ws
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SlotError::Transient(e.to_string()))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_default();
                    info!(slot = self.slot, reason = %reason, "Received close frame");
                    return Err(classify_close(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SlotError::Transient(e.to_string())),
                None => return Err(SlotError::Transient("stream ended".to_string())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(slot = self.slot, error = %e, "Error closing WebSocket");
        }
    }
}

fn classify_close(reason: String) -> SlotError {
    let lower = reason.to_ascii_lowercase();
    if AUTH_CLOSE_MARKERS.iter().any(|m| lower.contains(m)) {
        SlotError::AuthExpired(reason)
    } else {
        SlotError::Transient(format!("connection closed: {}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_carries_credentials() {
        let transport = KiteTransport::new("wss://ws.kite.trade", "key1", Duration::from_secs(30));
        let url = transport.endpoint("tok/en+1").unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("api_key".to_string(), "key1".to_string()),
                ("access_token".to_string(), "tok/en+1".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_url_is_transient() {
        let transport = KiteTransport::new("not a url", "k", Duration::from_secs(1));
        assert!(matches!(transport.endpoint("t"), Err(SlotError::Transient(_))));
    }

    #[test]
    fn test_close_reason_classification() {
        assert!(classify_close("Invalid access token".into()).is_auth());
        assert!(!classify_close("going away".into()).is_auth());
    }
}
