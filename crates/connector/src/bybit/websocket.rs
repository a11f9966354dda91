//! Bybit public option WebSocket client
//!
//! No authentication on the public channel. Keepalive is a JSON
//! `{"op":"ping"}` every 20 seconds; the server drops idle connections.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::bybit::messages::{parse_frame, WsRequest};
use crate::error::FeedError;
use crate::message::FeedEvent;
use crate::traits::{FeedConnection, FeedConnector};

/// Max WebSocket message size: 1 MiB
const MAX_MESSAGE_SIZE: usize = 1_048_576;

pub struct BybitConnector {
    url: String,
    read_timeout: Duration,
}

impl BybitConnector {
    /// `read_timeout` bounds silence on the socket; set it above the heartbeat interval
    pub fn new(url: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            read_timeout,
        }
    }
}

#[async_trait]
impl FeedConnector for BybitConnector {
    type Connection = BybitConnection;

    async fn connect(&self) -> Result<BybitConnection, FeedError> {
        info!(url = %self.url, "Connecting to Bybit WebSocket");

        let config = WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            max_frame_size: Some(MAX_MESSAGE_SIZE),
            ..Default::default()
        };

        let (ws, response) = connect_async_with_config(self.url.as_str(), Some(config), false)
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;

        info!(status = ?response.status(), "Bybit WebSocket connected");

        Ok(BybitConnection {
            ws,
            read_timeout: self.read_timeout,
        })
    }
}

pub struct BybitConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    read_timeout: Duration,
}

impl BybitConnection {
    async fn send_request(&mut self, request: &WsRequest<'_>) -> Result<(), FeedError> {
        let text =
            serde_json::to_string(request).map_err(|e| FeedError::SendFailed(e.to_string()))?;
        trace!(op = request.op, req_id = request.req_id, "Sending Bybit request");
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl FeedConnection for BybitConnection {
    async fn subscribe(&mut self, req_id: &str, symbols: &[String]) -> Result<(), FeedError> {
        if symbols.is_empty() {
            return Ok(());
        }
        debug!(req_id, count = symbols.len(), "Sending subscribe");
        self.send_request(&WsRequest::subscribe(req_id, symbols)).await
    }

    async fn unsubscribe(&mut self, req_id: &str, symbols: &[String]) -> Result<(), FeedError> {
        if symbols.is_empty() {
            return Ok(());
        }
        debug!(req_id, count = symbols.len(), "Sending unsubscribe");
        self.send_request(&WsRequest::unsubscribe(req_id, symbols)).await
    }

    async fn ping(&mut self, req_id: &str) -> Result<(), FeedError> {
        self.send_request(&WsRequest::ping(req_id)).await
    }

    async fn recv(&mut self) -> Result<FeedEvent, FeedError> {
        loop {
            let next = tokio::time::timeout(self.read_timeout, self.ws.next()).await;

            match next {
                Err(_) => {
                    let secs = self.read_timeout.as_secs();
                    warn!(timeout_secs = secs, "Bybit WebSocket read timeout");
                    return Err(FeedError::ReadTimeout(secs));
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    trace!(len = text.len(), "Received Bybit message");
                    return Ok(parse_frame(&text));
                }
                Ok(Some(Ok(Message::Binary(bytes)))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(parse_frame(&text)),
                    Err(_) => return Ok(FeedEvent::Malformed("non UTF-8 binary frame".into())),
                },
                Ok(Some(Ok(Message::Ping(data)))) => {
                    trace!("Received WS ping, sending pong");
                    self.ws
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| FeedError::SendFailed(e.to_string()))?;
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    info!(frame = ?frame, "Bybit WebSocket closed");
                    return Err(FeedError::Closed);
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(FeedError::ConnectionFailed(e.to_string())),
                Ok(None) => return Err(FeedError::Closed),
            }
        }
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| FeedError::SendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BYBIT_WS_URL;

    #[test]
    fn test_url_constant() {
        assert!(BYBIT_WS_URL.starts_with("wss://"));
        assert!(BYBIT_WS_URL.ends_with("/v5/public/option"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = BybitConnector::new("ws://127.0.0.1:1", Duration::from_secs(1));
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, FeedError::ConnectionFailed(_)));
    }
}
