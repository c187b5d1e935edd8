//! The socket seam: a small trait over the WebSocket so the lifecycle driver
//! can be exercised against scripted sockets in tests.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// One live socket. Contract: after `recv` returns an `Err`, the next call
/// returns `None`; errors are always followed by a close, like a real
/// socket's event order.
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: String) -> Result<(), SocketError>;
    async fn recv(&mut self) -> Option<Result<String, SocketError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, SocketError>;
}

/// tokio-tungstenite connector used outside tests.
pub struct WsConnector;

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, SocketError> {
        let connecting = connect_async(url.as_str());
        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| SocketError::Connect("connect timed out".to_string()))?
            .map_err(|err| SocketError::Connect(err.to_string()))?;
        Ok(Box::new(WsSocket {
            stream,
            failed: false,
        }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    failed: bool,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), SocketError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| SocketError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SocketError>> {
        if self.failed {
            return None;
        }
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(target: "skiff::socket", "dropping non-utf8 binary frame");
                    }
                },
                Ok(Message::Close(_)) => return None,
                // Transport-level keepalives; the protocol has its own.
                Ok(_) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(Err(SocketError::Receive(err.to_string())));
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
