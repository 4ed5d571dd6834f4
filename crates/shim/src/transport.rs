// Network transport to the daemon, behind a trait so the connection actor can
// be driven by an in-memory fake in tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("not connected")]
    NotConnected,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A text-frame connection to the daemon.
///
/// `recv` must be cancel safe: the connection actor polls it inside
/// `tokio::select!`.
#[async_trait]
pub trait DaemonTransport: Send {
    /// Open a fresh connection, replacing any previous one.
    async fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next text frame. Returns `None` when the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` client.
#[derive(Default)]
pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DaemonTransport for WsTransport {
    async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        self.close().await;
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|error| TransportError::Connect { url: url.to_string(), message: error.to_string() })?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                // tungstenite answers protocol pings itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    debug!("ignoring binary frame from daemon");
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "daemon closed the connection");
                    self.stream = None;
                    return Ok(None);
                }
                Some(Err(error)) => {
                    self.stream = None;
                    return Err(error.into());
                }
                None => {
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
