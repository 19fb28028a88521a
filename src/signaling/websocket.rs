//! Thin wrapper over the signaling websocket: JSON text frames in and out,
//! transport pings answered inline.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

pub struct SignalSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignalSocket {
    pub async fn connect(url: &str) -> Result<Self> {
        debug!("connecting to signaling server at {url}");
        let (stream, response) = connect_async(url)
            .await
            .with_context(|| format!("websocket connect to {url} failed"))?;
        debug!("signaling websocket open (HTTP {})", response.status());
        Ok(SignalSocket { stream })
    }

    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value).context("failed to encode envelope")?;
        trace!("-> {text}");
        self.stream
            .send(Message::Text(text))
            .await
            .context("websocket send failed")?;
        Ok(())
    }

    /// Next text frame, or `None` when the server closed the connection.
    /// Pings are answered and skipped; binary frames are ignored.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            let message = match self.stream.next().await {
                Some(m) => m.context("websocket receive failed")?,
                None => return Ok(None),
            };
            match message {
                Message::Text(text) => {
                    trace!("<- {text}");
                    return Ok(Some(text));
                }
                Message::Ping(payload) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .context("pong send failed")?;
                }
                Message::Close(frame) => {
                    debug!("signaling server closed the connection: {frame:?}");
                    return Ok(None);
                }
                other => trace!("ignoring websocket frame: {other:?}"),
            }
        }
    }
}
