//! WebSocket connector speaking binary frames to a plain room relay.

use super::link::{Connector, Link, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const FRAME_BUFFER: usize = 256;

/// Connects to `{url}/{room}`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn room_url(&self, room: &str) -> String {
        format!("{}/{}", self.url, room)
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, room: &str) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let url = self.room_url(room);
        async move {
            let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;
            let (mut writer, mut reader) = stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(FRAME_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(FRAME_BUFFER);

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if writer.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                let _ = writer.close().await;
            });

            tokio::spawn(async move {
                while let Some(message) = reader.next().await {
                    match message {
                        Ok(Message::Binary(data)) => {
                            if in_tx.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                tracing::debug!(url = %url, "websocket reader finished");
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_url_joins_without_double_slash() {
        let connector = WebSocketConnector::new("ws://localhost:1234/");
        assert_eq!(connector.room_url("demo"), "ws://localhost:1234/demo");
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_error() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:9");
        let err = connector.connect("room").await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
