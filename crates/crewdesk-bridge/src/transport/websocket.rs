use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{Link, LinkControl, Transport};
use crate::error::{BridgeError, Result};

/// Attaches to a backend already serving a WebSocket endpoint. Each text
/// message is one frame.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn open(&self) -> Result<Link> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                BridgeError::Transport(format!("failed to connect to {}: {}", self.url, e))
            })?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!(url = %self.url, "attached to backend websocket");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        {
            let alive = alive.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = outbound_rx.recv() => {
                            let Some(frame) = frame else { break };
                            if write.send(Message::Text(frame)).await.is_err() {
                                alive.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
                let _ = write.send(Message::Close(None)).await;
            });
        }

        {
            let alive = alive.clone();
            let cancel = cancel.clone();
            let url = self.url.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = read.next() => msg,
                    };
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(t) => t,
                            Err(_) => continue,
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::warn!(url = %url, "backend websocket read failed: {}", e);
                            break;
                        }
                    };
                    if inbound_tx.send(text).is_err() {
                        break;
                    }
                }
                alive.store(false, Ordering::SeqCst);
                tracing::debug!(url = %url, "backend websocket closed");
            });
        }

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            control: Arc::new(SocketControl { alive, cancel }),
        })
    }
}

struct SocketControl {
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[async_trait]
impl LinkControl for SocketControl {
    async fn probe(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ConnectionClosed(
                "websocket was shut down".to_string(),
            ));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionLost(
                "websocket closed by backend".to_string(),
            ));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchanges_text_frames_with_a_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let reply = text.replace("ping", "pong");
                    ws.send(Message::Text(reply)).await.unwrap();
                    break;
                }
            }
            let _ = ws.close(None).await;
        });

        let transport = WebSocketTransport::new(format!("ws://{addr}"));
        let mut link = transport.open().await.unwrap();
        link.outbound.send(r#"{"kind":"ping"}"#.to_string()).unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some(r#"{"kind":"pong"}"#));

        let closed = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert_eq!(link.control.probe().await.unwrap_err().kind(), "connection_lost");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WebSocketTransport::new(format!("ws://{addr}"))
            .open()
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "transport");
    }
}
