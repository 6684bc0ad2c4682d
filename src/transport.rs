//! Persistent text-frame connections.
//!
//! A [`Connection`] is a pair of frame queues plus a shared closed signal.
//! The WebSocket constructor pumps the queues from a single background task;
//! [`Connection::pair`] links two connections in memory.

use std::sync::{Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Cloneable sending half of a connection.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl FrameSender {
    pub fn send(&self, frame: impl Into<String>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionLost);
        }
        self.tx
            .send(frame.into())
            .map_err(|_| Error::ConnectionLost)
    }

    /// Close the underlying connection. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the connection is closed or broken.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// Receiving half of a connection. Ends when the connection ends.
#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
}

impl FrameStream {
    pub async fn next(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    sender: FrameSender,
    frames: Mutex<Option<FrameStream>>,
}

impl Connection {
    /// Open a WebSocket connection and start pumping frames.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(target: "meetbot.transport", "WebSocket connected to {}", url);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let closed = CancellationToken::new();

        let token = closed.clone();
        let peer = url.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }

                    Some(frame) = out_rx.recv() => {
                        if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                            warn!(target: "meetbot.transport", "WebSocket send error: {}", e);
                            break;
                        }
                    }

                    msg = ws_rx.next() => {
                        let msg = match msg {
                            Some(Ok(m)) => m,
                            Some(Err(e)) => {
                                warn!(target: "meetbot.transport", "WebSocket error: {}", e);
                                break;
                            }
                            None => break,
                        };

                        match msg {
                            Message::Text(text) => {
                                if in_tx.send(text.as_str().to_owned()).is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => {
                                info!(target: "meetbot.transport", "Close received from {}", peer);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }

            token.cancel();
            debug!(target: "meetbot.transport", "WebSocket disconnected: {}", peer);
        });

        Ok(Self::from_parts(out_tx, in_rx, closed))
    }

    /// Build a connection over caller-provided frame queues.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self::from_parts(outbound, inbound, CancellationToken::new())
    }

    /// Two connections linked back to back, sharing one closed signal.
    pub fn pair() -> (Connection, Connection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (
            Self::from_parts(a_tx, b_rx, closed.clone()),
            Self::from_parts(b_tx, a_rx, closed),
        )
    }

    fn from_parts(
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            sender: FrameSender {
                tx,
                closed: closed.clone(),
            },
            frames: Mutex::new(Some(FrameStream { rx, closed })),
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: impl Into<String>) -> Result<()> {
        self.sender.send(frame)
    }

    /// Take the inbound frame stream. Only the first call returns it.
    pub fn frames(&self) -> Option<FrameStream> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_frames_in_order() {
        let (a, b) = Connection::pair();
        let mut frames = b.frames().unwrap();

        a.send("one").unwrap();
        a.send("two").unwrap();

        assert_eq!(frames.next().await.as_deref(), Some("one"));
        assert_eq!(frames.next().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn frames_can_only_be_taken_once() {
        let (a, _b) = Connection::pair();
        assert!(a.frames().is_some());
        assert!(a.frames().is_none());
    }

    #[tokio::test]
    async fn close_ends_stream_and_fails_send() {
        let (a, b) = Connection::pair();
        let mut frames = b.frames().unwrap();

        a.close();
        a.close();

        assert!(frames.next().await.is_none());
        assert!(matches!(a.send("late"), Err(Error::ConnectionLost)));
        assert!(matches!(b.send("late"), Err(Error::ConnectionLost)));
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream() {
        let (a, b) = Connection::pair();
        let mut frames = b.frames().unwrap();

        drop(a);

        assert!(frames.next().await.is_none());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let (a, _b) = Connection::pair();
        let sender = a.sender();
        let waiter = tokio::spawn(async move { sender.closed().await });

        a.close();

        waiter.await.unwrap();
    }
}
