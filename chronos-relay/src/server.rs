//! WebSocket relay server: topic fan-out for rooms without an external
//! broker.
//!
//! ```text
//! Client A ──┐                      ┌── patterns A ──▶ Client A
//!            ├──▶ shared feed ──────┤
//! Client B ──┘    (broadcast)       └── patterns B ──▶ Client B
//! ```
//!
//! Every connection feeds published envelopes into one broadcast channel
//! and filters the channel against its own subscription patterns on the way
//! back out. Per-publisher delivery order is preserved by the single feed.
//! The relay keeps nothing: no retained messages, no authentication, no
//! persistence.

use std::net::SocketAddr;
use std::sync::Arc;

use chronos_core::transport::{topic_matches, Envelope};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::frame::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Feed capacity: undelivered envelopes buffered per connection.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7883".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub published_frames: u64,
    pub delivered_frames: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    feed: broadcast::Sender<Envelope>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let (feed, _) = broadcast::channel(config.channel_capacity);
        Self {
            config,
            feed,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let feed = self.feed.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, feed, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Serve one client connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        feed: broadcast::Sender<Envelope>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("relay connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Patterns this connection subscribed, duplicates allowed: a client
        // may hold several subscriptions over the same pattern and retire
        // them one at a time.
        let mut patterns: Vec<String> = Vec::new();
        let mut feed_rx = feed.subscribe();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match RelayFrame::decode(&bytes) {
                                Ok(RelayFrame::Subscribe { pattern }) => {
                                    log::debug!("{addr} subscribed to {pattern}");
                                    patterns.push(pattern);
                                }
                                Ok(RelayFrame::Unsubscribe { pattern }) => {
                                    if let Some(index) =
                                        patterns.iter().position(|p| *p == pattern)
                                    {
                                        patterns.swap_remove(index);
                                    }
                                }
                                Ok(RelayFrame::Publish { topic, payload }) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.published_frames += 1;
                                    }
                                    // No subscribers is fine; fan-out is
                                    // fire-and-forget.
                                    let _ = feed.send(Envelope { topic, payload });
                                }
                                Ok(RelayFrame::Deliver { .. }) => {
                                    log::debug!("{addr} sent a deliver frame, ignoring");
                                }
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                envelope = feed_rx.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            if patterns.iter().any(|p| topic_matches(p, &envelope.topic)) {
                                let frame = RelayFrame::Deliver {
                                    topic: envelope.topic,
                                    payload: envelope.payload,
                                };
                                ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                                let mut s = stats.write().await;
                                s.delivered_frames += 1;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("connection {addr} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        let mut s = stats.write().await;
        s.active_connections -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:7883");
        assert_eq!(config.channel_capacity, 256);
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.published_frames, 0);
        assert_eq!(stats.delivered_frames, 0);
    }

    #[test]
    fn test_custom_bind_addr() {
        let server = RelayServer::new(RelayConfig {
            bind_addr: "0.0.0.0:9000".to_string(),
            ..RelayConfig::default()
        });
        assert_eq!(server.bind_addr(), "0.0.0.0:9000");
    }
}
