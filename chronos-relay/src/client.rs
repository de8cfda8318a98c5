//! Relay client: a [`Transport`] over one WebSocket connection.
//!
//! Connecting spawns a writer task (outgoing frames) and a reader task
//! (routing delivered envelopes to the matching subscriptions). A dropped
//! subscription receiver is detected on the next matching delivery and its
//! pattern is retired at the relay.
//!
//! Connection establishment happens exactly once, in
//! [`RelayTransport::connect`]; a failed connect is surfaced to the caller
//! and never retried here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chronos_core::transport::{topic_matches, Envelope, Transport, TransportError};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::frame::RelayFrame;

enum Outgoing {
    Frame(Vec<u8>),
    Shutdown,
}

struct Route {
    pattern: String,
    sender: mpsc::UnboundedSender<Envelope>,
}

/// A client connection to a relay server.
#[derive(Clone)]
pub struct RelayTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    routes: Arc<Mutex<Vec<Route>>>,
    closed: Arc<AtomicBool>,
}

impl RelayTransport {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:7883`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("connected to relay at {url}");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        tokio::spawn(async move {
            while let Some(item) = outgoing_rx.recv().await {
                match item {
                    Outgoing::Frame(bytes) => {
                        if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Shutdown => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let routes: Arc<Mutex<Vec<Route>>> = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_routes = routes.clone();
        let reader_closed = closed.clone();
        let unsubscribe_tx = outgoing_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(RelayFrame::Deliver { topic, payload }) => {
                                route_delivery(
                                    &reader_routes,
                                    &unsubscribe_tx,
                                    topic,
                                    payload,
                                );
                            }
                            Ok(other) => {
                                log::debug!("unexpected frame from relay: {other:?}");
                            }
                            Err(e) => {
                                log::warn!("undecodable frame from relay: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            log::info!("relay connection lost");
        });

        Ok(Self {
            outgoing: outgoing_tx,
            routes,
            closed,
        })
    }

    fn send_frame(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        let bytes = frame
            .encode()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.outgoing
            .send(Outgoing::Frame(bytes))
            .map_err(|_| TransportError::Closed)
    }
}

/// Fan one delivered envelope out to matching routes; retire routes whose
/// receiver is gone, unsubscribing patterns nobody wants anymore.
fn route_delivery(
    routes: &Mutex<Vec<Route>>,
    unsubscribe_tx: &mpsc::UnboundedSender<Outgoing>,
    topic: String,
    payload: Vec<u8>,
) {
    let mut dead_patterns: Vec<String> = Vec::new();
    {
        let mut routes = routes.lock();
        routes.retain(|route| {
            if !topic_matches(&route.pattern, &topic) {
                return true;
            }
            let envelope = Envelope {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            if route.sender.send(envelope).is_ok() {
                true
            } else {
                dead_patterns.push(route.pattern.clone());
                false
            }
        });
        dead_patterns.retain(|dead| routes.iter().all(|route| route.pattern != *dead));
    }
    for pattern in dead_patterns {
        if let Ok(bytes) = (RelayFrame::Unsubscribe { pattern }).encode() {
            let _ = unsubscribe_tx.send(Outgoing::Frame(bytes));
        }
    }
}

impl Transport for RelayTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.send_frame(&RelayFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().push(Route {
            pattern: pattern.to_string(),
            sender: tx,
        });
        self.send_frame(&RelayFrame::Subscribe {
            pattern: pattern.to_string(),
        })?;
        Ok(rx)
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outgoing.send(Outgoing::Shutdown);
    }
}
