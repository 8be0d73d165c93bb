//! WebSocket Client für den Signaling-Server
//!
//! Hält die WebSocket-Verbindung mit einem Read- und einem Write-Task.
//! Eingehende Nachrichten landen in einer mpsc-Queue, Statusänderungen
//! gehen als `SignalingEvent` an alle Abonnenten. Reconnects sind Sache
//! des Aufrufers.

use super::messages::SignalingMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const EVENT_CAPACITY: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Malformed signaling message: {0}")]
    Malformed(String),
}

// ============================================================================
// SINK
// ============================================================================

/// Ausgehende Seite des Signaling-Kanals
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

#[async_trait]
impl SignalingSink for mpsc::Sender<SignalingMessage> {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| SignalingError::NotConnected)
    }
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    /// Nachricht konnte nicht gelesen werden und wurde verworfen
    Error(String),
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: String,
    connected: Arc<RwLock<bool>>,
    tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Verbindet mit dem Server
    ///
    /// Gibt den Client und die Queue der eingehenden Nachrichten zurück.
    pub async fn connect(
        server_url: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalingMessage>), SignalingError> {
        url::Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling server: {}", server_url);

        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SignalingMessage>(100);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let connected = Arc::new(RwLock::new(true));

        let _ = event_tx.send(SignalingEvent::Connected);

        // Read-Task
        let connected_clone = Arc::clone(&connected);
        let read_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            tracing::debug!(
                                peer_id = %message.peer_id(),
                                "Signaling message received: {}",
                                message.kind()
                            );
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring malformed signaling message: {}", e);
                            let _ = read_events.send(SignalingEvent::Error(
                                SignalingError::Malformed(e.to_string()).to_string(),
                            ));
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            *connected_clone.write() = false;
            let _ = read_events.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        let write_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            *write_connected.write() = false;
            let _ = write.close().await;
        });

        let client = Self {
            server_url: server_url.to_string(),
            connected,
            tx,
            event_tx,
        };
        Ok((client, inbound_rx))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl SignalingSink for SignalingClient {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let json = message
            .to_json()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tracing::debug!(peer_id = %message.peer_id(), "Sending signaling message: {}", message.kind());
        self.tx
            .send(json)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("connected", &*self.connected.read())
            .finish()
    }
}
