//! Room Session
//!
//! Verbindet Signaling, Connection Manager, Quality Engine und Adaptive
//! Controller für einen Raum:
//! - Signaling-Nachrichten werden in Connection-Operationen übersetzt
//! - lokale ICE Candidates gehen per Signaling an den Peer
//! - sobald ein Peer verbunden ist, laufen Monitoring und ein Stream für ihn
//! - Quality-Reports und Empfehlungen steuern den Stream des Peers
//!
//! Peer-ID, Session-ID und Stream-ID sind im Raum identisch.

use crate::audio::{AudioPacket, AudioSource};
use crate::config::EngineConfig;
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, TransportFactory,
};
use crate::datachannel::{DataChannelMessage, DataMessageType};
use crate::quality::{
    AlertRecord, AudioLevelCollector, MetricCollector, NetworkStatsCollector, ProcessingCollector,
    QualityEngine, QualityError, QualityEvent, TranslationStatsCollector,
};
use crate::signaling::{SignalingError, SignalingMessage, SignalingSink};
use crate::streaming::{AdaptiveController, NetworkHealth, StreamingError};
use crate::translation::{
    translate_with_timeout, TranslationPayload, TranslationRequest, TranslationService,
    TranslationServiceError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kapazität der Fan-out Quelle pro Peer
const PEER_AUDIO_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 128;
const TRANSLATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Neue Offers nach einem wiederholbaren Fehler, bis der Peer wieder verbunden ist
const MAX_OFFER_RETRIES: u32 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RoomError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Quality(#[from] QualityError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error(transparent)]
    Translation(#[from] TranslationServiceError),

    #[error("No translation service configured")]
    NoTranslationService,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

// ============================================================================
// ROOM EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum RoomEvent {
    PeerConnected { peer_id: String },
    /// Peer ist weg (verlassen, fehlgeschlagen oder geschlossen)
    PeerLeft { peer_id: String, reason: String },
    Alert(AlertRecord),
    Translation {
        peer_id: String,
        payload: TranslationPayload,
    },
    Control {
        peer_id: String,
        data: serde_json::Value,
    },
}

// ============================================================================
// ROOM SESSION
// ============================================================================

/// Collectors und Audio-Ausgang eines verbundenen Peers
struct PeerMedia {
    network: NetworkStatsCollector,
    output: Arc<AudioSource>,
}

struct RoomInner {
    room_id: String,
    local_peer_id: String,
    connections: ConnectionManager,
    quality: QualityEngine,
    streaming: AdaptiveController,
    signaling: Arc<dyn SignalingSink>,
    translation: Option<Arc<dyn TranslationService>>,
    peers: Mutex<HashMap<String, PeerMedia>>,
    /// Peers, denen wir das Offer geschickt haben, mit Anzahl der Wiederholungen
    offered: Mutex<HashMap<String, u32>>,
    audio_levels: AudioLevelCollector,
    processing: ProcessingCollector,
    translation_stats: TranslationStatsCollector,
    sequence: AtomicU64,
    event_tx: broadcast::Sender<RoomEvent>,
}

pub struct RoomSession {
    inner: Arc<RoomInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomSession {
    pub fn new(
        room_id: impl Into<String>,
        local_peer_id: impl Into<String>,
        config: &EngineConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
    ) -> Self {
        Self::build(room_id.into(), local_peer_id.into(), config, factory, signaling, None)
    }

    /// Wie `new`, mit Übersetzungsdienst
    pub fn with_translation(
        room_id: impl Into<String>,
        local_peer_id: impl Into<String>,
        config: &EngineConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
        translation: Arc<dyn TranslationService>,
    ) -> Self {
        Self::build(
            room_id.into(),
            local_peer_id.into(),
            config,
            factory,
            signaling,
            Some(translation),
        )
    }

    fn build(
        room_id: String,
        local_peer_id: String,
        config: &EngineConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
        translation: Option<Arc<dyn TranslationService>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(RoomInner {
            room_id,
            local_peer_id,
            connections: ConnectionManager::new(factory, config),
            quality: QualityEngine::new(config.quality.clone()),
            streaming: AdaptiveController::new(config.streaming.clone()),
            signaling,
            translation,
            peers: Mutex::new(HashMap::new()),
            offered: Mutex::new(HashMap::new()),
            audio_levels: AudioLevelCollector::new(),
            processing: ProcessingCollector::new(),
            translation_stats: TranslationStatsCollector::new(),
            sequence: AtomicU64::new(0),
            event_tx,
        });

        let session = Self {
            inner,
            tasks: Mutex::new(Vec::new()),
        };
        session.spawn_event_pumps();
        session
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn quality(&self) -> &QualityEngine {
        &self.inner.quality
    }

    pub fn streaming(&self) -> &AdaptiveController {
        &self.inner.streaming
    }

    /// Meldet den lokalen Peer im Raum an
    pub async fn join(&self) -> Result<(), RoomError> {
        tracing::info!(room_id = %self.inner.room_id, "Joining room as {}", self.inner.local_peer_id);
        self.inner
            .signaling
            .send(SignalingMessage::JoinRoom {
                room_id: self.inner.room_id.clone(),
                peer_id: self.inner.local_peer_id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Verarbeitet eine eingehende Signaling-Nachricht
    pub async fn handle_signaling(&self, message: SignalingMessage) -> Result<(), RoomError> {
        self.inner.handle_signaling(message).await
    }

    /// Liest die eingehende Signaling-Queue in einem eigenen Task
    pub fn attach_signaling(&self, mut inbound: mpsc::Receiver<SignalingMessage>) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let peer_id = message.peer_id().to_string();
                let kind = message.kind();
                if let Err(e) = inner.handle_signaling(message).await {
                    tracing::warn!(peer_id = %peer_id, "Failed to handle {}: {}", kind, e);
                }
            }
            tracing::info!("Signaling channel closed");
        });
        self.tasks.lock().push(task);
    }

    /// Nimmt einen lokal aufgenommenen PCM-Frame entgegen
    ///
    /// Der Frame fließt in die Pegel-Messung und als Paket in den Stream
    /// jedes verbundenen Peers.
    pub async fn send_audio_frame(&self, samples: &[f32]) -> usize {
        self.inner.audio_levels.record_frame(samples);
        self.inner.processing.record_frames(1);

        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let peers: Vec<String> = self.inner.peers.lock().keys().cloned().collect();
        let mut delivered = 0;
        for peer_id in peers {
            let packet = AudioPacket::from_pcm(peer_id.as_str(), sequence, samples);
            match self.inner.streaming.push(&peer_id, packet).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(peer_id = %peer_id, "Audio frame skipped: {}", e),
            }
        }
        delivered
    }

    /// Übersetzt lokal und verteilt das Ergebnis über alle Data Channels
    ///
    /// Fehler des Dienstes gehen mit dem unübersetzten bzw. teilweisen
    /// Ergebnis an den Aufrufer zurück.
    pub async fn translate_and_send(
        &self,
        request: TranslationRequest,
    ) -> Result<TranslationPayload, RoomError> {
        let service = self
            .inner
            .translation
            .as_ref()
            .ok_or(RoomError::NoTranslationService)?;

        match translate_with_timeout(service.as_ref(), &request, TRANSLATION_TIMEOUT).await {
            Ok(response) => {
                self.inner
                    .translation_stats
                    .record_success(response.confidence);
                let mut payload = TranslationPayload::from_result(&request, &response);
                payload.speaker_id = Some(self.inner.local_peer_id.clone());

                let message = DataChannelMessage::translation(&payload, now_ms())?;
                let delivered = self.inner.connections.broadcast_data(&message).await;
                tracing::debug!("Translation delivered to {} peers", delivered);
                Ok(payload)
            }
            Err(e) => {
                match e.partial() {
                    Some(partial) => self.inner.translation_stats.record_partial(partial.confidence),
                    None => self.inner.translation_stats.record_failure(),
                }
                tracing::warn!("Translation failed: {}", e);
                Err(RoomError::Translation(e))
            }
        }
    }

    /// Verlässt den Raum und stoppt alle Worker
    ///
    /// Kehrt erst zurück, wenn alle Sessions, Monitore und Streams beendet sind.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        if let Err(e) = self
            .inner
            .signaling
            .send(SignalingMessage::LeaveRoom {
                room_id: self.inner.room_id.clone(),
                peer_id: self.inner.local_peer_id.clone(),
            })
            .await
        {
            tracing::debug!("Leave message not sent: {}", e);
        }

        self.inner.quality.shutdown().await;
        self.inner.streaming.shutdown().await;
        self.inner.connections.close_all().await;
        self.inner.peers.lock().clear();
        tracing::info!(room_id = %self.inner.room_id, "Room session shut down");
    }

    fn spawn_event_pumps(&self) {
        let mut tasks = self.tasks.lock();

        let inner = Arc::clone(&self.inner);
        let mut connection_rx = self.inner.connections.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match connection_rx.recv().await {
                    Ok(event) => inner.handle_connection_event(event).await,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Connection event pump lagged by {} events", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let inner = Arc::clone(&self.inner);
        let mut quality_rx = self.inner.quality.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match quality_rx.recv().await {
                    Ok(event) => inner.handle_quality_event(event).await,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Quality event pump lagged by {} events", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl RoomInner {
    async fn handle_signaling(&self, message: SignalingMessage) -> Result<(), RoomError> {
        match message {
            SignalingMessage::ParticipantJoined { peer_id } => {
                if peer_id == self.local_peer_id {
                    return Ok(());
                }
                tracing::info!(peer_id = %peer_id, "Participant joined, sending offer");
                self.offered.lock().insert(peer_id.clone(), 0);
                self.send_offer(&peer_id).await?;
            }
            SignalingMessage::Offer { offer, peer_id } => {
                if !self.connections.has_session(&peer_id) {
                    self.connections.create_session(&peer_id).await?;
                }
                self.connections
                    .apply_remote_description(&peer_id, offer)
                    .await?;
                let answer = self.connections.create_answer(&peer_id).await?;
                self.signaling
                    .send(SignalingMessage::answer(peer_id, answer))
                    .await?;
            }
            SignalingMessage::Answer { answer, peer_id } => {
                self.connections
                    .apply_remote_description(&peer_id, answer)
                    .await?;
            }
            SignalingMessage::IceCandidate { candidate, peer_id } => {
                self.connections
                    .add_remote_candidate(&peer_id, candidate)
                    .await?;
            }
            SignalingMessage::ParticipantLeft { peer_id } => {
                tracing::info!(peer_id = %peer_id, "Participant left");
                self.offered.lock().remove(&peer_id);
                self.connections.close_session(&peer_id).await?;
                self.teardown_peer(&peer_id, "left").await;
            }
            other @ (SignalingMessage::JoinRoom { .. } | SignalingMessage::LeaveRoom { .. }) => {
                tracing::debug!("Ignoring client-bound {} message", other.kind());
            }
        }
        Ok(())
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate { peer_id, candidate } => {
                if let Err(e) = self
                    .signaling
                    .send(SignalingMessage::ice_candidate(peer_id.clone(), candidate))
                    .await
                {
                    tracing::warn!(peer_id = %peer_id, "Failed to forward local candidate: {}", e);
                }
            }
            ConnectionEvent::StateChanged { peer_id, state } => {
                if state == ConnectionState::Connected {
                    self.on_peer_connected(&peer_id).await;
                    if let Some(retries) = self.offered.lock().get_mut(&peer_id) {
                        *retries = 0;
                    }
                }
                if let Some(media) = self.peers.lock().get(&peer_id) {
                    media.network.record_connection_state(state);
                }
            }
            ConnectionEvent::NetworkStats { peer_id, stats } => {
                if let Some(media) = self.peers.lock().get(&peer_id) {
                    media
                        .network
                        .record_packets(stats.packets_received, stats.packets_lost);
                    if let Some(kbps) = stats.available_bitrate_kbps {
                        media.network.record_bandwidth(kbps);
                    }
                }
            }
            ConnectionEvent::LatencyMeasured { peer_id, rtt_ms } => {
                if let Some(media) = self.peers.lock().get(&peer_id) {
                    media.network.record_rtt(rtt_ms);
                }
            }
            ConnectionEvent::DataMessage { peer_id, message } => match message.message_type {
                DataMessageType::Translation => match message.as_translation() {
                    Some(payload) => {
                        let _ = self.event_tx.send(RoomEvent::Translation { peer_id, payload });
                    }
                    None => tracing::warn!(peer_id = %peer_id, "Malformed translation payload"),
                },
                DataMessageType::Control => {
                    let _ = self.event_tx.send(RoomEvent::Control {
                        peer_id,
                        data: message.data,
                    });
                }
                _ => {}
            },
            ConnectionEvent::Failed { peer_id, error } => {
                tracing::error!(peer_id = %peer_id, "Peer session failed: {}", error);
                self.teardown_peer(&peer_id, &error.to_string()).await;
                self.retry_offer(&peer_id, &error).await;
            }
            ConnectionEvent::Closed { peer_id, reason } => {
                self.teardown_peer(&peer_id, &format!("{:?}", reason)).await;
            }
            _ => {}
        }
    }

    async fn handle_quality_event(&self, event: QualityEvent) {
        match event {
            QualityEvent::Report(report) => {
                let health = NetworkHealth {
                    latency_ms: report.snapshot.network.latency,
                    packet_loss: report.snapshot.network.packet_loss,
                    quality_score: Some(report.score.overall),
                };
                if let Err(e) = self
                    .streaming
                    .update_network(&report.session_id, health)
                    .await
                {
                    tracing::trace!(session_id = %report.session_id, "No stream for report: {}", e);
                }
            }
            QualityEvent::Recommendation(rec) => {
                match self
                    .streaming
                    .apply_recommendation(&rec.session_id, rec.action)
                    .await
                {
                    Ok(true) => {
                        tracing::debug!(session_id = %rec.session_id, "Forwarded {:?} to stream", rec.action)
                    }
                    Ok(false) => {}
                    Err(e) => tracing::trace!(session_id = %rec.session_id, "Recommendation dropped: {}", e),
                }
            }
            QualityEvent::Alert(alert) => {
                let _ = self.event_tx.send(RoomEvent::Alert(alert));
            }
            QualityEvent::CollectorDegraded { .. } => {}
        }
    }

    async fn send_offer(&self, peer_id: &str) -> Result<(), RoomError> {
        self.connections.create_session(peer_id).await?;
        self.connections.open_data_channel(peer_id, None).await?;
        let offer = self.connections.create_offer(peer_id).await?;
        self.signaling
            .send(SignalingMessage::offer(peer_id, offer))
            .await?;
        Ok(())
    }

    /// Baut nach einem wiederholbaren Fehler eine neue Session auf
    ///
    /// Nur die Seite, die ursprünglich das Offer geschickt hat, versucht es
    /// erneut; die Gegenseite beantwortet das neue Offer wie gewohnt.
    async fn retry_offer(&self, peer_id: &str, error: &ConnectionError) {
        let attempt = {
            let mut offered = self.offered.lock();
            match offered.get_mut(peer_id) {
                Some(retries) if error.is_retryable() && *retries < MAX_OFFER_RETRIES => {
                    *retries += 1;
                    *retries
                }
                Some(_) => {
                    offered.remove(peer_id);
                    return;
                }
                None => return,
            }
        };

        tracing::info!(peer_id, attempt, "Retrying connection with a new offer");
        if let Err(e) = self.send_offer(peer_id).await {
            tracing::warn!(peer_id, "Retry offer failed: {}", e);
        }
    }

    async fn on_peer_connected(&self, peer_id: &str) {
        let media = {
            let mut peers = self.peers.lock();
            if peers.contains_key(peer_id) {
                return;
            }
            let media = PeerMedia {
                network: NetworkStatsCollector::new(),
                output: Arc::new(AudioSource::new(peer_id, PEER_AUDIO_CAPACITY)),
            };
            let handles = (media.network.clone(), Arc::clone(&media.output));
            peers.insert(peer_id.to_string(), media);
            handles
        };
        let (network, output) = media;

        if let Err(e) = self.streaming.add_stream(peer_id, Arc::clone(&output)) {
            tracing::warn!(peer_id, "Failed to start stream: {}", e);
        }
        if let Err(e) = self.connections.attach_audio(peer_id, &output).await {
            tracing::warn!(peer_id, "Failed to attach audio: {}", e);
        }

        let collectors: Vec<Arc<dyn MetricCollector>> = vec![
            Arc::new(network),
            Arc::new(self.audio_levels.clone()),
            Arc::new(self.processing.clone()),
            Arc::new(self.translation_stats.clone()),
        ];
        if let Err(e) = self.quality.start_monitoring(peer_id, collectors) {
            tracing::warn!(peer_id, "Failed to start monitoring: {}", e);
        }

        tracing::info!(peer_id, "Peer connected");
        let _ = self.event_tx.send(RoomEvent::PeerConnected {
            peer_id: peer_id.to_string(),
        });
    }

    async fn teardown_peer(&self, peer_id: &str, reason: &str) {
        if self.peers.lock().remove(peer_id).is_none() {
            return;
        }
        if let Err(e) = self.quality.stop_monitoring(peer_id).await {
            tracing::debug!(peer_id, "Monitoring already stopped: {}", e);
        }
        if let Err(e) = self.streaming.remove_stream(peer_id).await {
            tracing::debug!(peer_id, "Stream already removed: {}", e);
        }
        tracing::info!(peer_id, "Peer removed: {}", reason);
        let _ = self.event_tx.send(RoomEvent::PeerLeft {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeTransportFactory;
    use crate::connection::{
        IceCandidate, SdpType, SessionDescription, TransportEvent, TransportStats,
    };
    use crate::streaming::StreamEvent;
    use crate::translation::TranslationResponse;
    use async_trait::async_trait;
    use tokio::time::timeout;

    struct Harness {
        room: RoomSession,
        factory: Arc<FakeTransportFactory>,
        outbound: mpsc::Receiver<SignalingMessage>,
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.quality.monitoring_interval_ms = 20;
        config.streaming.flush_interval_ms = 20;
        config.streaming.adjust_interval_ms = 40;
        config
    }

    fn harness_with(translation: Option<Arc<dyn TranslationService>>) -> Harness {
        let factory = Arc::new(FakeTransportFactory::new());
        let (tx, outbound) = mpsc::channel(64);
        let signaling: Arc<dyn SignalingSink> = Arc::new(tx);
        let room = match translation {
            Some(service) => RoomSession::with_translation(
                "room-1",
                "me",
                &config(),
                factory.clone(),
                signaling,
                service,
            ),
            None => RoomSession::new("room-1", "me", &config(), factory.clone(), signaling),
        };
        Harness {
            room,
            factory,
            outbound,
        }
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    async fn next_outbound(rx: &mut mpsc::Receiver<SignalingMessage>) -> SignalingMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no outbound signaling message")
            .expect("signaling channel closed")
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<RoomEvent>, mut pred: F) -> RoomEvent
    where
        F: FnMut(&RoomEvent) -> bool,
    {
        loop {
            match timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Ok(event)) if pred(&event) => return event,
                Ok(Ok(_)) => continue,
                other => panic!("room event not received: {:?}", other.map(|r| r.is_ok())),
            }
        }
    }

    #[tokio::test]
    async fn test_participant_joined_sends_offer() {
        let mut h = harness();
        h.room
            .handle_signaling(SignalingMessage::ParticipantJoined {
                peer_id: "peer-1".to_string(),
            })
            .await
            .unwrap();

        match next_outbound(&mut h.outbound).await {
            SignalingMessage::Offer { peer_id, .. } => assert_eq!(peer_id, "peer-1"),
            other => panic!("expected offer, got {:?}", other),
        }
        assert!(h.room.connections().has_session("peer-1"));
        let local = h.factory.control("peer-1").unwrap().local_descriptions();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].sdp_type, SdpType::Offer);
        let info = h.room.connections().session_info("peer-1").await.unwrap();
        assert!(info.data_channel.is_some());
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_join_is_ignored() {
        let h = harness();
        h.room
            .handle_signaling(SignalingMessage::ParticipantJoined {
                peer_id: "me".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(h.room.connections().session_count(), 0);
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_offer_with_early_candidates_is_answered() {
        let mut h = harness();
        let candidates: Vec<IceCandidate> = (1..=3)
            .map(|n| IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n)))
            .collect();

        // Candidate vor dem Offer legt noch keine Session an
        assert!(h
            .room
            .handle_signaling(SignalingMessage::ice_candidate("peer-1", candidates[0].clone()))
            .await
            .is_err());

        h.room.connections().create_session("peer-1").await.unwrap();
        for candidate in &candidates {
            h.room
                .handle_signaling(SignalingMessage::ice_candidate("peer-1", candidate.clone()))
                .await
                .unwrap();
        }
        assert_eq!(
            h.room
                .connections()
                .session_info("peer-1")
                .await
                .unwrap()
                .queued_candidates,
            3
        );

        h.room
            .handle_signaling(SignalingMessage::offer(
                "peer-1",
                SessionDescription::offer("v=0 remote"),
            ))
            .await
            .unwrap();

        assert!(matches!(
            next_outbound(&mut h.outbound).await,
            SignalingMessage::Answer { .. }
        ));
        let control = h.factory.control("peer-1").unwrap();
        assert_eq!(control.applied_candidates(), candidates);
        assert_eq!(
            control.remote_descriptions(),
            vec![SessionDescription::offer("v=0 remote")]
        );
        assert_eq!(control.local_descriptions()[0].sdp_type, SdpType::Answer);
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let mut h = harness();
        h.room.connections().create_session("peer-1").await.unwrap();
        let control = h.factory.control("peer-1").unwrap();
        let candidate = IceCandidate::new("candidate:9 1 udp 1 192.168.0.9 9 typ host");
        control.emit(TransportEvent::LocalCandidate(candidate.clone()));

        match next_outbound(&mut h.outbound).await {
            SignalingMessage::IceCandidate {
                candidate: sent,
                peer_id,
            } => {
                assert_eq!(peer_id, "peer-1");
                assert_eq!(sent, candidate);
            }
            other => panic!("expected ice-candidate, got {:?}", other),
        }
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_connected_peer_gets_monitoring_and_stream() {
        let h = harness();
        let mut events = h.room.subscribe();
        h.room.connections().create_session("peer-1").await.unwrap();
        h.factory
            .control("peer-1")
            .unwrap()
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));

        wait_for(&mut events, |e| matches!(e, RoomEvent::PeerConnected { .. })).await;
        assert!(h.room.quality().is_monitoring("peer-1"));
        assert!(h.room.streaming().has_stream("peer-1"));

        assert_eq!(h.room.send_audio_frame(&[0.1; 960]).await, 1);

        h.room
            .handle_signaling(SignalingMessage::ParticipantLeft {
                peer_id: "peer-1".to_string(),
            })
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, RoomEvent::PeerLeft { .. })).await;
        assert!(!h.room.quality().is_monitoring("peer-1"));
        assert!(!h.room.streaming().has_stream("peer-1"));
        assert!(!h.room.connections().has_session("peer-1"));
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_peer_is_torn_down() {
        let h = harness();
        let mut events = h.room.subscribe();
        h.room.connections().create_session("peer-1").await.unwrap();
        let control = h.factory.control("peer-1").unwrap();
        control.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        wait_for(&mut events, |e| matches!(e, RoomEvent::PeerConnected { .. })).await;

        control.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
        wait_for(&mut events, |e| matches!(e, RoomEvent::PeerLeft { .. })).await;
        assert!(!h.room.streaming().has_stream("peer-1"));
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_stats_drive_packet_loss_and_step_down() {
        let h = harness();
        let mut events = h.room.subscribe();
        let mut reports = h.room.quality().subscribe();
        let mut stream_events = h.room.streaming().subscribe();
        h.room.connections().create_session("peer-1").await.unwrap();
        let control = h.factory.control("peer-1").unwrap();
        control.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        wait_for(&mut events, |e| matches!(e, RoomEvent::PeerConnected { .. })).await;

        // Latenz per Pong, Verlust und Bandbreite aus den Transport-Statistiken
        let now = now_ms();
        let pong = DataChannelMessage::pong(now - 40, now).to_json().unwrap();
        control.emit(TransportEvent::DataChannelMessage {
            label: "control".to_string(),
            data: pong.into_bytes(),
        });
        control.emit(TransportEvent::NetworkStats(TransportStats {
            packets_received: 900,
            packets_lost: 100,
            available_bitrate_kbps: Some(96.0),
        }));

        let report = loop {
            match timeout(Duration::from_secs(2), reports.recv()).await {
                Ok(Ok(QualityEvent::Report(report))) if report.snapshot.network.packet_loss > 0.0 => {
                    break report
                }
                Ok(Ok(_)) => continue,
                other => panic!("no report with packet loss: {:?}", other.map(|r| r.is_ok())),
            }
        };
        assert!((report.snapshot.network.packet_loss - 0.1).abs() < 1e-9);
        assert_eq!(report.snapshot.network.bandwidth, 96.0);

        // 10 % Verlust liegt über packet_loss_high, der Stream schaltet herunter
        loop {
            match timeout(Duration::from_secs(2), stream_events.recv()).await {
                Ok(Ok(StreamEvent::QualityChanged { stream_id, from, to })) if to < from => {
                    assert_eq!(stream_id, "peer-1");
                    break;
                }
                Ok(Ok(_)) => continue,
                other => panic!("no step down: {:?}", other.map(|r| r.is_ok())),
            }
        }
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_retryable_failure_sends_one_new_offer() {
        let mut h = harness();
        h.room
            .handle_signaling(SignalingMessage::ParticipantJoined {
                peer_id: "peer-1".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            next_outbound(&mut h.outbound).await,
            SignalingMessage::Offer { .. }
        ));
        let first = h.factory.control("peer-1").unwrap();

        first.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
        match next_outbound(&mut h.outbound).await {
            SignalingMessage::Offer { peer_id, .. } => assert_eq!(peer_id, "peer-1"),
            other => panic!("expected new offer, got {:?}", other),
        }
        let second = h.factory.control("peer-1").unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(second.local_descriptions().len(), 1);

        // zweiter Fehlschlag ohne Verbindung dazwischen: kein weiterer Versuch
        second.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
        assert!(timeout(Duration::from_millis(200), h.outbound.recv())
            .await
            .is_err());
        assert!(!h.room.connections().has_session("peer-1"));
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_answering_side_does_not_retry() {
        let mut h = harness();
        h.room
            .handle_signaling(SignalingMessage::offer(
                "peer-1",
                SessionDescription::offer("v=0 remote"),
            ))
            .await
            .unwrap();
        assert!(matches!(
            next_outbound(&mut h.outbound).await,
            SignalingMessage::Answer { .. }
        ));

        h.factory
            .control("peer-1")
            .unwrap()
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
        assert!(timeout(Duration::from_millis(200), h.outbound.recv())
            .await
            .is_err());
        h.room.shutdown().await;
    }

    struct PartialService;

    #[async_trait]
    impl TranslationService for PartialService {
        async fn translate(
            &self,
            request: &TranslationRequest,
        ) -> Result<TranslationResponse, TranslationServiceError> {
            if request.text == "fail" {
                return Err(TranslationServiceError::Partial {
                    reason: "cut off".to_string(),
                    request: request.clone(),
                    partial: TranslationResponse {
                        translated_text: "hal".to_string(),
                        confidence: 0.3,
                        detected_language: None,
                    },
                });
            }
            Ok(TranslationResponse {
                translated_text: "hallo".to_string(),
                confidence: 0.9,
                detected_language: Some("en".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_translation_is_broadcast_and_errors_surface() {
        let mut h = harness_with(Some(Arc::new(PartialService)));
        h.room
            .handle_signaling(SignalingMessage::ParticipantJoined {
                peer_id: "peer-1".to_string(),
            })
            .await
            .unwrap();
        next_outbound(&mut h.outbound).await;

        let payload = h
            .room
            .translate_and_send(TranslationRequest::new("hello", "en", "de"))
            .await
            .unwrap();
        assert_eq!(payload.translated_text, "hallo");
        assert_eq!(payload.speaker_id.as_deref(), Some("me"));
        let sent = h.factory.control("peer-1").unwrap().sent_data();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("hallo"));

        let err = h
            .room
            .translate_and_send(TranslationRequest::new("fail", "en", "de"))
            .await
            .unwrap_err();
        match err {
            RoomError::Translation(e) => {
                assert_eq!(e.untranslated_text(), "fail");
                assert_eq!(e.best_effort_text(), "hal");
            }
            other => panic!("unexpected error {:?}", other),
        }
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_translation_without_service() {
        let h = harness();
        assert!(matches!(
            h.room
                .translate_and_send(TranslationRequest::new("x", "en", "de"))
                .await,
            Err(RoomError::NoTranslationService)
        ));
        h.room.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let mut h = harness();
        h.room.join().await.unwrap();
        assert!(matches!(
            next_outbound(&mut h.outbound).await,
            SignalingMessage::JoinRoom { .. }
        ));
        h.room.connections().create_session("a").await.unwrap();
        h.room.connections().create_session("b").await.unwrap();

        h.room.shutdown().await;
        assert_eq!(h.room.connections().session_count(), 0);
        assert!(h.factory.control("a").unwrap().is_closed());
        assert!(matches!(
            next_outbound(&mut h.outbound).await,
            SignalingMessage::LeaveRoom { .. }
        ));
    }
}
