//! Connection Lifecycle Manager
//!
//! Verwaltet eine `PeerSession` pro Remote-Teilnehmer. Sessions sind
//! voneinander isoliert: jede läuft in ihrem eigenen Task, ein Fehler in
//! einer Session beendet nur diese.

use super::error::ConnectionError;
use super::events::ConnectionEvent;
use super::session::{
    CandidateDisposition, DataChannelSession, PeerSessionInfo, SessionCommand, SessionEntry,
    SessionParams, SessionRegistry, SessionWorker,
};
use super::transport::{IceCandidate, SessionDescription, TransportFactory};
use crate::audio::AudioSource;
use crate::config::{ConnectionConfig, DataChannelConfig, EngineConfig};
use crate::datachannel::DataChannelMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    connect_timeout: Duration,
    sessions: SessionRegistry,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.connection.event_capacity);

        Self {
            factory,
            config: config.connection.clone(),
            connect_timeout: config.connect_timeout(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Abonniert alle Connection Events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Legt eine neue Session an und startet deren Connect-Timeout
    pub async fn create_session(&self, peer_id: &str) -> Result<PeerSessionInfo, ConnectionError> {
        if self.sessions.lock().contains_key(peer_id) {
            return Err(ConnectionError::DuplicateSession(peer_id.to_string()));
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = self
            .factory
            .create(peer_id, transport_tx)
            .await
            .map_err(|e| ConnectionError::Transport {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            })?;

        let session_id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue_size);
        let ping_interval = match self.config.ping_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let worker = SessionWorker::new(SessionParams {
            peer_id: peer_id.to_string(),
            session_id,
            transport: transport.clone(),
            commands: command_rx,
            transport_events: transport_rx,
            event_tx: self.event_tx.clone(),
            registry: self.sessions.clone(),
            connect_timeout: self.connect_timeout,
            ping_interval,
        });
        let info = worker.info();

        let inserted = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(peer_id) {
                false
            } else {
                // Spawn unter dem Lock: der Worker kann sich erst austragen,
                // nachdem er eingetragen wurde
                let task = tokio::spawn(worker.run());
                sessions.insert(
                    peer_id.to_string(),
                    SessionEntry {
                        session_id,
                        commands: command_tx,
                        task,
                    },
                );
                true
            }
        };

        if !inserted {
            tracing::warn!(peer_id, "Concurrent session creation, discarding transport");
            if let Err(e) = transport.close().await {
                tracing::debug!(peer_id, "Failed to close discarded transport: {}", e);
            }
            return Err(ConnectionError::DuplicateSession(peer_id.to_string()));
        }

        tracing::info!(peer_id, %session_id, "Session created");
        let _ = self.event_tx.send(ConnectionEvent::SessionCreated {
            peer_id: peer_id.to_string(),
        });

        Ok(info)
    }

    pub async fn create_offer(&self, peer_id: &str) -> Result<SessionDescription, ConnectionError> {
        self.request(peer_id, SessionCommand::CreateOffer).await
    }

    pub async fn create_answer(&self, peer_id: &str) -> Result<SessionDescription, ConnectionError> {
        self.request(peer_id, SessionCommand::CreateAnswer).await
    }

    /// Setzt Offer oder Answer des Peers und leert danach die Candidate Queue
    pub async fn apply_remote_description(
        &self,
        peer_id: &str,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.request(peer_id, |reply| {
            SessionCommand::ApplyRemoteDescription(desc, reply)
        })
        .await
    }

    /// Wendet einen Candidate an oder puffert ihn bis zur Remote Description
    pub async fn add_remote_candidate(
        &self,
        peer_id: &str,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, ConnectionError> {
        self.request(peer_id, |reply| {
            SessionCommand::AddRemoteCandidate(candidate, reply)
        })
        .await
    }

    pub async fn open_data_channel(
        &self,
        peer_id: &str,
        config: Option<DataChannelConfig>,
    ) -> Result<DataChannelSession, ConnectionError> {
        let config = config.unwrap_or_else(|| self.config.data_channel.clone());
        self.request(peer_id, |reply| SessionCommand::OpenDataChannel(config, reply))
            .await
    }

    pub async fn send_data(
        &self,
        peer_id: &str,
        message: DataChannelMessage,
    ) -> Result<(), ConnectionError> {
        self.request(peer_id, |reply| SessionCommand::SendData(message, reply))
            .await
    }

    /// Sendet eine Nachricht an alle Peers mit offenem Data Channel
    ///
    /// Gibt die Anzahl erfolgreicher Zustellungen zurück.
    pub async fn broadcast_data(&self, message: &DataChannelMessage) -> usize {
        let mut delivered = 0;
        for peer_id in self.peer_ids() {
            match self.send_data(&peer_id, message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(peer_id = %peer_id, "Broadcast skipped: {}", e),
            }
        }
        delivered
    }

    /// Misst die RTT; das Ergebnis kommt als `LatencyMeasured` Event
    pub async fn ping(&self, peer_id: &str) -> Result<(), ConnectionError> {
        self.request(peer_id, SessionCommand::Ping).await
    }

    /// Hängt die Session an die Fan-out Quelle für ausgehendes Audio
    pub async fn attach_audio(
        &self,
        peer_id: &str,
        source: &AudioSource,
    ) -> Result<(), ConnectionError> {
        let receiver = source.subscribe();
        self.request(peer_id, |reply| SessionCommand::AttachAudio(receiver, reply))
            .await
    }

    pub async fn detach_audio(&self, peer_id: &str) -> Result<(), ConnectionError> {
        self.request(peer_id, SessionCommand::DetachAudio).await
    }

    pub async fn session_info(&self, peer_id: &str) -> Result<PeerSessionInfo, ConnectionError> {
        let commands = self.commands_for(peer_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Info(reply_tx))
            .await
            .map_err(|_| ConnectionError::SessionNotFound(peer_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| ConnectionError::SessionNotFound(peer_id.to_string()))
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.lock().contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Schließt eine Session; ein zweiter Aufruf ist ein No-op
    pub async fn close_session(&self, peer_id: &str) -> Result<(), ConnectionError> {
        let entry = self.sessions.lock().remove(peer_id);
        let Some(entry) = entry else {
            tracing::debug!(peer_id, "close_session: no session");
            return Ok(());
        };

        shutdown_entry(peer_id, entry).await;
        Ok(())
    }

    /// Schließt alle Sessions
    pub async fn close_all(&self) {
        let entries: Vec<(String, SessionEntry)> = self.sessions.lock().drain().collect();
        if entries.is_empty() {
            return;
        }

        tracing::info!("Closing {} sessions", entries.len());
        futures::future::join_all(
            entries
                .into_iter()
                .map(|(peer_id, entry)| async move { shutdown_entry(&peer_id, entry).await }),
        )
        .await;
    }

    fn commands_for(&self, peer_id: &str) -> Result<mpsc::Sender<SessionCommand>, ConnectionError> {
        self.sessions
            .lock()
            .get(peer_id)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| ConnectionError::SessionNotFound(peer_id.to_string()))
    }

    /// Schickt ein Command an die Session und wartet auf die Antwort
    async fn request<T, F>(&self, peer_id: &str, build: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(oneshot::Sender<Result<T, ConnectionError>>) -> SessionCommand,
    {
        let commands = self.commands_for(peer_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(build(reply_tx))
            .await
            .map_err(|_| ConnectionError::SessionNotFound(peer_id.to_string()))?;

        reply_rx
            .await
            .map_err(|_| ConnectionError::SessionClosed(peer_id.to_string()))?
    }
}

async fn shutdown_entry(peer_id: &str, entry: SessionEntry) {
    let (done_tx, done_rx) = oneshot::channel();
    if entry.commands.send(SessionCommand::Close(done_tx)).await.is_ok() {
        let _ = done_rx.await;
    }
    if let Err(e) = entry.task.await {
        tracing::warn!(peer_id, "Session task ended abnormally: {}", e);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Ohne Command-Sender beenden sich die Worker mit `CloseReason::Shutdown`
        let remaining: Vec<SessionEntry> = self
            .sessions
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if !remaining.is_empty() {
            tracing::debug!("ConnectionManager dropped with {} open sessions", remaining.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::events::CloseReason;
    use crate::connection::fake::{FakeTransportFactory, FakeControl};
    use crate::connection::session::{DataChannelState, SignalingState, TimeoutState};
    use crate::connection::transport::{ConnectionState, TransportEvent, TransportStats};
    use crate::datachannel::DataMessageType;

    fn manager_with(timeout_ms: u64) -> (ConnectionManager, Arc<FakeTransportFactory>) {
        let factory = Arc::new(FakeTransportFactory::new());
        let mut config = EngineConfig {
            connection_timeout_ms: timeout_ms,
            ..Default::default()
        };
        config.connection.ping_interval_ms = 0;
        let manager = ConnectionManager::new(factory.clone(), &config);
        (manager, factory)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000{} typ host", n, n, n))
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if event.is_terminal() {
                return event;
            }
        }
    }

    async fn connect(control: &FakeControl) {
        control.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_flushed_in_order() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let control = factory.control("peer-1").unwrap();

        manager.create_offer("peer-1").await.unwrap();
        for n in 1..=3 {
            let disposition = manager
                .add_remote_candidate("peer-1", candidate(n))
                .await
                .unwrap();
            assert_eq!(disposition, CandidateDisposition::Queued { queue_len: n as usize });
        }
        assert!(control.applied_candidates().is_empty());

        manager
            .apply_remote_description("peer-1", SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();

        assert_eq!(
            control.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
        let info = manager.session_info("peer-1").await.unwrap();
        assert_eq!(info.queued_candidates, 0);
        assert_eq!(info.applied_candidates, 3);
        assert_eq!(info.signaling_state, SignalingState::Stable);
        assert!(info.has_remote_description);
    }

    #[tokio::test]
    async fn test_candidate_after_description_is_applied_directly() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        manager
            .apply_remote_description("peer-1", SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();

        let disposition = manager
            .add_remote_candidate("peer-1", candidate(7))
            .await
            .unwrap();
        assert_eq!(disposition, CandidateDisposition::Applied);
        assert_eq!(factory.control("peer-1").unwrap().applied_candidates(), vec![candidate(7)]);

        let answer = manager.create_answer("peer-1").await.unwrap();
        assert_eq!(answer.sdp_type, crate::connection::transport::SdpType::Answer);
        let info = manager.session_info("peer-1").await.unwrap();
        assert_eq!(info.signaling_state, SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_failing_candidate_does_not_abort_flush() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let control = factory.control("peer-1").unwrap();
        control.reject_candidate(&candidate(2).candidate);
        let mut events = manager.subscribe();

        manager.create_offer("peer-1").await.unwrap();
        for n in 1..=3 {
            manager.add_remote_candidate("peer-1", candidate(n)).await.unwrap();
        }
        manager
            .apply_remote_description("peer-1", SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();

        assert_eq!(control.applied_candidates(), vec![candidate(1), candidate(3)]);
        let info = manager.session_info("peer-1").await.unwrap();
        assert_eq!(info.failed_candidates, 1);
        assert_eq!(info.connection_state, ConnectionState::New);

        let mut saw_failure = false;
        let mut flushed = None;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::CandidateFailed { .. } => saw_failure = true,
                ConnectionEvent::CandidatesFlushed { applied, failed, .. } => {
                    flushed = Some((applied, failed))
                }
                _ => {}
            }
        }
        assert!(saw_failure);
        assert_eq!(flushed, Some((2, 1)));
    }

    #[tokio::test]
    async fn test_answer_in_stable_state_is_rejected_without_closing() {
        let (manager, _factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();

        let err = manager
            .apply_remote_description("peer-1", SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidState { .. }));
        assert!(manager.has_session("peer-1"));
    }

    #[tokio::test]
    async fn test_rejected_remote_description_fails_session() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        factory.control("peer-1").unwrap().reject_descriptions(true);
        let mut events = manager.subscribe();

        let err = manager
            .apply_remote_description("peer-1", SessionDescription::offer("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::SignalingApply { .. }));

        match next_terminal(&mut events).await {
            ConnectionEvent::Failed { peer_id, error } => {
                assert_eq!(peer_id, "peer-1");
                assert!(matches!(error, ConnectionError::SignalingApply { .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(factory.control("peer-1").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected() {
        let (manager, _factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let err = manager.create_session("peer-1").await.unwrap_err();
        assert_eq!(err, ConnectionError::DuplicateSession("peer-1".to_string()));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let mut events = manager.subscribe();

        manager.close_session("peer-1").await.unwrap();
        manager.close_session("peer-1").await.unwrap();

        match next_terminal(&mut events).await {
            ConnectionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Requested),
            other => panic!("unexpected event {:?}", other),
        }
        // genau ein terminales Event
        while let Ok(event) = events.try_recv() {
            assert!(!event.is_terminal());
        }
        assert!(factory.control("peer-1").unwrap().is_closed());
        assert!(!manager.has_session("peer-1"));
        assert!(matches!(
            manager.create_offer("peer-1").await,
            Err(ConnectionError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_session() {
        let (manager, factory) = manager_with(50);
        manager.create_session("peer-1").await.unwrap();
        let mut events = manager.subscribe();

        let event = tokio::time::timeout(Duration::from_secs(2), next_terminal(&mut events))
            .await
            .unwrap();
        match event {
            ConnectionEvent::Failed { error, .. } => {
                assert_eq!(
                    error,
                    ConnectionError::ConnectTimeout {
                        peer_id: "peer-1".to_string(),
                        timeout_ms: 50
                    }
                );
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(factory.control("peer-1").unwrap().is_closed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manager.has_session("peer-1"));
    }

    #[tokio::test]
    async fn test_connected_session_cancels_timeout() {
        let (manager, factory) = manager_with(80);
        manager.create_session("peer-1").await.unwrap();
        connect(&factory.control("peer-1").unwrap()).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let info = manager.session_info("peer-1").await.unwrap();
        assert_eq!(info.connection_state, ConnectionState::Connected);
        assert_eq!(info.connect_timeout, TimeoutState::Cancelled);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-a").await.unwrap();
        manager.create_session("peer-b").await.unwrap();
        let mut events = manager.subscribe();

        factory
            .control("peer-a")
            .unwrap()
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));

        match next_terminal(&mut events).await {
            ConnectionEvent::Failed { peer_id, error } => {
                assert_eq!(peer_id, "peer-a");
                assert!(error.is_retryable());
            }
            other => panic!("unexpected event {:?}", other),
        }

        let info = manager.session_info("peer-b").await.unwrap();
        assert_eq!(info.connection_state, ConnectionState::New);
        assert!(!factory.control("peer-b").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_disconnected_is_recoverable() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let control = factory.control("peer-1").unwrap();
        connect(&control).await;
        control.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        connect(&control).await;

        let info = manager.session_info("peer-1").await.unwrap();
        assert_eq!(info.connection_state, ConnectionState::Connected);
        assert!(!control.is_closed());
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_pong_measured() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let control = factory.control("peer-1").unwrap();
        let mut events = manager.subscribe();

        manager.open_data_channel("peer-1", None).await.unwrap();
        connect(&control).await;

        let ping = DataChannelMessage::ping(1_000);
        control.emit(TransportEvent::DataChannelMessage {
            label: "control".to_string(),
            data: ping.to_json().unwrap().into_bytes(),
        });
        let pong = DataChannelMessage::pong(chrono::Utc::now().timestamp_millis() - 25, 0);
        control.emit(TransportEvent::DataChannelMessage {
            label: "control".to_string(),
            data: pong.to_json().unwrap().into_bytes(),
        });

        let rtt = loop {
            if let ConnectionEvent::LatencyMeasured { rtt_ms, .. } = events.recv().await.unwrap() {
                break rtt_ms;
            }
        };
        assert!(rtt >= 25.0);

        let sent = control.sent_data();
        let reply = DataChannelMessage::from_slice(sent[0].1.as_bytes()).unwrap();
        assert_eq!(reply.message_type, DataMessageType::Pong);
        assert_eq!(reply.original_timestamp(), Some(1_000));
    }

    #[tokio::test]
    async fn test_send_data_requires_open_channel() {
        let (manager, _factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();

        let err = manager
            .send_data("peer-1", DataChannelMessage::control(serde_json::json!({}), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::DataChannel { .. }));

        let channel = manager.open_data_channel("peer-1", None).await.unwrap();
        assert_eq!(channel.ready_state, DataChannelState::Connecting);
        let info = manager.session_info("peer-1").await.unwrap();
        assert_eq!(
            info.data_channel.map(|dc| dc.ready_state),
            Some(DataChannelState::Open)
        );
    }

    #[tokio::test]
    async fn test_audio_is_forwarded_once_connected() {
        let (manager, factory) = manager_with(30_000);
        manager.create_session("peer-1").await.unwrap();
        let control = factory.control("peer-1").unwrap();
        let source = AudioSource::new("mic", 16);

        manager.attach_audio("peer-1", &source).await.unwrap();
        connect(&control).await;
        // Info als Barriere: alle vorherigen Transport Events sind verarbeitet
        manager.session_info("peer-1").await.unwrap();

        source.publish(crate::audio::AudioPacket::new("mic", 1, vec![0u8; 16]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = manager.session_info("peer-1").await.unwrap();
        assert!(info.audio_attached);
        assert_eq!(info.audio_packets_sent, 1);
        assert_eq!(control.audio_packets(), 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_gone_when_event_arrives() {
        let (manager, factory) = manager_with(30_000);
        let mut events = manager.subscribe();
        manager.create_session("peer-1").await.unwrap();
        factory
            .control("peer-1")
            .unwrap()
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));

        let event = tokio::time::timeout(Duration::from_secs(2), next_terminal(&mut events))
            .await
            .unwrap();
        assert!(matches!(event, ConnectionEvent::Failed { .. }));
        // ohne Wartezeit neu anlegbar
        assert!(!manager.has_session("peer-1"));
        manager.create_session("peer-1").await.unwrap();
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_transport_stats_are_forwarded() {
        let (manager, factory) = manager_with(30_000);
        let mut events = manager.subscribe();
        manager.create_session("peer-1").await.unwrap();
        let stats = TransportStats {
            packets_received: 480,
            packets_lost: 20,
            available_bitrate_kbps: Some(300.0),
        };
        factory
            .control("peer-1")
            .unwrap()
            .emit(TransportEvent::NetworkStats(stats));

        let forwarded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ConnectionEvent::NetworkStats { peer_id, stats } = events.recv().await.unwrap() {
                    return (peer_id, stats);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(forwarded, ("peer-1".to_string(), stats));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_close_all() {
        let (manager, factory) = manager_with(30_000);
        for peer in ["a", "b", "c"] {
            manager.create_session(peer).await.unwrap();
        }
        manager.close_all().await;

        assert_eq!(manager.session_count(), 0);
        for peer in ["a", "b", "c"] {
            assert!(factory.control(peer).unwrap().is_closed());
        }
    }
}
