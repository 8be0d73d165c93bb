//! Peer Session - Zustandsmaschine pro Remote-Teilnehmer
//!
//! Jede Session läuft als eigener Task und besitzt ihren Transport, ihre
//! Candidate Queue und ihren Connect-Timeout. Von außen wird sie nur über
//! `SessionCommand`s angesprochen, der Transport meldet sich über
//! `TransportEvent`s.

use super::candidate_queue::CandidateQueue;
use super::error::ConnectionError;
use super::events::{CloseReason, ConnectionEvent};
use super::transport::{
    ConnectionState, IceCandidate, IceGatheringState, PeerTransport, SdpType,
    SessionDescription, TransportEvent,
};
use crate::audio::AudioPacket;
use crate::config::DataChannelConfig;
use crate::datachannel::{DataChannelMessage, DataMessageType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

// ============================================================================
// SIGNALING STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
}

impl SignalingState {
    /// Zustand nach einer lokalen Description, `None` wenn unzulässig
    pub fn after_local(self, sdp_type: SdpType) -> Option<Self> {
        use SignalingState::*;
        match (self, sdp_type) {
            (Stable, SdpType::Offer) | (HaveLocalOffer, SdpType::Offer) => Some(HaveLocalOffer),
            (HaveRemoteOffer, SdpType::Answer) | (HaveLocalPranswer, SdpType::Answer) => {
                Some(Stable)
            }
            (HaveRemoteOffer, SdpType::Pranswer) | (HaveLocalPranswer, SdpType::Pranswer) => {
                Some(HaveLocalPranswer)
            }
            _ => None,
        }
    }

    /// Zustand nach einer Remote Description, `None` wenn unzulässig
    pub fn after_remote(self, sdp_type: SdpType) -> Option<Self> {
        use SignalingState::*;
        match (self, sdp_type) {
            (Stable, SdpType::Offer) | (HaveRemoteOffer, SdpType::Offer) => Some(HaveRemoteOffer),
            (HaveLocalOffer, SdpType::Answer) | (HaveRemotePranswer, SdpType::Answer) => {
                Some(Stable)
            }
            (HaveLocalOffer, SdpType::Pranswer) | (HaveRemotePranswer, SdpType::Pranswer) => {
                Some(HaveRemotePranswer)
            }
            _ => None,
        }
    }
}

// ============================================================================
// DATA CHANNEL SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Control/Translation Kanal neben dem Media-Pfad
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelSession {
    pub label: String,
    pub ready_state: DataChannelState,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

// ============================================================================
// CONNECT TIMEOUT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Armed,
    Cancelled,
    Fired,
}

/// Einmaliger Connect-Timeout einer Session
///
/// Wird genau einmal beendet: entweder durch `cancel()` (Verbindung steht)
/// oder durch `fire()` (Deadline erreicht).
#[derive(Debug)]
pub struct ConnectTimeout {
    duration: Duration,
    deadline: Instant,
    state: TimeoutState,
}

impl ConnectTimeout {
    pub fn arm(duration: Duration) -> Self {
        Self {
            duration,
            deadline: Instant::now() + duration,
            state: TimeoutState::Armed,
        }
    }

    pub fn state(&self) -> TimeoutState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == TimeoutState::Armed
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Gibt `true` zurück wenn der Timer dadurch beendet wurde
    pub fn cancel(&mut self) -> bool {
        if self.is_armed() {
            self.state = TimeoutState::Cancelled;
            true
        } else {
            false
        }
    }

    /// Gibt `true` zurück wenn der Timer dadurch ausgelöst wurde
    pub fn fire(&mut self) -> bool {
        if self.is_armed() {
            self.state = TimeoutState::Fired;
            true
        } else {
            false
        }
    }

    /// Wartet bis zur Deadline; bleibt hängen wenn der Timer nicht mehr läuft
    pub async fn expired(&self) {
        if self.is_armed() {
            tokio::time::sleep_until(self.deadline).await;
        } else {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// SESSION INFO
// ============================================================================

/// Unveränderlicher Schnappschuss einer Session
#[derive(Debug, Clone)]
pub struct PeerSessionInfo {
    pub peer_id: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub signaling_state: SignalingState,
    pub connection_state: ConnectionState,
    pub ice_gathering_state: IceGatheringState,
    pub has_remote_description: bool,
    pub queued_candidates: usize,
    pub applied_candidates: usize,
    pub failed_candidates: usize,
    pub connect_timeout: TimeoutState,
    pub data_channel: Option<DataChannelSession>,
    pub inbound_track: Option<String>,
    pub audio_attached: bool,
    pub audio_packets_sent: u64,
}

/// Ergebnis von `add_remote_candidate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Noch keine Remote Description, Länge der Queue danach
    Queued { queue_len: usize },
    Applied,
}

// ============================================================================
// COMMANDS
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

pub(crate) enum SessionCommand {
    CreateOffer(Reply<SessionDescription>),
    CreateAnswer(Reply<SessionDescription>),
    ApplyRemoteDescription(SessionDescription, Reply<()>),
    AddRemoteCandidate(IceCandidate, Reply<CandidateDisposition>),
    OpenDataChannel(DataChannelConfig, Reply<DataChannelSession>),
    SendData(DataChannelMessage, Reply<()>),
    Ping(Reply<()>),
    AttachAudio(broadcast::Receiver<AudioPacket>, Reply<()>),
    DetachAudio(Reply<()>),
    Info(oneshot::Sender<PeerSessionInfo>),
    Close(oneshot::Sender<()>),
}

/// Eintrag im Session-Verzeichnis des Managers
pub(crate) struct SessionEntry {
    pub session_id: Uuid,
    pub commands: mpsc::Sender<SessionCommand>,
    pub task: JoinHandle<()>,
}

pub(crate) type SessionRegistry = Arc<Mutex<HashMap<String, SessionEntry>>>;

// ============================================================================
// SESSION WORKER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Exit,
}

enum Termination {
    Closed(CloseReason),
    Failed(ConnectionError),
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) struct SessionParams {
    pub peer_id: String,
    pub session_id: Uuid,
    pub transport: Arc<dyn PeerTransport>,
    pub commands: mpsc::Receiver<SessionCommand>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub event_tx: broadcast::Sender<ConnectionEvent>,
    pub registry: SessionRegistry,
    pub connect_timeout: Duration,
    pub ping_interval: Option<Duration>,
}

pub(crate) struct SessionWorker {
    peer_id: String,
    session_id: Uuid,
    created_at: DateTime<Utc>,
    transport: Arc<dyn PeerTransport>,
    commands: mpsc::Receiver<SessionCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_events_open: bool,
    event_tx: broadcast::Sender<ConnectionEvent>,
    registry: SessionRegistry,

    signaling_state: SignalingState,
    connection_state: ConnectionState,
    ice_gathering_state: IceGatheringState,
    candidates: CandidateQueue,
    applied_candidates: usize,
    failed_candidates: usize,
    data_channel: Option<DataChannelSession>,
    inbound_track: Option<String>,
    audio: Option<broadcast::Receiver<AudioPacket>>,
    audio_packets_sent: u64,
    timeout: ConnectTimeout,
    ping: Option<Interval>,
    terminated: bool,
}

impl SessionWorker {
    pub(crate) fn new(params: SessionParams) -> Self {
        let ping = params.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        Self {
            peer_id: params.peer_id,
            session_id: params.session_id,
            created_at: Utc::now(),
            transport: params.transport,
            commands: params.commands,
            transport_events: params.transport_events,
            transport_events_open: true,
            event_tx: params.event_tx,
            registry: params.registry,
            signaling_state: SignalingState::Stable,
            connection_state: ConnectionState::New,
            ice_gathering_state: IceGatheringState::New,
            candidates: CandidateQueue::new(),
            applied_candidates: 0,
            failed_candidates: 0,
            data_channel: None,
            inbound_track: None,
            audio: None,
            audio_packets_sent: 0,
            timeout: ConnectTimeout::arm(params.connect_timeout),
            ping,
            terminated: false,
        }
    }

    pub(crate) fn info(&self) -> PeerSessionInfo {
        PeerSessionInfo {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id,
            created_at: self.created_at,
            signaling_state: self.signaling_state,
            connection_state: self.connection_state,
            ice_gathering_state: self.ice_gathering_state,
            has_remote_description: self.candidates.was_flushed(),
            queued_candidates: self.candidates.len(),
            applied_candidates: self.applied_candidates,
            failed_candidates: self.failed_candidates,
            connect_timeout: self.timeout.state(),
            data_channel: self.data_channel.clone(),
            inbound_track: self.inbound_track.clone(),
            audio_attached: self.audio.is_some(),
            audio_packets_sent: self.audio_packets_sent,
        }
    }

    /// Haupt-Loop der Session
    pub(crate) async fn run(mut self) {
        tracing::debug!(peer_id = %self.peer_id, session_id = %self.session_id, "Session worker started");

        loop {
            // Transport Events zuerst: ein Command sieht immer alle Events,
            // die vor ihm eingetroffen sind
            let step = tokio::select! {
                biased;

                event = self.transport_events.recv(), if self.transport_events_open => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        self.transport_events_open = false;
                        Step::Continue
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.terminate(Termination::Closed(CloseReason::Shutdown)).await;
                        Step::Exit
                    }
                },
                _ = self.timeout.expired() => self.handle_timeout().await,
                packet = next_audio(&mut self.audio) => self.forward_audio(packet).await,
                _ = next_tick(&mut self.ping) => {
                    if let Err(e) = self.send_ping().await {
                        tracing::trace!(peer_id = %self.peer_id, "Skipping ping: {}", e);
                    }
                    Step::Continue
                }
            };

            if step == Step::Exit {
                break;
            }
        }

        self.unregister();
        tracing::debug!(peer_id = %self.peer_id, "Session worker stopped");
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, command: SessionCommand) -> Step {
        match command {
            SessionCommand::CreateOffer(reply) => {
                let result = self.create_local_description(SdpType::Offer).await;
                self.reply_and_check(reply, result).await
            }
            SessionCommand::CreateAnswer(reply) => {
                let result = self.create_local_description(SdpType::Answer).await;
                self.reply_and_check(reply, result).await
            }
            SessionCommand::ApplyRemoteDescription(desc, reply) => {
                let result = self.apply_remote_description(desc).await;
                self.reply_and_check(reply, result).await
            }
            SessionCommand::AddRemoteCandidate(candidate, reply) => {
                let result = self.add_remote_candidate(candidate).await;
                let _ = reply.send(result);
                Step::Continue
            }
            SessionCommand::OpenDataChannel(config, reply) => {
                let result = self.open_data_channel(config).await;
                let _ = reply.send(result);
                Step::Continue
            }
            SessionCommand::SendData(message, reply) => {
                let result = self.send_data(&message).await;
                let _ = reply.send(result);
                Step::Continue
            }
            SessionCommand::Ping(reply) => {
                let result = self.send_ping().await;
                let _ = reply.send(result);
                Step::Continue
            }
            SessionCommand::AttachAudio(receiver, reply) => {
                tracing::debug!(peer_id = %self.peer_id, "Audio source attached");
                self.audio = Some(receiver);
                let _ = reply.send(Ok(()));
                Step::Continue
            }
            SessionCommand::DetachAudio(reply) => {
                if self.audio.take().is_some() {
                    tracing::debug!(peer_id = %self.peer_id, "Audio source detached");
                }
                let _ = reply.send(Ok(()));
                Step::Continue
            }
            SessionCommand::Info(reply) => {
                let _ = reply.send(self.info());
                Step::Continue
            }
            SessionCommand::Close(reply) => {
                self.terminate(Termination::Closed(CloseReason::Requested))
                    .await;
                let _ = reply.send(());
                Step::Exit
            }
        }
    }

    /// Antwortet dem Aufrufer; fatale Fehler beenden danach die Session
    async fn reply_and_check<T>(&mut self, reply: Reply<T>, result: Result<T, ConnectionError>) -> Step {
        let fatal = match &result {
            Err(e) if e.is_session_fatal() => Some(e.clone()),
            _ => None,
        };
        let _ = reply.send(result);

        match fatal {
            Some(error) => {
                tracing::error!(peer_id = %self.peer_id, "Session failed: {}", error);
                self.terminate(Termination::Failed(error)).await;
                Step::Exit
            }
            None => Step::Continue,
        }
    }

    async fn create_local_description(
        &mut self,
        sdp_type: SdpType,
    ) -> Result<SessionDescription, ConnectionError> {
        let next_state = self.signaling_state.after_local(sdp_type).ok_or_else(|| {
            ConnectionError::InvalidState {
                peer_id: self.peer_id.clone(),
                reason: format!(
                    "cannot create local {:?} in state {:?}",
                    sdp_type, self.signaling_state
                ),
            }
        })?;

        let created = match sdp_type {
            SdpType::Offer => self.transport.create_offer().await,
            _ => self.transport.create_answer().await,
        };
        let desc = created.map_err(|e| ConnectionError::Transport {
            peer_id: self.peer_id.clone(),
            reason: e.to_string(),
        })?;

        self.transport
            .set_local_description(desc.clone())
            .await
            .map_err(|e| ConnectionError::SignalingApply {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(peer_id = %self.peer_id, "Local {:?} applied", sdp_type);
        self.set_signaling_state(next_state);
        Ok(desc)
    }

    async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let sdp_type = desc.sdp_type;
        let next_state = self.signaling_state.after_remote(sdp_type).ok_or_else(|| {
            ConnectionError::InvalidState {
                peer_id: self.peer_id.clone(),
                reason: format!(
                    "cannot apply remote {:?} in state {:?}",
                    sdp_type, self.signaling_state
                ),
            }
        })?;

        self.transport
            .set_remote_description(desc)
            .await
            .map_err(|e| ConnectionError::SignalingApply {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(peer_id = %self.peer_id, "Remote {:?} applied", sdp_type);
        self.set_signaling_state(next_state);
        self.flush_candidates().await;
        Ok(())
    }

    /// Wendet alle gepufferten Candidates in Ankunftsreihenfolge an
    async fn flush_candidates(&mut self) {
        let pending = self.candidates.drain();
        if pending.is_empty() {
            return;
        }

        let mut applied = 0;
        let mut failed = 0;
        for candidate in pending {
            match self.transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    failed += 1;
                    let error = ConnectionError::CandidateApply {
                        peer_id: self.peer_id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(peer_id = %self.peer_id, "Skipping queued candidate: {}", error);
                    self.emit(ConnectionEvent::CandidateFailed {
                        peer_id: self.peer_id.clone(),
                        error,
                    });
                }
            }
        }

        self.applied_candidates += applied;
        self.failed_candidates += failed;
        tracing::debug!(peer_id = %self.peer_id, applied, failed, "Candidate queue flushed");
        self.emit(ConnectionEvent::CandidatesFlushed {
            peer_id: self.peer_id.clone(),
            applied,
            failed,
        });
    }

    async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, ConnectionError> {
        // vor dem ersten Flush fehlt die Remote Description noch
        if !self.candidates.was_flushed() {
            let queue_len = self.candidates.push(candidate);
            tracing::debug!(peer_id = %self.peer_id, queue_len, "Candidate queued");
            return Ok(CandidateDisposition::Queued { queue_len });
        }

        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => {
                self.applied_candidates += 1;
                Ok(CandidateDisposition::Applied)
            }
            Err(e) => {
                self.failed_candidates += 1;
                let error = ConnectionError::CandidateApply {
                    peer_id: self.peer_id.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(peer_id = %self.peer_id, "Skipping candidate: {}", error);
                self.emit(ConnectionEvent::CandidateFailed {
                    peer_id: self.peer_id.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn open_data_channel(
        &mut self,
        config: DataChannelConfig,
    ) -> Result<DataChannelSession, ConnectionError> {
        if let Some(existing) = &self.data_channel {
            if existing.ready_state != DataChannelState::Closed {
                return Err(ConnectionError::DataChannel {
                    peer_id: self.peer_id.clone(),
                    reason: format!("data channel '{}' already exists", existing.label),
                });
            }
        }

        self.transport
            .create_data_channel(&config)
            .await
            .map_err(|e| ConnectionError::DataChannel {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })?;

        let channel = DataChannelSession {
            label: config.label,
            ready_state: DataChannelState::Connecting,
            ordered: config.ordered,
            max_retransmits: config.max_retransmits,
        };
        self.data_channel = Some(channel.clone());
        self.emit(ConnectionEvent::DataChannelStateChanged {
            peer_id: self.peer_id.clone(),
            label: channel.label.clone(),
            state: DataChannelState::Connecting,
        });
        Ok(channel)
    }

    fn open_channel_label(&self) -> Option<String> {
        self.data_channel
            .as_ref()
            .filter(|dc| dc.ready_state == DataChannelState::Open)
            .map(|dc| dc.label.clone())
    }

    async fn send_data(&mut self, message: &DataChannelMessage) -> Result<(), ConnectionError> {
        let label = self
            .open_channel_label()
            .ok_or_else(|| ConnectionError::DataChannel {
                peer_id: self.peer_id.clone(),
                reason: "data channel not open".to_string(),
            })?;

        let payload = message.to_json().map_err(|e| ConnectionError::DataChannel {
            peer_id: self.peer_id.clone(),
            reason: e.to_string(),
        })?;

        self.transport
            .send_data(&label, payload)
            .await
            .map_err(|e| ConnectionError::DataChannel {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })
    }

    async fn send_ping(&mut self) -> Result<(), ConnectionError> {
        if self.connection_state != ConnectionState::Connected {
            return Err(ConnectionError::DataChannel {
                peer_id: self.peer_id.clone(),
                reason: "peer not connected".to_string(),
            });
        }
        self.send_data(&DataChannelMessage::ping(now_ms())).await
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Step {
        match event {
            TransportEvent::ConnectionStateChanged(state) => {
                self.handle_connection_state(state).await
            }
            TransportEvent::IceGatheringStateChanged(state) => {
                if state != self.ice_gathering_state {
                    self.ice_gathering_state = state;
                    self.emit(ConnectionEvent::IceGatheringChanged {
                        peer_id: self.peer_id.clone(),
                        state,
                    });
                }
                Step::Continue
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.emit(ConnectionEvent::LocalCandidate {
                    peer_id: self.peer_id.clone(),
                    candidate,
                });
                Step::Continue
            }
            TransportEvent::DataChannelOpened {
                label,
                ordered,
                max_retransmits,
            } => {
                let adopt = match &self.data_channel {
                    Some(dc) => dc.label == label || dc.ready_state == DataChannelState::Closed,
                    None => true,
                };
                if !adopt {
                    tracing::debug!(peer_id = %self.peer_id, %label, "Ignoring additional data channel");
                    return Step::Continue;
                }
                tracing::info!(peer_id = %self.peer_id, %label, "Data channel open");
                self.data_channel = Some(DataChannelSession {
                    label: label.clone(),
                    ready_state: DataChannelState::Open,
                    ordered,
                    max_retransmits,
                });
                self.emit(ConnectionEvent::DataChannelStateChanged {
                    peer_id: self.peer_id.clone(),
                    label,
                    state: DataChannelState::Open,
                });
                Step::Continue
            }
            TransportEvent::DataChannelMessage { label, data } => {
                self.handle_data_message(&label, &data).await;
                Step::Continue
            }
            TransportEvent::DataChannelClosed { label } => {
                let closed = match self.data_channel.as_mut() {
                    Some(dc) if dc.label == label && dc.ready_state != DataChannelState::Closed => {
                        dc.ready_state = DataChannelState::Closed;
                        true
                    }
                    _ => false,
                };
                if closed {
                    tracing::info!(peer_id = %self.peer_id, %label, "Data channel closed");
                    self.emit(ConnectionEvent::DataChannelStateChanged {
                        peer_id: self.peer_id.clone(),
                        label,
                        state: DataChannelState::Closed,
                    });
                }
                Step::Continue
            }
            TransportEvent::RemoteTrack { track_id } => {
                tracing::info!(peer_id = %self.peer_id, %track_id, "Inbound track");
                self.inbound_track = Some(track_id.clone());
                self.emit(ConnectionEvent::RemoteTrack {
                    peer_id: self.peer_id.clone(),
                    track_id,
                });
                Step::Continue
            }
            TransportEvent::NetworkStats(stats) => {
                tracing::trace!(
                    peer_id = %self.peer_id,
                    received = stats.packets_received,
                    lost = stats.packets_lost,
                    "Transport stats"
                );
                self.emit(ConnectionEvent::NetworkStats {
                    peer_id: self.peer_id.clone(),
                    stats,
                });
                Step::Continue
            }
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) -> Step {
        if state == self.connection_state {
            return Step::Continue;
        }

        tracing::info!(peer_id = %self.peer_id, "Peer connection state: {:?}", state);

        match state {
            ConnectionState::Failed => {
                let error = ConnectionError::Transport {
                    peer_id: self.peer_id.clone(),
                    reason: "peer connection failed".to_string(),
                };
                self.terminate(Termination::Failed(error)).await;
                Step::Exit
            }
            ConnectionState::Closed => {
                self.terminate(Termination::Closed(CloseReason::RemoteClosed))
                    .await;
                Step::Exit
            }
            _ => {
                self.set_connection_state(state);
                if state == ConnectionState::Connected && self.timeout.cancel() {
                    tracing::debug!(peer_id = %self.peer_id, "Connect timeout cancelled");
                }
                if state == ConnectionState::Disconnected {
                    tracing::warn!(peer_id = %self.peer_id, "Peer disconnected, waiting for recovery");
                }
                Step::Continue
            }
        }
    }

    async fn handle_data_message(&mut self, label: &str, data: &[u8]) {
        let message = match DataChannelMessage::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer_id = %self.peer_id, %label, "Malformed data channel message: {}", e);
                return;
            }
        };

        match message.message_type {
            DataMessageType::Ping => {
                if let Some(pong) = message.reply_to_ping(now_ms()) {
                    if let Err(e) = self.send_data(&pong).await {
                        tracing::debug!(peer_id = %self.peer_id, "Failed to answer ping: {}", e);
                    }
                }
            }
            DataMessageType::Pong => {
                if let Some(rtt_ms) = message.rtt_ms(now_ms()) {
                    tracing::trace!(peer_id = %self.peer_id, rtt_ms, "Pong received");
                    self.emit(ConnectionEvent::LatencyMeasured {
                        peer_id: self.peer_id.clone(),
                        rtt_ms,
                    });
                }
            }
            DataMessageType::Translation | DataMessageType::Control => {
                self.emit(ConnectionEvent::DataMessage {
                    peer_id: self.peer_id.clone(),
                    message,
                });
            }
        }
    }

    async fn handle_timeout(&mut self) -> Step {
        if !self.timeout.fire() {
            return Step::Continue;
        }

        let error = ConnectionError::ConnectTimeout {
            peer_id: self.peer_id.clone(),
            timeout_ms: self.timeout.duration().as_millis() as u64,
        };
        tracing::error!(peer_id = %self.peer_id, "{}", error);
        self.terminate(Termination::Failed(error)).await;
        Step::Exit
    }

    async fn forward_audio(&mut self, packet: Result<AudioPacket, RecvError>) -> Step {
        match packet {
            Ok(packet) => {
                if self.connection_state != ConnectionState::Connected {
                    return Step::Continue;
                }
                match self.transport.send_audio(&packet).await {
                    Ok(()) => self.audio_packets_sent += 1,
                    Err(e) => {
                        tracing::debug!(peer_id = %self.peer_id, "Failed to send audio: {}", e)
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(peer_id = %self.peer_id, skipped, "Audio fan-out lagging");
            }
            Err(RecvError::Closed) => {
                self.audio = None;
            }
        }
        Step::Continue
    }

    // ========================================================================
    // CLEANUP
    // ========================================================================

    /// Gibt alle Ressourcen frei und meldet genau ein terminales Event
    async fn terminate(&mut self, termination: Termination) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        self.timeout.cancel();
        self.ping = None;
        self.audio = None;
        self.candidates.clear();

        let open_label = self
            .data_channel
            .as_ref()
            .filter(|dc| dc.ready_state != DataChannelState::Closed)
            .map(|dc| dc.label.clone());
        if let Some(label) = open_label {
            if let Err(e) = self.transport.close_data_channel(&label).await {
                tracing::debug!(peer_id = %self.peer_id, "Failed to close data channel: {}", e);
            }
            if let Some(dc) = self.data_channel.as_mut() {
                dc.ready_state = DataChannelState::Closed;
            }
            self.emit(ConnectionEvent::DataChannelStateChanged {
                peer_id: self.peer_id.clone(),
                label,
                state: DataChannelState::Closed,
            });
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!(peer_id = %self.peer_id, "Failed to close transport: {}", e);
        }

        // vor dem Terminal-Event austragen, damit Empfänger sofort neu anlegen können
        self.unregister();
        match termination {
            Termination::Closed(reason) => {
                self.set_connection_state(ConnectionState::Closed);
                tracing::info!(peer_id = %self.peer_id, "Session closed ({:?})", reason);
                self.emit(ConnectionEvent::Closed {
                    peer_id: self.peer_id.clone(),
                    reason,
                });
            }
            Termination::Failed(error) => {
                self.set_connection_state(ConnectionState::Failed);
                self.emit(ConnectionEvent::Failed {
                    peer_id: self.peer_id.clone(),
                    error,
                });
            }
        }
    }

    /// Entfernt den eigenen Eintrag, sofern er noch zu dieser Session gehört
    fn unregister(&self) {
        let mut sessions = self.registry.lock();
        if sessions
            .get(&self.peer_id)
            .is_some_and(|entry| entry.session_id == self.session_id)
        {
            sessions.remove(&self.peer_id);
        }
    }

    fn set_signaling_state(&mut self, state: SignalingState) {
        if state != self.signaling_state {
            self.signaling_state = state;
            self.emit(ConnectionEvent::SignalingStateChanged {
                peer_id: self.peer_id.clone(),
                state,
            });
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        if state != self.connection_state {
            self.connection_state = state;
            self.emit(ConnectionEvent::StateChanged {
                peer_id: self.peer_id.clone(),
                state,
            });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn next_audio(
    receiver: &mut Option<broadcast::Receiver<AudioPacket>>,
) -> Result<AudioPacket, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
