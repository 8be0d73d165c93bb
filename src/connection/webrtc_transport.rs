//! `PeerTransport` auf Basis von webrtc-rs
//!
//! Jeder Peer bekommt eine eigene `RTCPeerConnection` mit einem lokalen
//! Opus-Track. Alle Callbacks werden in `TransportEvent`s übersetzt.

use super::transport::{
    ConnectionState, IceCandidate, IceGatheringState, PeerTransport, SdpType,
    SessionDescription, TransportError, TransportEvent, TransportEventSender, TransportFactory,
    TransportStats,
};
use crate::audio::{AudioPacket, CHANNELS, SAMPLE_RATE};
use crate::config::{ConnectionConfig, DataChannelConfig, IceServerConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage as RTCDataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
    };
    result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        other => {
            return Err(TransportError::InvalidSdp(format!(
                "unsupported description type {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn map_gathering_state(state: RTCIceGathererState) -> Option<IceGatheringState> {
    match state {
        RTCIceGathererState::New => Some(IceGatheringState::New),
        RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
        RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
        _ => None,
    }
}

fn local_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let init = candidate.to_json().ok()?;
    Some(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

/// Verdichtet einen Stats-Report auf Paketzähler und Bandbreite
///
/// Verlust kommt aus den RTCP Receiver Reports der Gegenseite
/// (`remote-inbound-rtp`), die Bandbreite vom nominierten Candidate-Paar.
fn summarize_stats<'a>(reports: impl IntoIterator<Item = &'a StatsReportType>) -> TransportStats {
    let mut stats = TransportStats::default();
    for report in reports {
        match report {
            StatsReportType::RemoteInboundRTP(rtp) => {
                stats.packets_received += rtp.packets_received;
                stats.packets_lost += rtp.packets_lost.max(0) as u64;
            }
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.available_outgoing_bitrate > 0.0 =>
            {
                stats.available_bitrate_kbps = Some(pair.available_outgoing_bitrate / 1000.0);
            }
            _ => {}
        }
    }
    stats
}

/// Fragt periodisch `get_stats()` ab, solange die Verbindung besteht
///
/// Hält nur eine schwache Referenz, damit der Task die Peer Connection
/// nicht am Leben hält.
async fn poll_stats(pc: Weak<RTCPeerConnection>, events: TransportEventSender, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(conn) = pc.upgrade() else { break };
        match conn.connection_state() {
            RTCPeerConnectionState::Connected => {}
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => break,
            _ => continue,
        }
        let report: StatsReport = conn.get_stats().await;
        let stats = summarize_stats(report.reports.values());
        if events.send(TransportEvent::NetworkStats(stats)).is_err() {
            break;
        }
    }
}

type ChannelMap = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

/// `DataChannelOpened` für einen Channel; webrtc-rs speichert "unbegrenzt" als 0
fn opened_event(dc: &RTCDataChannel) -> TransportEvent {
    TransportEvent::DataChannelOpened {
        label: dc.label().to_string(),
        ordered: dc.ordered(),
        max_retransmits: Some(dc.max_retransmits()).filter(|n| *n > 0),
    }
}

/// Hängt Open/Message/Close Handler an einen Data Channel
fn register_channel_handlers(dc: &Arc<RTCDataChannel>, events: TransportEventSender, channels: ChannelMap) {
    let label = dc.label().to_string();
    channels.lock().insert(label.clone(), Arc::clone(dc));

    let open_events = events.clone();
    let opened = opened_event(dc);
    dc.on_open(Box::new(move || {
        let _ = open_events.send(opened.clone());
        Box::pin(async {})
    }));

    let message_events = events.clone();
    let message_label = label.clone();
    dc.on_message(Box::new(move |msg: RTCDataChannelMessage| {
        let _ = message_events.send(TransportEvent::DataChannelMessage {
            label: message_label.clone(),
            data: msg.data.to_vec(),
        });
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        channels.lock().remove(&label);
        let _ = events.send(TransportEvent::DataChannelClosed {
            label: label.clone(),
        });
        Box::pin(async {})
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct WebRtcTransport {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    channels: ChannelMap,
    events: TransportEventSender,
}

impl WebRtcTransport {
    async fn connect(
        peer_id: &str,
        ice_servers: Vec<RTCIceServer>,
        stats_interval: Option<Duration>,
        events: TransportEventSender,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            format!("room-engine-{}", peer_id),
        ));

        let rtp_sender = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        // RTCP lesen, sonst laufen die Interceptors nicht
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        if let Some(interval) = stats_interval {
            tokio::spawn(poll_stats(Arc::downgrade(&pc), events.clone(), interval));
        }

        let transport = Self {
            peer_id: peer_id.to_string(),
            pc,
            audio_track,
            channels: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        transport.setup_handlers();
        Ok(transport)
    }

    fn setup_handlers(&self) {
        let events = self.events.clone();
        let state_events = events.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::debug!(peer_id = %peer_id, "RTC peer connection state: {:?}", s);
                let _ = state_events.send(TransportEvent::ConnectionStateChanged(
                    map_connection_state(s),
                ));
                Box::pin(async {})
            }));

        let gathering_events = events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                if let Some(state) = map_gathering_state(s) {
                    let _ = gathering_events.send(TransportEvent::IceGatheringStateChanged(state));
                }
                Box::pin(async {})
            }));

        let candidate_events = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate.as_ref().and_then(local_candidate) {
                let _ = candidate_events.send(TransportEvent::LocalCandidate(candidate));
            }
            Box::pin(async {})
        }));

        let channel_events = events.clone();
        let channels = Arc::clone(&self.channels);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                tracing::debug!("Remote data channel '{}'", dc.label());
                register_channel_handlers(&dc, channel_events.clone(), Arc::clone(&channels));
                Box::pin(async {})
            }));

        self.pc.on_track(Box::new(move |track, _, _| {
            let _ = events.send(TransportEvent::RemoteTrack {
                track_id: track.id(),
            });
            Box::pin(async {})
        }));
    }

    fn channel(&self, label: &str) -> Result<Arc<RTCDataChannel>, TransportError> {
        self.channels
            .lock()
            .get(label)
            .cloned()
            .ok_or_else(|| TransportError::NoDataChannel(label.to_string()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_local_description(desc).await.map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_remote_description(desc).await.map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn create_data_channel(&self, config: &DataChannelConfig) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: config.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&config.label, Some(init))
            .await
            .map_err(webrtc_err)?;

        tracing::debug!(peer_id = %self.peer_id, "Created data channel '{}'", config.label);
        register_channel_handlers(&dc, self.events.clone(), Arc::clone(&self.channels));
        Ok(())
    }

    async fn send_data(&self, label: &str, payload: String) -> Result<(), TransportError> {
        let dc = self.channel(label)?;
        dc.send_text(payload).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn close_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let dc = self.channels.lock().remove(label);
        match dc {
            Some(dc) => dc.close().await.map_err(webrtc_err),
            None => Ok(()),
        }
    }

    async fn send_audio(&self, packet: &AudioPacket) -> Result<(), TransportError> {
        self.audio_track
            .write_sample(&Sample {
                data: packet.payload.to_vec().into(),
                duration: Duration::from_millis(u64::from(packet.duration_ms)),
                ..Default::default()
            })
            .await
            .map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channels.lock().clear();
        self.pc.close().await.map_err(webrtc_err)
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt `WebRtcTransport`s mit den konfigurierten ICE Servern
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    stats_interval: Option<Duration>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            ice_servers: to_rtc_ice_servers(&config.ice_servers),
            stats_interval: (config.stats_interval_ms > 0)
                .then(|| Duration::from_millis(config.stats_interval_ms)),
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::connect(
            peer_id,
            self.ice_servers.clone(),
            self.stats_interval,
            events,
        )
        .await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_server_mapping() {
        let servers = to_rtc_ice_servers(&[IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: "user".to_string(),
            credential: "secret".to_string(),
        }]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "user");
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(map_gathering_state(RTCIceGathererState::Closed), None);
    }

    fn remote_inbound(ssrc: u32, received: u64, lost: i64) -> StatsReportType {
        use webrtc::stats::{RTCStatsType, RemoteInboundRTPStats};
        StatsReportType::RemoteInboundRTP(RemoteInboundRTPStats {
            timestamp: tokio::time::Instant::now(),
            stats_type: RTCStatsType::RemoteInboundRTP,
            id: format!("remote-inbound-{}", ssrc),
            ssrc,
            kind: "audio".to_string(),
            packets_received: received,
            packets_lost: lost,
            local_id: format!("outbound-{}", ssrc),
            round_trip_time: Some(0.05),
            total_round_trip_time: 0.05,
            fraction_lost: 0.0,
            round_trip_time_measurements: 1,
        })
    }

    #[test]
    fn test_stats_summary_sums_remote_inbound_streams() {
        let reports = [remote_inbound(1, 900, 50), remote_inbound(2, 100, 0)];
        let stats = summarize_stats(reports.iter());
        assert_eq!(stats.packets_received, 1000);
        assert_eq!(stats.packets_lost, 50);
        assert_eq!(stats.available_bitrate_kbps, None);
    }

    #[test]
    fn test_stats_summary_ignores_negative_loss() {
        // RTCP darf durch Duplikate negative Verluste melden
        let reports = [remote_inbound(1, 100, -3)];
        let stats = summarize_stats(reports.iter());
        assert_eq!(stats.packets_lost, 0);
    }

    #[tokio::test]
    async fn test_opened_event_maps_retransmit_limit() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = WebRtcTransport::connect("peer-1", Vec::new(), None, tx).await.unwrap();

        let limited = transport
            .pc
            .create_data_channel(
                "lossy",
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(3),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            opened_event(&limited),
            TransportEvent::DataChannelOpened {
                label: "lossy".to_string(),
                ordered: false,
                max_retransmits: Some(3),
            }
        );

        let reliable = transport.pc.create_data_channel("control", None).await.unwrap();
        assert_eq!(
            opened_event(&reliable),
            TransportEvent::DataChannelOpened {
                label: "control".to_string(),
                ordered: true,
                max_retransmits: None,
            }
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_contains_audio_section() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = WebRtcTransport::connect("peer-1", Vec::new(), None, tx).await.unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        transport.close().await.unwrap();
    }
}
