//! In-Memory Transport für Tests

use super::transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportError, TransportEvent,
    TransportEventSender, TransportFactory,
};
use crate::audio::AudioPacket;
use crate::config::DataChannelConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    applied: Vec<IceCandidate>,
    rejected_candidates: HashSet<String>,
    reject_descriptions: bool,
    sent: Vec<(String, String)>,
    audio_packets: usize,
    closed: bool,
}

/// Handle auf einen Fake-Transport, um ihn von außen zu steuern
#[derive(Clone)]
pub struct FakeControl {
    state: Arc<Mutex<FakeState>>,
    events: TransportEventSender,
}

impl FakeControl {
    /// Simuliert einen Callback des Transports
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.state
            .lock()
            .rejected_candidates
            .insert(candidate.to_string());
    }

    pub fn reject_descriptions(&self, reject: bool) {
        self.state.lock().reject_descriptions = reject;
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn sent_data(&self) -> Vec<(String, String)> {
        self.state.lock().sent.clone()
    }

    pub fn audio_packets(&self) -> usize {
        self.state.lock().audio_packets
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

pub struct FakeTransport {
    control: FakeControl,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer("v=0 fake answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.control.state.lock().local.push(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.control.state.lock();
        if state.reject_descriptions {
            return Err(TransportError::InvalidSdp(format!(
                "rejected {:?}",
                desc.sdp_type
            )));
        }
        state.remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.control.state.lock();
        if state.rejected_candidates.contains(&candidate.candidate) {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, config: &DataChannelConfig) -> Result<(), TransportError> {
        self.control.emit(TransportEvent::DataChannelOpened {
            label: config.label.clone(),
            ordered: config.ordered,
            max_retransmits: config.max_retransmits,
        });
        Ok(())
    }

    async fn send_data(&self, label: &str, payload: String) -> Result<(), TransportError> {
        let mut state = self.control.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.sent.push((label.to_string(), payload));
        Ok(())
    }

    async fn close_data_channel(&self, _label: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_audio(&self, _packet: &AudioPacket) -> Result<(), TransportError> {
        self.control.state.lock().audio_packets += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.control.state.lock().closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    controls: Mutex<HashMap<String, FakeControl>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control des zuletzt für diesen Peer erzeugten Transports
    pub fn control(&self, peer_id: &str) -> Option<FakeControl> {
        self.controls.lock().get(peer_id).cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let control = FakeControl {
            state: Arc::new(Mutex::new(FakeState::default())),
            events,
        };
        self.controls
            .lock()
            .insert(peer_id.to_string(), control.clone());
        Ok(Arc::new(FakeTransport { control }))
    }
}
