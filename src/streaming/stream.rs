//! Zustand eines einzelnen Streams
//!
//! Reine Logik ohne Timer: der Worker ruft `push`, `flush_tick` und
//! `adjust_tick` auf und verteilt die freigegebenen Pakete und Events.

use super::buffer::{Admission, StreamBuffer};
use super::level::{buffer_health, decide_step, NetworkHealth, QualityLevel, StepDecision};
use crate::audio::AudioPacket;
use crate::config::StreamingConfig;
use crate::quality::ActionTag;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Overflow {
        stream_id: String,
        evicted: usize,
        size: usize,
    },
    OversizedDrop {
        stream_id: String,
        packet_size: usize,
    },
    Underrun {
        stream_id: String,
        size: usize,
        min_size: usize,
    },
    BufferResized {
        stream_id: String,
        old_max: usize,
        new_max: usize,
    },
    QualityChanged {
        stream_id: String,
        from: QualityLevel,
        to: QualityLevel,
    },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::Overflow { stream_id, .. }
            | StreamEvent::OversizedDrop { stream_id, .. }
            | StreamEvent::Underrun { stream_id, .. }
            | StreamEvent::BufferResized { stream_id, .. }
            | StreamEvent::QualityChanged { stream_id, .. } => stream_id,
        }
    }
}

/// Kopie der Stream-Telemetrie
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub stream_id: String,
    pub size: usize,
    pub queued_packets: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub target_size: usize,
    pub overflow_count: u64,
    pub evicted_packets: u64,
    pub oversized_drops: u64,
    pub underrun_count: u64,
    pub released_packets: u64,
    pub level: QualityLevel,
    pub buffer_health: f64,
}

#[derive(Debug, Default)]
pub struct TickOutput {
    pub released: Vec<AudioPacket>,
    pub events: Vec<StreamEvent>,
}

pub struct StreamState {
    stream_id: String,
    config: StreamingConfig,
    buffer: StreamBuffer,
    level: QualityLevel,
    network: Option<NetworkHealth>,
    pending_actions: Vec<ActionTag>,
    interval_underruns: u32,
    interval_overflows: u32,
    underrun_count: u64,
    released_packets: u64,
    last_packet_at: Option<Instant>,
    health: f64,
}

impl StreamState {
    pub fn new(stream_id: impl Into<String>, config: &StreamingConfig) -> Self {
        Self {
            stream_id: stream_id.into(),
            buffer: StreamBuffer::new(
                config.min_buffer_size,
                config.target_buffer_size,
                config.max_buffer_size,
            ),
            config: config.clone(),
            level: QualityLevel::default(),
            network: None,
            pending_actions: Vec::new(),
            interval_underruns: 0,
            interval_overflows: 0,
            underrun_count: 0,
            released_packets: 0,
            last_packet_at: None,
            health: 100.0,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn push(&mut self, packet: AudioPacket, now: Instant) -> TickOutput {
        let packet_size = packet.len();
        self.last_packet_at = Some(now);
        let mut out = TickOutput::default();

        let admission = self.buffer.push(packet);
        if admission.is_overflow() {
            self.interval_overflows += 1;
            out.events.push(StreamEvent::Overflow {
                stream_id: self.stream_id.clone(),
                evicted: admission.evicted(),
                size: self.buffer.size(),
            });
        }
        if let Admission::Oversized { .. } = admission {
            tracing::warn!(
                stream_id = %self.stream_id,
                "Dropping {} byte packet larger than buffer ({} bytes)",
                packet_size,
                self.buffer.max_size()
            );
            out.events.push(StreamEvent::OversizedDrop {
                stream_id: self.stream_id.clone(),
                packet_size,
            });
        }

        out.released = self.buffer.release_ready();
        self.released_packets += out.released.len() as u64;
        out
    }

    /// Unterlauf-Prüfung, danach Flush
    ///
    /// Ein Stream ohne Pakete im letzten Anpassungsintervall gilt als ruhend
    /// und läuft nicht unter.
    pub fn flush_tick(&mut self, now: Instant) -> TickOutput {
        let mut out = TickOutput::default();
        let active = self
            .last_packet_at
            .map(|at| now.saturating_duration_since(at) <= self.config.adjust_interval())
            .unwrap_or(false);

        if active && self.buffer.is_below_min() {
            self.interval_underruns += 1;
            self.underrun_count += 1;
            tracing::debug!(
                stream_id = %self.stream_id,
                "Buffer underrun: {} < {} bytes",
                self.buffer.size(),
                self.buffer.min_size()
            );
            out.events.push(StreamEvent::Underrun {
                stream_id: self.stream_id.clone(),
                size: self.buffer.size(),
                min_size: self.buffer.min_size(),
            });
        }

        out.released = self.buffer.flush();
        self.released_packets += out.released.len() as u64;
        out
    }

    /// Puffergröße und Quality-Stufe anpassen, höchstens ein Schritt
    pub fn adjust_tick(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.health = buffer_health(self.interval_underruns, self.interval_overflows);

        let old_max = self.buffer.max_size();
        let pending_buffer_action = self
            .pending_actions
            .iter()
            .rev()
            .find(|a| matches!(a, ActionTag::IncreaseBuffer | ActionTag::ReduceBuffer))
            .copied();

        let new_max = if self.interval_underruns > 0 {
            self.grown(old_max)
        } else if self.interval_overflows > 0 {
            self.shrunk(old_max)
        } else {
            match pending_buffer_action {
                Some(ActionTag::IncreaseBuffer) => self.grown(old_max),
                Some(ActionTag::ReduceBuffer) => self.shrunk(old_max),
                _ => old_max,
            }
        };

        if new_max != old_max {
            let evicted = self.buffer.resize(new_max);
            tracing::debug!(
                stream_id = %self.stream_id,
                "Buffer resized: {} -> {} bytes",
                old_max,
                new_max
            );
            events.push(StreamEvent::BufferResized {
                stream_id: self.stream_id.clone(),
                old_max,
                new_max,
            });
            if evicted > 0 {
                events.push(StreamEvent::Overflow {
                    stream_id: self.stream_id.clone(),
                    evicted,
                    size: self.buffer.size(),
                });
            }
        }

        let mut decision = decide_step(self.network.as_ref(), self.health, &self.config);
        if self.pending_actions.contains(&ActionTag::LowerQuality) {
            decision = StepDecision::Down;
        }
        let from = self.level;
        let to = match decision {
            StepDecision::Up => from.step_up(),
            StepDecision::Down => from.step_down(),
            StepDecision::Hold => from,
        };
        if to != from {
            self.level = to;
            tracing::info!(stream_id = %self.stream_id, "Quality level {} -> {}", from, to);
            events.push(StreamEvent::QualityChanged {
                stream_id: self.stream_id.clone(),
                from,
                to,
            });
        }

        self.interval_underruns = 0;
        self.interval_overflows = 0;
        self.pending_actions.clear();
        events
    }

    pub fn update_network(&mut self, health: NetworkHealth) {
        self.network = Some(health);
    }

    /// Merkt eine Empfehlung für den nächsten Anpassungszyklus vor
    ///
    /// Gibt `false` zurück, wenn der Tag für Streams keine Bedeutung hat.
    pub fn apply_action(&mut self, action: ActionTag) -> bool {
        match action {
            ActionTag::IncreaseBuffer | ActionTag::ReduceBuffer | ActionTag::LowerQuality => {
                self.pending_actions.push(action);
                true
            }
            _ => false,
        }
    }

    /// Gibt alle verbleibenden Pakete frei
    pub fn drain(&mut self) -> Vec<AudioPacket> {
        let released = self.buffer.flush();
        self.released_packets += released.len() as u64;
        released
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            stream_id: self.stream_id.clone(),
            size: self.buffer.size(),
            queued_packets: self.buffer.len(),
            min_size: self.buffer.min_size(),
            max_size: self.buffer.max_size(),
            target_size: self.buffer.target_size(),
            overflow_count: self.buffer.overflow_count(),
            evicted_packets: self.buffer.evicted_packets(),
            oversized_drops: self.buffer.oversized_drops(),
            underrun_count: self.underrun_count,
            released_packets: self.released_packets,
            level: self.level,
            buffer_health: self.health,
        }
    }

    fn grown(&self, current: usize) -> usize {
        let grown = (current as f64 * self.config.grow_factor) as usize;
        grown.min(self.config.buffer_ceiling).max(current)
    }

    fn shrunk(&self, current: usize) -> usize {
        let shrunk = (current as f64 * self.config.shrink_factor) as usize;
        shrunk.max(self.config.buffer_floor).min(current)
    }
}
