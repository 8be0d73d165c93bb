//! Audio-Pakete und Fan-out einer lokalen Quelle
//!
//! Eine `AudioSource` kann gleichzeitig an mehrere Peer Sessions gehängt
//! werden. Jede Session hält ihren eigenen Receiver; langsame Sessions
//! verlieren Pakete, blockieren aber nie die Quelle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

pub const FRAME_DURATION_MS: u32 = 20;

/// Ab diesem Betrag gilt ein Sample als übersteuert
const CLIP_LEVEL: f32 = 0.99;

// ============================================================================
// AUDIO PACKET
// ============================================================================

/// Ein kodierter Audio-Chunk
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    pub stream_id: String,
    pub sequence: u64,
    pub payload: Arc<[u8]>,
    pub duration_ms: u32,
    /// Aufnahmezeitpunkt (Unix ms)
    pub captured_at: i64,
}

impl AudioPacket {
    pub fn new(stream_id: impl Into<String>, sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence,
            payload: payload.into(),
            duration_ms: FRAME_DURATION_MS,
            captured_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Kodiert einen PCM-Frame als 16-bit Little Endian
    pub fn from_pcm(stream_id: impl Into<String>, sequence: u64, samples: &[f32]) -> Self {
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            payload.extend_from_slice(&value.to_le_bytes());
        }
        let mut packet = Self::new(stream_id, sequence, payload);
        packet.duration_ms = (samples.len() as u64 * 1000 / SAMPLE_RATE as u64) as u32;
        packet
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ============================================================================
// LEVEL ANALYSIS
// ============================================================================

/// Pegel eines PCM-Frames
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameLevels {
    /// RMS (0.0 - 1.0)
    pub rms: f32,
    pub peak: f32,
    /// Anteil übersteuerter Samples
    pub clipping_ratio: f32,
}

pub fn analyze_frame(samples: &[f32]) -> FrameLevels {
    if samples.is_empty() {
        return FrameLevels::default();
    }

    let rms: f32 = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let clipped = samples.iter().filter(|s| s.abs() >= CLIP_LEVEL).count();

    FrameLevels {
        rms: rms.min(1.0),
        peak: peak.min(1.0),
        clipping_ratio: clipped as f32 / samples.len() as f32,
    }
}

// ============================================================================
// AUDIO SOURCE
// ============================================================================

/// Lokale Audio-Quelle mit Fan-out an beliebig viele Sessions
#[derive(Debug)]
pub struct AudioSource {
    id: String,
    tx: broadcast::Sender<AudioPacket>,
    published: AtomicU64,
}

impl AudioSource {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            id: id.into(),
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Neuer Receiver für eine Session
    pub fn subscribe(&self) -> broadcast::Receiver<AudioPacket> {
        self.tx.subscribe()
    }

    /// Verteilt ein Paket und gibt die Anzahl der Empfänger zurück
    pub fn publish(&self, packet: AudioPacket) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // Ohne Empfänger wird das Paket verworfen
        self.tx.send(packet).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_silence() {
        let levels = analyze_frame(&[0.0; FRAME_SIZE]);
        assert_eq!(levels.rms, 0.0);
        assert_eq!(levels.clipping_ratio, 0.0);
    }

    #[test]
    fn test_analyze_clipping() {
        let mut frame = vec![0.5f32; 100];
        frame[0] = 1.0;
        frame[1] = -1.0;
        let levels = analyze_frame(&frame);
        assert!((levels.clipping_ratio - 0.02).abs() < 1e-6);
        assert_eq!(levels.peak, 1.0);
        assert!(levels.rms > 0.5);
    }

    #[test]
    fn test_from_pcm_encodes_i16() {
        let packet = AudioPacket::from_pcm("mic", 7, &[0.0; FRAME_SIZE]);
        assert_eq!(packet.len(), FRAME_SIZE * 2);
        assert_eq!(packet.duration_ms, 20);
        assert_eq!(packet.sequence, 7);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let source = AudioSource::new("mic", 16);
        let mut a = source.subscribe();
        let mut b = source.subscribe();

        assert_eq!(source.publish(AudioPacket::new("mic", 1, vec![1, 2, 3])), 2);

        assert_eq!(a.recv().await.unwrap().sequence, 1);
        assert_eq!(b.recv().await.unwrap().sequence, 1);
    }

    #[test]
    fn test_publish_without_receivers() {
        let source = AudioSource::new("mic", 4);
        assert_eq!(source.publish(AudioPacket::new("mic", 1, vec![0])), 0);
        assert_eq!(source.published(), 1);
    }
}
