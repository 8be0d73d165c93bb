//! Adaptive Controller
//!
//! Ein Worker pro Stream mit zwei Timern: Flush (Unterlauf-Prüfung und
//! Freigabe) und Anpassung (Puffergröße, Quality-Stufe). Freigegebene
//! Pakete gehen an die `AudioSource` des Streams.

use super::level::NetworkHealth;
use super::stream::{StreamEvent, StreamState, StreamStats, TickOutput};
use crate::audio::{AudioPacket, AudioSource};
use crate::config::StreamingConfig;
use crate::quality::ActionTag;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Kapazität des Stream-Event-Broadcasts
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamingError {
    #[error("Stream {0} already exists")]
    DuplicateStream(String),

    #[error("Stream {0} not found")]
    StreamNotFound(String),

    #[error("Adaptive controller has been shut down")]
    ControllerStopped,
}

// ============================================================================
// WORKER
// ============================================================================

enum StreamCommand {
    Push(AudioPacket),
    UpdateNetwork(NetworkHealth),
    ApplyAction(ActionTag, oneshot::Sender<bool>),
    Stats(oneshot::Sender<StreamStats>),
}

struct StreamEntry {
    commands: mpsc::Sender<StreamCommand>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct StreamWorker {
    state: StreamState,
    output: Arc<AudioSource>,
    config: StreamingConfig,
    commands: mpsc::Receiver<StreamCommand>,
    stop: oneshot::Receiver<()>,
    event_tx: broadcast::Sender<StreamEvent>,
}

impl StreamWorker {
    async fn run(mut self) {
        tracing::debug!(stream_id = %self.state.stream_id(), "Stream worker started");

        let mut flush = tokio::time::interval(self.config.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut adjust = tokio::time::interval(self.config.adjust_interval());
        adjust.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Erste Ticks kommen sofort
        flush.tick().await;
        adjust.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = &mut self.stop => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = flush.tick() => {
                    let out = self.state.flush_tick(Instant::now());
                    self.dispatch(out);
                }
                _ = adjust.tick() => {
                    for event in self.state.adjust_tick() {
                        let _ = self.event_tx.send(event);
                    }
                }
            }
        }

        // Bereits eingereihte Commands noch abarbeiten, dann restliche Pakete freigeben
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
        let remaining = self.state.drain();
        for packet in remaining {
            self.output.publish(packet);
        }
        tracing::debug!(stream_id = %self.state.stream_id(), "Stream worker stopped");
    }

    fn handle_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::Push(packet) => {
                let out = self.state.push(packet, Instant::now());
                self.dispatch(out);
            }
            StreamCommand::UpdateNetwork(health) => self.state.update_network(health),
            StreamCommand::ApplyAction(action, reply) => {
                let _ = reply.send(self.state.apply_action(action));
            }
            StreamCommand::Stats(reply) => {
                let _ = reply.send(self.state.stats());
            }
        }
    }

    fn dispatch(&self, out: TickOutput) {
        for event in out.events {
            let _ = self.event_tx.send(event);
        }
        for packet in out.released {
            self.output.publish(packet);
        }
    }
}

// ============================================================================
// ADAPTIVE CONTROLLER
// ============================================================================

pub struct AdaptiveController {
    config: StreamingConfig,
    streams: Arc<Mutex<HashMap<String, StreamEntry>>>,
    event_tx: broadcast::Sender<StreamEvent>,
    stopped: AtomicBool,
}

impl AdaptiveController {
    pub fn new(config: StreamingConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            streams: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    /// Legt einen Stream an; freigegebene Pakete gehen an `output`
    pub fn add_stream(
        &self,
        stream_id: &str,
        output: Arc<AudioSource>,
    ) -> Result<(), StreamingError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StreamingError::ControllerStopped);
        }

        let mut streams = self.streams.lock();
        if streams.contains_key(stream_id) {
            return Err(StreamingError::DuplicateStream(stream_id.to_string()));
        }

        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue_size.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = StreamWorker {
            state: StreamState::new(stream_id, &self.config),
            output,
            config: self.config.clone(),
            commands: command_rx,
            stop: stop_rx,
            event_tx: self.event_tx.clone(),
        };
        let task = tokio::spawn(worker.run());
        streams.insert(
            stream_id.to_string(),
            StreamEntry {
                commands: command_tx,
                stop: stop_tx,
                task,
            },
        );
        tracing::info!(stream_id, "Stream added");
        Ok(())
    }

    pub async fn push(&self, stream_id: &str, packet: AudioPacket) -> Result<(), StreamingError> {
        self.send(stream_id, StreamCommand::Push(packet)).await
    }

    pub async fn update_network(
        &self,
        stream_id: &str,
        health: NetworkHealth,
    ) -> Result<(), StreamingError> {
        self.send(stream_id, StreamCommand::UpdateNetwork(health))
            .await
    }

    /// Merkt eine Empfehlung für den nächsten Anpassungszyklus vor
    ///
    /// `Ok(false)`, wenn der Tag für Streams keine Bedeutung hat.
    pub async fn apply_recommendation(
        &self,
        stream_id: &str,
        action: ActionTag,
    ) -> Result<bool, StreamingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(stream_id, StreamCommand::ApplyAction(action, reply_tx))
            .await?;
        reply_rx
            .await
            .map_err(|_| StreamingError::StreamNotFound(stream_id.to_string()))
    }

    pub async fn stats(&self, stream_id: &str) -> Result<StreamStats, StreamingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(stream_id, StreamCommand::Stats(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| StreamingError::StreamNotFound(stream_id.to_string()))
    }

    /// Stoppt den Worker; verbleibende Pakete werden noch freigegeben
    pub async fn remove_stream(&self, stream_id: &str) -> Result<(), StreamingError> {
        let entry = self
            .streams
            .lock()
            .remove(stream_id)
            .ok_or_else(|| StreamingError::StreamNotFound(stream_id.to_string()))?;
        stop_entry(stream_id, entry).await;
        tracing::info!(stream_id, "Stream removed");
        Ok(())
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.lock().contains_key(stream_id)
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let entries: Vec<(String, StreamEntry)> = self.streams.lock().drain().collect();
        futures::future::join_all(
            entries
                .into_iter()
                .map(|(stream_id, entry)| async move { stop_entry(&stream_id, entry).await }),
        )
        .await;
        tracing::info!("Adaptive controller shut down");
    }

    async fn send(&self, stream_id: &str, command: StreamCommand) -> Result<(), StreamingError> {
        let commands = self
            .streams
            .lock()
            .get(stream_id)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| StreamingError::StreamNotFound(stream_id.to_string()))?;
        commands
            .send(command)
            .await
            .map_err(|_| StreamingError::StreamNotFound(stream_id.to_string()))
    }
}

async fn stop_entry(stream_id: &str, entry: StreamEntry) {
    let _ = entry.stop.send(());
    if let Err(e) = entry.task.await {
        tracing::warn!(stream_id, "Stream worker ended abnormally: {}", e);
    }
}

impl Drop for AdaptiveController {
    fn drop(&mut self) {
        for (_, entry) in self.streams.lock().drain() {
            let _ = entry.stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::QualityLevel;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config() -> StreamingConfig {
        StreamingConfig {
            min_buffer_size: 100,
            target_buffer_size: 300,
            max_buffer_size: 400,
            buffer_floor: 300,
            buffer_ceiling: 1000,
            flush_interval_ms: 20,
            adjust_interval_ms: 40,
            ..Default::default()
        }
    }

    fn packet(seq: u64, len: usize) -> AudioPacket {
        AudioPacket::new("s1", seq, vec![0u8; len])
    }

    #[tokio::test]
    async fn test_packets_reach_output_in_order() {
        let controller = AdaptiveController::new(config());
        let output = Arc::new(AudioSource::new("out", 64));
        let mut rx = output.subscribe();
        controller.add_stream("s1", Arc::clone(&output)).unwrap();

        for seq in 0..3 {
            controller.push("s1", packet(seq, 100)).await.unwrap();
        }
        for expected in 0..3 {
            let received = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received.sequence, expected);
        }
        assert_eq!(controller.stats("s1").await.unwrap().released_packets, 3);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_timer_releases_partial_buffer() {
        let controller = AdaptiveController::new(config());
        let output = Arc::new(AudioSource::new("out", 64));
        let mut rx = output.subscribe();
        controller.add_stream("s1", Arc::clone(&output)).unwrap();

        controller.push("s1", packet(7, 50)).await.unwrap();
        let received = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sequence, 7);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_is_reported() {
        let controller = AdaptiveController::new(config());
        let mut events = controller.subscribe();
        controller
            .add_stream("s1", Arc::new(AudioSource::new("out", 8)))
            .unwrap();

        controller.push("s1", packet(0, 1000)).await.unwrap();
        let stats = controller.stats("s1").await.unwrap();
        assert_eq!(stats.oversized_drops, 1);
        assert!(stats.size <= stats.max_size);

        let mut saw_drop = false;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
            if matches!(event, StreamEvent::OversizedDrop { packet_size: 1000, .. }) {
                saw_drop = true;
                break;
            }
        }
        assert!(saw_drop);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_recommendation_lowers_quality() {
        let controller = AdaptiveController::new(config());
        let mut events = controller.subscribe();
        controller
            .add_stream("s1", Arc::new(AudioSource::new("out", 8)))
            .unwrap();

        assert!(controller
            .apply_recommendation("s1", ActionTag::LowerQuality)
            .await
            .unwrap());
        assert!(!controller
            .apply_recommendation("s1", ActionTag::ImproveTranslation)
            .await
            .unwrap());

        let changed = loop {
            match timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Ok(StreamEvent::QualityChanged { from, to, .. })) => break (from, to),
                Ok(Ok(_)) => continue,
                other => panic!("no quality change: {:?}", other.map(|r| r.is_ok())),
            }
        };
        assert_eq!(changed, (QualityLevel::High, QualityLevel::Medium));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_unknown_and_stopped() {
        let controller = AdaptiveController::new(config());
        let output = Arc::new(AudioSource::new("out", 8));
        controller.add_stream("s1", Arc::clone(&output)).unwrap();
        assert_eq!(
            controller.add_stream("s1", Arc::clone(&output)),
            Err(StreamingError::DuplicateStream("s1".to_string()))
        );
        assert_eq!(
            controller.push("nope", packet(0, 1)).await,
            Err(StreamingError::StreamNotFound("nope".to_string()))
        );

        controller.remove_stream("s1").await.unwrap();
        assert!(!controller.has_stream("s1"));
        assert!(controller.remove_stream("s1").await.is_err());

        controller.shutdown().await;
        assert_eq!(
            controller.add_stream("s2", output),
            Err(StreamingError::ControllerStopped)
        );
    }

    #[tokio::test]
    async fn test_remove_stream_releases_remaining_packets() {
        let mut cfg = config();
        cfg.flush_interval_ms = 60_000;
        cfg.adjust_interval_ms = 60_000;
        let controller = AdaptiveController::new(cfg);
        let output = Arc::new(AudioSource::new("out", 8));
        let mut rx = output.subscribe();
        controller.add_stream("s1", Arc::clone(&output)).unwrap();

        controller.push("s1", packet(1, 10)).await.unwrap();
        controller.remove_stream("s1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
    }
}
