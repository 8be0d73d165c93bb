//! Quality Engine
//!
//! Ein Worker pro überwachter Session. Der Worker besitzt seinen
//! `QualityMonitor` exklusiv; Leser schicken Commands und bekommen Kopien
//! zurück.

use super::alerts::AlertRecord;
use super::collectors::{collect_all, MetricCollector};
use super::metrics::{MetricCategory, QualityMetricsSnapshot};
use super::monitor::{QualityMonitor, QualityReport};
use super::rules::Recommendation;
use crate::config::QualityConfig;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Kapazität des Event-Broadcasts; langsame Empfänger verlieren die ältesten Events
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityError {
    #[error("Session {0} is already monitored")]
    AlreadyMonitoring(String),

    #[error("Session {0} is not monitored")]
    NotMonitoring(String),

    #[error("Quality engine has been shut down")]
    EngineStopped,
}

// ============================================================================
// QUALITY EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum QualityEvent {
    Report(QualityReport),
    Alert(AlertRecord),
    Recommendation(Recommendation),
    /// Collector hat in diesem Zyklus nichts geliefert
    CollectorDegraded {
        session_id: String,
        category: MetricCategory,
        reason: String,
    },
}

// ============================================================================
// WORKER
// ============================================================================

enum MonitorCommand {
    Latest(oneshot::Sender<Option<QualityReport>>),
    History(oneshot::Sender<Vec<Arc<QualityMetricsSnapshot>>>),
    Alerts(oneshot::Sender<Vec<AlertRecord>>),
    Recommendations(oneshot::Sender<Vec<Recommendation>>),
    TakeRecommendations(oneshot::Sender<Vec<Recommendation>>),
}

struct MonitorEntry {
    commands: mpsc::Sender<MonitorCommand>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct MonitorWorker {
    monitor: QualityMonitor,
    collectors: Vec<Arc<dyn MetricCollector>>,
    config: QualityConfig,
    commands: mpsc::Receiver<MonitorCommand>,
    stop: oneshot::Receiver<()>,
    event_tx: broadcast::Sender<QualityEvent>,
}

impl MonitorWorker {
    async fn run(mut self) {
        let session_id = self.monitor.session_id().to_string();
        tracing::debug!(session_id = %session_id, "Quality monitor started");

        let mut ticker = tokio::time::interval(self.config.monitoring_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut self.stop => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = ticker.tick() => self.cycle().await,
            }
        }

        tracing::debug!(session_id = %session_id, "Quality monitor stopped");
    }

    fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Latest(reply) => {
                let _ = reply.send(self.monitor.latest().cloned());
            }
            MonitorCommand::History(reply) => {
                let _ = reply.send(self.monitor.history());
            }
            MonitorCommand::Alerts(reply) => {
                let _ = reply.send(self.monitor.alerts());
            }
            MonitorCommand::Recommendations(reply) => {
                let _ = reply.send(self.monitor.recommendations());
            }
            MonitorCommand::TakeRecommendations(reply) => {
                let _ = reply.send(self.monitor.take_recommendations());
            }
        }
    }

    async fn cycle(&mut self) {
        let (samples, errors) =
            collect_all(&self.collectors, self.config.collector_timeout()).await;
        let session_id = self.monitor.session_id().to_string();

        for error in &errors {
            tracing::warn!(session_id = %session_id, "Metric collection degraded: {}", error);
            let _ = self.event_tx.send(QualityEvent::CollectorDegraded {
                session_id: session_id.clone(),
                category: error.category(),
                reason: error.to_string(),
            });
        }

        let outcome = self.monitor.process(&samples, errors, Utc::now());
        tracing::trace!(
            session_id = %session_id,
            "Quality score {:.1} ({})",
            outcome.report.score.overall,
            outcome.report.score.grade
        );

        for alert in outcome.alerts {
            tracing::warn!(
                session_id = %session_id,
                severity = ?alert.severity,
                "Quality alert: {}",
                alert.message
            );
            let _ = self.event_tx.send(QualityEvent::Alert(alert));
        }
        for rec in outcome.recommendations {
            tracing::debug!(session_id = %session_id, "Recommendation: {}", rec.rule);
            let _ = self.event_tx.send(QualityEvent::Recommendation(rec));
        }
        let _ = self.event_tx.send(QualityEvent::Report(outcome.report));
    }
}

// ============================================================================
// QUALITY ENGINE
// ============================================================================

pub struct QualityEngine {
    config: QualityConfig,
    monitors: Arc<Mutex<HashMap<String, MonitorEntry>>>,
    event_tx: broadcast::Sender<QualityEvent>,
    stopped: AtomicBool,
}

impl QualityEngine {
    pub fn new(config: QualityConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            monitors: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QualityEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Startet den periodischen Worker für eine Session
    pub fn start_monitoring(
        &self,
        session_id: &str,
        collectors: Vec<Arc<dyn MetricCollector>>,
    ) -> Result<(), QualityError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QualityError::EngineStopped);
        }

        let mut monitors = self.monitors.lock();
        if monitors.contains_key(session_id) {
            return Err(QualityError::AlreadyMonitoring(session_id.to_string()));
        }

        let (command_tx, command_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = MonitorWorker {
            monitor: QualityMonitor::new(session_id, &self.config),
            collectors,
            config: self.config.clone(),
            commands: command_rx,
            stop: stop_rx,
            event_tx: self.event_tx.clone(),
        };
        let task = tokio::spawn(worker.run());

        monitors.insert(
            session_id.to_string(),
            MonitorEntry {
                commands: command_tx,
                stop: stop_tx,
                task,
            },
        );
        tracing::info!(session_id, "Quality monitoring started");
        Ok(())
    }

    /// Stoppt den Worker und wartet auf sein Ende
    pub async fn stop_monitoring(&self, session_id: &str) -> Result<(), QualityError> {
        let entry = self
            .monitors
            .lock()
            .remove(session_id)
            .ok_or_else(|| QualityError::NotMonitoring(session_id.to_string()))?;
        stop_entry(session_id, entry).await;
        tracing::info!(session_id, "Quality monitoring stopped");
        Ok(())
    }

    pub fn is_monitoring(&self, session_id: &str) -> bool {
        self.monitors.lock().contains_key(session_id)
    }

    pub fn monitored_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.monitors.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn latest(&self, session_id: &str) -> Result<Option<QualityReport>, QualityError> {
        self.request(session_id, MonitorCommand::Latest).await
    }

    pub async fn history(
        &self,
        session_id: &str,
    ) -> Result<Vec<Arc<QualityMetricsSnapshot>>, QualityError> {
        self.request(session_id, MonitorCommand::History).await
    }

    pub async fn alerts(&self, session_id: &str) -> Result<Vec<AlertRecord>, QualityError> {
        self.request(session_id, MonitorCommand::Alerts).await
    }

    pub async fn recommendations(
        &self,
        session_id: &str,
    ) -> Result<Vec<Recommendation>, QualityError> {
        self.request(session_id, MonitorCommand::Recommendations)
            .await
    }

    /// Entnimmt die angesammelten Empfehlungen einer Session
    pub async fn take_recommendations(
        &self,
        session_id: &str,
    ) -> Result<Vec<Recommendation>, QualityError> {
        self.request(session_id, MonitorCommand::TakeRecommendations)
            .await
    }

    /// Stoppt alle Worker; danach sind keine neuen Sessions mehr möglich
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let entries: Vec<(String, MonitorEntry)> = self.monitors.lock().drain().collect();
        futures::future::join_all(
            entries
                .into_iter()
                .map(|(session_id, entry)| async move { stop_entry(&session_id, entry).await }),
        )
        .await;
        tracing::info!("Quality engine shut down");
    }

    async fn request<T, F>(&self, session_id: &str, build: F) -> Result<T, QualityError>
    where
        F: FnOnce(oneshot::Sender<T>) -> MonitorCommand,
    {
        let commands = self
            .monitors
            .lock()
            .get(session_id)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| QualityError::NotMonitoring(session_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(build(reply_tx))
            .await
            .map_err(|_| QualityError::NotMonitoring(session_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| QualityError::NotMonitoring(session_id.to_string()))
    }
}

async fn stop_entry(session_id: &str, entry: MonitorEntry) {
    let _ = entry.stop.send(());
    if let Err(e) = entry.task.await {
        tracing::warn!(session_id, "Quality monitor ended abnormally: {}", e);
    }
}

impl Drop for QualityEngine {
    fn drop(&mut self) {
        for (_, entry) in self.monitors.lock().drain() {
            let _ = entry.stop.send(());
        }
    }
}
