//! Progress and telemetry events
//!
//! The pipeline reports every stage start/finish, the measured levels at
//! each validation boundary, degradations and the final failure to a
//! [`ProgressObserver`]. Observers must not block: events are emitted from
//! the pipeline thread between stages.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::SignalLevels;
use crate::song::{DegradationKind, Stage};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StageStarted {
        stage: Stage,
        clip_index: Option<usize>,
    },
    StageCompleted {
        stage: Stage,
        clip_index: Option<usize>,
        elapsed_ms: u64,
    },
    /// Levels measured at a validation boundary, e.g. `post-mix`
    SignalLevels {
        label: String,
        clip_index: Option<usize>,
        levels: SignalLevels,
    },
    Degraded {
        stage: Stage,
        clip_index: Option<usize>,
        kind: DegradationKind,
        message: String,
    },
    Failed {
        stage: Stage,
        clip_index: Option<usize>,
        error_code: String,
        message: String,
    },
    Finished {
        duration_secs: f64,
        levels: SignalLevels,
    },
}

/// One event for one song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub song_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(song_id: Uuid, kind: EventKind) -> Self {
        Self {
            song_id,
            at: Utc::now(),
            kind,
        }
    }
}

/// Receives pipeline events
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let song = event.song_id;
        match &event.kind {
            EventKind::StageStarted { stage, clip_index } => {
                debug!(%song, %stage, clip = ?clip_index, "stage started");
            }
            EventKind::StageCompleted {
                stage,
                clip_index,
                elapsed_ms,
            } => {
                info!(%song, %stage, clip = ?clip_index, elapsed_ms, "stage completed");
            }
            EventKind::SignalLevels {
                label,
                clip_index,
                levels,
            } => {
                debug!(%song, stage = %label, clip = ?clip_index, peak = levels.peak, rms = levels.rms, "levels");
            }
            EventKind::Degraded {
                stage,
                clip_index,
                kind,
                message,
            } => {
                warn!(%song, %stage, clip = ?clip_index, ?kind, "{}", message);
            }
            EventKind::Failed {
                stage,
                clip_index,
                error_code,
                message,
            } => {
                warn!(%song, %stage, clip = ?clip_index, code = %error_code, "song failed: {}", message);
            }
            EventKind::Finished {
                duration_secs,
                levels,
            } => {
                info!(%song, duration_secs, peak = levels.peak, rms = levels.rms, "song ready");
            }
        }
    }
}

/// Sends events over a channel; a closed receiver is ignored
#[derive(Debug)]
pub struct ChannelObserver {
    sender: Mutex<Sender<PipelineEvent>>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<PipelineEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if sender.send(event.clone()).is_err() {
            debug!("progress receiver dropped");
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<PipelineEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stages that completed, in order
    pub fn completed_stages(&self) -> Vec<(Stage, Option<usize>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::StageCompleted {
                    stage, clip_index, ..
                } => Some((stage, clip_index)),
                _ => None,
            })
            .collect()
    }

    /// Levels recorded under a validation label
    pub fn levels(&self, label: &str) -> Vec<SignalLevels> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::SignalLevels { label: l, levels, .. } if l == label => Some(levels),
                _ => None,
            })
            .collect()
    }
}

impl ProgressObserver for CollectingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fan-out to several observers
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}

impl Observers {
    pub fn push(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn emit(&self, song_id: Uuid, kind: EventKind) {
        if self.observers.is_empty() {
            return;
        }
        let event = PipelineEvent::new(song_id, kind);
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, rx) = mpsc::channel();
        let mut observers = Observers::default();
        observers.push(Arc::new(ChannelObserver::new(tx)));

        let id = Uuid::new_v4();
        observers.emit(
            id,
            EventKind::StageStarted {
                stage: Stage::Generating,
                clip_index: Some(0),
            },
        );
        let event = rx.recv().unwrap();
        assert_eq!(event.song_id, id);
        assert!(matches!(event.kind, EventKind::StageStarted { clip_index: Some(0), .. }));
    }

    #[test]
    fn test_dropped_receiver_ignored() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let observer = ChannelObserver::new(tx);
        observer.on_event(&PipelineEvent::new(
            Uuid::nil(),
            EventKind::StageStarted {
                stage: Stage::Chaining,
                clip_index: None,
            },
        ));
    }

    #[test]
    fn test_collecting_observer_filters() {
        let collector = Arc::new(CollectingObserver::new());
        let mut observers = Observers::default();
        observers.push(collector.clone());
        let id = Uuid::new_v4();
        observers.emit(
            id,
            EventKind::SignalLevels {
                label: "post-mix".into(),
                clip_index: Some(1),
                levels: SignalLevels { peak: 0.5, rms: 0.2 },
            },
        );
        observers.emit(
            id,
            EventKind::StageCompleted {
                stage: Stage::Mastering,
                clip_index: None,
                elapsed_ms: 3,
            },
        );

        assert_eq!(collector.levels("post-mix"), vec![SignalLevels { peak: 0.5, rms: 0.2 }]);
        assert_eq!(collector.completed_stages(), vec![(Stage::Mastering, None)]);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = PipelineEvent::new(
            Uuid::nil(),
            EventKind::StageStarted {
                stage: Stage::Separating,
                clip_index: Some(2),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stage_started");
        assert_eq!(json["stage"], "separating");
        assert_eq!(json["clip_index"], 2);
    }
}
