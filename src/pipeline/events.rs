//! Progress and log notifications.
//!
//! The orchestrator reports through [`ProgressObserver`]. Notifications are
//! fire-and-forget: observers must return promptly, and the channel-backed
//! observer drops events rather than wait on a slow consumer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::RunStatus;

/// Receives progress and log notifications from a run.
pub trait ProgressObserver: Send + Sync {
    /// `current` may be fractional inside the per-hypothesis loop.
    fn on_progress(&self, current: f64, total: u32, message: &str);

    fn on_log(&self, message: &str);

    /// A text fragment streamed by the stage named `stage`.
    fn on_fragment(&self, _stage: &str, _fragment: &str) {}

    /// Called once when the run reaches a terminal state.
    fn on_finished(&self, _status: RunStatus) {}
}

/// Forwards notifications to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_progress(&self, current: f64, total: u32, message: &str) {
        tracing::debug!(current, total, "{}", message);
    }

    fn on_log(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn on_fragment(&self, stage: &str, fragment: &str) {
        tracing::trace!(stage, "{}", fragment);
    }

    fn on_finished(&self, status: RunStatus) {
        tracing::info!(%status, "Run finished");
    }
}

/// Events published by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Progress update.
    Progress {
        current: f64,
        total: u32,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Human-readable log line.
    Log {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Streamed model output.
    Fragment {
        stage: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// The run reached a terminal state.
    Finished {
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Creates a progress event.
    pub fn progress(current: f64, total: u32, message: impl Into<String>) -> Self {
        PipelineEvent::Progress {
            current,
            total,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a log event.
    pub fn log(message: impl Into<String>) -> Self {
        PipelineEvent::Log {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a fragment event.
    pub fn fragment(stage: impl Into<String>, text: impl Into<String>) -> Self {
        PipelineEvent::Fragment {
            stage: stage.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a finished event.
    pub fn finished(status: RunStatus) -> Self {
        PipelineEvent::Finished {
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::Progress { timestamp, .. }
            | PipelineEvent::Log { timestamp, .. }
            | PipelineEvent::Fragment { timestamp, .. }
            | PipelineEvent::Finished { timestamp, .. } => *timestamp,
        }
    }
}

/// Publishes notifications as [`PipelineEvent`]s on a bounded channel.
///
/// Uses `try_send`; when the receiver lags or is gone the event is dropped.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    /// Creates an observer together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::trace!(error = %e, "Dropped pipeline event");
        }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, current: f64, total: u32, message: &str) {
        self.publish(PipelineEvent::progress(current, total, message));
    }

    fn on_log(&self, message: &str) {
        self.publish(PipelineEvent::log(message));
    }

    fn on_fragment(&self, stage: &str, fragment: &str) {
        self.publish(PipelineEvent::fragment(stage, fragment));
    }

    fn on_finished(&self, status: RunStatus) {
        self.publish(PipelineEvent::finished(status));
    }
}

/// Fans notifications out to several observers.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding only a [`TracingObserver`].
    pub fn tracing() -> Self {
        Self::new().with(Arc::new(TracingObserver))
    }

    pub fn with(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ProgressObserver for ObserverSet {
    fn on_progress(&self, current: f64, total: u32, message: &str) {
        for observer in &self.observers {
            observer.on_progress(current, total, message);
        }
    }

    fn on_log(&self, message: &str) {
        for observer in &self.observers {
            observer.on_log(message);
        }
    }

    fn on_fragment(&self, stage: &str, fragment: &str) {
        for observer in &self.observers {
            observer.on_fragment(stage, fragment);
        }
    }

    fn on_finished(&self, status: RunStatus) {
        for observer in &self.observers {
            observer.on_finished(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_observer_publishes_events() {
        let (observer, mut rx) = ChannelObserver::channel(8);
        observer.on_progress(1.0, 10, "Selecting target");
        observer.on_log("hello");
        observer.on_finished(RunStatus::Completed);

        match rx.recv().await.unwrap() {
            PipelineEvent::Progress { current, total, message, .. } => {
                assert_eq!(current, 1.0);
                assert_eq!(total, 10);
                assert_eq!(message, "Selecting target");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), PipelineEvent::Log { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::Finished { status: RunStatus::Completed, .. }
        ));
    }

    #[test]
    fn test_channel_observer_never_blocks() {
        let (observer, rx) = ChannelObserver::channel(1);
        observer.on_log("first");
        observer.on_log("dropped");
        drop(rx);
        observer.on_log("closed");
    }

    #[tokio::test]
    async fn test_observer_set_fans_out() {
        let (a, mut rx_a) = ChannelObserver::channel(4);
        let (b, mut rx_b) = ChannelObserver::channel(4);
        let set = ObserverSet::tracing().with(Arc::new(a)).with(Arc::new(b));
        assert_eq!(set.len(), 3);

        set.on_log("both");
        assert!(matches!(rx_a.recv().await.unwrap(), PipelineEvent::Log { message, .. } if message == "both"));
        assert!(matches!(rx_b.recv().await.unwrap(), PipelineEvent::Log { message, .. } if message == "both"));
    }

    #[tokio::test]
    async fn test_observer_set_forwards_fragments_in_order() {
        let (observer, mut rx) = ChannelObserver::channel(4);
        let set = ObserverSet::new().with(Arc::new(observer));

        set.on_fragment("Physics Oracle", "{\"physically");
        set.on_fragment("Physics Oracle", "_possible\": true}");

        let mut texts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                PipelineEvent::Fragment { stage, text, .. } => {
                    assert_eq!(stage, "Physics Oracle");
                    texts.push(text);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(texts.concat(), "{\"physically_possible\": true}");
    }

    #[test]
    fn test_event_serialization_tag() {
        let value = serde_json::to_value(PipelineEvent::log("x")).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["message"], "x");
    }
}
