//! Job run states and the event stream a job reports through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Runtime status of one channel job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunState {
    Idle,
    Connecting,
    Scanning,
    Uploading,
    Paused,
    Completed,
    QuotaExceeded,
    Error,
    Crashed,
}

impl JobRunState {
    /// Convert state to string for status output
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunState::Idle => "idle",
            JobRunState::Connecting => "connecting",
            JobRunState::Scanning => "scanning",
            JobRunState::Uploading => "uploading",
            JobRunState::Paused => "paused",
            JobRunState::Completed => "completed",
            JobRunState::QuotaExceeded => "quota_exceeded",
            JobRunState::Error => "error",
            JobRunState::Crashed => "crashed",
        }
    }

    /// Terminal states end the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobRunState::Completed
                | JobRunState::QuotaExceeded
                | JobRunState::Error
                | JobRunState::Crashed
        )
    }
}

impl std::fmt::Display for JobRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    StateChanged { state: JobRunState },
    /// Number of pending items found by the scan.
    Discovered { pending: usize },
    ItemStarted {
        index: usize,
        total: usize,
        title: String,
        publish_at: DateTime<Utc>,
    },
    /// Transfer progress of the current item, 0.0 to 1.0.
    Progress { fraction: f32 },
    ItemPublished { remote_id: String },
    ItemFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub channel: String,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

/// Sending half of a job's event stream.
///
/// A dropped receiver never fails the job; events are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    channel: String,
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventSink {
    pub fn new(channel: impl Into<String>, tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            channel: channel.into(),
            tx: Some(tx),
        }
    }

    /// A sink that discards every event.
    pub fn disabled(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            tx: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn emit(&self, kind: JobEventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(JobEvent {
                channel: self.channel.clone(),
                kind,
            });
        }
    }

    pub fn state(&self, state: JobRunState) {
        self.emit(JobEventKind::StateChanged { state });
    }

    pub fn progress(&self, fraction: f32) {
        self.emit(JobEventKind::Progress {
            fraction: fraction.clamp(0.0, 1.0),
        });
    }
}

/// Creates an unbounded event channel.
pub fn event_channel() -> (
    mpsc::UnboundedSender<JobEvent>,
    mpsc::UnboundedReceiver<JobEvent>,
) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal = [
            JobRunState::Completed,
            JobRunState::QuotaExceeded,
            JobRunState::Error,
            JobRunState::Crashed,
        ];
        for state in terminal {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
        for state in [
            JobRunState::Idle,
            JobRunState::Connecting,
            JobRunState::Scanning,
            JobRunState::Uploading,
            JobRunState::Paused,
        ] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobRunState::QuotaExceeded).unwrap();
        assert_eq!(json, "\"quota_exceeded\"");
        assert_eq!(JobRunState::QuotaExceeded.as_str(), "quota_exceeded");
    }

    #[test]
    fn test_sink_tags_events_with_channel() {
        let (tx, mut rx) = event_channel();
        let sink = EventSink::new("news", tx);

        sink.state(JobRunState::Scanning);
        sink.progress(1.7);

        assert_eq!(
            rx.try_recv().unwrap(),
            JobEvent {
                channel: "news".into(),
                kind: JobEventKind::StateChanged {
                    state: JobRunState::Scanning
                },
            }
        );
        assert_eq!(
            rx.try_recv().unwrap().kind,
            JobEventKind::Progress { fraction: 1.0 }
        );
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = event_channel();
        drop(rx);
        let sink = EventSink::new("news", tx);
        sink.state(JobRunState::Completed);
        EventSink::disabled("quiet").state(JobRunState::Completed);
    }

    #[test]
    fn test_event_json_shape() {
        let event = JobEvent {
            channel: "news".into(),
            kind: JobEventKind::ItemPublished {
                remote_id: "abc".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["channel"], "news");
        assert_eq!(value["kind"], "item_published");
        assert_eq!(value["remote_id"], "abc");
    }
}
