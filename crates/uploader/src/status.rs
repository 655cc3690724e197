//! Status module for the channel uploader
//!
//! Keeps one status row per channel, fed from the job event stream, with
//! JSON serialization support for the status endpoint.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::events::{JobEvent, JobEventKind, JobRunState};

/// Per-channel status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelStatus {
    pub channel: String,
    pub state: JobRunState,
    pub pending: usize,
    pub published: u64,
    pub failed: u64,
    /// Title of the item currently uploading
    pub current_item: Option<String>,
    pub progress: f32,
    pub last_error: Option<String>,
}

impl ChannelStatus {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: JobRunState::Idle,
            pending: 0,
            published: 0,
            failed: 0,
            current_item: None,
            progress: 0.0,
            last_error: None,
        }
    }
}

/// Snapshot of every channel in the current run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub channels: Vec<ChannelStatus>,
}

impl StatusSnapshot {
    pub fn channel(&self, name: &str) -> Option<&ChannelStatus> {
        self.channels.iter().find(|c| c.channel == name)
    }

    fn channel_mut(&mut self, name: &str) -> &mut ChannelStatus {
        let index = match self.channels.iter().position(|c| c.channel == name) {
            Some(index) => index,
            None => {
                self.channels.push(ChannelStatus::new(name));
                self.channels.len() - 1
            }
        };
        &mut self.channels[index]
    }

    /// Folds one job event into the snapshot.
    pub fn apply_event(&mut self, event: &JobEvent) {
        self.timestamp_unix_ms = chrono::Utc::now().timestamp_millis();
        let status = self.channel_mut(&event.channel);

        match &event.kind {
            JobEventKind::StateChanged { state } => {
                status.state = *state;
                if state.is_terminal() {
                    status.current_item = None;
                }
            }
            JobEventKind::Discovered { pending } => status.pending = *pending,
            JobEventKind::ItemStarted { title, .. } => {
                status.current_item = Some(title.clone());
                status.progress = 0.0;
            }
            JobEventKind::Progress { fraction } => status.progress = *fraction,
            JobEventKind::ItemPublished { .. } => {
                status.published += 1;
                status.pending = status.pending.saturating_sub(1);
                status.current_item = None;
            }
            JobEventKind::ItemFailed { reason } => {
                status.failed += 1;
                status.last_error = Some(reason.clone());
                status.current_item = None;
            }
        }
    }
}

/// Shared status state for concurrent access across the orchestrator and
/// the status server
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus with one idle row per channel
pub fn new_shared_status<I, S>(channels: I) -> SharedStatus
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let snapshot = StatusSnapshot {
        timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
        channels: channels.into_iter().map(ChannelStatus::new).collect(),
    };
    Arc::new(RwLock::new(snapshot))
}

/// Applies events to `status` until every sender is dropped.
pub fn spawn_status_updater(
    status: SharedStatus,
    mut events: mpsc::UnboundedReceiver<JobEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            status.write().await.apply_event(&event);
        }
    })
}
