//! Job Runner: drives one channel's backlog from credential to completion
//! markers.
//!
//! `Idle -> Connecting -> Scanning -> Uploading <-> Paused` and then one of
//! `Completed`, `QuotaExceeded`, `Error` or `Crashed`. Per-item failures are
//! contained here; only quota, credential and unexpected faults end a run
//! early.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use channel_uploader_config::ChannelConfig;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::completion_marker::{write_completion_marker, CompletionRecord, MarkerError};
use crate::credentials::{normalize_account_key, ClientProfile, CredentialStore};
use crate::events::{EventSink, JobEventKind, JobRunState};
use crate::pause::PauseToken;
use crate::publish::{PublishError, PublishSettings, UploadExecutor};
use crate::scan::{list_pending_work, ScanError};
use crate::schedule::{Cadence, ScheduleCursor};
use crate::service::ServiceConnector;

/// Unexpected faults that end a run as `Crashed`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    /// The item was published but could not be marked complete.
    #[error("Failed to write completion marker: {0}")]
    Marker(#[from] MarkerError),
}

/// One channel's run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelJob {
    pub name: String,
    /// Credential reference (account key, optionally with `.json`).
    pub credential: String,
    /// Path of the owning client profile file.
    pub client_profile: PathBuf,
    pub folder: PathBuf,
    pub cadence: Cadence,
    pub category: Option<String>,
    pub playlist: Option<String>,
}

impl ChannelJob {
    /// Builds a job from a config row; the profile name is resolved against
    /// `client_profile_dir` unless it is already an absolute path.
    pub fn from_config(config: &ChannelConfig, client_profile_dir: &Path) -> Self {
        Self {
            name: config.display_name().to_string(),
            credential: config.credential.clone(),
            client_profile: client_profile_dir.join(&config.client_profile),
            folder: config.folder.clone(),
            cadence: Cadence::from_entries(config.slots.entries(), config.day_gap),
            category: config.category.clone(),
            playlist: config.playlist.clone(),
        }
    }
}

/// Outcome of one channel run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub channel: String,
    pub state: JobRunState,
    pub published: usize,
    pub failed: usize,
    /// Pending items left untouched (non-zero only after a quota stop).
    pub remaining: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobReport {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            channel: channel.into(),
            state: JobRunState::Idle,
            published: 0,
            failed: 0,
            remaining: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Runs one channel job.
pub struct JobRunner {
    job: ChannelJob,
    store: Arc<CredentialStore>,
    connector: Arc<dyn ServiceConnector>,
    settings: PublishSettings,
    item_failure_delay: Duration,
    pause: PauseToken,
    events: EventSink,
}

impl JobRunner {
    pub fn new(
        job: ChannelJob,
        store: Arc<CredentialStore>,
        connector: Arc<dyn ServiceConnector>,
        settings: PublishSettings,
    ) -> Self {
        let events = EventSink::disabled(job.name.clone());
        Self {
            job,
            store,
            connector,
            settings,
            item_failure_delay: Duration::from_secs(3),
            pause: PauseToken::new(),
            events,
        }
    }

    /// Delay after a failed item before the next one starts.
    pub fn with_item_failure_delay(mut self, delay: Duration) -> Self {
        self.item_failure_delay = delay;
        self
    }

    pub fn with_pause(mut self, pause: PauseToken) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn job(&self) -> &ChannelJob {
        &self.job
    }

    /// Runs the job to a terminal state. Never fails; every fault ends up in
    /// the report.
    pub async fn run(self) -> JobReport {
        let mut report = JobReport::new(&self.job.name);
        info!(channel = %self.job.name, run_id = %report.run_id, "job started");

        let state = match self.execute(&mut report).await {
            Ok(state) => state,
            Err(e) => {
                error!(channel = %self.job.name, error = %e, "job crashed");
                report.error = Some(e.to_string());
                JobRunState::Crashed
            }
        };

        report.state = state;
        report.finished_at = Some(Utc::now());
        self.events.state(state);
        info!(
            channel = %self.job.name,
            state = %state,
            published = report.published,
            failed = report.failed,
            remaining = report.remaining,
            "job finished"
        );
        report
    }

    async fn execute(&self, report: &mut JobReport) -> Result<JobRunState, RunnerError> {
        let job = &self.job;

        self.events.state(JobRunState::Connecting);
        let profile = match ClientProfile::load(&job.client_profile) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(channel = %job.name, error = %e, "client profile unusable");
                report.error = Some(e.to_string());
                return Ok(JobRunState::Error);
            }
        };
        let service = match self
            .store
            .get_authenticated_client(&job.credential, &profile, self.connector.as_ref())
            .await
        {
            Ok(service) => service,
            Err(e) => {
                warn!(channel = %job.name, error = %e, "authentication failed");
                report.error = Some(e.to_string());
                return Ok(JobRunState::Error);
            }
        };
        let account_key =
            normalize_account_key(&job.credential).unwrap_or_else(|_| job.credential.clone());

        self.events.state(JobRunState::Scanning);
        let items = list_pending_work(&job.folder)?;
        self.events.emit(JobEventKind::Discovered {
            pending: items.len(),
        });
        if items.is_empty() {
            info!(channel = %job.name, folder = %job.folder.display(), "nothing to publish");
            return Ok(JobRunState::Completed);
        }

        self.events.state(JobRunState::Uploading);
        let executor = UploadExecutor::new(
            service,
            self.settings.clone(),
            self.pause.clone(),
            self.events.clone(),
        );
        let mut cursor = ScheduleCursor::<Local>::new();
        let total = items.len();

        for (index, item) in items.iter().enumerate() {
            executor.pause_point().await;

            let publish_at = cursor.peek(&job.cadence, Local::now());
            info!(
                channel = %job.name,
                folder = %item.folder_name(),
                publish_at = %publish_at,
                "publishing item {}/{}",
                index + 1,
                total
            );
            self.events.emit(JobEventKind::ItemStarted {
                index,
                total,
                title: item.metadata.title.clone(),
                publish_at: publish_at.with_timezone(&Utc),
            });

            let result = executor
                .publish(
                    item,
                    publish_at.with_timezone(&Utc),
                    job.category.as_deref(),
                    job.playlist.as_deref(),
                )
                .await;

            match result {
                Ok(remote_id) => {
                    cursor.commit(publish_at);
                    let record =
                        CompletionRecord::scheduled(&remote_id, publish_at.fixed_offset(), &account_key);
                    write_completion_marker(&item.path, &record)?;
                    report.published += 1;
                    info!(channel = %job.name, folder = %item.folder_name(), remote_id = %remote_id, "item published");
                    self.events.emit(JobEventKind::ItemPublished { remote_id });
                }
                Err(PublishError::QuotaExceeded(message)) => {
                    warn!(channel = %job.name, error = %message, "quota exceeded, stopping");
                    report.remaining = total - index;
                    report.error = Some(format!("quota exceeded: {message}"));
                    return Ok(JobRunState::QuotaExceeded);
                }
                Err(e) => {
                    warn!(
                        channel = %job.name,
                        folder = %item.folder_name(),
                        error = %e,
                        "item failed, skipping"
                    );
                    report.failed += 1;
                    self.events.emit(JobEventKind::ItemFailed {
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(self.item_failure_delay).await;
                }
            }
        }

        Ok(JobRunState::Completed)
    }
}
